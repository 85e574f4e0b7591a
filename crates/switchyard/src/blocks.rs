//! Built-in blocks the engine itself depends on: the inverter behind the
//! `_not_<name>` shortcut, the `_ctrl` control block and the event
//! repeater created by [`Event::repeated`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::mpsc;

use crate::block::{check_signature, BlockCtx, CombLogic, InputSignature, Inputs, MainTask, SeqLogic};
use crate::circuit::Circuit;
use crate::error::{CircuitError, SimResult};
use crate::event::{DestSpec, Event, EventType};
use crate::value::{truthy, EventData, Value};

/// Boolean negation of a single input. Undefined inputs count as false.
pub struct Invert;

impl CombLogic for Invert {
    fn calc_output(&self, inputs: &Inputs) -> SimResult<Value> {
        let input = inputs
            .unnamed()?
            .first()
            .cloned()
            .ok_or_else(|| CircuitError::Config("inverter input missing".into()))?;
        Ok(json!(!truthy(&input.unwrap_or(Value::Null))))
    }

    fn check_connections(&self, signature: &InputSignature) -> SimResult<()> {
        check_signature(signature, &[("_", Some(1))])
    }
}

/// Simulation control block, auto-created under the `_ctrl` name.
///
/// Accepts `shutdown` (normal stop) and `abort` (fatal stop carrying an
/// `error` item) from anywhere in the circuit.
pub struct ControlBlock;

impl SeqLogic for ControlBlock {
    fn handle_event(
        &self,
        ctx: &BlockCtx,
        etype: &EventType,
        data: &EventData,
    ) -> SimResult<Value> {
        let source = data
            .get("source")
            .and_then(Value::as_str)
            .unwrap_or("<no-source-data>");
        match etype {
            EventType::Named(name) if name == "shutdown" => {
                ctx.circuit()
                    .abort(CircuitError::Cancelled(format!(
                        "shutdown requested by {source:?}"
                    )));
                Ok(Value::Null)
            }
            EventType::Named(name) if name == "abort" => {
                let error = data
                    .get("error")
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "<no-error-data>".to_string());
                ctx.circuit().abort(CircuitError::Block {
                    block: source.to_string(),
                    message: format!("error reported: {error}"),
                });
                Ok(Value::Null)
            }
            other => Err(CircuitError::UnknownEvent {
                block: ctx.name(),
                etype: other.label(),
            }),
        }
    }

    fn init_regular(&self, ctx: &BlockCtx) -> SimResult<()> {
        ctx.set_output(Value::Null)
    }
}

/// Periodically re-send the last received event.
///
/// The original event is forwarded synchronously with `repeat: 0` (so a
/// forbidden event loop is not concealed); the attached main task then
/// re-sends it every `interval` with an incremented `repeat` counter,
/// stopping after `count` repeats when a cap is set. The block's output is
/// the current repeat counter.
pub struct Repeat {
    event: Event,
    etype: String,
    interval: Duration,
    count: Option<u64>,
    tx: Mutex<Option<mpsc::UnboundedSender<EventData>>>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<EventData>>>,
}

impl Repeat {
    pub fn new(
        circuit: &Arc<Circuit>,
        dest: impl Into<DestSpec>,
        etype: &str,
        interval: Duration,
        count: Option<u64>,
    ) -> SimResult<Self> {
        if interval.is_zero() {
            return Err(CircuitError::Config("repeat interval must be positive".into()));
        }
        Ok(Self {
            event: Event::new_in(circuit, dest, etype),
            etype: etype.to_string(),
            interval,
            count,
            tx: Mutex::new(None),
            rx: Mutex::new(None),
        })
    }
}

impl SeqLogic for Repeat {
    fn handle_event(
        &self,
        ctx: &BlockCtx,
        etype: &EventType,
        data: &EventData,
    ) -> SimResult<Value> {
        match etype {
            EventType::Named(name) if *name == self.etype => {
                let mut data = data.clone();
                let orig_source = data.get("source").cloned().unwrap_or(Value::Null);
                data.insert("orig_source".into(), orig_source);
                ctx.set_output(json!(0))?;
                let mut first = data.clone();
                first.insert("repeat".into(), json!(0));
                self.event.send(ctx.circuit(), ctx.id, first)?;
                if let Some(tx) = &*self.tx.lock() {
                    let _ = tx.send(data);
                }
                Ok(Value::Null)
            }
            // other event types pass through this block unnoticed
            _ => Ok(Value::Null),
        }
    }

    fn init_regular(&self, ctx: &BlockCtx) -> SimResult<()> {
        ctx.set_output(json!(0))
    }

    fn start(&self, _ctx: &BlockCtx) -> SimResult<()> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.tx.lock() = Some(tx);
        *self.rx.lock() = Some(rx);
        Ok(())
    }

    fn as_main_task(&self) -> Option<&dyn MainTask> {
        Some(self)
    }
}

#[async_trait]
impl MainTask for Repeat {
    async fn run(&self, ctx: BlockCtx) -> SimResult<()> {
        let mut rx = self.rx.lock().take().ok_or_else(|| {
            CircuitError::InvalidState("repeat task started before start()".into())
        })?;
        let mut data = EventData::new();
        let mut repeating = false;
        let mut repeat: u64 = 0;
        loop {
            if repeating {
                match tokio::time::timeout(self.interval, rx.recv()).await {
                    Ok(Some(received)) => {
                        data = received;
                        repeat = 0;
                    }
                    Ok(None) => return Ok(()),
                    Err(_) => repeat += 1,
                }
            } else {
                // avoid the timeout overhead while nothing is repeating
                match rx.recv().await {
                    Some(received) => {
                        data = received;
                        repeat = 0;
                    }
                    None => return Ok(()),
                }
            }
            if repeat > 0 {
                // skip the original event, it was forwarded synchronously
                ctx.set_output(json!(repeat))?;
                let mut resend = data.clone();
                resend.insert("repeat".into(), json!(repeat));
                self.event.send(ctx.circuit(), ctx.id, resend)?;
            }
            repeating = self.count.map_or(true, |count| repeat < count);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::SlotValues;
    use indexmap::indexmap;

    fn single_input(value: Option<Value>) -> Inputs {
        Inputs::new(indexmap! {
            "_".to_string() => SlotValues::Group(vec![value]),
        })
    }

    #[test]
    fn test_invert() {
        assert_eq!(
            Invert.calc_output(&single_input(Some(json!(true)))).unwrap(),
            json!(false)
        );
        assert_eq!(
            Invert.calc_output(&single_input(Some(json!(0)))).unwrap(),
            json!(true)
        );
        // undefined input counts as false
        assert_eq!(Invert.calc_output(&single_input(None)).unwrap(), json!(true));
    }

    #[test]
    fn test_invert_signature() {
        let good = single_input(Some(json!(1))).signature();
        assert!(Invert.check_connections(&good).is_ok());
        let bad = Inputs::new(indexmap! {
            "_".to_string() => SlotValues::Group(vec![Some(json!(1)), Some(json!(2))]),
        })
        .signature();
        assert!(Invert.check_connections(&bad).is_err());
    }

    #[test]
    fn test_repeat_rejects_zero_interval() {
        let circuit = Circuit::new_arc();
        assert!(Repeat::new(&circuit, "dest", "put", Duration::ZERO, None).is_err());
    }
}
