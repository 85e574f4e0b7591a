//! Minimal fixture blocks for engine testing.
//!
//! Provides small, dependency-free logic implementations used by the unit
//! and integration tests: a value input, an event recorder and a
//! restartable on/off timer machine.

use std::sync::Arc;

use serde_json::json;

use crate::block::{BlockCtx, SeqLogic};
use crate::error::{CircuitError, SimResult};
use crate::event::EventType;
use crate::fsm::{FromStates, Fsm, FsmDef, INF_TIME};
use crate::value::{EventData, Value};

/// A `put`-driven value input. The output mirrors the last `value` item;
/// `initdef` is applied directly.
pub struct ValueStore;

impl SeqLogic for ValueStore {
    fn handle_event(
        &self,
        ctx: &BlockCtx,
        etype: &EventType,
        data: &EventData,
    ) -> SimResult<Value> {
        match etype {
            EventType::Named(name) if name == "put" => {
                let value = data
                    .get("value")
                    .cloned()
                    .ok_or_else(|| CircuitError::Config("missing event data item 'value'".into()))?;
                ctx.set_output(value.clone())?;
                Ok(value)
            }
            other => Err(CircuitError::UnknownEvent {
                block: ctx.name(),
                etype: other.label(),
            }),
        }
    }

    fn init_from_value(&self, ctx: &BlockCtx, value: &Value) -> SimResult<()> {
        ctx.set_output(value.clone())
    }
}

/// A block that initializes to `null` and accepts no events.
pub struct Noop;

impl SeqLogic for Noop {
    fn handle_event(
        &self,
        ctx: &BlockCtx,
        etype: &EventType,
        _data: &EventData,
    ) -> SimResult<Value> {
        Err(CircuitError::UnknownEvent {
            block: ctx.name(),
            etype: etype.label(),
        })
    }

    fn init_regular(&self, ctx: &BlockCtx) -> SimResult<()> {
        ctx.set_output(Value::Null)
    }
}

/// Records every received event: the output becomes
/// `[event_label, event_data]`.
pub struct EventMemory;

impl SeqLogic for EventMemory {
    fn handle_event(
        &self,
        ctx: &BlockCtx,
        etype: &EventType,
        data: &EventData,
    ) -> SimResult<Value> {
        ctx.set_output(json!([etype.label(), Value::Object(data.clone())]))?;
        Ok(Value::Null)
    }

    fn init_regular(&self, ctx: &BlockCtx) -> SimResult<()> {
        ctx.set_output(Value::Null)
    }
}

/// Transition tables of the classic on/off timer machine.
pub fn timer_def() -> Arc<FsmDef> {
    FsmDef::builder()
        .states(["off", "on"])
        .event("start", FromStates::Any, "on")
        .event("stop", FromStates::Any, "off")
        .event("toggle", "on", "off")
        .event("toggle", "off", "on")
        .timer("on", Some(INF_TIME), "stop")
        .timer("off", Some(INF_TIME), "start")
        .build()
        .expect("timer tables are valid")
}

/// An on/off timer instance with boolean output.
///
/// With `restartable = false` a `start` event received in the `on` state
/// (or `stop` in `off`) is rejected, leaving a running timer untouched.
pub fn timer_fsm(restartable: bool) -> Fsm {
    Fsm::new(timer_def())
        .cond("start", move |view| restartable || view.state != Some("on"))
        .expect("known event")
        .cond("stop", move |view| restartable || view.state != Some("off"))
        .expect("known event")
        .with_output(|state, _sdata| Some(json!(state == "on")))
}
