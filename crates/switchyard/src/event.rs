//! Typed events, the filter pipeline and the external event entry.
//!
//! An [`Event`] is a sending definition with a fixed destination and type;
//! the payload varies per send. Destinations may be forward references by
//! name, resolved at circuit finalization.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use crate::block::{BlockHandle, BlockId};
use crate::circuit::{Circuit, NameCell, TypeReq};
use crate::error::{CircuitError, SimResult};
use crate::value::{EventData, Value};

/// An event type: a plain name, a conditional selector or a direct state
/// transition (FSM only).
#[derive(Debug, Clone, PartialEq)]
pub enum EventType {
    /// Regular named event (`"put"`, `"start"`, ...).
    Named(String),
    /// Conditional event resolved against the `value` data item.
    Cond(EventCond),
    /// Direct FSM transition bypassing the transition table.
    Goto(String),
}

/// Conditional event selector: `etrue` is delivered when `value` is truthy,
/// `efalse` otherwise. A `None` side means "no event".
#[derive(Debug, Clone, PartialEq)]
pub struct EventCond {
    pub etrue: Option<Box<EventType>>,
    pub efalse: Option<Box<EventType>>,
}

impl EventType {
    pub fn named(name: impl Into<String>) -> Self {
        EventType::Named(name.into())
    }

    pub fn goto(state: impl Into<String>) -> Self {
        EventType::Goto(state.into())
    }

    /// Build a conditional event from the two branches.
    pub fn cond(etrue: Option<EventType>, efalse: Option<EventType>) -> Self {
        EventType::Cond(EventCond {
            etrue: etrue.map(Box::new),
            efalse: efalse.map(Box::new),
        })
    }

    /// Human-readable label for logs and error messages.
    pub fn label(&self) -> String {
        match self {
            EventType::Named(n) => n.clone(),
            EventType::Cond(c) => {
                let side = |s: &Option<Box<EventType>>| {
                    s.as_ref().map(|e| e.label()).unwrap_or_else(|| "-".into())
                };
                format!("cond({}, {})", side(&c.etrue), side(&c.efalse))
            }
            EventType::Goto(s) => format!("goto:{s}"),
        }
    }

    pub(crate) fn validate(&self) -> SimResult<()> {
        match self {
            EventType::Named(n) if n.is_empty() => Err(CircuitError::Config(
                "event name must be a non-empty string".into(),
            )),
            _ => Ok(()),
        }
    }
}

impl From<&str> for EventType {
    fn from(name: &str) -> Self {
        EventType::Named(name.to_string())
    }
}

impl From<String> for EventType {
    fn from(name: String) -> Self {
        EventType::Named(name)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Event destination: a name (late-resolved) or an existing block.
#[derive(Debug, Clone)]
pub enum DestSpec {
    Name(String),
    Id(BlockId),
}

impl From<&str> for DestSpec {
    fn from(name: &str) -> Self {
        DestSpec::Name(name.to_string())
    }
}

impl From<String> for DestSpec {
    fn from(name: String) -> Self {
        DestSpec::Name(name)
    }
}

impl From<&BlockHandle> for DestSpec {
    fn from(handle: &BlockHandle) -> Self {
        DestSpec::Id(handle.id)
    }
}

impl From<BlockHandle> for DestSpec {
    fn from(handle: BlockHandle) -> Self {
        DestSpec::Id(handle.id)
    }
}

/// Verdict of one event filter.
pub enum FilterVerdict {
    /// Keep the (possibly mutated) data and continue the pipeline.
    Accept,
    /// Cancel delivery; the rest of the pipeline does not run.
    Reject,
    /// Replace the payload and continue the pipeline.
    Replace(EventData),
}

/// A pure function transforming or rejecting event data.
pub trait EventFilter: Send + Sync {
    fn apply(&self, data: &mut EventData) -> FilterVerdict;
}

impl<F> EventFilter for F
where
    F: Fn(&mut EventData) -> FilterVerdict + Send + Sync,
{
    fn apply(&self, data: &mut EventData) -> FilterVerdict {
        self(data)
    }
}

/// An event sending definition: destination, type and filter pipeline.
pub struct Event {
    dest: Arc<NameCell>,
    etype: EventType,
    filters: Vec<Box<dyn EventFilter>>,
}

impl Event {
    /// Define an event targeting a block in the current circuit.
    pub fn new(dest: impl Into<DestSpec>, etype: impl Into<EventType>) -> Self {
        Self::new_in(&crate::circuit::current(), dest, etype)
    }

    /// Define an event targeting a block in an explicit circuit.
    pub fn new_in(
        circuit: &Arc<Circuit>,
        dest: impl Into<DestSpec>,
        etype: impl Into<EventType>,
    ) -> Self {
        let etype = etype.into();
        debug_assert!(etype.validate().is_ok());
        let dest = match dest.into() {
            DestSpec::Name(name) => NameCell::unresolved(name, TypeReq::Sequential),
            DestSpec::Id(id) => NameCell::resolved(id),
        };
        circuit.register_name_cell(dest.clone());
        Self {
            dest,
            etype,
            filters: Vec::new(),
        }
    }

    /// The standard simulation-abort event (`_ctrl` / `abort`).
    pub fn abort_event(circuit: &Arc<Circuit>) -> Self {
        Self::new_in(circuit, "_ctrl", "abort")
    }

    /// Wrap the destination in an automatically created repeater block that
    /// re-sends the last event every `interval` (at most `count` repeats).
    pub fn repeated(
        circuit: &Arc<Circuit>,
        dest: impl Into<DestSpec>,
        etype: &str,
        interval: Duration,
        count: Option<u64>,
    ) -> SimResult<Self> {
        let dest = dest.into();
        let destname = match &dest {
            DestSpec::Name(n) => n.clone(),
            DestSpec::Id(id) => circuit.block_name(*id),
        };
        let repeater = crate::blocks::Repeat::new(circuit, dest, etype, interval, count)?;
        let name = circuit.next_auto_name("repeat");
        let comment = format!("automatic repeat: event={etype:?}, destination={destname:?}");
        let handle = circuit.register_reserved_seq(&name, repeater, &comment)?;
        Ok(Self::new_in(circuit, &handle, etype))
    }

    /// Append a filter to the pipeline (applied left to right).
    pub fn with_filter(mut self, filter: impl EventFilter + 'static) -> Self {
        self.filters.push(Box::new(filter));
        self
    }

    pub fn etype(&self) -> &EventType {
        &self.etype
    }

    /// Destination description, valid before and after resolution.
    pub fn dest_label(&self) -> String {
        self.dest.label()
    }

    /// Apply the filter pipeline and deliver the event.
    ///
    /// Injects the sender's name as `source`. Returns `false` if a filter
    /// rejected the event.
    pub(crate) fn send(
        &self,
        circuit: &Arc<Circuit>,
        source: BlockId,
        mut data: EventData,
    ) -> SimResult<bool> {
        let source_name = circuit.block_name(source);
        data.insert("source".to_string(), json!(source_name));
        for filter in &self.filters {
            match filter.apply(&mut data) {
                FilterVerdict::Accept => {}
                FilterVerdict::Replace(new_data) => data = new_data,
                FilterVerdict::Reject => {
                    if circuit.debug_enabled(source) {
                        tracing::debug!(
                            block = %source_name,
                            event = %self.etype,
                            "event rejected by a filter"
                        );
                    }
                    return Ok(false);
                }
            }
        }
        let dest = self.dest.get_or_resolve(circuit)?;
        // A destination block may still be uninitialized: events can be
        // generated while the circuit is initializing.
        circuit.ensure_init_for_event(dest)?;
        circuit.deliver(dest, &self.etype, data)?;
        Ok(true)
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<event dest={:?}, type={:?}>",
            self.dest.label(),
            self.etype.label()
        )
    }
}

/// External event entry used by host-level I/O tasks.
///
/// The destination must exist when the entry is created (no forward
/// references) and the event type must be a plain name. Every delivered
/// payload carries a `source` item starting with the reserved `_ext_`
/// prefix.
pub struct ExtEvent {
    circuit: Arc<Circuit>,
    dest: BlockId,
    etype: String,
    source: String,
}

/// Reserved prefix marking externally injected events.
pub const EXT_SOURCE_PREFIX: &str = "_ext_";

fn normalize_source(source: &str) -> String {
    if source.starts_with(EXT_SOURCE_PREFIX) {
        source.to_string()
    } else {
        format!("{EXT_SOURCE_PREFIX}{source}")
    }
}

impl ExtEvent {
    /// Bind an external entry to `(destination, event type)`.
    pub fn new(
        circuit: &Arc<Circuit>,
        dest: impl Into<DestSpec>,
        etype: &str,
    ) -> SimResult<Self> {
        if etype.is_empty() {
            return Err(CircuitError::Config(
                "event name must be a non-empty string".into(),
            ));
        }
        let dest = match dest.into() {
            DestSpec::Name(name) => circuit
                .lookup(&name)
                .ok_or(CircuitError::NotFound(name))?,
            DestSpec::Id(id) => id,
        };
        circuit.require_sequential(dest)?;
        Ok(Self {
            circuit: circuit.clone(),
            dest,
            etype: etype.to_string(),
            source: normalize_source(""),
        })
    }

    /// Set the default source name (normalized with the `_ext_` prefix).
    pub fn with_source(mut self, source: &str) -> Self {
        self.source = normalize_source(source);
        self
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Send with a single `value` item.
    pub fn send(&self, value: Value) -> SimResult<Value> {
        self.send_data(crate::value::value_data(value))
    }

    /// Send with a full payload. A `source` item in the payload overrides
    /// the default source and is normalized as well.
    pub fn send_data(&self, mut data: EventData) -> SimResult<Value> {
        if !self.circuit.is_ready() {
            return Err(CircuitError::InvalidState(
                "circuit not ready for external events".into(),
            ));
        }
        let source = match data.get("source") {
            Some(Value::String(s)) => normalize_source(s),
            Some(other) => {
                return Err(CircuitError::Config(format!(
                    "event source must be a string, got {other}"
                )))
            }
            None => self.source.clone(),
        };
        data.insert("source".to_string(), json!(source));
        self.circuit
            .deliver(self.dest, &EventType::Named(self.etype.clone()), data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_labels() {
        assert_eq!(EventType::named("put").label(), "put");
        assert_eq!(EventType::goto("idle").label(), "goto:idle");
        let cond = EventType::cond(Some("on".into()), None);
        assert_eq!(cond.label(), "cond(on, -)");
    }

    #[test]
    fn test_source_normalization() {
        assert_eq!(normalize_source(""), "_ext_");
        assert_eq!(normalize_source("device"), "_ext_device");
        assert_eq!(normalize_source("_ext_HAL9000"), "_ext_HAL9000");
    }

    #[test]
    fn test_filter_closure_impl() {
        let filter = |data: &mut EventData| {
            if data.contains_key("value") {
                FilterVerdict::Accept
            } else {
                FilterVerdict::Reject
            }
        };
        let mut with_value = crate::value::value_data(serde_json::json!(1));
        assert!(matches!(filter.apply(&mut with_value), FilterVerdict::Accept));
        let mut empty = EventData::new();
        assert!(matches!(filter.apply(&mut empty), FilterVerdict::Reject));
    }
}
