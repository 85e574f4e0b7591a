//! Stock event filters for the dispatcher's filter pipeline.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::circuit::{Circuit, NameCell, TypeReq};
use crate::event::{DestSpec, EventFilter, FilterVerdict};
use crate::value::{truthy, EventData, Value};

/// Filter out the initial change from undefined to the first real value.
pub struct NotFromUndef;

impl EventFilter for NotFromUndef {
    fn apply(&self, data: &mut EventData) -> FilterVerdict {
        if data.contains_key("previous") {
            FilterVerdict::Accept
        } else {
            FilterVerdict::Reject
        }
    }
}

/// Edge detector for logical output values.
///
/// `rise` accepts false-to-true transitions, `fall` true-to-false ones.
/// The first value after undefined is controlled by `u_rise`/`u_fall`;
/// `u_rise` follows `rise` unless set explicitly.
pub struct Edge {
    rise: bool,
    fall: bool,
    u_rise: Option<bool>,
    u_fall: bool,
}

impl Default for Edge {
    fn default() -> Self {
        Self::new()
    }
}

impl Edge {
    pub fn new() -> Self {
        Self {
            rise: false,
            fall: false,
            u_rise: None,
            u_fall: false,
        }
    }

    pub fn rise(mut self, enabled: bool) -> Self {
        self.rise = enabled;
        self
    }

    pub fn fall(mut self, enabled: bool) -> Self {
        self.fall = enabled;
        self
    }

    pub fn u_rise(mut self, enabled: bool) -> Self {
        self.u_rise = Some(enabled);
        self
    }

    pub fn u_fall(mut self, enabled: bool) -> Self {
        self.u_fall = enabled;
        self
    }
}

impl EventFilter for Edge {
    fn apply(&self, data: &mut EventData) -> FilterVerdict {
        let value = data.get("value").map(truthy).unwrap_or(false);
        let accepted = match data.get("previous") {
            None => {
                if value {
                    self.u_rise.unwrap_or(self.rise)
                } else {
                    self.u_fall
                }
            }
            Some(previous) => {
                let previous = truthy(previous);
                if value {
                    !previous && self.rise
                } else {
                    previous && self.fall
                }
            }
        };
        if accepted {
            FilterVerdict::Accept
        } else {
            FilterVerdict::Reject
        }
    }
}

/// Pass numeric values only when they differ from the last passed value
/// by at least `delta`.
pub struct Delta {
    delta: f64,
    last: Mutex<Option<f64>>,
}

impl Delta {
    pub fn new(delta: f64) -> Self {
        Self {
            delta,
            last: Mutex::new(None),
        }
    }
}

impl EventFilter for Delta {
    fn apply(&self, data: &mut EventData) -> FilterVerdict {
        let value = match data.get("value").and_then(Value::as_f64) {
            Some(value) => value,
            None => return FilterVerdict::Reject,
        };
        let mut last = self.last.lock();
        match *last {
            Some(previous) if (previous - value).abs() < self.delta => FilterVerdict::Reject,
            _ => {
                *last = Some(value);
                FilterVerdict::Accept
            }
        }
    }
}

/// Enable or disable events depending on another block's output.
pub struct IfOutput {
    circuit: Weak<Circuit>,
    control: Arc<NameCell>,
}

impl IfOutput {
    pub fn new(circuit: &Arc<Circuit>, control: impl Into<DestSpec>) -> Self {
        let control = match control.into() {
            DestSpec::Name(name) => NameCell::unresolved(name, TypeReq::Any),
            DestSpec::Id(id) => NameCell::resolved(id),
        };
        circuit.register_name_cell(control.clone());
        Self {
            circuit: Arc::downgrade(circuit),
            control,
        }
    }
}

impl EventFilter for IfOutput {
    fn apply(&self, data: &mut EventData) -> FilterVerdict {
        let _ = data;
        let circuit = match self.circuit.upgrade() {
            Some(circuit) => circuit,
            None => return FilterVerdict::Reject,
        };
        let id = match self.control.get_or_resolve(&circuit) {
            Ok(id) => id,
            Err(_) => return FilterVerdict::Reject,
        };
        match circuit.output_of(id) {
            Some(output) if truthy(&output) => FilterVerdict::Accept,
            _ => FilterVerdict::Reject,
        }
    }
}

/// Outcome of a [`DataEdit::modify`] step.
pub enum EditOutcome {
    Replace(Value),
    Delete,
    Reject,
}

type EditFn = Box<dyn Fn(&mut EventData) -> bool + Send + Sync>;

/// Chainable event data editor.
///
/// ```ignore
/// Event::new_in(&circuit, "dest", "put")
///     .with_filter(DataEdit::new().rename("value", "reading").add("unit", json!("C")));
/// ```
#[derive(Default)]
pub struct DataEdit {
    edits: Vec<EditFn>,
}

impl DataEdit {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(mut self, edit: impl Fn(&mut EventData) -> bool + Send + Sync + 'static) -> Self {
        self.edits.push(Box::new(edit));
        self
    }

    /// Add a key/value pair, overwriting an existing value.
    pub fn add(self, key: &str, value: Value) -> Self {
        let key = key.to_string();
        self.push(move |data| {
            data.insert(key.clone(), value.clone());
            true
        })
    }

    /// Add key/value pairs only where the key is missing.
    pub fn setdefault(self, key: &str, value: Value) -> Self {
        let key = key.to_string();
        self.push(move |data| {
            data.entry(key.clone()).or_insert_with(|| value.clone());
            true
        })
    }

    /// Copy `data[src]` to `data[dst]`; rejects the event if `src` is
    /// missing.
    pub fn copy(self, src: &str, dst: &str) -> Self {
        let src = src.to_string();
        let dst = dst.to_string();
        self.push(move |data| match data.get(&src).cloned() {
            Some(value) => {
                data.insert(dst.clone(), value);
                true
            }
            None => false,
        })
    }

    /// Rename `src` to `dst`; rejects the event if `src` is missing.
    pub fn rename(self, src: &str, dst: &str) -> Self {
        let src = src.to_string();
        let dst = dst.to_string();
        self.push(move |data| match data.remove(&src) {
            Some(value) => {
                data.insert(dst.clone(), value);
                true
            }
            None => false,
        })
    }

    /// Delete the listed keys; missing keys are ignored.
    pub fn delete(self, keys: &[&str]) -> Self {
        let keys: Vec<String> = keys.iter().map(|k| k.to_string()).collect();
        self.push(move |data| {
            for key in &keys {
                data.remove(key);
            }
            true
        })
    }

    /// Delete all but the listed keys.
    pub fn permit(self, keys: &[&str]) -> Self {
        let keys: Vec<String> = keys.iter().map(|k| k.to_string()).collect();
        self.push(move |data| {
            data.retain(|key, _| keys.iter().any(|k| k == key));
            true
        })
    }

    /// Apply a function to the value under `key`; rejects the event if the
    /// key is missing or the function says so.
    pub fn modify(
        self,
        key: &str,
        func: impl Fn(&Value) -> EditOutcome + Send + Sync + 'static,
    ) -> Self {
        let key = key.to_string();
        self.push(move |data| {
            let current = match data.get(&key) {
                Some(value) => value.clone(),
                None => return false,
            };
            match func(&current) {
                EditOutcome::Replace(value) => {
                    data.insert(key.clone(), value);
                    true
                }
                EditOutcome::Delete => {
                    data.remove(&key);
                    true
                }
                EditOutcome::Reject => false,
            }
        })
    }
}

impl EventFilter for DataEdit {
    fn apply(&self, data: &mut EventData) -> FilterVerdict {
        for edit in &self.edits {
            if !edit(data) {
                return FilterVerdict::Reject;
            }
        }
        FilterVerdict::Accept
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::data_from;
    use serde_json::json;

    fn out_data(previous: Option<Value>, value: Value) -> EventData {
        let mut data = EventData::new();
        if let Some(previous) = previous {
            data.insert("previous".into(), previous);
        }
        data.insert("value".into(), value);
        data
    }

    fn accepts(filter: &dyn EventFilter, data: &EventData) -> bool {
        matches!(filter.apply(&mut data.clone()), FilterVerdict::Accept)
    }

    #[test]
    fn test_not_from_undef() {
        assert!(!accepts(&NotFromUndef, &out_data(None, json!(true))));
        assert!(accepts(&NotFromUndef, &out_data(Some(json!(false)), json!(true))));
    }

    #[test]
    fn test_edge_rise() {
        let edge = Edge::new().rise(true);
        assert!(accepts(&edge, &out_data(Some(json!(false)), json!(true))));
        assert!(!accepts(&edge, &out_data(Some(json!(true)), json!(true))));
        assert!(!accepts(&edge, &out_data(Some(json!(true)), json!(false))));
        // u_rise follows rise by default
        assert!(accepts(&edge, &out_data(None, json!(true))));
        assert!(!accepts(&edge, &out_data(None, json!(false))));
    }

    #[test]
    fn test_edge_u_rise_override() {
        let edge = Edge::new().rise(true).u_rise(false);
        assert!(!accepts(&edge, &out_data(None, json!(true))));
        assert!(accepts(&edge, &out_data(Some(json!(false)), json!(true))));
    }

    #[test]
    fn test_edge_fall() {
        let edge = Edge::new().fall(true);
        assert!(accepts(&edge, &out_data(Some(json!(true)), json!(false))));
        assert!(!accepts(&edge, &out_data(Some(json!(false)), json!(false))));
        assert!(!accepts(&edge, &out_data(None, json!(false))));
        let edge = Edge::new().fall(true).u_fall(true);
        assert!(accepts(&edge, &out_data(None, json!(false))));
    }

    #[test]
    fn test_delta() {
        let delta = Delta::new(1.0);
        assert!(accepts(&delta, &out_data(None, json!(0.0))));
        assert!(!accepts(&delta, &out_data(None, json!(0.5))));
        assert!(accepts(&delta, &out_data(None, json!(1.5))));
        assert!(!accepts(&delta, &out_data(None, json!(2.0))));
    }

    #[test]
    fn test_data_edit() {
        let edit = DataEdit::new()
            .add("unit", json!("C"))
            .rename("value", "reading")
            .setdefault("unit", json!("F"))
            .delete(&["previous"]);
        let mut data = out_data(Some(json!(1)), json!(2));
        assert!(matches!(edit.apply(&mut data), FilterVerdict::Accept));
        assert_eq!(data.get("unit"), Some(&json!("C")));
        assert_eq!(data.get("reading"), Some(&json!(2)));
        assert!(!data.contains_key("value"));
        assert!(!data.contains_key("previous"));
    }

    #[test]
    fn test_data_edit_rejects() {
        let edit = DataEdit::new().rename("missing", "x");
        let mut data = EventData::new();
        assert!(matches!(edit.apply(&mut data), FilterVerdict::Reject));

        let edit = DataEdit::new().modify("value", |_| EditOutcome::Reject);
        let mut data = data_from([("value", json!(5))]);
        assert!(matches!(edit.apply(&mut data), FilterVerdict::Reject));
    }

    #[test]
    fn test_data_edit_permit_and_modify() {
        let edit = DataEdit::new()
            .permit(&["value"])
            .modify("value", |v| EditOutcome::Replace(json!(v.as_i64().unwrap() + 1)));
        let mut data = out_data(Some(json!(0)), json!(41));
        assert!(matches!(edit.apply(&mut data), FilterVerdict::Accept));
        assert_eq!(data.len(), 1);
        assert_eq!(data.get("value"), Some(&json!(42)));
    }
}
