//! The dynamic value model shared by outputs, event data and persisted state.
//!
//! A block output is `Option<Value>`: `None` is the "not yet defined"
//! sentinel, so JSON `null` remains a valid, distinct output value. Event
//! data is an ordered string-keyed mapping of values; keys whose value
//! would be undefined (for example `previous` on the very first output
//! change) are omitted instead of being set to `null`.

/// Dynamic value carried on outputs and in event data.
pub type Value = serde_json::Value;

/// Ordered string-keyed event payload.
pub type EventData = serde_json::Map<String, Value>;

/// Truth test used by conditional events and filters.
///
/// `null`, `false`, numeric zero, the empty string and empty containers are
/// falsy; everything else is truthy. An absent value counts as falsy.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Build event data from key/value pairs.
pub fn data_from<I, K>(pairs: I) -> EventData
where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<String>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}

/// Event data carrying just a `value` item.
pub fn value_data(value: Value) -> EventData {
    data_from([("value", value)])
}

/// Check a block, state or event name: non-empty, and names starting with
/// an underscore are reserved for the engine.
pub fn check_name(name: &str, what: &str, allow_reserved: bool) -> crate::error::SimResult<()> {
    if name.is_empty() {
        return Err(crate::error::CircuitError::Config(format!(
            "{what} must be a non-empty string"
        )));
    }
    if name.starts_with('_') && !allow_reserved {
        return Err(crate::error::CircuitError::Config(format!(
            "{name:?} is a reserved {what} (leading underscore)"
        )));
    }
    Ok(())
}

/// Unix-style wildcard match supporting `*` and `?`.
///
/// The original debug-flag control matched block names with `fnmatch`;
/// this is the minimal equivalent needed for name patterns.
pub fn wildcard_match(pattern: &str, name: &str) -> bool {
    fn rec(p: &[u8], n: &[u8]) -> bool {
        match (p.first(), n.first()) {
            (None, None) => true,
            (Some(b'*'), _) => rec(&p[1..], n) || (!n.is_empty() && rec(p, &n[1..])),
            (Some(b'?'), Some(_)) => rec(&p[1..], &n[1..]),
            (Some(c), Some(d)) if c == d => rec(&p[1..], &n[1..]),
            _ => false,
        }
    }
    rec(pattern.as_bytes(), name.as_bytes())
}

/// Format an output for log records: `<undef>` for the missing value.
pub fn fmt_output(value: &Option<Value>) -> String {
    match value {
        None => "<undef>".to_string(),
        Some(v) => v.to_string(),
    }
}

/// `true`/`false` and friends for environment toggles.
pub fn env_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_truthiness() {
        assert!(!truthy(&json!(null)));
        assert!(!truthy(&json!(false)));
        assert!(!truthy(&json!(0)));
        assert!(!truthy(&json!("")));
        assert!(!truthy(&json!([])));
        assert!(truthy(&json!(true)));
        assert!(truthy(&json!(0.5)));
        assert!(truthy(&json!("x")));
        assert!(truthy(&json!([0])));
    }

    #[test]
    fn test_check_name() {
        assert!(check_name("valve", "block name", false).is_ok());
        assert!(check_name("", "block name", false).is_err());
        assert!(check_name("_ctrl", "block name", false).is_err());
        assert!(check_name("_ctrl", "block name", true).is_ok());
    }

    #[test]
    fn test_wildcard_match() {
        assert!(wildcard_match("pump*", "pump_main"));
        assert!(wildcard_match("*", "anything"));
        assert!(wildcard_match("p?mp", "pump"));
        assert!(!wildcard_match("pump*", "valve"));
        assert!(!wildcard_match("p?mp", "pmp"));
    }

    #[test]
    fn test_env_flag() {
        assert_eq!(env_flag("1"), Some(true));
        assert_eq!(env_flag("Off"), Some(false));
        assert_eq!(env_flag("maybe"), None);
    }

    #[test]
    fn test_data_builders() {
        let d = value_data(json!(3));
        assert_eq!(d.get("value"), Some(&json!(3)));
        let d = data_from([("a", json!(1)), ("b", json!(2))]);
        assert_eq!(d.len(), 2);
    }
}
