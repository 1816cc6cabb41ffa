//! Lenient payload decoding.
//!
//! A chain shares one payload across all of its commands and each command only
//! reads its own subset, so conversion never fails: a field that is missing or
//! does not fit its declared type keeps its default. Values that a command
//! cannot do without are declared as [`Required`] and checked at first use.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("required field `{0}` was not provided")]
pub struct MissingField(pub &'static str);

/// Decode `payload` into `T`, falling back to `T::default()` field by field.
///
/// Every top-level key of the payload is tried on its own; keys that make
/// the target fail to deserialize are dropped and their field keeps its
/// default.
pub fn decode_lenient<T>(payload: &Value) -> T
where
    T: DeserializeOwned + Serialize + Default,
{
    if let Ok(value) = serde_json::from_value::<T>(payload.clone()) {
        return value;
    }

    let defaults = T::default();
    let mut merged = match serde_json::to_value(&defaults) {
        Ok(Value::Object(map)) => map,
        _ => return defaults,
    };

    let Value::Object(fields) = payload else {
        return defaults;
    };

    for (key, value) in fields {
        let previous = merged.insert(key.clone(), value.clone());
        if serde_json::from_value::<T>(Value::Object(merged.clone())).is_err() {
            match previous {
                Some(old) => merged.insert(key.clone(), old),
                None => merged.remove(key),
            };
        }
    }

    serde_json::from_value::<T>(Value::Object(merged)).unwrap_or(defaults)
}

/// The payload section a command reads: `payload[section]` if that is an
/// object, else the whole payload.
pub fn section<'a>(payload: &'a Value, name: &str) -> &'a Value {
    match payload.get(name) {
        Some(v @ Value::Object(_)) => v,
        _ => payload,
    }
}

/// Convenience over [`decode_lenient`] for a named payload section.
pub fn decode_section<T>(payload: &Value, name: &str) -> T
where
    T: DeserializeOwned + Serialize + Default,
{
    decode_lenient(section(payload, name))
}

/// A field that defaults to absent and is validated only when read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Required<T>(Option<T>);

impl<T> Default for Required<T> {
    fn default() -> Self {
        Required(None)
    }
}

impl<T> Required<T> {
    pub fn new(value: T) -> Self {
        Required(Some(value))
    }

    pub fn get(&self, field: &'static str) -> Result<&T, MissingField> {
        self.0.as_ref().ok_or(MissingField(field))
    }

    pub fn is_present(&self) -> bool {
        self.0.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
    #[serde(default, rename_all = "camelCase")]
    struct Provision {
        host: Required<String>,
        cpus: u32,
        memory_mb: u64,
        tags: Vec<String>,
        dry_run: bool,
    }

    #[test]
    fn missing_fields_take_defaults() {
        let p: Provision = decode_lenient(&json!({"cpus": 4}));
        assert_eq!(p.cpus, 4);
        assert_eq!(p.memory_mb, 0);
        assert!(!p.host.is_present());
    }

    #[test]
    fn malformed_field_is_dropped_not_fatal() {
        let p: Provision = decode_lenient(&json!({"cpus": "lots", "memoryMb": 2048, "tags": ["a"]}));
        assert_eq!(p.cpus, 0);
        assert_eq!(p.memory_mb, 2048);
        assert_eq!(p.tags, vec!["a".to_string()]);
    }

    #[test]
    fn non_object_payload_yields_default() {
        let p: Provision = decode_lenient(&json!([1, 2, 3]));
        assert_eq!(p, Provision::default());
        let p: Provision = decode_lenient(&Value::Null);
        assert_eq!(p, Provision::default());
    }

    #[test]
    fn required_field_fails_only_on_use() {
        let p: Provision = decode_lenient(&json!({}));
        assert_eq!(p.host.get("host"), Err(MissingField("host")));

        let p: Provision = decode_lenient(&json!({"host": "hv-01"}));
        assert_eq!(p.host.get("host").unwrap(), "hv-01");
    }

    #[test]
    fn section_falls_back_to_whole_payload() {
        let payload = json!({"provision": {"cpus": 2}, "cpus": 8});
        let p: Provision = decode_section(&payload, "provision");
        assert_eq!(p.cpus, 2);
        let p: Provision = decode_section(&payload, "absent");
        assert_eq!(p.cpus, 8);
    }
}
