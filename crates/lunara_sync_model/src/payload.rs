//! Flat field-map payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// An entity payload modeled as a flat field map.
///
/// Field values are JSON documents, matching what the remote store holds.
/// Each field may carry its own edit timestamp; when both sides of a
/// conflict carry them, the resolver merges field-wise instead of falling
/// back to whole-record last-write-wins.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    fields: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    field_edited_at: BTreeMap<String, DateTime<Utc>>,
}

impl Payload {
    /// Creates an empty payload.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a field without an edit timestamp (coarse-grained payload).
    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.fields.insert(name.into(), value);
    }

    /// Sets a field and records when it was edited.
    pub fn set_at(&mut self, name: impl Into<String>, value: Value, edited_at: DateTime<Utc>) {
        let name = name.into();
        self.field_edited_at.insert(name.clone(), edited_at);
        self.fields.insert(name, value);
    }

    /// Returns a field value.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Returns the edit timestamp of a field, if one was recorded.
    pub fn edited_at(&self, name: &str) -> Option<DateTime<Utc>> {
        self.field_edited_at.get(name).copied()
    }

    /// Returns true if any field carries an edit timestamp.
    pub fn has_field_timestamps(&self) -> bool {
        !self.field_edited_at.is_empty()
    }

    /// Iterates over fields in name order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Returns the number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Returns true if the payload has no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn set_and_get() {
        let mut payload = Payload::new();
        payload.set("flow", json!("medium"));
        payload.set("mood", json!(["calm", "tired"]));

        assert_eq!(payload.get("flow"), Some(&json!("medium")));
        assert_eq!(payload.len(), 2);
        assert!(!payload.has_field_timestamps());
    }

    #[test]
    fn field_timestamps() {
        let mut payload = Payload::new();
        payload.set_at("flow", json!("heavy"), ts(100));
        payload.set("note", json!("untracked"));

        assert!(payload.has_field_timestamps());
        assert_eq!(payload.edited_at("flow"), Some(ts(100)));
        assert_eq!(payload.edited_at("note"), None);
    }

    #[test]
    fn overwrite_keeps_latest_timestamp() {
        let mut payload = Payload::new();
        payload.set_at("flow", json!("light"), ts(100));
        payload.set_at("flow", json!("heavy"), ts(200));

        assert_eq!(payload.get("flow"), Some(&json!("heavy")));
        assert_eq!(payload.edited_at("flow"), Some(ts(200)));
    }

    #[test]
    fn serde_roundtrip() {
        let mut payload = Payload::new();
        payload.set_at("temperature", json!(36.7), ts(50));

        let encoded = serde_json::to_string(&payload).unwrap();
        let decoded: Payload = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, payload);
    }
}
