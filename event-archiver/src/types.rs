use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ValidationError;

/// The event envelope the archiver moves from the log to the store.
///
/// `id`, `type`, `source` and `time` are required; everything else in the
/// payload is opaque to the archiver and passes through untouched. `id` is
/// the store's primary key, so redelivering the same record is a no-op.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    #[serde(default)]
    pub id: String,

    #[serde(rename = "type", default)]
    pub event_type: String,

    #[serde(default)]
    pub source: String,

    #[serde(default)]
    pub time: Option<DateTime<Utc>>,

    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl Record {
    /// Decode and validate a record in one step. Validity is checked once,
    /// here, before any store interaction.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ValidationError> {
        let record: Record = serde_json::from_slice(bytes)?;
        record.validate()?;
        Ok(record)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.is_empty() {
            return Err(ValidationError::MissingField("id"));
        }
        if self.event_type.is_empty() {
            return Err(ValidationError::MissingField("type"));
        }
        if self.source.is_empty() {
            return Err(ValidationError::MissingField("source"));
        }
        if self.time.is_none() {
            return Err(ValidationError::MissingField("time"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn encode(value: Value) -> Vec<u8> {
        serde_json::to_vec(&value).unwrap()
    }

    #[test]
    fn valid_record_decodes() {
        let record = Record::from_bytes(&encode(json!({
            "id": "evt-1",
            "type": "user.created",
            "source": "accounts",
            "time": "2024-06-01T12:00:00Z",
            "plan": "pro",
            "seats": 4
        })))
        .unwrap();

        assert_eq!(record.id, "evt-1");
        assert_eq!(record.event_type, "user.created");
        assert_eq!(record.source, "accounts");
        assert!(record.time.is_some());
    }

    #[test]
    fn extra_payload_fields_pass_through_untouched() {
        let payload = json!({
            "id": "evt-2",
            "type": "user.created",
            "source": "accounts",
            "time": "2024-06-01T12:00:00Z",
            "nested": {"a": [1, 2, 3]},
            "flag": true
        });
        let record = Record::from_bytes(&encode(payload)).unwrap();

        assert_eq!(record.payload.get("nested"), Some(&json!({"a": [1, 2, 3]})));
        assert_eq!(record.payload.get("flag"), Some(&json!(true)));
        // required fields are not duplicated into the passthrough map
        assert!(!record.payload.contains_key("id"));
    }

    #[test]
    fn missing_or_empty_required_fields_are_invalid() {
        let cases = [
            (json!({"type": "t", "source": "s", "time": "2024-06-01T12:00:00Z"}), "id"),
            (
                json!({"id": "", "type": "t", "source": "s", "time": "2024-06-01T12:00:00Z"}),
                "id",
            ),
            (json!({"id": "x", "source": "s", "time": "2024-06-01T12:00:00Z"}), "type"),
            (json!({"id": "x", "type": "t", "time": "2024-06-01T12:00:00Z"}), "source"),
            (json!({"id": "x", "type": "t", "source": "s"}), "time"),
        ];

        for (value, field) in cases {
            match Record::from_bytes(&encode(value)) {
                Err(ValidationError::MissingField(found)) => assert_eq!(found, field),
                other => panic!("expected MissingField({field}), got {other:?}"),
            }
        }
    }

    #[test]
    fn garbage_bytes_are_invalid() {
        assert!(matches!(
            Record::from_bytes(b"not json"),
            Err(ValidationError::Undecodable(_))
        ));
    }

    #[test]
    fn malformed_timestamp_is_invalid() {
        let result = Record::from_bytes(&encode(json!({
            "id": "x",
            "type": "t",
            "source": "s",
            "time": "yesterday-ish"
        })));
        assert!(matches!(result, Err(ValidationError::Undecodable(_))));
    }
}
