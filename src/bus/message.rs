//! Canonical message envelope and its wire form.
//!
//! Every stream entry carries a single field, [`DATA_FIELD`], holding the
//! JSON-serialized envelope `{ "trace": { "trace_id": ... }, "payload": ... }`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Name of the entry field holding the serialized envelope.
pub const DATA_FIELD: &str = "data";

/// Envelope schema violations. Raised before any side effect.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Message envelope must be a JSON object")]
    NotAnObject,

    #[error("Invalid field '{field}': {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("trace.trace_id must not be empty")]
    EmptyTraceId,
}

/// Correlation block; its `trace_id` is the dedup key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trace {
    pub trace_id: String,
}

/// Validated message envelope.
///
/// The payload stays opaque JSON; consumers interpret it with their own types.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageCanonical {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<Trace>,
    pub payload: Value,
}

impl MessageCanonical {
    /// Envelope without a trace; never deduplicated.
    pub fn new(payload: Value) -> Self {
        Self {
            trace: None,
            payload,
        }
    }

    /// Envelope deduplicated on `trace_id`.
    pub fn traced(trace_id: impl Into<String>, payload: Value) -> Self {
        Self {
            trace: Some(Trace {
                trace_id: trace_id.into(),
            }),
            payload,
        }
    }

    pub fn trace_id(&self) -> Option<&str> {
        self.trace.as_ref().map(|t| t.trace_id.as_str())
    }

    /// Check the invariants the type alone cannot express.
    pub fn validate(&self) -> Result<(), ValidationError> {
        match &self.trace {
            Some(trace) if trace.trace_id.trim().is_empty() => Err(ValidationError::EmptyTraceId),
            _ => Ok(()),
        }
    }

    /// Parse and validate an untyped envelope. Unknown top-level keys are dropped.
    pub fn from_value(value: Value) -> Result<Self, ValidationError> {
        let Value::Object(mut obj) = value else {
            return Err(ValidationError::NotAnObject);
        };

        let trace = match obj.remove("trace") {
            None => None,
            Some(Value::Object(trace)) => Some(parse_trace(trace)?),
            Some(other) => {
                return Err(ValidationError::InvalidField {
                    field: "trace",
                    reason: format!("expected object, got {}", json_kind(&other)),
                })
            }
        };

        let message = Self {
            trace,
            payload: obj.remove("payload").unwrap_or(Value::Null),
        };
        message.validate()?;
        Ok(message)
    }

    /// Serialize for the [`DATA_FIELD`] of a stream entry.
    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Decode the [`DATA_FIELD`] of a stream entry.
    pub fn decode(data: &str) -> Result<Self, String> {
        let value: Value = serde_json::from_str(data).map_err(|e| e.to_string())?;
        Self::from_value(value).map_err(|e| e.to_string())
    }
}

fn parse_trace(mut trace: Map<String, Value>) -> Result<Trace, ValidationError> {
    match trace.remove("trace_id") {
        Some(Value::String(trace_id)) => Ok(Trace { trace_id }),
        Some(other) => Err(ValidationError::InvalidField {
            field: "trace.trace_id",
            reason: format!("expected string, got {}", json_kind(&other)),
        }),
        None => Err(ValidationError::InvalidField {
            field: "trace.trace_id",
            reason: "missing".to_string(),
        }),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_value_accepts_traced_envelope() {
        let msg = MessageCanonical::from_value(json!({
            "trace": {"trace_id": "t1"},
            "payload": {"foo": "bar"}
        }))
        .unwrap();
        assert_eq!(msg.trace_id(), Some("t1"));
        assert_eq!(msg.payload, json!({"foo": "bar"}));
    }

    #[test]
    fn test_from_value_defaults_payload_to_null_and_drops_unknown_keys() {
        let msg = MessageCanonical::from_value(json!({"extra": 1})).unwrap();
        assert!(msg.trace.is_none());
        assert_eq!(msg.payload, Value::Null);
        assert_eq!(msg.encode().unwrap(), r#"{"payload":null}"#);
    }

    #[test]
    fn test_from_value_rejects_non_object() {
        assert_eq!(
            MessageCanonical::from_value(json!([1, 2])),
            Err(ValidationError::NotAnObject)
        );
    }

    #[test]
    fn test_from_value_rejects_bad_trace() {
        let err = MessageCanonical::from_value(json!({"trace": "t1"})).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidField { field: "trace", .. }));

        let err = MessageCanonical::from_value(json!({"trace": {"trace_id": 7}})).unwrap_err();
        assert!(matches!(
            err,
            ValidationError::InvalidField {
                field: "trace.trace_id",
                ..
            }
        ));

        let err = MessageCanonical::from_value(json!({"trace": {}})).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidField { .. }));
    }

    #[test]
    fn test_blank_trace_id_rejected() {
        let err = MessageCanonical::from_value(json!({"trace": {"trace_id": "  "}})).unwrap_err();
        assert_eq!(err, ValidationError::EmptyTraceId);
        assert!(MessageCanonical::traced("", json!(null)).validate().is_err());
    }

    #[test]
    fn test_encode_wire_shape() {
        let msg = MessageCanonical::traced("t1", json!({"foo": "bar"}));
        let wire: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(wire, json!({"trace": {"trace_id": "t1"}, "payload": {"foo": "bar"}}));
        assert_eq!(MessageCanonical::decode(&msg.encode().unwrap()).unwrap(), msg);
    }

    #[test]
    fn test_decode_reports_garbage() {
        assert!(MessageCanonical::decode("not json").is_err());
        assert!(MessageCanonical::decode("42").is_err());
    }
}
