use serde::Deserialize;
use serde_json::Value;

/// Uniform MCP response envelope. Some endpoints (knowledge ingest) put
/// operation fields next to `success` instead of under `data`; those are
/// kept in `extra`.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Envelope {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub error: Option<Value>,
    #[serde(default)]
    pub meta: Option<Value>,
    #[serde(flatten)]
    pub extra: Value,
}

impl Envelope {
    /// Human-readable error message; MCP sends either an error object with
    /// `{code, message}` or a bare string.
    pub fn error_message(&self) -> String {
        match &self.error {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Object(o)) => o
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string(),
            _ => "unknown error".to_string(),
        }
    }

    /// Per-item failures under `error.details.failures`. Their presence
    /// means a partial failure which must not be retried.
    pub fn item_failures(&self) -> Option<&Vec<Value>> {
        self.error
            .as_ref()?
            .get("details")?
            .get("failures")?
            .as_array()
    }

    /// `data.result` for tool-style endpoints.
    pub fn result(&self) -> Option<&Value> {
        self.data.as_ref()?.get("result")
    }
}

/// One failed item from a partial-failure sync response.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ItemFailure {
    pub id: String,
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_error_message_from_object_and_string() {
        let env: Envelope = serde_json::from_value(json!({
            "success": false,
            "error": {"code": "E42", "message": "boom"}
        }))
        .unwrap();
        assert_eq!(env.error_message(), "boom");

        let env: Envelope =
            serde_json::from_value(json!({"success": false, "error": "plain failure"})).unwrap();
        assert_eq!(env.error_message(), "plain failure");
    }

    #[test]
    fn test_item_failures_detection() {
        let env: Envelope = serde_json::from_value(json!({
            "success": false,
            "error": {
                "code": "PARTIAL",
                "message": "2 items failed",
                "details": {"upserted": 3, "failures": [{"id": "a", "error": "x"}]}
            }
        }))
        .unwrap();
        assert_eq!(env.item_failures().map(|f| f.len()), Some(1));

        let env: Envelope =
            serde_json::from_value(json!({"success": false, "error": {"message": "down"}}))
                .unwrap();
        assert!(env.item_failures().is_none());
    }

    #[test]
    fn test_extra_fields_survive() {
        let env: Envelope = serde_json::from_value(json!({
            "success": true,
            "chunksCreated": 4,
            "uri": "https://example.com/blob/main/a.md"
        }))
        .unwrap();
        assert_eq!(env.extra.get("chunksCreated").and_then(Value::as_i64), Some(4));
    }
}
