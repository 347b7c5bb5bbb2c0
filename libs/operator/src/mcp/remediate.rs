use crate::crd::remediation::RemediationMode;
use crate::error::{Error, Result};
use crate::mcp::client::{McpClient, RetryPolicy, DEFAULT_TIMEOUT};

use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// Body for the MCP remediate tool. Threshold and risk level are only ever
/// present in automatic mode.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RemediateRequest {
    pub issue: String,
    pub mode: RemediationMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence_threshold: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_risk_level: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemediateOutcome {
    /// Whether MCP attempted and applied a remediation; `false` in manual
    /// mode or below threshold, still a success to the caller.
    pub executed: bool,
    pub message: String,
}

/// Typed client for a policy's remediate endpoint.
#[derive(Clone)]
pub struct RemediateClient {
    inner: McpClient,
}

impl RemediateClient {
    pub fn new(endpoint: &str, retry: RetryPolicy) -> Result<Self> {
        Ok(Self {
            inner: McpClient::new(endpoint, None, retry, DEFAULT_TIMEOUT)?,
        })
    }

    pub async fn remediate(
        &self,
        request: &RemediateRequest,
        cancel: &CancellationToken,
    ) -> Result<RemediateOutcome> {
        let body = serde_json::to_value(request).map_err(|e| {
            Error::SerializationError("failed to serialize remediate request".into(), Box::new(e))
        })?;
        let envelope = self.inner.post_json("", &body, cancel).await?;
        if !envelope.success {
            return Err(Error::McpError(format!(
                "remediation failed: {}",
                envelope.error_message()
            )));
        }
        let result = envelope.result().cloned().unwrap_or(Value::Null);
        Ok(RemediateOutcome {
            executed: result
                .get("executed")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            message: result
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;
    use wiremock::matchers::{body_json, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_manual_mode_omits_threshold_and_risk() {
        let request = RemediateRequest {
            issue: "Pod p1 in namespace default has a Failed event".into(),
            mode: RemediationMode::Manual,
            confidence_threshold: None,
            max_risk_level: None,
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(
            value,
            json!({"issue": "Pod p1 in namespace default has a Failed event", "mode": "manual"})
        );
    }

    #[test]
    fn test_automatic_mode_carries_both() {
        let request = RemediateRequest {
            issue: "x".into(),
            mode: RemediationMode::Automatic,
            confidence_threshold: Some(0.8),
            max_risk_level: Some("low".into()),
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["confidenceThreshold"], json!(0.8));
        assert_eq!(value["maxRiskLevel"], json!("low"));
    }

    #[tokio::test]
    async fn test_remediate_parses_executed_flag() {
        let server = MockServer::start().await;
        let request = RemediateRequest {
            issue: "issue".into(),
            mode: RemediationMode::Automatic,
            confidence_threshold: Some(0.9),
            max_risk_level: Some("medium".into()),
        };
        Mock::given(method("POST"))
            .and(body_json(serde_json::to_value(&request).unwrap()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "data": {
                    "result": {"message": "applied kubectl delete pod", "executed": true},
                    "tool": "remediate",
                    "executionTime": 1200
                }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let outcome = RemediateClient::new(&server.uri(), RetryPolicy::default())
            .unwrap()
            .remediate(&request, &CancellationToken::new())
            .await
            .unwrap();
        assert!(outcome.executed);
        assert_eq!(outcome.message, "applied kubectl delete pod");
    }
}
