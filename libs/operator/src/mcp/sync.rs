use crate::error::Result;
use crate::mcp::client::{McpClient, RetryPolicy, SYNC_FLUSH_TIMEOUT};
use crate::mcp::types::ItemFailure;
use crate::resource_sync::record::{DeleteIdentifier, ResourceRecord};

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

const SYNC_PATH: &str = "/api/v1/resources/sync";

/// Outcome of one `/api/v1/resources/sync` call.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncOutcome {
    pub upserted: i64,
    pub deleted: i64,
    pub failures: Vec<ItemFailure>,
}

/// Typed client for the resource sync endpoint.
#[derive(Clone)]
pub struct ResourceSyncClient {
    inner: McpClient,
}

impl ResourceSyncClient {
    pub fn new(endpoint: &str, token: Option<String>, retry: RetryPolicy) -> Result<Self> {
        Ok(Self {
            inner: McpClient::new(endpoint, token, retry, SYNC_FLUSH_TIMEOUT)?,
        })
    }

    /// Push one batch of upserts and deletes. Partial failures come back in
    /// the outcome; transport failures and full rejections are errors.
    pub async fn sync(
        &self,
        upserts: &[ResourceRecord],
        deletes: &[DeleteIdentifier],
        is_resync: bool,
        cancel: &CancellationToken,
    ) -> Result<SyncOutcome> {
        let body = json!({
            "upserts": upserts,
            "deletes": deletes,
            "isResync": is_resync,
        });
        let envelope = self.inner.post_json(SYNC_PATH, &body, cancel).await?;

        let counts = if envelope.success {
            envelope.data.clone().unwrap_or(Value::Null)
        } else {
            // partial failure: counts live under error.details
            envelope
                .error
                .as_ref()
                .and_then(|e| e.get("details"))
                .cloned()
                .unwrap_or(Value::Null)
        };

        let failures = envelope
            .item_failures()
            .map(|failures| {
                failures
                    .iter()
                    .filter_map(|f| serde_json::from_value(f.clone()).ok())
                    .collect()
            })
            .unwrap_or_default();

        Ok(SyncOutcome {
            upserted: counts.get("upserted").and_then(Value::as_i64).unwrap_or(0),
            deleted: counts.get("deleted").and_then(Value::as_i64).unwrap_or(0),
            failures,
        })
    }

    pub fn endpoint(&self) -> &str {
        self.inner.endpoint()
    }
}

impl std::fmt::Debug for ResourceSyncClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceSyncClient")
            .field("endpoint", &self.inner.endpoint())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource_sync::record::ResourceRecord;

    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn record(name: &str) -> ResourceRecord {
        ResourceRecord {
            namespace: "default".into(),
            name: name.into(),
            kind: "Pod".into(),
            api_version: "v1".into(),
            labels: [("app".to_string(), name.to_string())].into(),
            annotations: Default::default(),
            created_at: None,
            updated_at: None,
        }
    }

    #[tokio::test]
    async fn test_sync_sends_resync_flag_and_parses_counts() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/resources/sync"))
            .and(body_partial_json(json!({"isResync": true})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "data": {"upserted": 2, "deleted": 1}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = ResourceSyncClient::new(&server.uri(), None, RetryPolicy::default()).unwrap();
        let outcome = client
            .sync(
                &[record("a"), record("b")],
                &[DeleteIdentifier {
                    namespace: "default".into(),
                    name: "c".into(),
                    kind: "Pod".into(),
                    api_version: "v1".into(),
                }],
                true,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.upserted, 2);
        assert_eq!(outcome.deleted, 1);
        assert!(outcome.failures.is_empty());
    }

    #[tokio::test]
    async fn test_partial_failures_surface_in_outcome() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": false,
                "error": {
                    "code": "PARTIAL",
                    "message": "1 failed",
                    "details": {
                        "upserted": 1,
                        "deleted": 0,
                        "failures": [{"id": "default:v1:Pod:b", "error": "conflict"}]
                    }
                }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = ResourceSyncClient::new(&server.uri(), None, RetryPolicy::default()).unwrap();
        let outcome = client
            .sync(&[record("a"), record("b")], &[], false, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.upserted, 1);
        assert_eq!(
            outcome.failures,
            vec![ItemFailure {
                id: "default:v1:Pod:b".into(),
                error: "conflict".into()
            }]
        );
    }
}
