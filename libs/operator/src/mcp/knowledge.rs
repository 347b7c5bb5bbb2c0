use crate::error::{Error, Result};
use crate::mcp::client::{McpClient, RetryPolicy, DEFAULT_TIMEOUT};

use std::collections::BTreeMap;

use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

const KNOWLEDGE_PATH: &str = "/api/v1/tools/manageKnowledge";
const SOURCE_PATH: &str = "/api/v1/knowledge/source";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestOutcome {
    pub chunks_created: i64,
}

/// Typed client for MCP's knowledge store.
#[derive(Clone)]
pub struct KnowledgeClient {
    inner: McpClient,
}

impl KnowledgeClient {
    pub fn new(endpoint: &str, token: Option<String>, retry: RetryPolicy) -> Result<Self> {
        Ok(Self {
            inner: McpClient::new(endpoint, token, retry, DEFAULT_TIMEOUT)?,
        })
    }

    /// Ingest one document. `metadata` must already carry the `source`
    /// identifier so bulk deletion can find the chunks again.
    pub async fn ingest(
        &self,
        uri: &str,
        content: &str,
        metadata: &BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<IngestOutcome> {
        let body = json!({
            "operation": "ingest",
            "uri": uri,
            "content": content,
            "metadata": metadata,
        });
        let envelope = self.inner.post_json(KNOWLEDGE_PATH, &body, cancel).await?;
        if !envelope.success {
            return Err(Error::McpError(format!(
                "ingest of {uri} failed: {}",
                envelope.error_message()
            )));
        }
        Ok(IngestOutcome {
            chunks_created: envelope
                .extra
                .get("chunksCreated")
                .and_then(Value::as_i64)
                .unwrap_or(0),
        })
    }

    /// Delete all chunks previously ingested for one document URI.
    pub async fn delete_by_uri(&self, uri: &str, cancel: &CancellationToken) -> Result<()> {
        let body = json!({"operation": "deleteByUri", "uri": uri});
        let envelope = self.inner.post_json(KNOWLEDGE_PATH, &body, cancel).await?;
        if !envelope.success {
            return Err(Error::McpError(format!(
                "deleteByUri of {uri} failed: {}",
                envelope.error_message()
            )));
        }
        Ok(())
    }

    /// Delete every chunk whose metadata `source` equals `source_id`.
    /// Succeeds when nothing is left to delete.
    pub async fn delete_source(&self, source_id: &str, cancel: &CancellationToken) -> Result<i64> {
        let encoded = utf8_percent_encode(source_id, NON_ALPHANUMERIC);
        let envelope = self
            .inner
            .delete(&format!("{SOURCE_PATH}/{encoded}"), cancel)
            .await?;
        if !envelope.success {
            return Err(Error::McpError(format!(
                "bulk delete for source {source_id} failed: {}",
                envelope.error_message()
            )));
        }
        Ok(envelope
            .data
            .as_ref()
            .and_then(|d| d.get("chunksDeleted"))
            .and_then(Value::as_i64)
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_ingest_returns_chunk_count() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/tools/manageKnowledge"))
            .and(body_partial_json(json!({
                "operation": "ingest",
                "uri": "https://github.com/acme/platform/blob/main/docs/guide.md",
                "metadata": {"source": "default/docs"}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "chunksCreated": 3,
                "chunkIds": ["a", "b", "c"],
                "uri": "https://github.com/acme/platform/blob/main/docs/guide.md",
                "message": "ingested"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let metadata: BTreeMap<String, String> =
            [("source".to_string(), "default/docs".to_string())].into();
        let outcome = KnowledgeClient::new(&server.uri(), None, RetryPolicy::default())
            .unwrap()
            .ingest(
                "https://github.com/acme/platform/blob/main/docs/guide.md",
                "# Guide",
                &metadata,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.chunks_created, 3);
    }

    #[tokio::test]
    async fn test_delete_source_url_encodes_identifier() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/api/v1/knowledge/source/default%2Fdocs"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "data": {"sourceIdentifier": "default/docs", "chunksDeleted": 12}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let deleted = KnowledgeClient::new(&server.uri(), None, RetryPolicy::default())
            .unwrap()
            .delete_source("default/docs", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(deleted, 12);
    }

    #[tokio::test]
    async fn test_delete_source_with_no_chunks_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let deleted = KnowledgeClient::new(&server.uri(), None, RetryPolicy::default())
            .unwrap()
            .delete_source("default/missing", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(deleted, 0);
    }
}
