use crate::error::{Error, Result};
use crate::mcp::client::{McpClient, RetryPolicy, DEFAULT_TIMEOUT};

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

const ORG_DATA_PATH: &str = "/api/v1/tools/manageOrgData";

/// Append the manageOrgData tool path unless the endpoint already carries it.
pub fn normalize_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim_end_matches('/');
    if trimmed.contains(ORG_DATA_PATH) {
        trimmed.to_string()
    } else {
        format!("{trimmed}{ORG_DATA_PATH}")
    }
}

/// Typed client for capability operations on the manageOrgData tool.
#[derive(Clone)]
pub struct CapabilityClient {
    inner: McpClient,
    collection_id: Option<String>,
}

impl CapabilityClient {
    pub fn new(
        endpoint: &str,
        collection_id: Option<String>,
        token: Option<String>,
        retry: RetryPolicy,
    ) -> Result<Self> {
        Ok(Self {
            inner: McpClient::new(&normalize_endpoint(endpoint), token, retry, DEFAULT_TIMEOUT)?,
            collection_id,
        })
    }

    fn body(&self, operation: &str) -> Value {
        let mut body = json!({
            "dataType": "capabilities",
            "operation": operation,
        });
        if let Some(collection) = &self.collection_id {
            body["collection"] = Value::String(collection.clone());
        }
        body
    }

    /// List the capability ids MCP currently knows.
    pub async fn list(&self, cancel: &CancellationToken) -> Result<Vec<String>> {
        let envelope = self.inner.post_json("", &self.body("list"), cancel).await?;
        if !envelope.success {
            return Err(Error::McpError(format!(
                "capability list failed: {}",
                envelope.error_message()
            )));
        }
        let capabilities = envelope
            .result()
            .and_then(|r| r.get("capabilities"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(capabilities
            .iter()
            .filter_map(|c| match c {
                Value::String(id) => Some(id.clone()),
                Value::Object(o) => o
                    .get("id")
                    .or_else(|| o.get("resourceId"))
                    .and_then(Value::as_str)
                    .map(str::to_string),
                _ => None,
            })
            .collect())
    }

    /// Trigger a targeted scan for a comma-joined capability id list.
    pub async fn scan(&self, resource_list: &str, cancel: &CancellationToken) -> Result<()> {
        let mut body = self.body("scan");
        body["resourceList"] = Value::String(resource_list.to_string());
        let envelope = self.inner.post_json("", &body, cancel).await?;
        if !envelope.success {
            return Err(Error::McpError(format!(
                "capability scan failed: {}",
                envelope.error_message()
            )));
        }
        Ok(())
    }

    /// Delete one capability id from the catalog.
    pub async fn delete(&self, id: &str, cancel: &CancellationToken) -> Result<()> {
        let mut body = self.body("delete");
        body["id"] = Value::String(id.to_string());
        let envelope = self.inner.post_json("", &body, cancel).await?;
        if !envelope.success {
            return Err(Error::McpError(format!(
                "capability delete for {id} failed: {}",
                envelope.error_message()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_normalize_endpoint() {
        assert_eq!(
            normalize_endpoint("http://mcp:8080"),
            "http://mcp:8080/api/v1/tools/manageOrgData"
        );
        assert_eq!(
            normalize_endpoint("http://mcp:8080/"),
            "http://mcp:8080/api/v1/tools/manageOrgData"
        );
        assert_eq!(
            normalize_endpoint("http://mcp:8080/api/v1/tools/manageOrgData"),
            "http://mcp:8080/api/v1/tools/manageOrgData"
        );
    }

    #[tokio::test]
    async fn test_list_parses_both_id_shapes() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/tools/manageOrgData"))
            .and(body_partial_json(
                json!({"dataType": "capabilities", "operation": "list"}),
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "data": {"result": {
                    "success": true,
                    "capabilities": ["SQL.devopstoolkit.live", {"id": "Provider.pkg.crossplane.io"}],
                    "totalCount": 2
                }}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client =
            CapabilityClient::new(&server.uri(), None, None, RetryPolicy::default()).unwrap();
        let ids = client.list(&CancellationToken::new()).await.unwrap();
        assert_eq!(
            ids,
            vec!["SQL.devopstoolkit.live", "Provider.pkg.crossplane.io"]
        );
    }

    #[tokio::test]
    async fn test_scan_sends_resource_list() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({
                "operation": "scan",
                "resourceList": "A.g,B.g"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true})))
            .expect(1)
            .mount(&server)
            .await;

        CapabilityClient::new(&server.uri(), None, None, RetryPolicy::default())
            .unwrap()
            .scan("A.g,B.g", &CancellationToken::new())
            .await
            .unwrap();
    }
}
