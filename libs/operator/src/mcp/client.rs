use crate::error::{Error, Result};
use crate::mcp::types::Envelope;

use rand::Rng;
use serde_json::Value;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
/// Resource-sync flushes carry whole resync batches and get more headroom.
pub const SYNC_FLUSH_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total retryable attempts, including the first one.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// HTTP/JSON client for one MCP endpoint: bearer auth, per-attempt timeout,
/// exponential backoff with ±25% jitter.
#[derive(Clone)]
pub struct McpClient {
    http: reqwest::Client,
    base: String,
    token: Option<String>,
    retry: RetryPolicy,
}

enum Attempt {
    Done(Envelope),
    Retry(String),
    Fail(Error),
}

impl McpClient {
    pub fn new(
        endpoint: &str,
        token: Option<String>,
        retry: RetryPolicy,
        timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::McpRequestError("failed to build HTTP client".into(), Box::new(e)))?;
        Ok(Self {
            http,
            base: endpoint.trim_end_matches('/').to_string(),
            token,
            retry,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.base
    }

    /// POST `body` to `<endpoint><path>` and return the parsed envelope.
    /// Partial-failure envelopes are returned to the caller unretried.
    pub async fn post_json(
        &self,
        path: &str,
        body: &Value,
        cancel: &CancellationToken,
    ) -> Result<Envelope> {
        let url = format!("{}{}", self.base, path);
        self.execute(
            || self.http.post(&url).json(body),
            &url,
            false,
            cancel,
        )
        .await
    }

    /// DELETE `<endpoint><path>`. A 404 is treated as an empty success so
    /// delete-like operations stay idempotent.
    pub async fn delete(&self, path: &str, cancel: &CancellationToken) -> Result<Envelope> {
        let url = format!("{}{}", self.base, path);
        self.execute(|| self.http.delete(&url), &url, true, cancel).await
    }

    async fn execute(
        &self,
        build: impl Fn() -> reqwest::RequestBuilder,
        url: &str,
        missing_ok: bool,
        cancel: &CancellationToken,
    ) -> Result<Envelope> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let outcome = tokio::select! {
                outcome = self.attempt(build(), missing_ok) => outcome,
                _ = cancel.cancelled() => {
                    return Err(Error::McpError(format!("request to {url} cancelled")));
                }
            };

            let reason = match outcome {
                Attempt::Done(envelope) => return Ok(envelope),
                Attempt::Fail(error) => return Err(error),
                Attempt::Retry(reason) => reason,
            };

            if attempt >= self.retry.max_retries {
                return Err(Error::McpError(format!(
                    "request to {url} failed after {attempt} attempts: {reason}"
                )));
            }

            let backoff = self.backoff_with_jitter(attempt);
            debug!(msg = "retrying MCP request", %url, attempt, ?backoff, %reason);
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = cancel.cancelled() => {
                    return Err(Error::McpError(format!("request to {url} cancelled")));
                }
            }
        }
    }

    async fn attempt(&self, request: reqwest::RequestBuilder, missing_ok: bool) -> Attempt {
        let request = match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        };
        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => return Attempt::Retry(format!("network error: {e}")),
        };

        let status = response.status();
        if status.is_server_error() {
            return Attempt::Retry(format!("HTTP {status}"));
        }
        if status == reqwest::StatusCode::NOT_FOUND && missing_ok {
            return Attempt::Done(Envelope {
                success: true,
                ..Envelope::default()
            });
        }
        if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            return Attempt::Fail(Error::McpError(format!("HTTP {status}: {body}")));
        }

        let envelope = match response.json::<Envelope>().await {
            Ok(envelope) => envelope,
            Err(e) => return Attempt::Fail(Error::McpError(format!("invalid response body: {e}"))),
        };

        if envelope.success || envelope.item_failures().is_some() {
            Attempt::Done(envelope)
        } else {
            let message = envelope.error_message();
            warn!(msg = "MCP returned failure envelope", %message);
            Attempt::Retry(format!("success=false: {message}"))
        }
    }

    fn backoff_with_jitter(&self, attempt: u32) -> Duration {
        let exponential =
            self.retry.initial_backoff.as_secs_f64() * 2f64.powi(attempt.saturating_sub(1) as i32);
        let capped = exponential.min(self.retry.max_backoff.as_secs_f64());
        let jitter = rand::thread_rng().gen_range(0.75..=1.25);
        Duration::from_secs_f64(capped * jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(40),
        }
    }

    fn client(server: &MockServer) -> McpClient {
        McpClient::new(&server.uri(), None, fast_retry(), Duration::from_secs(2)).unwrap()
    }

    #[tokio::test]
    async fn test_retries_on_5xx_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/resources/sync"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v1/resources/sync"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true})))
            .expect(1)
            .mount(&server)
            .await;

        let envelope = client(&server)
            .post_json(
                "/api/v1/resources/sync",
                &json!({"upserts": []}),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(envelope.success);
    }

    #[tokio::test]
    async fn test_4xx_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad request"))
            .expect(1)
            .mount(&server)
            .await;

        let err = client(&server)
            .post_json("/x", &json!({}), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("400"));
    }

    #[tokio::test]
    async fn test_failure_envelope_without_item_failures_is_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"success": false, "error": {"message": "busy"}})),
            )
            .expect(3)
            .mount(&server)
            .await;

        let err = client(&server)
            .post_json("/x", &json!({}), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("after 3 attempts"));
    }

    #[tokio::test]
    async fn test_partial_failure_is_returned_without_retry() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": false,
                "error": {
                    "code": "PARTIAL",
                    "message": "1 item failed",
                    "details": {"failures": [{"id": "default:v1:Pod:p1", "error": "conflict"}]}
                }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let envelope = client(&server)
            .post_json("/x", &json!({}), &CancellationToken::new())
            .await
            .unwrap();
        assert!(!envelope.success);
        assert_eq!(envelope.item_failures().map(|f| f.len()), Some(1));
    }

    #[tokio::test]
    async fn test_bearer_token_is_sent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(wiremock::matchers::header("authorization", "Bearer tok-1"))
            .and(body_partial_json(json!({"operation": "list"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true})))
            .expect(1)
            .mount(&server)
            .await;

        McpClient::new(
            &server.uri(),
            Some("tok-1".to_string()),
            fast_retry(),
            Duration::from_secs(2),
        )
        .unwrap()
        .post_json("/x", &json!({"operation": "list"}), &CancellationToken::new())
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_delete_treats_404_as_success() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let envelope = client(&server)
            .delete("/api/v1/knowledge/source/x", &CancellationToken::new())
            .await
            .unwrap();
        assert!(envelope.success);
    }

    #[tokio::test]
    async fn test_cancellation_aborts_backoff() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let slow = McpClient::new(
            &server.uri(),
            None,
            RetryPolicy {
                max_retries: 3,
                initial_backoff: Duration::from_secs(60),
                max_backoff: Duration::from_secs(60),
            },
            Duration::from_secs(2),
        )
        .unwrap();

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let err = slow
            .post_json("/x", &json!({}), &cancel)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cancelled"));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let client = McpClient::new(
            "http://mcp",
            None,
            RetryPolicy {
                max_retries: 5,
                initial_backoff: Duration::from_secs(1),
                max_backoff: Duration::from_secs(3),
            },
            Duration::from_secs(1),
        )
        .unwrap();

        let first = client.backoff_with_jitter(1).as_secs_f64();
        assert!((0.75..=1.25).contains(&first), "got {first}");
        let second = client.backoff_with_jitter(2).as_secs_f64();
        assert!((1.5..=2.5).contains(&second), "got {second}");
        let capped = client.backoff_with_jitter(4).as_secs_f64();
        assert!((2.25..=3.75).contains(&capped), "got {capped}");
    }

    #[test]
    fn test_trailing_slash_is_trimmed() {
        let client = McpClient::new(
            "http://mcp:8080/",
            None,
            RetryPolicy::default(),
            Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(client.endpoint(), "http://mcp:8080");
    }
}
