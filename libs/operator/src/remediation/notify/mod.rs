pub mod google_chat;
pub mod slack;

use crate::crd::remediation::NotificationSinkSpec;
use crate::error::{Error, Result};
use crate::mcp::auth::resolve_secret_value;

use kube::client::Client;
use serde_json::Value;
use tokio::time::Duration;
use tracing::warn;

pub const SLACK_WEBHOOK_PREFIX: &str = "https://hooks.slack.com/";
pub const GOOGLE_CHAT_WEBHOOK_PREFIX: &str = "https://chat.googleapis.com/";

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkKind {
    Slack,
    GoogleChat,
}

impl SinkKind {
    pub fn name(&self) -> &'static str {
        match self {
            SinkKind::Slack => "Slack",
            SinkKind::GoogleChat => "Google Chat",
        }
    }

    fn url_prefix(&self) -> &'static str {
        match self {
            SinkKind::Slack => SLACK_WEBHOOK_PREFIX,
            SinkKind::GoogleChat => GOOGLE_CHAT_WEBHOOK_PREFIX,
        }
    }
}

/// Phase a notification reports on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notification<'a> {
    Started {
        issue: &'a str,
        mode: &'a str,
    },
    Completed {
        issue: &'a str,
        outcome: CompletionOutcome,
        message: &'a str,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOutcome {
    Executed,
    ManualActionRequired,
    Failed,
}

/// Resolve the webhook URL for one sink. A secret reference wins over a
/// plaintext URL; the scheme prefix is validated per sink.
pub async fn resolve_webhook_url(
    client: &Client,
    namespace: &str,
    sink: &NotificationSinkSpec,
    kind: SinkKind,
) -> Result<String> {
    let url = match (&sink.webhook_url, &sink.webhook_url_secret_ref) {
        (configured, Some(secret_ref)) => {
            if configured.is_some() {
                warn!(
                    msg = "both webhookUrl and webhookUrlSecretRef configured, the secret wins",
                    sink = kind.name()
                );
            }
            resolve_secret_value(client, namespace, secret_ref).await?
        }
        (Some(url), None) => url.clone(),
        (None, None) => {
            return Err(Error::NotificationError(format!(
                "{} sink enabled without a webhook URL",
                kind.name()
            )))
        }
    };

    if !url.starts_with(kind.url_prefix()) {
        return Err(Error::NotificationError(format!(
            "{} webhook URL must start with {}",
            kind.name(),
            kind.url_prefix()
        )));
    }
    Ok(url)
}

/// Fire-and-forget webhook sender shared by both sinks.
#[derive(Clone)]
pub struct Notifier {
    http: reqwest::Client,
}

impl Notifier {
    pub fn new() -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .build()
            .map_err(|e| {
                Error::McpRequestError("failed to build webhook client".into(), Box::new(e))
            })?;
        Ok(Self { http })
    }

    pub async fn post(&self, url: &str, payload: &Value) -> Result<()> {
        let response = self
            .http
            .post(url)
            .json(payload)
            .send()
            .await
            .map_err(|e| Error::NotificationError(format!("webhook unreachable: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::NotificationError(format!(
                "webhook returned HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }
}
