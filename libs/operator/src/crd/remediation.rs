use crate::crd::SecretKeyRef;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Matches Kubernetes Events against selectors and drives MCP remediation
/// with rate limiting, durable cooldowns and human notifications.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    kind = "RemediationPolicy",
    group = "dot-ai.devopstoolkit.live",
    version = "v1alpha1",
    namespaced,
    status = "RemediationPolicyStatus",
    shortname = "rp",
    printcolumn = r#"{"name":"Mode", "type":"string", "jsonPath":".spec.mode"}"#,
    printcolumn = r#"{"name":"Processed", "type":"integer", "jsonPath":".status.eventsProcessed"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RemediationPolicySpec {
    /// Ordered selectors; the first matching (policy, selector) pair wins.
    #[serde(default)]
    pub event_selectors: Vec<EventSelector>,
    /// MCP remediate tool endpoint.
    pub mcp_endpoint: String,
    /// Default remediation mode when a selector does not override it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<RemediationMode>,
    /// Default confidence threshold for automatic mode (0.8 when unset).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence_threshold: Option<f64>,
    /// Default maximum risk level for automatic mode (`low` when unset).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_risk_level: Option<RiskLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limiting: Option<RateLimitSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notifications: Option<NotificationsSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistence: Option<PersistenceSpec>,
}

/// A selector matches an event iff each non-empty field equals the
/// corresponding event field.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EventSelector {
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "type")]
    pub event_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub involved_object_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<RemediationMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence_threshold: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_risk_level: Option<RiskLevel>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum RemediationMode {
    Manual,
    Automatic,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitSpec {
    /// Remediations allowed per owner-resolved object in a sliding minute.
    pub events_per_minute: u32,
    /// Minutes an owner-resolved object is blocked after a remediation;
    /// zero disables the rate-limiter cooldown.
    #[serde(default)]
    pub cooldown_minutes: u32,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NotificationsSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slack: Option<NotificationSinkSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub google_chat: Option<NotificationSinkSpec>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NotificationSinkSpec {
    #[serde(default)]
    pub enabled: bool,
    /// Plaintext webhook URL; ignored with a warning when a secret ref is
    /// also configured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url_secret_ref: Option<SecretKeyRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default)]
    pub notify_on_start: bool,
    #[serde(default = "default_true")]
    pub notify_on_complete: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PersistenceSpec {
    /// Cooldown persistence across restarts; on unless explicitly disabled.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl RemediationPolicySpec {
    /// Cooldown persistence is on unless `spec.persistence.enabled=false`.
    pub fn persistence_enabled(&self) -> bool {
        self.persistence.as_ref().map(|p| p.enabled).unwrap_or(true)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RemediationPolicyStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub events_processed: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mcp_messages_sent: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub successful_remediations: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_remediations: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limited_events: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_event_time: Option<Time>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_remediation_time: Option<Time>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_rate_limited_event: Option<Time>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Condition>>,
}
