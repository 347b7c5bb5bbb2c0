use crate::crd::SecretKeyRef;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Keeps MCP's capability catalog equal to the set of resource kinds the
/// cluster serves, filtered by include/exclude patterns.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    kind = "CapabilityScanConfig",
    group = "dot-ai.devopstoolkit.live",
    version = "v1alpha1",
    namespaced,
    status = "CapabilityScanConfigStatus",
    shortname = "csc",
    printcolumn = r#"{"name":"Endpoint", "type":"string", "jsonPath":".spec.mcpEndpoint"}"#,
    printcolumn = r#"{"name":"Last Scan", "type":"date", "jsonPath":".status.lastScanTime"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityScanConfigSpec {
    /// MCP endpoint; `/api/v1/tools/manageOrgData` is appended when missing.
    pub mcp_endpoint: String,
    /// Capability collection this config manages on the MCP side.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection_id: Option<String>,
    /// Bearer token for MCP, resolved from a secret in this namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_secret_ref: Option<SecretKeyRef>,
    /// Capability id patterns to include; empty means everything.
    #[serde(default)]
    pub include_resources: Vec<String>,
    /// Capability id patterns to reject, evaluated after includes.
    #[serde(default)]
    pub exclude_resources: Vec<String>,
    /// Seconds CRD changes are batched before a scan/delete flush.
    #[serde(default = "default_debounce_seconds")]
    pub debounce_seconds: u64,
    /// Overrides for the MCP retry policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetrySpec>,
}

fn default_debounce_seconds() -> u64 {
    10
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RetrySpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_backoff_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_backoff_seconds: Option<u64>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityScanConfigStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_scan_time: Option<Time>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Condition>>,
}
