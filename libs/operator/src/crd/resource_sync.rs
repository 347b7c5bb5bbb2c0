use crate::crd::SecretKeyRef;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Declares which cluster to mirror into MCP and how aggressively.
///
/// One engine (discovery, watcher pool, debounce buffer, periodic resync)
/// runs per `ResourceSyncConfig`.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    kind = "ResourceSyncConfig",
    group = "dot-ai.devopstoolkit.live",
    version = "v1alpha1",
    namespaced,
    status = "ResourceSyncConfigStatus",
    shortname = "rsc",
    printcolumn = r#"{"name":"Endpoint", "type":"string", "jsonPath":".spec.mcpEndpoint"}"#,
    printcolumn = r#"{"name":"Watched", "type":"integer", "jsonPath":".status.watchedResourceTypes"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSyncConfigSpec {
    /// Base URL of the MCP resource sync endpoint.
    pub mcp_endpoint: String,
    /// Bearer token for MCP, resolved from a secret in this namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_secret_ref: Option<SecretKeyRef>,
    /// Maximum seconds between an observed change and its batched delivery.
    #[serde(default = "default_debounce_seconds")]
    pub debounce_seconds: u64,
    /// Minutes between full resyncs of the cached cluster state.
    #[serde(default = "default_resync_interval_minutes")]
    pub resync_interval_minutes: u64,
}

fn default_debounce_seconds() -> u64 {
    5
}

fn default_resync_interval_minutes() -> u64 {
    60
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSyncConfigStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watched_resource_types: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_time: Option<Time>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_resync_time: Option<Time>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_errors: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_resources_synced: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Condition>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_defaults() {
        let spec: ResourceSyncConfigSpec =
            serde_json::from_value(serde_json::json!({"mcpEndpoint": "http://mcp:8080"})).unwrap();
        assert_eq!(spec.debounce_seconds, 5);
        assert_eq!(spec.resync_interval_minutes, 60);
        assert!(spec.auth_secret_ref.is_none());
    }
}
