use crate::crd::SecretKeyRef;

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const GIT_KNOWLEDGE_FINALIZER: &str = "gitknowledgesource.dot-ai.devopstoolkit.live/cleanup";

/// Ingests documents from a Git repository into MCP's knowledge store on a
/// schedule; a finalizer guarantees the store is cleaned up on deletion.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    kind = "GitKnowledgeSource",
    group = "dot-ai.devopstoolkit.live",
    version = "v1alpha1",
    namespaced,
    status = "GitKnowledgeSourceStatus",
    shortname = "gks",
    printcolumn = r#"{"name":"Repository", "type":"string", "jsonPath":".spec.repository.url"}"#,
    printcolumn = r#"{"name":"Documents", "type":"integer", "jsonPath":".status.documentCount"}"#,
    printcolumn = r#"{"name":"Last Sync", "type":"date", "jsonPath":".status.lastSyncTime"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct GitKnowledgeSourceSpec {
    pub repository: GitRepositorySpec,
    /// Glob patterns a file must match to be ingested; `**` crosses
    /// directory separators.
    #[serde(default)]
    pub include: Vec<String>,
    /// Glob patterns that reject a file even when an include matched.
    #[serde(default)]
    pub exclude: Vec<String>,
    /// Standard 5-field cron, `@hourly`-style shortcuts, or `@every <dur>`.
    #[serde(default = "default_schedule")]
    pub schedule: String,
    pub mcp_server: McpServerSpec,
    /// Extra metadata attached to every ingested document.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Files larger than this are skipped and recorded in the status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_file_size_bytes: Option<u64>,
    #[serde(default)]
    pub deletion_policy: DeletionPolicy,
}

fn default_schedule() -> String {
    "@every 24h".to_string()
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GitRepositorySpec {
    /// HTTPS clone URL; a trailing `.git` is stripped when building
    /// document URIs.
    pub url: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    /// Shallow clone depth; full history when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depth: Option<u32>,
    /// Token injected into the clone URL, resolved from this secret.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<SecretKeyRef>,
}

pub fn default_branch() -> String {
    "main".to_string()
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct McpServerSpec {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_secret_ref: Option<SecretKeyRef>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum DeletionPolicy {
    /// Remove all ingested chunks from MCP before the CR disappears.
    #[default]
    Delete,
    /// Leave ingested chunks in place.
    Retain,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GitKnowledgeSourceStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_count: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_time: Option<Time>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_synced_commit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_scheduled_sync: Option<Time>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skipped_files: Option<Vec<SkippedFile>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_errors: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Condition>>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SkippedFile {
    pub path: String,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
}
