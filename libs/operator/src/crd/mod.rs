pub mod capability_scan;
pub mod git_knowledge;
pub mod remediation;
pub mod resource_sync;
pub mod solution;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// API group shared by all dot-ai custom resources.
pub const API_GROUP: &str = "dot-ai.devopstoolkit.live";

/// Reference to a single key inside a `Secret` in the CR's own namespace.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SecretKeyRef {
    /// Name of the secret.
    pub name: String,
    /// Key within the secret's data.
    pub key: String,
}
