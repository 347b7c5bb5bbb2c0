use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Groups deployed resources under one intent. The controller adds itself as
/// a non-controlling owner of every referenced resource so the garbage
/// collector cascades deletion.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    kind = "Solution",
    group = "dot-ai.devopstoolkit.live",
    version = "v1alpha1",
    namespaced,
    status = "SolutionStatus",
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Resources", "type":"integer", "jsonPath":".status.resourcesTotal"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct SolutionSpec {
    /// Free-form description of what this solution is meant to achieve.
    pub intent: String,
    #[serde(default)]
    pub resources: Vec<ResourceReference>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceReference {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    /// Defaults to the Solution's own namespace for namespaced kinds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum SolutionState {
    Deployed,
    Degraded,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SolutionStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<SolutionState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources_total: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources_owned: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Condition>>,
}
