use std::collections::BTreeMap;

use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::DynamicObject;
use kube::ResourceExt;
use serde::Serialize;

/// Namespace token for cluster-scoped resources.
pub const CLUSTER_NAMESPACE: &str = "_cluster";

/// What MCP gets to see of one cluster object: identity, labels and the
/// selected annotations.
#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRecord {
    pub namespace: String,
    pub name: String,
    pub kind: String,
    pub api_version: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<Time>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<Time>,
}

impl ResourceRecord {
    pub fn from_dynamic(obj: &DynamicObject, kind: &str, api_version: &str) -> Self {
        let namespace = obj
            .namespace()
            .unwrap_or_else(|| CLUSTER_NAMESPACE.to_string());
        Self {
            namespace,
            name: obj.name_any(),
            kind: kind.to_string(),
            api_version: api_version.to_string(),
            labels: obj.labels().clone(),
            annotations: select_annotations(obj.annotations()),
            created_at: obj.creation_timestamp(),
            updated_at: Some(Time(Utc::now())),
        }
    }

    /// `<ns|_cluster>:<apiVersion>:<kind>:<name>`
    pub fn id(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.namespace, self.api_version, self.kind, self.name
        )
    }

    pub fn delete_identifier(&self) -> DeleteIdentifier {
        DeleteIdentifier {
            namespace: self.namespace.clone(),
            name: self.name.clone(),
            kind: self.kind.clone(),
            api_version: self.api_version.clone(),
        }
    }
}

/// Identity of a deleted object, enough for MCP to drop its copy.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeleteIdentifier {
    pub namespace: String,
    pub name: String,
    pub kind: String,
    pub api_version: String,
}

impl DeleteIdentifier {
    pub fn id(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.namespace, self.api_version, self.kind, self.name
        )
    }
}

/// One change flowing from a watcher into the debounce buffer.
#[derive(Clone, Debug, PartialEq)]
pub enum ResourceChange {
    Upsert(ResourceRecord),
    Delete(DeleteIdentifier),
}

impl ResourceChange {
    pub fn id(&self) -> String {
        match self {
            ResourceChange::Upsert(record) => record.id(),
            ResourceChange::Delete(identifier) => identifier.id(),
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, ResourceChange::Delete(_))
    }
}

/// Keep only annotations worth shipping: `description` and `*/description`.
/// `kubectl.kubernetes.io/last-applied-configuration` and `meta.helm.sh/*`
/// are always dropped.
pub fn select_annotations(annotations: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    annotations
        .iter()
        .filter(|(key, _)| {
            if *key == "kubectl.kubernetes.io/last-applied-configuration" {
                return false;
            }
            if key.starts_with("meta.helm.sh/") {
                return false;
            }
            *key == "description" || key.ends_with("/description")
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}
