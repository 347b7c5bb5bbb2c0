use crate::error::{Error, Result};

use kube::client::Client;
use kube::discovery::ApiResource;
use tracing::warn;

/// One discovered API resource, flattened from the group/version discovery
/// documents.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiscoveredResource {
    pub group: String,
    pub version: String,
    pub kind: String,
    /// Plural resource name; subresources keep their `pods/status` form.
    pub plural: String,
    pub namespaced: bool,
    pub verbs: Vec<String>,
}

impl DiscoveredResource {
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    pub fn api_resource(&self) -> ApiResource {
        ApiResource {
            group: self.group.clone(),
            version: self.version.clone(),
            api_version: self.api_version(),
            kind: self.kind.clone(),
            plural: self.plural.clone(),
        }
    }

    /// Key used to identify one watcher: `<group>/<version>/<plural>`,
    /// `core` standing in for the empty group.
    pub fn gvr_key(&self) -> String {
        format!(
            "{}/{}/{}",
            if self.group.is_empty() { "core" } else { &self.group },
            self.version,
            self.plural
        )
    }

    /// `<plural>` for the core group, else `<plural>.<group>`; the form the
    /// watcher skip list uses.
    pub fn skip_key(&self) -> String {
        if self.group.is_empty() {
            self.plural.clone()
        } else {
            format!("{}.{}", self.plural, self.group)
        }
    }

    /// `Kind` for the core group, else `Kind.<group>`.
    pub fn capability_id(&self) -> String {
        if self.group.is_empty() {
            self.kind.clone()
        } else {
            format!("{}.{}", self.kind, self.group)
        }
    }

    pub fn is_subresource(&self) -> bool {
        self.plural.contains('/')
    }

    pub fn watchable(&self) -> bool {
        self.verbs.iter().any(|v| v == "list") && self.verbs.iter().any(|v| v == "watch")
    }
}

fn split_group_version(group_version: &str) -> (String, String) {
    match group_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), group_version.to_string()),
    }
}

/// Enumerate every API resource the cluster serves, one entry per
/// `(group, resource)` at the group's preferred version.
///
/// Unreachable API groups (stale APIServices, aggregated APIs that are down)
/// are logged and skipped; only a completely failed discovery is fatal.
pub async fn discover_all(client: &Client) -> Result<Vec<DiscoveredResource>> {
    let mut resources = Vec::new();

    let core_versions = client.list_core_api_versions().await.map_err(|e| {
        Error::DiscoveryError(format!("failed to list core API versions: {e}"))
    })?;
    for version in &core_versions.versions {
        match client.list_core_api_resources(version).await {
            Ok(list) => collect_resources(&mut resources, &list),
            Err(e) => {
                warn!(msg = "skipping unreachable core API version", %version, %e);
            }
        }
    }

    let groups = client
        .list_api_groups()
        .await
        .map_err(|e| Error::DiscoveryError(format!("failed to list API groups: {e}")))?;
    for group in &groups.groups {
        let Some(version) = group
            .preferred_version
            .as_ref()
            .or_else(|| group.versions.first())
        else {
            continue;
        };
        match client
            .list_api_group_resources(&version.group_version)
            .await
        {
            Ok(list) => collect_resources(&mut resources, &list),
            Err(e) => {
                warn!(
                    msg = "skipping unreachable API group",
                    group = %group.name,
                    group_version = %version.group_version,
                    %e
                );
            }
        }
    }

    Ok(resources)
}

fn collect_resources(
    out: &mut Vec<DiscoveredResource>,
    list: &k8s_openapi::apimachinery::pkg::apis::meta::v1::APIResourceList,
) {
    let (list_group, list_version) = split_group_version(&list.group_version);
    for resource in &list.resources {
        // Individual entries may pin their own group/version (e.g. for
        // resources served from another group).
        let group = resource.group.clone().unwrap_or_else(|| list_group.clone());
        let version = resource
            .version
            .clone()
            .unwrap_or_else(|| list_version.clone());
        out.push(DiscoveredResource {
            group,
            version,
            kind: resource.kind.clone(),
            plural: resource.name.clone(),
            namespaced: resource.namespaced,
            verbs: resource.verbs.clone(),
        });
    }
}
