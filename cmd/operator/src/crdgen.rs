use dot_ai_operator::crd::capability_scan::CapabilityScanConfig;
use dot_ai_operator::crd::git_knowledge::GitKnowledgeSource;
use dot_ai_operator::crd::remediation::RemediationPolicy;
use dot_ai_operator::crd::resource_sync::ResourceSyncConfig;
use dot_ai_operator::crd::solution::Solution;

use kube::CustomResourceExt;

/// Print all CRD manifests to stdout: `cargo run --bin crdgen | kubectl apply -f -`
fn main() {
    let crds = [
        serde_yaml::to_string(&ResourceSyncConfig::crd()),
        serde_yaml::to_string(&CapabilityScanConfig::crd()),
        serde_yaml::to_string(&RemediationPolicy::crd()),
        serde_yaml::to_string(&GitKnowledgeSource::crd()),
        serde_yaml::to_string(&Solution::crd()),
    ];
    for crd in crds {
        print!("---\n{}", crd.expect("CRD serializes to YAML"));
    }
}
