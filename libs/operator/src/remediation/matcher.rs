use crate::crd::remediation::{
    EventSelector, RemediationMode, RemediationPolicy, RemediationPolicySpec, RiskLevel,
};

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use k8s_openapi::api::core::v1::Event;
use kube::ResourceExt;

const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.8;

fn field_matches(selector_field: Option<&str>, event_field: Option<&str>) -> bool {
    match selector_field {
        None | Some("") => true,
        Some(want) => event_field == Some(want),
    }
}

/// A selector matches an event iff each non-empty selector field equals the
/// corresponding event field.
pub fn selector_matches(selector: &EventSelector, event: &Event) -> bool {
    let namespace = event
        .involved_object
        .namespace
        .as_deref()
        .or(event.metadata.namespace.as_deref());
    field_matches(selector.event_type.as_deref(), event.type_.as_deref())
        && field_matches(selector.reason.as_deref(), event.reason.as_deref())
        && field_matches(
            selector.involved_object_kind.as_deref(),
            event.involved_object.kind.as_deref(),
        )
        && field_matches(selector.namespace.as_deref(), namespace)
}

/// First-match-wins across policies (ordered by namespace/name) and across
/// each policy's selectors in declaration order.
pub fn find_match<'a>(
    policies: &'a [Arc<RemediationPolicy>],
    event: &Event,
) -> Option<(&'a Arc<RemediationPolicy>, &'a EventSelector)> {
    for policy in policies {
        for selector in &policy.spec.event_selectors {
            if selector_matches(selector, event) {
                return Some((policy, selector));
            }
        }
    }
    None
}

/// Dedup key: `<event.namespace>/<event.name>:<event.resourceVersion>`.
pub fn event_dedup_key(event: &Event) -> String {
    format!(
        "{}/{}:{}",
        event.metadata.namespace.as_deref().unwrap_or_default(),
        event.name_any(),
        event.metadata.resource_version.as_deref().unwrap_or_default()
    )
}

/// Seen event keys with an expiry sweep.
#[derive(Default)]
pub struct ProcessedEvents {
    entries: HashMap<String, DateTime<Utc>>,
}

impl ProcessedEvents {
    /// Record a key; returns false when the event was already processed.
    pub fn observe(&mut self, key: &str, now: DateTime<Utc>) -> bool {
        self.entries.insert(key.to_string(), now).is_none()
    }

    pub fn cleanup(&mut self, now: DateTime<Utc>, max_age: Duration) {
        self.entries.retain(|_, seen| now - *seen < max_age);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Deterministic issue text sent to the MCP remediate tool.
pub fn issue_description(event: &Event) -> String {
    let object = &event.involved_object;
    let name = object.name.clone().unwrap_or_default();
    let message = event.message.clone().unwrap_or_default();

    if name.is_empty() {
        return if message.is_empty() {
            "Kubernetes event".to_string()
        } else {
            format!("Kubernetes event: {message}")
        };
    }

    let kind = object.kind.clone().unwrap_or_default();
    let api_version = object.api_version.clone().unwrap_or_default();
    let kind_expr = if api_version.contains('/') {
        format!("{kind}.{api_version}")
    } else {
        kind
    };

    let namespace = object.namespace.clone().unwrap_or_default();
    let where_part = if namespace.is_empty() {
        String::new()
    } else {
        format!(" in namespace {namespace}")
    };

    let reason = event.reason.clone().unwrap_or_default();
    let reason_part = if reason.is_empty() {
        "an issue".to_string()
    } else {
        format!("a {reason} event")
    };

    let tail = if message.is_empty() {
        String::new()
    } else {
        format!(": {message}")
    };

    format!("{kind_expr} {name}{where_part} has {reason_part}{tail}")
}

/// Parameters resolved for one (policy, selector) match. Manual mode never
/// carries a threshold or risk level.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectiveParams {
    pub mode: RemediationMode,
    pub confidence_threshold: Option<f64>,
    pub max_risk_level: Option<String>,
}

pub fn effective_params(
    policy: &RemediationPolicySpec,
    selector: &EventSelector,
) -> EffectiveParams {
    let mode = selector
        .mode
        .or(policy.mode)
        .unwrap_or(RemediationMode::Manual);
    match mode {
        RemediationMode::Manual => EffectiveParams {
            mode,
            confidence_threshold: None,
            max_risk_level: None,
        },
        RemediationMode::Automatic => EffectiveParams {
            mode,
            confidence_threshold: Some(
                selector
                    .confidence_threshold
                    .or(policy.confidence_threshold)
                    .unwrap_or(DEFAULT_CONFIDENCE_THRESHOLD),
            ),
            max_risk_level: Some(
                selector
                    .max_risk_level
                    .or(policy.max_risk_level)
                    .unwrap_or(RiskLevel::Low)
                    .as_str()
                    .to_string(),
            ),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use k8s_openapi::api::core::v1::ObjectReference;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn event(
        type_: &str,
        reason: &str,
        kind: &str,
        api_version: &str,
        namespace: &str,
        name: &str,
        message: &str,
    ) -> Event {
        Event {
            metadata: ObjectMeta {
                name: Some("evt-1".into()),
                namespace: Some(namespace.to_string()).filter(|n| !n.is_empty()),
                resource_version: Some("100".into()),
                ..ObjectMeta::default()
            },
            involved_object: ObjectReference {
                kind: Some(kind.to_string()).filter(|k| !k.is_empty()),
                api_version: Some(api_version.to_string()).filter(|v| !v.is_empty()),
                name: Some(name.to_string()).filter(|n| !n.is_empty()),
                namespace: Some(namespace.to_string()).filter(|n| !n.is_empty()),
                ..ObjectReference::default()
            },
            type_: Some(type_.to_string()).filter(|t| !t.is_empty()),
            reason: Some(reason.to_string()).filter(|r| !r.is_empty()),
            message: Some(message.to_string()).filter(|m| !m.is_empty()),
            ..Event::default()
        }
    }

    fn selector(json: serde_json::Value) -> EventSelector {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_empty_selector_fields_match_anything() {
        let e = event("Warning", "OOMKilling", "Pod", "v1", "default", "p1", "killed");
        assert!(selector_matches(&selector(serde_json::json!({})), &e));
        assert!(selector_matches(
            &selector(serde_json::json!({"type": "Warning"})),
            &e
        ));
        assert!(selector_matches(
            &selector(serde_json::json!({"type": "Warning", "reason": "OOMKilling"})),
            &e
        ));
        assert!(!selector_matches(
            &selector(serde_json::json!({"type": "Normal"})),
            &e
        ));
        assert!(!selector_matches(
            &selector(serde_json::json!({"involvedObjectKind": "Deployment"})),
            &e
        ));
    }

    #[test]
    fn test_dedup_key_shape() {
        let e = event("Warning", "Failed", "Pod", "v1", "default", "p1", "x");
        assert_eq!(event_dedup_key(&e), "default/evt-1:100");
    }

    #[test]
    fn test_processed_events_expiry() {
        let mut processed = ProcessedEvents::default();
        let now = Utc::now();
        assert!(processed.observe("a", now - Duration::hours(2)));
        assert!(processed.observe("b", now));
        assert!(!processed.observe("b", now));
        processed.cleanup(now, Duration::hours(1));
        assert_eq!(processed.len(), 1);
        assert!(processed.observe("a", now));
    }

    #[test]
    fn test_issue_description_shapes() {
        // no involved object name
        let e = event("Warning", "Failed", "", "", "", "", "node pressure");
        assert_eq!(issue_description(&e), "Kubernetes event: node pressure");
        let e = event("Warning", "Failed", "", "", "", "", "");
        assert_eq!(issue_description(&e), "Kubernetes event");

        // core group, everything present
        let e = event("Warning", "OOMKilling", "Pod", "v1", "default", "p1", "killed");
        assert_eq!(
            issue_description(&e),
            "Pod p1 in namespace default has a OOMKilling event: killed"
        );

        // named group uses Kind.apiVersion
        let e = event("Warning", "", "Deployment", "apps/v1", "", "web", "");
        assert_eq!(issue_description(&e), "Deployment.apps/v1 web has an issue");
    }

    #[test]
    fn test_effective_params_resolution() {
        let policy: RemediationPolicySpec = serde_json::from_value(serde_json::json!({
            "mcpEndpoint": "http://mcp",
            "mode": "automatic",
            "confidenceThreshold": 0.9
        }))
        .unwrap();

        // selector overrides win
        let params = effective_params(
            &policy,
            &selector(serde_json::json!({"mode": "automatic", "confidenceThreshold": 0.95, "maxRiskLevel": "medium"})),
        );
        assert_eq!(params.confidence_threshold, Some(0.95));
        assert_eq!(params.max_risk_level.as_deref(), Some("medium"));

        // policy defaults fill the gaps, hard defaults last
        let params = effective_params(&policy, &selector(serde_json::json!({})));
        assert_eq!(params.mode, RemediationMode::Automatic);
        assert_eq!(params.confidence_threshold, Some(0.9));
        assert_eq!(params.max_risk_level.as_deref(), Some("low"));

        // manual mode omits both fields regardless of configured values
        let params = effective_params(&policy, &selector(serde_json::json!({"mode": "manual"})));
        assert_eq!(params.mode, RemediationMode::Manual);
        assert_eq!(params.confidence_threshold, None);
        assert_eq!(params.max_risk_level, None);
    }

    #[test]
    fn test_first_match_wins_across_policies_and_selectors() {
        let mut p1 = RemediationPolicy::new(
            "a-policy",
            serde_json::from_value(serde_json::json!({
                "mcpEndpoint": "http://mcp",
                "eventSelectors": [
                    {"type": "Normal"},
                    {"type": "Warning", "reason": "OOMKilling"}
                ]
            }))
            .unwrap(),
        );
        p1.metadata.namespace = Some("default".into());
        let mut p2 = RemediationPolicy::new(
            "b-policy",
            serde_json::from_value(serde_json::json!({
                "mcpEndpoint": "http://mcp",
                "eventSelectors": [{"type": "Warning"}]
            }))
            .unwrap(),
        );
        p2.metadata.namespace = Some("default".into());

        let policies = vec![Arc::new(p1), Arc::new(p2)];
        let e = event("Warning", "OOMKilling", "Pod", "v1", "default", "p1", "x");
        let (policy, selector) = find_match(&policies, &e).unwrap();
        assert_eq!(policy.name_any(), "a-policy");
        assert_eq!(selector.reason.as_deref(), Some("OOMKilling"));
    }
}
