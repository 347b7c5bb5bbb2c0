use crate::crd::remediation::RemediationPolicy;
use crate::remediation::rate_limit::ObjectCooldowns;
use crate::remediation::PolicyRegistry;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, ObjectMeta, Patch, PatchParams, ResourceExt};
use kube::client::Client;
use kube::Resource;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Current on-disk format; older or newer files are ignored, never migrated.
pub const STATE_VERSION: &str = "1";

const FIELD_MANAGER: &str = "dot-ai-controller";
const SYNC_INTERVAL: tokio::time::Duration = tokio::time::Duration::from_secs(60);
const SHUTDOWN_SYNC_TIMEOUT: tokio::time::Duration = tokio::time::Duration::from_secs(30);

/// Entries with less remaining time than this are not worth persisting.
fn min_persisted_remaining() -> Duration {
    Duration::hours(1)
}

pub fn state_configmap_name(policy_name: &str) -> String {
    format!("{policy_name}-cooldown-state")
}

/// Runtime key: `<policyNs>/<policyName>/<shortKey>` where the short key is
/// `<objNs>/<objectIdentifier>/<reason>`.
pub fn full_key(policy_namespace: &str, policy_name: &str, short_key: &str) -> String {
    format!("{policy_namespace}/{policy_name}/{short_key}")
}

/// Split a full key back into `(policyNs, policyName, shortKey)`.
pub fn split_full_key(key: &str) -> Option<(&str, &str, &str)> {
    let mut parts = key.splitn(3, '/');
    Some((parts.next()?, parts.next()?, parts.next()?))
}

/// Build the key the object cooldown map uses for one remediated object.
pub fn object_cooldown_key(
    policy_namespace: &str,
    policy_name: &str,
    object_namespace: &str,
    object_identifier: &str,
    reason: &str,
) -> String {
    full_key(
        policy_namespace,
        policy_name,
        &format!("{object_namespace}/{object_identifier}/{reason}"),
    )
}

/// Serialize the per-policy short-key map into ConfigMap data.
pub fn build_state_data(
    entries: &HashMap<String, DateTime<Utc>>,
    now: DateTime<Utc>,
) -> BTreeMap<String, String> {
    let cooldowns: BTreeMap<String, String> = entries
        .iter()
        .map(|(k, v)| (k.clone(), v.to_rfc3339()))
        .collect();
    BTreeMap::from([
        ("version".to_string(), STATE_VERSION.to_string()),
        ("lastSync".to_string(), now.to_rfc3339()),
        (
            "cooldowns".to_string(),
            serde_json::to_string(&cooldowns).unwrap_or_else(|_| "{}".to_string()),
        ),
    ])
}

/// Parse ConfigMap data back into short-key entries, dropping entries that
/// already expired. A version mismatch ignores the whole payload.
pub fn parse_state_data(
    data: &BTreeMap<String, String>,
    now: DateTime<Utc>,
) -> Option<HashMap<String, DateTime<Utc>>> {
    if data.get("version").map(String::as_str) != Some(STATE_VERSION) {
        return None;
    }
    let raw: BTreeMap<String, String> = serde_json::from_str(data.get("cooldowns")?).ok()?;
    Some(
        raw.iter()
            .filter_map(|(key, value)| {
                let end = DateTime::parse_from_rfc3339(value).ok()?.with_timezone(&Utc);
                (end > now).then(|| (key.clone(), end))
            })
            .collect(),
    )
}

/// Persists object cooldowns into one ConfigMap per policy so they survive
/// controller restarts.
pub struct CooldownPersister {
    client: Client,
    cooldowns: Arc<ObjectCooldowns>,
    policies: PolicyRegistry,
}

impl CooldownPersister {
    pub fn new(client: Client, cooldowns: Arc<ObjectCooldowns>, policies: PolicyRegistry) -> Self {
        Self {
            client,
            cooldowns,
            policies,
        }
    }

    /// Load the persisted state for one policy into the in-memory map.
    pub async fn load_policy(&self, policy: &RemediationPolicy) {
        // safe unwrap: RemediationPolicy is namespaced
        let namespace = policy.namespace().unwrap();
        let name = policy.name_any();
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &namespace);

        let configmap = match api.get(&state_configmap_name(&name)).await {
            Ok(configmap) => configmap,
            Err(kube::Error::Api(ae)) if ae.code == 404 => return,
            Err(e) => {
                warn!(msg = "failed to read cooldown state", policy = %name, %e);
                return;
            }
        };

        let Some(entries) = configmap
            .data
            .as_ref()
            .and_then(|data| parse_state_data(data, Utc::now()))
        else {
            warn!(msg = "ignoring cooldown state with unknown version", policy = %name);
            return;
        };

        let count = entries.len();
        self.cooldowns.restore(
            entries
                .into_iter()
                .map(|(short, end)| (full_key(&namespace, &name, &short), end))
                .collect(),
        );
        info!(msg = "restored cooldown state", policy = %name, entries = count);
    }

    /// Write the ≥1h-remaining entries of every persisting policy.
    pub async fn persist_all(&self) {
        let now = Utc::now();
        let snapshot = self.cooldowns.snapshot();

        // group by owning policy
        let mut per_policy: HashMap<(String, String), HashMap<String, DateTime<Utc>>> =
            HashMap::new();
        for (key, end) in &snapshot {
            if *end - now < min_persisted_remaining() {
                continue;
            }
            let Some((policy_ns, policy_name, short)) = split_full_key(key) else {
                continue;
            };
            per_policy
                .entry((policy_ns.to_string(), policy_name.to_string()))
                .or_default()
                .insert(short.to_string(), *end);
        }

        let policies = self.policies.read().await.clone();
        for (key, policy) in policies {
            if !policy.spec.persistence_enabled() {
                continue;
            }
            let Some((namespace, name)) = key.split_once('/') else {
                continue;
            };
            let entries = per_policy
                .remove(&(namespace.to_string(), name.to_string()))
                .unwrap_or_default();
            if let Err(e) = self.write_state(&policy, &entries, now).await {
                warn!(msg = "failed to persist cooldown state", policy = %name, %e);
            }
        }
    }

    async fn write_state(
        &self,
        policy: &RemediationPolicy,
        entries: &HashMap<String, DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> kube::Result<()> {
        // safe unwrap: RemediationPolicy is namespaced
        let namespace = policy.namespace().unwrap();
        let name = policy.name_any();
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &namespace);

        let owner = OwnerReference {
            api_version: RemediationPolicy::api_version(&()).to_string(),
            kind: RemediationPolicy::kind(&()).to_string(),
            name: name.clone(),
            uid: policy.uid().unwrap_or_default(),
            controller: Some(true),
            ..OwnerReference::default()
        };
        let configmap = ConfigMap {
            metadata: ObjectMeta {
                name: Some(state_configmap_name(&name)),
                namespace: Some(namespace.clone()),
                owner_references: Some(vec![owner]),
                labels: Some(BTreeMap::from([
                    (
                        "app.kubernetes.io/component".to_string(),
                        "cooldown-state".to_string(),
                    ),
                    (
                        "app.kubernetes.io/managed-by".to_string(),
                        FIELD_MANAGER.to_string(),
                    ),
                ])),
                ..ObjectMeta::default()
            },
            data: Some(build_state_data(entries, now)),
            ..ConfigMap::default()
        };

        api.patch(
            &state_configmap_name(&name),
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&configmap),
        )
        .await?;
        Ok(())
    }

    /// Sync every minute; on shutdown run one final sync under its own
    /// timeout, since the engine token is already gone by then.
    pub async fn run(self, token: CancellationToken) {
        let mut ticker = tokio::time::interval(SYNC_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.cooldowns.sweep(Utc::now());
                    self.persist_all().await;
                }
                _ = token.cancelled() => break,
            }
        }
        if tokio::time::timeout(SHUTDOWN_SYNC_TIMEOUT, self.persist_all())
            .await
            .is_err()
        {
            warn!(msg = "final cooldown sync timed out");
        }
        debug!(msg = "cooldown persister stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_round_trip() {
        let key = object_cooldown_key("default", "policy", "apps", "cronjob:my-cronjob", "OOMKilling");
        assert_eq!(key, "default/policy/apps/cronjob:my-cronjob/OOMKilling");
        let (ns, name, short) = split_full_key(&key).unwrap();
        assert_eq!(ns, "default");
        assert_eq!(name, "policy");
        assert_eq!(short, "apps/cronjob:my-cronjob/OOMKilling");
        assert_eq!(full_key(ns, name, short), key);
    }

    #[test]
    fn test_state_data_round_trip() {
        let now = Utc::now();
        let end = now + Duration::hours(3);
        let entries = HashMap::from([("apps/cronjob:db-cleanup/Failed".to_string(), end)]);

        let data = build_state_data(&entries, now);
        assert_eq!(data.get("version").map(String::as_str), Some("1"));
        assert!(data.contains_key("lastSync"));

        let parsed = parse_state_data(&data, now).unwrap();
        assert_eq!(parsed.len(), 1);
        let parsed_end = parsed["apps/cronjob:db-cleanup/Failed"];
        assert_eq!(parsed_end.timestamp(), end.timestamp());
    }

    #[test]
    fn test_parse_drops_expired_entries() {
        let now = Utc::now();
        let entries = HashMap::from([
            ("live".to_string(), now + Duration::hours(2)),
            ("dead".to_string(), now - Duration::minutes(5)),
        ]);
        let data = build_state_data(&entries, now);
        let parsed = parse_state_data(&data, now).unwrap();
        assert!(parsed.contains_key("live"));
        assert!(!parsed.contains_key("dead"));
    }

    #[test]
    fn test_version_mismatch_is_ignored() {
        let now = Utc::now();
        let mut data = build_state_data(&HashMap::new(), now);
        data.insert("version".to_string(), "2".to_string());
        assert!(parse_state_data(&data, now).is_none());
    }

    #[test]
    fn test_configmap_name() {
        assert_eq!(state_configmap_name("oom-policy"), "oom-policy-cooldown-state");
    }

    mod persist {
        use super::super::*;
        use crate::crd::remediation::{RemediationPolicy, RemediationPolicySpec};

        use std::collections::HashMap;
        use std::sync::Arc;

        use assert_json_diff::assert_json_include;
        use http::{Request, Response};
        use kube::client::Body;
        use kube::ResourceExt;
        use serde_json::json;
        use tokio::sync::RwLock;

        fn policy(persistence_enabled: bool) -> RemediationPolicy {
            let mut policy = RemediationPolicy::new(
                "oom-policy",
                serde_json::from_value::<RemediationPolicySpec>(json!({
                    "mcpEndpoint": "http://mcp:8080",
                    "persistence": {"enabled": persistence_enabled}
                }))
                .unwrap(),
            );
            policy.metadata.namespace = Some("default".into());
            policy.metadata.uid = Some("rp-uid-1".into());
            policy
        }

        #[tokio::test]
        async fn test_persist_writes_owned_configmap_with_long_entries_only() {
            let (mock_service, mut handle) =
                tower_test::mock::pair::<Request<Body>, Response<Body>>();
            let client = Client::new(mock_service, "default");

            let cooldowns = Arc::new(ObjectCooldowns::new(1));
            let now = Utc::now();
            // three hours left: persisted
            cooldowns.restore(HashMap::from([(
                "default/oom-policy/apps/cronjob:db-cleanup/Failed".to_string(),
                now + Duration::hours(3),
            )]));
            // thirty minutes left: intentionally dropped
            cooldowns.restore(HashMap::from([(
                "default/oom-policy/apps/web-1/OOMKilling".to_string(),
                now + Duration::minutes(30),
            )]));

            let policy = policy(true);
            let registry: PolicyRegistry = Arc::new(RwLock::new(HashMap::from([(
                format!("default/{}", policy.name_any()),
                Arc::new(policy),
            )])));
            let persister = CooldownPersister::new(client, cooldowns, registry);

            let server = tokio::spawn(async move {
                let (request, send) = handle.next_request().await.expect("apply patch");
                assert_eq!(request.method(), http::Method::PATCH);
                assert!(request
                    .uri()
                    .path()
                    .ends_with("/configmaps/oom-policy-cooldown-state"));

                let body = request.into_body().collect_bytes().await.unwrap();
                let configmap: serde_json::Value = serde_json::from_slice(&body).unwrap();
                assert_json_include!(
                    actual: configmap.clone(),
                    expected: json!({
                        "metadata": {
                            "labels": {
                                "app.kubernetes.io/component": "cooldown-state",
                                "app.kubernetes.io/managed-by": "dot-ai-controller"
                            },
                            "ownerReferences": [{
                                "kind": "RemediationPolicy",
                                "name": "oom-policy",
                                "uid": "rp-uid-1",
                                "controller": true
                            }]
                        },
                        "data": {"version": "1"}
                    })
                );

                let cooldowns: BTreeMap<String, String> =
                    serde_json::from_str(configmap["data"]["cooldowns"].as_str().unwrap())
                        .unwrap();
                assert!(cooldowns.contains_key("apps/cronjob:db-cleanup/Failed"));
                assert!(!cooldowns.contains_key("apps/web-1/OOMKilling"));

                send.send_response(
                    Response::builder()
                        .body(Body::from(serde_json::to_vec(&configmap).unwrap()))
                        .unwrap(),
                );
            });

            persister.persist_all().await;
            server.await.unwrap();
        }

        #[tokio::test]
        async fn test_opted_out_policy_is_not_persisted() {
            let (mock_service, mut handle) =
                tower_test::mock::pair::<Request<Body>, Response<Body>>();
            let client = Client::new(mock_service, "default");

            let cooldowns = Arc::new(ObjectCooldowns::new(1));
            cooldowns.restore(HashMap::from([(
                "default/oom-policy/apps/web-1/Failed".to_string(),
                Utc::now() + Duration::hours(3),
            )]));

            let policy = policy(false);
            let registry: PolicyRegistry = Arc::new(RwLock::new(HashMap::from([(
                format!("default/{}", policy.name_any()),
                Arc::new(policy),
            )])));
            let persister = CooldownPersister::new(client, cooldowns, registry);

            persister.persist_all().await;
            // no request must have been made
            let waited = tokio::time::timeout(
                tokio::time::Duration::from_millis(100),
                handle.next_request(),
            )
            .await;
            assert!(waited.is_err(), "expected no API call for opted-out policy");
        }
    }
}
