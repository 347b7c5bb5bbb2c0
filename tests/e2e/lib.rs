#[cfg(all(test, feature = "e2e-tests"))]
mod test {
    use std::time::Duration;

    use dot_ai_operator::crd::remediation::{RemediationPolicy, RemediationPolicySpec};
    use dot_ai_operator::crd::resource_sync::{ResourceSyncConfig, ResourceSyncConfigSpec};
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::api::{Api, PostParams};
    use kube::client::Client;
    use kube::runtime::wait::{await_condition, conditions, Condition};
    use kube::ResourceExt;
    use serde_json::json;
    use tokio::time::timeout;

    fn has_ready_condition<K>(status_conditions: fn(&K) -> Option<&Vec<k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition>>) -> impl Condition<K> {
        move |obj: Option<&K>| {
            obj.and_then(status_conditions)
                .map(|conditions| {
                    conditions
                        .iter()
                        .any(|c| c.type_ == "Ready" && c.status == "True")
                })
                .unwrap_or(false)
        }
    }

    fn sync_config_ready() -> impl Condition<ResourceSyncConfig> {
        has_ready_condition::<ResourceSyncConfig>(|config| {
            config.status.as_ref().and_then(|s| s.conditions.as_ref())
        })
    }

    fn policy_ready() -> impl Condition<RemediationPolicy> {
        has_ready_condition::<RemediationPolicy>(|policy| {
            policy.status.as_ref().and_then(|s| s.conditions.as_ref())
        })
    }

    async fn wait_for<R, C>(api: Api<R>, name: &str, condition: C)
    where
        R: kube::Resource
            + Clone
            + std::fmt::Debug
            + for<'de> k8s_openapi::serde::Deserialize<'de>
            + 'static
            + Send,
        C: Condition<R>,
    {
        timeout(
            Duration::from_secs(30),
            await_condition(api, name, condition),
        )
        .await
        .unwrap()
        .unwrap();
    }

    #[tokio::test]
    async fn sync_config_becomes_ready() {
        let client = Client::try_default().await.unwrap();
        let api = Api::<ResourceSyncConfig>::namespaced(client, "default");

        let config = ResourceSyncConfig::new(
            "e2e-sync",
            serde_json::from_value::<ResourceSyncConfigSpec>(json!({
                "mcpEndpoint": "http://dot-ai-mcp.dot-ai.svc:8080",
                "debounceSeconds": 2,
                "resyncIntervalMinutes": 5
            }))
            .unwrap(),
        );
        api.create(&PostParams::default(), &config).await.unwrap();

        wait_for(api.clone(), "e2e-sync", sync_config_ready()).await;

        let live = api.get("e2e-sync").await.unwrap();
        let watched = live
            .status
            .as_ref()
            .and_then(|s| s.watched_resource_types)
            .unwrap_or(0);
        assert!(watched > 0, "engine should watch at least the CRD informer");

        api.delete("e2e-sync", &Default::default()).await.unwrap();
    }

    #[tokio::test]
    async fn policy_ready_and_cooldown_state_created() {
        let client = Client::try_default().await.unwrap();
        let api = Api::<RemediationPolicy>::namespaced(client.clone(), "default");

        let policy = RemediationPolicy::new(
            "e2e-policy",
            serde_json::from_value::<RemediationPolicySpec>(json!({
                "mcpEndpoint": "http://dot-ai-mcp.dot-ai.svc:8080/api/v1/tools/remediate",
                "eventSelectors": [{"type": "Warning", "reason": "OOMKilling"}],
                "rateLimiting": {"eventsPerMinute": 5, "cooldownMinutes": 10}
            }))
            .unwrap(),
        );
        api.create(&PostParams::default(), &policy).await.unwrap();

        wait_for(api.clone(), "e2e-policy", policy_ready()).await;

        // the cooldown state ConfigMap appears after the first persister sync
        let configmaps = Api::<ConfigMap>::namespaced(client, "default");
        let state = timeout(Duration::from_secs(120), async {
            loop {
                if let Ok(cm) = configmaps.get("e2e-policy-cooldown-state").await {
                    break cm;
                }
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(
            state
                .data
                .as_ref()
                .and_then(|d| d.get("version"))
                .map(String::as_str),
            Some("1")
        );
        assert!(state
            .owner_references()
            .iter()
            .any(|o| o.kind == "RemediationPolicy"));

        let policy = api.get("e2e-policy").await.unwrap();
        api.delete("e2e-policy", &Default::default()).await.unwrap();
        wait_for(
            api,
            "e2e-policy",
            conditions::is_deleted(&policy.uid().unwrap()),
        )
        .await;
    }
}
