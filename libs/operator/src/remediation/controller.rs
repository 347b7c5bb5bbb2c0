use crate::conditions::{new_condition, set_condition, TYPE_READY};
use crate::controller::{check_api_queryable, Context, ControllerId, State};
use crate::crd::remediation::RemediationPolicy;
use crate::error::{Error, Result};
use crate::remediation::cooldown::CooldownPersister;
use crate::remediation::processor::{run_event_watcher, EventProcessor};
use crate::remediation::rate_limit::{ObjectCooldowns, DEFAULT_OBJECT_COOLDOWN_MINUTES};
use crate::remediation::PolicyRegistry;
use crate::telemetry;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::api::{Api, Patch, PatchParams, ResourceExt};
use kube::client::Client;
use kube::runtime::controller::{self, Action, Controller};
use kube::runtime::finalizer::{finalizer, Event as FinalizerEvent};
use kube::runtime::watcher;
use serde_json::json;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, field, info, instrument, Span};

pub const CONTROLLER_ID: ControllerId = "remediation";

pub static REMEDIATION_FINALIZER: &str = "remediationpolicy.dot-ai.devopstoolkit.live/cleanup";

const READY_REQUEUE: Duration = Duration::from_secs(60 * 60);

/// Per-controller context: the policy registry feeding the event processor
/// plus bookkeeping for cooldown-state loading.
pub struct Ctx {
    pub base: Arc<Context>,
    policies: PolicyRegistry,
    persister: CooldownPersister,
    loaded: Mutex<HashSet<String>>,
}

fn error_policy(obj: Arc<RemediationPolicy>, error: &Error, ctx: Arc<Ctx>) -> Action {
    crate::controller::error_policy(obj, error, ctx.base.clone())
}

#[instrument(skip(ctx, policy), fields(trace_id))]
async fn reconcile(policy: Arc<RemediationPolicy>, ctx: Arc<Ctx>) -> Result<Action> {
    let trace_id = telemetry::current_trace_id();
    Span::current().record("trace_id", field::display(&trace_id));
    let _timer = ctx.base.metrics.count_and_measure(&trace_id);
    ctx.base.diagnostics.write().await.last_event = Utc::now();

    // safe unwrap: RemediationPolicy is namespaced
    let namespace = policy.namespace().unwrap();
    let api: Api<RemediationPolicy> = Api::namespaced(ctx.base.client.clone(), &namespace);

    finalizer(&api, REMEDIATION_FINALIZER, policy, |event| async {
        match event {
            FinalizerEvent::Apply(policy) => apply(policy, ctx.clone()).await,
            FinalizerEvent::Cleanup(policy) => cleanup(policy, ctx.clone()).await,
        }
    })
    .await
    .map_err(|e| Error::FinalizerError(Box::new(e)))
}

async fn apply(policy: Arc<RemediationPolicy>, ctx: Arc<Ctx>) -> Result<Action> {
    // safe unwrap: RemediationPolicy is namespaced
    let namespace = policy.namespace().unwrap();
    let name = policy.name_any();
    let key = format!("{namespace}/{name}");

    if policy.spec.mcp_endpoint.is_empty() {
        patch_ready(&ctx, &policy, false, "ConfigError", "spec.mcpEndpoint is empty").await;
        return Ok(Action::requeue(Duration::from_secs(60)));
    }

    // cooldown state loads once per policy per process lifetime; the
    // in-memory map is authoritative afterwards
    if policy.spec.persistence_enabled() && ctx.loaded.lock().await.insert(key.clone()) {
        ctx.persister.load_policy(&policy).await;
    }

    let selectors = policy.spec.event_selectors.len();
    ctx.policies.write().await.insert(key.clone(), policy.clone());
    info!(msg = "remediation policy active", %key, selectors);

    patch_ready(&ctx, &policy, true, "PolicyActive", "watching cluster events").await;
    Ok(Action::requeue(READY_REQUEUE))
}

async fn cleanup(policy: Arc<RemediationPolicy>, ctx: Arc<Ctx>) -> Result<Action> {
    // safe unwrap: RemediationPolicy is namespaced
    let key = format!("{}/{}", policy.namespace().unwrap(), policy.name_any());
    ctx.policies.write().await.remove(&key);
    ctx.loaded.lock().await.remove(&key);
    info!(msg = "remediation policy removed", %key);
    // the cooldown ConfigMap is owned by the policy; the garbage collector
    // removes it
    Ok(Action::await_change())
}

async fn patch_ready(
    ctx: &Arc<Ctx>,
    policy: &RemediationPolicy,
    ready: bool,
    reason: &str,
    message: &str,
) {
    // safe unwrap: RemediationPolicy is namespaced
    let namespace = policy.namespace().unwrap();
    let name = policy.name_any();
    let api: Api<RemediationPolicy> = Api::namespaced(ctx.base.client.clone(), &namespace);

    let mut conditions: Vec<Condition> = policy
        .status
        .as_ref()
        .and_then(|s| s.conditions.clone())
        .unwrap_or_default();
    set_condition(
        &mut conditions,
        new_condition(TYPE_READY, ready, reason, message, policy.metadata.generation),
    );
    let status = json!({"status": {"conditions": conditions}});
    match api
        .patch_status(&name, &PatchParams::default(), &Patch::Merge(&status))
        .await
    {
        Ok(_) => {}
        Err(kube::Error::Api(ae)) if ae.code == 409 || ae.code == 404 => {}
        Err(e) => error!(msg = "failed to patch policy status", %e),
    }
}

/// Initialize the remediation controller, the cluster-wide event watcher
/// and the cooldown persister.
pub async fn run(state: State, client: Client) {
    let api = check_api_queryable::<RemediationPolicy>(client.clone()).await;

    let policies: PolicyRegistry = Arc::new(RwLock::new(HashMap::new()));
    let cooldowns = Arc::new(ObjectCooldowns::new(DEFAULT_OBJECT_COOLDOWN_MINUTES));
    let base = state.to_context(client.clone(), CONTROLLER_ID);

    let reporter = base.diagnostics.read().await.reporter.clone();
    let processor = match EventProcessor::new(
        client.clone(),
        policies.clone(),
        cooldowns.clone(),
        base.metrics.clone(),
        reporter,
    ) {
        Ok(processor) => Arc::new(processor),
        Err(e) => {
            error!(msg = "failed to build event processor", %e);
            std::process::exit(1);
        }
    };

    let ctx = Arc::new(Ctx {
        base,
        policies: policies.clone(),
        persister: CooldownPersister::new(client.clone(), cooldowns.clone(), policies.clone()),
        loaded: Mutex::new(HashSet::new()),
    });

    let token = CancellationToken::new();
    let watcher_token = token.clone();
    let watcher_client = client.clone();
    let event_watcher = tokio::spawn(async move {
        run_event_watcher(processor, watcher_client, watcher_token).await;
    });

    let persister = CooldownPersister::new(client.clone(), cooldowns, policies);
    let persister_token = token.clone();
    let persister_task = tokio::spawn(async move {
        persister.run(persister_token).await;
    });

    info!(msg = "starting remediation controller");
    let controller = Controller::new(api, watcher::Config::default().any_semantic())
        // debounce to filter out reconcile calls that happen in quick succession (only taking the latest)
        .with_config(controller::Config::default().debounce(Duration::from_millis(500)))
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx.clone())
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()));

    ctx.base.metrics.ready_set(1);
    controller.await;

    // stop the background tasks; the persister does one final sync
    token.cancel();
    let _ = event_watcher.await;
    let _ = persister_task.await;
}
