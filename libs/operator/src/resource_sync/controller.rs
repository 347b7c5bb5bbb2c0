use crate::conditions::{new_condition, set_condition, TYPE_READY};
use crate::controller::{check_api_queryable, Context, ControllerId, State};
use crate::crd::resource_sync::ResourceSyncConfig;
use crate::error::{Error, Result};
use crate::mcp::auth::resolve_optional_bearer_token;
use crate::resource_sync::engine::{EngineParams, SyncEngine};
use crate::telemetry;

use std::collections::HashMap;
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
use tokio::sync::Mutex;
use tokio::time::Duration;
use tracing::{error, field, info, instrument, Span};

pub const CONTROLLER_ID: ControllerId = "resource-sync";

pub static RESOURCE_SYNC_FINALIZER: &str = "resourcesyncconfig.dot-ai.devopstoolkit.live/cleanup";

const READY_REQUEUE: Duration = Duration::from_secs(60 * 60);
const CONFIG_ERROR_REQUEUE: Duration = Duration::from_secs(60);

/// Per-controller context carrying the live engines.
pub struct Ctx {
    pub base: Arc<Context>,
    engines: Mutex<HashMap<String, SyncEngine>>,
}

fn error_policy(obj: Arc<ResourceSyncConfig>, error: &Error, ctx: Arc<Ctx>) -> Action {
    crate::controller::error_policy(obj, error, ctx.base.clone())
}

#[instrument(skip(ctx, config), fields(trace_id))]
async fn reconcile(config: Arc<ResourceSyncConfig>, ctx: Arc<Ctx>) -> Result<Action> {
    let trace_id = telemetry::current_trace_id();
    Span::current().record("trace_id", field::display(&trace_id));
    let _timer = ctx.base.metrics.count_and_measure(&trace_id);
    ctx.base.diagnostics.write().await.last_event = Utc::now();

    // safe unwrap: ResourceSyncConfig is namespaced
    let namespace = config.namespace().unwrap();
    let api: Api<ResourceSyncConfig> = Api::namespaced(ctx.base.client.clone(), &namespace);

    finalizer(&api, RESOURCE_SYNC_FINALIZER, config, |event| async {
        match event {
            FinalizerEvent::Apply(config) => apply(config, ctx.clone()).await,
            FinalizerEvent::Cleanup(config) => cleanup(config, ctx.clone()).await,
        }
    })
    .await
    .map_err(|e| Error::FinalizerError(Box::new(e)))
}

async fn apply(config: Arc<ResourceSyncConfig>, ctx: Arc<Ctx>) -> Result<Action> {
    // safe unwrap: ResourceSyncConfig is namespaced
    let namespace = config.namespace().unwrap();
    let name = config.name_any();
    let key = format!("{namespace}/{name}");
    let params = EngineParams::from(&config.spec);

    let mut engines = ctx.engines.lock().await;
    if let Some(engine) = engines.get(&key) {
        if engine.params == params {
            return Ok(Action::requeue(READY_REQUEUE));
        }
        // endpoint, auth, debounce or resync changed: unwind the engine and
        // build a fresh one from the new spec
        info!(msg = "sync config changed, rebuilding engine", %key);
        engine.shutdown();
        engines.remove(&key);
    }

    let bearer = match resolve_optional_bearer_token(
        &ctx.base.client,
        &namespace,
        config.spec.auth_secret_ref.as_ref(),
    )
    .await
    {
        Ok(bearer) => bearer,
        Err(e @ Error::AuthError(_)) => {
            patch_engine_status(&ctx, &config, false, "MCPAuthError", &e.to_string(), 0).await;
            return Ok(Action::requeue(CONFIG_ERROR_REQUEUE));
        }
        Err(e) => return Err(e),
    };

    match SyncEngine::start(
        ctx.base.client.clone(),
        &config,
        bearer,
        ctx.base.metrics.clone(),
    )
    .await
    {
        Ok(engine) => {
            // the CRD watcher is always present on top of the discovered set
            let watched = engine.watched_types + 1;
            info!(msg = "resource sync engine started", %key, watched);
            engines.insert(key, engine);
            patch_engine_status(&ctx, &config, true, "EngineRunning", "resource sync active", watched)
                .await;
            Ok(Action::requeue(READY_REQUEUE))
        }
        Err(e) => {
            patch_engine_status(&ctx, &config, false, "StartupFailed", &e.to_string(), 0).await;
            Err(e)
        }
    }
}

async fn cleanup(config: Arc<ResourceSyncConfig>, ctx: Arc<Ctx>) -> Result<Action> {
    // safe unwrap: ResourceSyncConfig is namespaced
    let key = format!("{}/{}", config.namespace().unwrap(), config.name_any());
    if let Some(engine) = ctx.engines.lock().await.remove(&key) {
        engine.shutdown();
        info!(msg = "resource sync engine stopped", %key);
    }
    Ok(Action::await_change())
}

async fn patch_engine_status(
    ctx: &Arc<Ctx>,
    config: &ResourceSyncConfig,
    ready: bool,
    reason: &str,
    message: &str,
    watched_types: usize,
) {
    // safe unwrap: ResourceSyncConfig is namespaced
    let namespace = config.namespace().unwrap();
    let name = config.name_any();
    let api: Api<ResourceSyncConfig> = Api::namespaced(ctx.base.client.clone(), &namespace);

    let mut conditions: Vec<Condition> = config
        .status
        .as_ref()
        .and_then(|s| s.conditions.clone())
        .unwrap_or_default();
    set_condition(
        &mut conditions,
        new_condition(TYPE_READY, ready, reason, message, config.metadata.generation),
    );
    let status = json!({"status": {
        "active": ready,
        "watchedResourceTypes": watched_types as i64,
        "conditions": conditions,
        "lastError": if ready { None } else { Some(message.to_string()) },
    }});
    match api
        .patch_status(&name, &PatchParams::default(), &Patch::Merge(&status))
        .await
    {
        Ok(_) => {}
        Err(kube::Error::Api(ae)) if ae.code == 409 || ae.code == 404 => {}
        Err(e) => error!(msg = "failed to patch sync status", %e),
    }
}

/// Initialize the resource-sync controller and shared state
pub async fn run(state: State, client: Client) {
    let api = check_api_queryable::<ResourceSyncConfig>(client.clone()).await;

    let ctx = Arc::new(Ctx {
        base: state.to_context(client, CONTROLLER_ID),
        engines: Mutex::new(HashMap::new()),
    });

    info!(msg = "starting resource-sync controller");
    let controller = Controller::new(api, watcher::Config::default().any_semantic())
        // debounce to filter out reconcile calls that happen in quick succession (only taking the latest)
        .with_config(controller::Config::default().debounce(Duration::from_millis(500)))
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx.clone())
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()));

    ctx.base.metrics.ready_set(1);
    controller.await;

    for (_, engine) in ctx.engines.lock().await.drain() {
        engine.shutdown();
    }
}
