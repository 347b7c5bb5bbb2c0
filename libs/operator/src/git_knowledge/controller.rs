use crate::conditions::{
    new_condition, set_condition, TYPE_READY, TYPE_SCHEDULED, TYPE_SYNCED,
};
use crate::controller::{check_api_queryable, Context, ControllerId, State};
use crate::crd::git_knowledge::{
    DeletionPolicy, GitKnowledgeSource, GitKnowledgeSourceStatus, GIT_KNOWLEDGE_FINALIZER,
};
use crate::error::{Error, GitErrorKind, Result};
use crate::git_knowledge::ingest::sync_repository;
use crate::git_knowledge::repo::{clone_dir, CloneDirGuard};
use crate::git_knowledge::schedule::SyncSchedule;
use crate::mcp::auth::{resolve_optional_bearer_token, resolve_secret_value};
use crate::mcp::client::RetryPolicy;
use crate::mcp::knowledge::KnowledgeClient;
use crate::telemetry;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{Api, Patch, PatchParams, ResourceExt};
use kube::client::Client;
use kube::runtime::controller::{self, Action, Controller};
use kube::runtime::finalizer::{finalizer, Event as FinalizerEvent};
use kube::runtime::watcher;
use serde_json::json;
use tokio::sync::Mutex;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, field, info, instrument, warn, Span};

pub const CONTROLLER_ID: ControllerId = "git-knowledge";

/// Another reconcile holds this source's mutex; try again shortly.
const BUSY_REQUEUE: Duration = Duration::from_secs(30);
const CONFIG_ERROR_REQUEUE: Duration = Duration::from_secs(60);

/// Per-controller context; the per-key mutexes guarantee two reconciles for
/// one source never overlap a clone.
pub struct Ctx {
    pub base: Arc<Context>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

fn error_policy(obj: Arc<GitKnowledgeSource>, error: &Error, ctx: Arc<Ctx>) -> Action {
    crate::controller::error_policy(obj, error, ctx.base.clone())
}

#[instrument(skip(ctx, source), fields(trace_id))]
async fn reconcile(source: Arc<GitKnowledgeSource>, ctx: Arc<Ctx>) -> Result<Action> {
    let trace_id = telemetry::current_trace_id();
    Span::current().record("trace_id", field::display(&trace_id));
    let _timer = ctx.base.metrics.count_and_measure(&trace_id);
    ctx.base.diagnostics.write().await.last_event = Utc::now();

    // safe unwrap: GitKnowledgeSource is namespaced
    let namespace = source.namespace().unwrap();
    let name = source.name_any();
    let key = format!("{namespace}/{name}");

    let lock = {
        let mut locks = ctx.locks.lock().await;
        locks.entry(key.clone()).or_default().clone()
    };
    let Ok(_guard) = lock.try_lock() else {
        info!(msg = "sync already in progress, requeueing", %key);
        return Ok(Action::requeue(BUSY_REQUEUE));
    };

    let api: Api<GitKnowledgeSource> = Api::namespaced(ctx.base.client.clone(), &namespace);
    finalizer(&api, GIT_KNOWLEDGE_FINALIZER, source, |event| async {
        match event {
            FinalizerEvent::Apply(source) => apply(source, ctx.clone()).await,
            FinalizerEvent::Cleanup(source) => cleanup(source, ctx.clone()).await,
        }
    })
    .await
    .map_err(|e| Error::FinalizerError(Box::new(e)))
}

async fn apply(source: Arc<GitKnowledgeSource>, ctx: Arc<Ctx>) -> Result<Action> {
    // safe unwrap: GitKnowledgeSource is namespaced
    let namespace = source.namespace().unwrap();
    let name = source.name_any();
    let now = Utc::now();

    let schedule = match SyncSchedule::parse(&source.spec.schedule) {
        Ok(schedule) => schedule,
        Err(e) => {
            warn!(msg = "invalid sync schedule", source = %name, %e);
            patch_status(&ctx, &source, |status| {
                status.next_scheduled_sync = None;
                status.last_error = Some(e.to_string());
                let mut conditions = status.conditions.take().unwrap_or_default();
                set_condition(
                    &mut conditions,
                    new_condition(
                        TYPE_SCHEDULED,
                        false,
                        "ScheduleError",
                        &e.to_string(),
                        source.metadata.generation,
                    ),
                );
                status.conditions = Some(conditions);
            })
            .await;
            // nothing to requeue for; a spec change triggers a new reconcile
            return Ok(Action::await_change());
        }
    };

    let last_sync = source
        .status
        .as_ref()
        .and_then(|s| s.last_sync_time.as_ref())
        .map(|t| t.0);

    // not due yet: publish the next instant and sleep until then
    if last_sync.is_some() {
        let (delta, next) = schedule.next_sync(now, last_sync);
        if !delta.is_zero() {
            patch_status(&ctx, &source, |status| {
                status.next_scheduled_sync = Some(Time(next));
                let mut conditions = status.conditions.take().unwrap_or_default();
                set_condition(
                    &mut conditions,
                    new_condition(
                        TYPE_SCHEDULED,
                        true,
                        "WaitingForSchedule",
                        &format!("next sync at {}", next.to_rfc3339()),
                        source.metadata.generation,
                    ),
                );
                status.conditions = Some(conditions);
            })
            .await;
            return Ok(Action::requeue(delta));
        }
    }

    let git_token = match &source.spec.repository.secret_ref {
        Some(secret_ref) => {
            match resolve_secret_value(&ctx.base.client, &namespace, secret_ref).await {
                Ok(token) => Some(token),
                Err(e) => {
                    record_sync_failure(&ctx, &source, "GitAuthError", &e.to_string()).await;
                    return Ok(Action::requeue(CONFIG_ERROR_REQUEUE));
                }
            }
        }
        None => None,
    };

    let bearer = match resolve_optional_bearer_token(
        &ctx.base.client,
        &namespace,
        source.spec.mcp_server.auth_secret_ref.as_ref(),
    )
    .await
    {
        Ok(bearer) => bearer,
        Err(e) => {
            record_sync_failure(&ctx, &source, "MCPAuthError", &e.to_string()).await;
            return Ok(Action::requeue(CONFIG_ERROR_REQUEUE));
        }
    };

    let knowledge =
        KnowledgeClient::new(&source.spec.mcp_server.url, bearer, RetryPolicy::default())?;
    let source_id = format!("{namespace}/{name}");
    let uid = source.uid().unwrap_or_default();
    let target = CloneDirGuard::new(clone_dir(&std::env::temp_dir(), &namespace, &name, &uid));

    info!(msg = "starting repository sync", source = %source_id);
    let report = match sync_repository(
        &source.spec,
        git_token,
        &knowledge,
        &source_id,
        target,
        &CancellationToken::new(),
    )
    .await
    {
        Ok(report) => report,
        Err(Error::GitError { kind, message }) => {
            let reason = match kind {
                GitErrorKind::Auth => "GitAuthError",
                GitErrorKind::RepositoryNotFound => "RepositoryNotFound",
                GitErrorKind::Other => "CloneError",
            };
            record_sync_failure(&ctx, &source, reason, &message).await;
            return Ok(Action::requeue(CONFIG_ERROR_REQUEUE));
        }
        Err(e) => return Err(e),
    };

    let (delta, next) = schedule.next_sync(Utc::now(), Some(Utc::now()));
    let generation = source.metadata.generation;
    patch_status(&ctx, &source, move |status| {
        status.active = Some(true);
        status.document_count = Some(report.documents);
        status.last_sync_time = Some(Time(Utc::now()));
        status.last_synced_commit = Some(report.head_commit.clone());
        status.next_scheduled_sync = Some(Time(next));
        status.skipped_files = Some(report.skipped.clone());
        status.sync_errors = Some(status.sync_errors.unwrap_or(0) + report.errors);
        status.last_error = report.last_error.clone();
        status.observed_generation = generation;
        let mut conditions = status.conditions.take().unwrap_or_default();
        set_condition(
            &mut conditions,
            new_condition(TYPE_READY, true, "SyncSucceeded", "source is active", generation),
        );
        set_condition(
            &mut conditions,
            new_condition(
                TYPE_SYNCED,
                report.errors == 0,
                if report.errors == 0 {
                    "AllDocumentsIngested"
                } else {
                    "PartialIngest"
                },
                &format!("{} documents ingested", report.documents),
                generation,
            ),
        );
        set_condition(
            &mut conditions,
            new_condition(
                TYPE_SCHEDULED,
                true,
                "WaitingForSchedule",
                &format!("next sync at {}", next.to_rfc3339()),
                generation,
            ),
        );
        status.conditions = Some(conditions);
    })
    .await;

    Ok(Action::requeue(if delta.is_zero() {
        BUSY_REQUEUE
    } else {
        delta
    }))
}

/// On deletion with `deletionPolicy=Delete`, all chunks for this source
/// must be gone from MCP before the finalizer comes off.
async fn cleanup(source: Arc<GitKnowledgeSource>, ctx: Arc<Ctx>) -> Result<Action> {
    // safe unwrap: GitKnowledgeSource is namespaced
    let namespace = source.namespace().unwrap();
    let name = source.name_any();
    let key = format!("{namespace}/{name}");

    if source.spec.deletion_policy == DeletionPolicy::Delete {
        let bearer = resolve_optional_bearer_token(
            &ctx.base.client,
            &namespace,
            source.spec.mcp_server.auth_secret_ref.as_ref(),
        )
        .await
        // the auth secret may already be gone during teardown; the bulk
        // delete endpoint itself decides whether it needs credentials
        .unwrap_or_default();

        let knowledge =
            KnowledgeClient::new(&source.spec.mcp_server.url, bearer, RetryPolicy::default())?;
        let deleted = knowledge
            .delete_source(&key, &CancellationToken::new())
            .await?;
        info!(msg = "knowledge chunks deleted", source = %key, chunks = deleted);
    }

    ctx.locks.lock().await.remove(&key);
    Ok(Action::await_change())
}

async fn record_sync_failure(
    ctx: &Arc<Ctx>,
    source: &GitKnowledgeSource,
    reason: &str,
    message: &str,
) {
    warn!(msg = "repository sync failed", reason, message);
    let generation = source.metadata.generation;
    let reason = reason.to_string();
    let message = message.to_string();
    patch_status(ctx, source, move |status| {
        status.sync_errors = Some(status.sync_errors.unwrap_or(0) + 1);
        status.last_error = Some(message.clone());
        let mut conditions = status.conditions.take().unwrap_or_default();
        set_condition(
            &mut conditions,
            new_condition(TYPE_READY, false, &reason, &message, generation),
        );
        status.conditions = Some(conditions);
    })
    .await;
}

/// Read a fresh copy, mutate, merge-patch; conflicts are abandoned.
async fn patch_status<F>(ctx: &Arc<Ctx>, source: &GitKnowledgeSource, mutate: F)
where
    F: FnOnce(&mut GitKnowledgeSourceStatus),
{
    // safe unwrap: GitKnowledgeSource is namespaced
    let namespace = source.namespace().unwrap();
    let name = source.name_any();
    let api: Api<GitKnowledgeSource> = Api::namespaced(ctx.base.client.clone(), &namespace);

    let fresh = match api.get(&name).await {
        Ok(fresh) => fresh,
        Err(kube::Error::Api(ae)) if ae.code == 404 => return,
        Err(e) => {
            warn!(msg = "failed to read source for status update", %e);
            return;
        }
    };
    let mut status = fresh.status.unwrap_or_default();
    mutate(&mut status);

    match api
        .patch_status(
            &name,
            &PatchParams::default(),
            &Patch::Merge(&json!({"status": status})),
        )
        .await
    {
        Ok(_) => {}
        Err(kube::Error::Api(ae)) if ae.code == 409 || ae.code == 404 => {}
        Err(e) => error!(msg = "failed to patch source status", %e),
    }
}

/// Initialize the git-knowledge controller and shared state
pub async fn run(state: State, client: Client) {
    let api = check_api_queryable::<GitKnowledgeSource>(client.clone()).await;

    let ctx = Arc::new(Ctx {
        base: state.to_context(client, CONTROLLER_ID),
        locks: Mutex::new(HashMap::new()),
    });

    info!(msg = "starting git-knowledge controller");
    let controller = Controller::new(api, watcher::Config::default().any_semantic())
        // debounce to filter out reconcile calls that happen in quick succession (only taking the latest)
        .with_config(controller::Config::default().debounce(Duration::from_millis(500)))
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx.clone())
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()));

    ctx.base.metrics.ready_set(1);
    controller.await;
}
