use crate::crd::resource_sync::{ResourceSyncConfig, ResourceSyncConfigSpec};
use crate::crd::SecretKeyRef;
use crate::discovery;
use crate::error::Result;
use crate::mcp::client::RetryPolicy;
use crate::mcp::sync::ResourceSyncClient;
use crate::metrics::ControllerMetrics;
use crate::resource_sync::debounce::run_debounce_loop;
use crate::resource_sync::record::ResourceChange;
use crate::resource_sync::watch::{is_skipped, run_crd_watcher, SharedCache, WatcherPool};

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{Api, Patch, PatchParams, ResourceExt};
use kube::client::Client;
use serde_json::json;
use tokio::sync::{mpsc, RwLock};
use tokio::time::{Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Bounded capacity between the watchers and the debounce buffer; overflow
/// drops changes and lets the periodic resync repair MCP.
const CHANGE_CHANNEL_CAPACITY: usize = 10_000;
/// How long the initial resync waits for watcher caches to fill.
const INITIAL_SYNC_WAIT: Duration = Duration::from_secs(30);

/// Engine parameters derived from the spec; any drift forces a rebuild.
#[derive(Clone, Debug, PartialEq)]
pub struct EngineParams {
    pub endpoint: String,
    pub auth_secret_ref: Option<SecretKeyRef>,
    pub debounce: Duration,
    pub resync: Duration,
}

impl From<&ResourceSyncConfigSpec> for EngineParams {
    fn from(spec: &ResourceSyncConfigSpec) -> Self {
        Self {
            endpoint: spec.mcp_endpoint.clone(),
            auth_secret_ref: spec.auth_secret_ref.clone(),
            debounce: Duration::from_secs(spec.debounce_seconds.max(1)),
            resync: Duration::from_secs(spec.resync_interval_minutes.max(1) * 60),
        }
    }
}

/// Status writer shared by the debounce and resync loops. Every write reads
/// a fresh copy first; conflicts are abandoned and the next write catches up.
pub struct StatusSink {
    api: Api<ResourceSyncConfig>,
    name: String,
}

impl StatusSink {
    pub fn new(client: Client, namespace: &str, name: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            name: name.to_string(),
        }
    }

    async fn patch(&self, status: serde_json::Value) {
        match self
            .api
            .patch_status(
                &self.name,
                &PatchParams::default(),
                &Patch::Merge(&json!({"status": status})),
            )
            .await
        {
            Ok(_) => {}
            Err(kube::Error::Api(ae)) if ae.code == 409 || ae.code == 404 => {}
            Err(e) => warn!(msg = "failed to update sync status", %e),
        }
    }

    async fn current_errors(&self) -> i64 {
        self.api
            .get(&self.name)
            .await
            .ok()
            .and_then(|config| config.status.and_then(|s| s.sync_errors))
            .unwrap_or(0)
    }

    pub async fn record_flush(&self) {
        self.patch(json!({"lastSyncTime": Time(Utc::now())})).await;
    }

    pub async fn record_error(&self, message: &str) {
        let errors = self.current_errors().await;
        self.patch(json!({
            "syncErrors": errors + 1,
            "lastError": message,
        }))
        .await;
    }

    pub async fn record_resync(&self, total: usize) {
        let now = Time(Utc::now());
        self.patch(json!({
            "lastResyncTime": now,
            "lastSyncTime": now,
            "totalResourcesSynced": total as i64,
            "lastError": null,
        }))
        .await;
    }
}

/// Live resource-sync engine for one `ResourceSyncConfig`.
pub struct SyncEngine {
    pub params: EngineParams,
    /// Resource types selected at discovery time (without the CRD watcher).
    pub watched_types: usize,
    token: CancellationToken,
    closed: Arc<AtomicBool>,
}

impl SyncEngine {
    pub async fn start(
        client: Client,
        config: &ResourceSyncConfig,
        bearer: Option<String>,
        metrics: Arc<ControllerMetrics>,
    ) -> Result<SyncEngine> {
        let params = EngineParams::from(&config.spec);
        let mcp = ResourceSyncClient::new(&params.endpoint, bearer, RetryPolicy::default())?;

        // safe unwrap: ResourceSyncConfig is namespaced
        let namespace = config.namespace().unwrap();
        let name = config.name_any();
        let status = Arc::new(StatusSink::new(client.clone(), &namespace, &name));

        let targets: Vec<_> = discovery::discover_all(&client)
            .await?
            .into_iter()
            .filter(|r| r.watchable() && !r.is_subresource() && !is_skipped(r))
            .collect();
        // one watcher per (group, resource); preferred version wins
        let mut seen = std::collections::HashSet::new();
        let targets: Vec<_> = targets
            .into_iter()
            .filter(|r| seen.insert(r.skip_key()))
            .collect();
        let watched_types = targets.len();
        info!(
            msg = "starting resource sync engine",
            config = %format!("{namespace}/{name}"),
            watched_types
        );

        let token = CancellationToken::new();
        let closed = Arc::new(AtomicBool::new(false));
        let cache: SharedCache = Arc::new(RwLock::new(HashMap::new()));
        let (tx, rx) = mpsc::channel::<ResourceChange>(CHANGE_CHANNEL_CAPACITY);

        let pool = WatcherPool::new(
            client.clone(),
            cache.clone(),
            tx,
            closed.clone(),
            metrics.clone(),
            token.clone(),
        );
        for target in targets {
            pool.ensure_watcher(target).await;
        }

        let crd_pool = pool.clone();
        let crd_client = client.clone();
        let crd_token = token.clone();
        tokio::spawn(async move {
            run_crd_watcher(crd_pool, crd_client, crd_token).await;
        });

        let debounce_token = token.clone();
        let debounce_mcp = mcp.clone();
        let debounce_status = status.clone();
        let debounce_metrics = metrics.clone();
        let window = params.debounce;
        tokio::spawn(async move {
            run_debounce_loop(
                rx,
                window,
                debounce_mcp,
                debounce_status,
                debounce_metrics,
                debounce_token,
            )
            .await;
        });

        let resync_token = token.clone();
        let resync_interval = params.resync;
        let resync_pool = pool.clone();
        tokio::spawn(async move {
            run_resync_loop(
                cache,
                resync_pool,
                watched_types,
                resync_interval,
                mcp,
                status,
                metrics,
                resync_token,
            )
            .await;
        });

        Ok(SyncEngine {
            params,
            watched_types,
            token,
            closed,
        })
    }

    /// Mark the change channel closed and unwind every task of this engine.
    pub fn shutdown(&self) {
        self.closed.store(true, std::sync::atomic::Ordering::Relaxed);
        self.token.cancel();
    }
}

/// Initial full resync once the watcher caches are populated, then one full
/// push per configured interval. Failures count; the loop never stops.
#[allow(clippy::too_many_arguments)]
async fn run_resync_loop(
    cache: SharedCache,
    pool: Arc<WatcherPool>,
    initial_watchers: usize,
    interval: Duration,
    mcp: ResourceSyncClient,
    status: Arc<StatusSink>,
    metrics: Arc<ControllerMetrics>,
    token: CancellationToken,
) {
    // wait for the initial listings so the first resync is complete
    let deadline = tokio::time::Instant::now() + INITIAL_SYNC_WAIT;
    while pool.ready_count() < initial_watchers && tokio::time::Instant::now() < deadline {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(Duration::from_millis(500)) => {}
        }
    }

    resync_once(&cache, &mcp, &status, &metrics, &token).await;

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await; // the interval's immediate first tick
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => resync_once(&cache, &mcp, &status, &metrics, &token).await,
        }
    }
    debug!(msg = "resync loop stopped");
}

async fn resync_once(
    cache: &SharedCache,
    mcp: &ResourceSyncClient,
    status: &StatusSink,
    metrics: &ControllerMetrics,
    token: &CancellationToken,
) {
    let records: Vec<_> = cache.read().await.values().cloned().collect();
    let total = records.len();
    match mcp.sync(&records, &[], true, token).await {
        Ok(outcome) => {
            metrics.mcp_request_inc("resync", "ok");
            if !outcome.failures.is_empty() {
                warn!(
                    msg = "resync reported item failures",
                    failures = outcome.failures.len()
                );
            }
            info!(msg = "resync complete", total);
            status.record_resync(total).await;
        }
        Err(e) => {
            metrics.mcp_request_inc("resync", "error");
            warn!(msg = "resync failed", %e);
            status.record_error(&e.to_string()).await;
        }
    }
}
