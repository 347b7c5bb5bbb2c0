use crate::capability_scan::pattern::capability_allowed;
use crate::crd::capability_scan::{CapabilityScanConfig, CapabilityScanConfigSpec};
use crate::discovery;
use crate::error::Result;
use crate::mcp::client::RetryPolicy;
use crate::mcp::org_data::CapabilityClient;
use crate::metrics::ControllerMetrics;

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use futures::TryStreamExt;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{Api, Patch, PatchParams, ResourceExt};
use kube::client::Client;
use kube::runtime::{watcher, WatchStreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::{Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const CRD_CHANGE_QUEUE_SIZE: usize = 100;

/// One CRD appearing or disappearing, reduced to its capability id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CrdChange {
    pub resource_id: String,
    pub is_delete: bool,
}

/// Debounced capability changes awaiting a flush. A delete removes the id
/// from the pending scans and wins over any scan that arrives later.
#[derive(Default, Debug)]
pub struct PendingBatch {
    scans: BTreeSet<String>,
    deletes: BTreeSet<String>,
}

impl PendingBatch {
    pub fn apply(&mut self, change: CrdChange) {
        if change.is_delete {
            self.scans.remove(&change.resource_id);
            self.deletes.insert(change.resource_id);
        } else if !self.deletes.contains(&change.resource_id) {
            self.scans.insert(change.resource_id);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.scans.is_empty() && self.deletes.is_empty()
    }

    pub fn drain(&mut self) -> (Vec<String>, Vec<String>) {
        let scans = std::mem::take(&mut self.scans).into_iter().collect();
        let deletes = std::mem::take(&mut self.deletes).into_iter().collect();
        (scans, deletes)
    }
}

/// `toScan = cluster − mcp`, `toDelete = mcp − cluster`.
pub fn diff_capabilities(
    cluster: &BTreeSet<String>,
    mcp: &BTreeSet<String>,
) -> (Vec<String>, Vec<String>) {
    let to_scan = cluster.difference(mcp).cloned().collect();
    let to_delete = mcp.difference(cluster).cloned().collect();
    (to_scan, to_delete)
}

/// Engine parameters derived from the spec; any drift forces a rebuild.
#[derive(Clone, Debug, PartialEq)]
pub struct EngineParams {
    pub endpoint: String,
    pub collection_id: Option<String>,
    pub auth_secret_ref: Option<crate::crd::SecretKeyRef>,
    pub include_resources: Vec<String>,
    pub exclude_resources: Vec<String>,
    pub debounce: Duration,
    pub retry: RetryPolicy,
}

impl From<&CapabilityScanConfigSpec> for EngineParams {
    fn from(spec: &CapabilityScanConfigSpec) -> Self {
        let defaults = RetryPolicy::default();
        let retry = spec
            .retry
            .as_ref()
            .map(|r| RetryPolicy {
                max_retries: r.max_retries.unwrap_or(defaults.max_retries),
                initial_backoff: r
                    .initial_backoff_seconds
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.initial_backoff),
                max_backoff: r
                    .max_backoff_seconds
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.max_backoff),
            })
            .unwrap_or(defaults);
        Self {
            endpoint: spec.mcp_endpoint.clone(),
            collection_id: spec.collection_id.clone(),
            auth_secret_ref: spec.auth_secret_ref.clone(),
            include_resources: spec.include_resources.clone(),
            exclude_resources: spec.exclude_resources.clone(),
            debounce: Duration::from_secs(spec.debounce_seconds.max(1)),
            retry,
        }
    }
}

/// Live capability-scan engine for one `CapabilityScanConfig`.
pub struct CapabilityEngine {
    pub params: EngineParams,
    token: CancellationToken,
}

impl CapabilityEngine {
    /// Reconcile the capability catalog once, then keep tracking CRD churn
    /// through a debounced batch loop.
    pub async fn start(
        client: Client,
        config: &CapabilityScanConfig,
        token: Option<String>,
        metrics: Arc<ControllerMetrics>,
    ) -> Result<CapabilityEngine> {
        let params = EngineParams::from(&config.spec);
        let mcp = CapabilityClient::new(
            &params.endpoint,
            params.collection_id.clone(),
            token,
            params.retry.clone(),
        )?;
        let cancel = CancellationToken::new();

        // safe unwrap: CapabilityScanConfig is namespaced
        let namespace = config.namespace().unwrap();
        let name = config.name_any();
        let status_api: Api<CapabilityScanConfig> = Api::namespaced(client.clone(), &namespace);

        startup_reconcile(&client, &params, &mcp, &cancel).await?;
        update_scan_status(&status_api, &name, None).await;

        let (tx, rx) = mpsc::channel::<CrdChange>(CRD_CHANGE_QUEUE_SIZE);

        let watcher_token = cancel.clone();
        let watcher_client = client.clone();
        let watcher_metrics = metrics.clone();
        tokio::spawn(async move {
            run_crd_feed(watcher_client, tx, watcher_metrics, watcher_token).await;
        });

        let loop_token = cancel.clone();
        let loop_params = params.clone();
        tokio::spawn(async move {
            run_batch_loop(rx, loop_params, mcp, status_api, name, loop_token).await;
        });

        Ok(CapabilityEngine {
            params,
            token: cancel,
        })
    }

    pub fn shutdown(&self) {
        self.token.cancel();
    }
}

/// Make MCP's catalog equal to the filtered set of kinds the cluster
/// currently serves. Runs on first activation and after pod restarts.
async fn startup_reconcile(
    client: &Client,
    params: &EngineParams,
    mcp: &CapabilityClient,
    cancel: &CancellationToken,
) -> Result<()> {
    let cluster: BTreeSet<String> = discovery::discover_all(client)
        .await?
        .iter()
        .filter(|r| !r.is_subresource())
        .map(|r| r.capability_id())
        .filter(|id| capability_allowed(id, &params.include_resources, &params.exclude_resources))
        .collect();

    let known: BTreeSet<String> = mcp.list(cancel).await?.into_iter().collect();
    let (to_scan, to_delete) = diff_capabilities(&cluster, &known);

    info!(
        msg = "capability startup reconciliation",
        cluster = cluster.len(),
        known = known.len(),
        scan = to_scan.len(),
        delete = to_delete.len()
    );

    if !to_scan.is_empty() {
        mcp.scan(&to_scan.join(","), cancel).await?;
    }
    for id in &to_delete {
        if let Err(e) = mcp.delete(id, cancel).await {
            warn!(msg = "capability delete failed", id, %e);
        }
    }
    Ok(())
}

fn crd_capability_id(crd: &CustomResourceDefinition) -> String {
    if crd.spec.group.is_empty() {
        crd.spec.names.kind.clone()
    } else {
        format!("{}.{}", crd.spec.names.kind, crd.spec.group)
    }
}

/// Watch CRDs and feed capability changes into the batch queue. The send is
/// non-blocking; a full queue drops the change and the next startup
/// reconciliation repairs the catalog.
async fn run_crd_feed(
    client: Client,
    tx: mpsc::Sender<CrdChange>,
    metrics: Arc<ControllerMetrics>,
    token: CancellationToken,
) {
    let api: Api<CustomResourceDefinition> = Api::all(client);
    let stream = watcher(api, watcher::Config::default().any_semantic()).default_backoff();
    let mut stream = std::pin::pin!(stream);
    loop {
        let event = tokio::select! {
            _ = token.cancelled() => break,
            event = stream.try_next() => event,
        };
        let change = match event {
            Ok(Some(watcher::Event::Apply(crd) | watcher::Event::InitApply(crd))) => CrdChange {
                resource_id: crd_capability_id(&crd),
                is_delete: false,
            },
            Ok(Some(watcher::Event::Delete(crd))) => CrdChange {
                resource_id: crd_capability_id(&crd),
                is_delete: true,
            },
            Ok(_) => continue,
            Err(e) => {
                warn!(msg = "CRD watch error", %e);
                metrics.watch_operations_failed_inc();
                continue;
            }
        };
        if tx.try_send(change).is_err() {
            metrics.changes_dropped_inc();
        }
    }
}

/// Debounce loop: drain the queue into a pending batch and flush on a
/// ticker, on queue close or on cancellation.
async fn run_batch_loop(
    mut rx: mpsc::Receiver<CrdChange>,
    params: EngineParams,
    mcp: CapabilityClient,
    status_api: Api<CapabilityScanConfig>,
    name: String,
    token: CancellationToken,
) {
    let mut batch = PendingBatch::default();
    let mut ticker = tokio::time::interval(params.debounce);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            maybe = rx.recv() => match maybe {
                Some(change) => {
                    if capability_allowed(
                        &change.resource_id,
                        &params.include_resources,
                        &params.exclude_resources,
                    ) {
                        batch.apply(change);
                    }
                }
                None => {
                    flush(&mut batch, &mcp, &status_api, &name).await;
                    break;
                }
            },
            _ = ticker.tick() => flush(&mut batch, &mcp, &status_api, &name).await,
            _ = token.cancelled() => {
                flush(&mut batch, &mcp, &status_api, &name).await;
                break;
            }
        }
    }
    debug!(msg = "capability batch loop stopped", config = %name);
}

async fn flush(
    batch: &mut PendingBatch,
    mcp: &CapabilityClient,
    status_api: &Api<CapabilityScanConfig>,
    name: &str,
) {
    if batch.is_empty() {
        return;
    }
    let (scans, deletes) = batch.drain();
    // the flush itself is not tied to the engine token: a final flush on
    // shutdown must still be able to run to completion
    let cancel = CancellationToken::new();
    let mut last_error: Option<String> = None;

    if !scans.is_empty() {
        if let Err(e) = mcp.scan(&scans.join(","), &cancel).await {
            warn!(msg = "capability scan flush failed", %e);
            last_error = Some(e.to_string());
        }
    }
    for id in &deletes {
        if let Err(e) = mcp.delete(id, &cancel).await {
            warn!(msg = "capability delete failed", id, %e);
            last_error = Some(e.to_string());
        }
    }

    update_scan_status(status_api, name, last_error).await;
}

async fn update_scan_status(
    api: &Api<CapabilityScanConfig>,
    name: &str,
    last_error: Option<String>,
) {
    let status = json!({
        "status": {
            "lastScanTime": Time(Utc::now()),
            "lastError": last_error,
        }
    });
    match api
        .patch_status(name, &PatchParams::default(), &Patch::Merge(&status))
        .await
    {
        Ok(_) => {}
        Err(kube::Error::Api(ae)) if ae.code == 409 || ae.code == 404 => {}
        Err(e) => warn!(msg = "failed to update scan status", %e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(id: &str, is_delete: bool) -> CrdChange {
        CrdChange {
            resource_id: id.to_string(),
            is_delete,
        }
    }

    #[test]
    fn test_diff_capabilities() {
        let cluster: BTreeSet<String> = ["A.g", "B.g", "D.g"].iter().map(|s| s.to_string()).collect();
        let mcp: BTreeSet<String> = ["A.g", "B.g", "C.g"].iter().map(|s| s.to_string()).collect();
        let (scan, delete) = diff_capabilities(&cluster, &mcp);
        assert_eq!(scan, vec!["D.g"]);
        assert_eq!(delete, vec!["C.g"]);

        let (scan, delete) = diff_capabilities(&cluster, &cluster);
        assert!(scan.is_empty() && delete.is_empty());
    }

    #[test]
    fn test_delete_removes_pending_scan() {
        let mut batch = PendingBatch::default();
        batch.apply(change("A.g", false));
        batch.apply(change("A.g", true));
        let (scans, deletes) = batch.drain();
        assert!(scans.is_empty());
        assert_eq!(deletes, vec!["A.g"]);
    }

    #[test]
    fn test_scan_after_delete_is_ignored() {
        let mut batch = PendingBatch::default();
        batch.apply(change("A.g", true));
        batch.apply(change("A.g", false));
        let (scans, deletes) = batch.drain();
        assert!(scans.is_empty());
        assert_eq!(deletes, vec!["A.g"]);
    }

    #[test]
    fn test_drain_clears_batch() {
        let mut batch = PendingBatch::default();
        batch.apply(change("A.g", false));
        batch.apply(change("B.g", false));
        let (scans, _) = batch.drain();
        assert_eq!(scans, vec!["A.g", "B.g"]);
        assert!(batch.is_empty());
    }

    #[test]
    fn test_engine_params_retry_overrides() {
        let spec: CapabilityScanConfigSpec = serde_json::from_value(serde_json::json!({
            "mcpEndpoint": "http://mcp:8080",
            "retry": {"maxRetries": 5, "initialBackoffSeconds": 2}
        }))
        .unwrap();
        let params = EngineParams::from(&spec);
        assert_eq!(params.retry.max_retries, 5);
        assert_eq!(params.retry.initial_backoff, Duration::from_secs(2));
        assert_eq!(params.retry.max_backoff, RetryPolicy::default().max_backoff);
    }
}
