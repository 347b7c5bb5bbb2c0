use crate::discovery::DiscoveredResource;
use crate::metrics::ControllerMetrics;
use crate::resource_sync::record::{ResourceChange, ResourceRecord};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use futures::TryStreamExt;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, DynamicObject};
use kube::client::Client;
use kube::runtime::{watcher, WatchStreamExt};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Resources never watched: high-churn noise the sync has no use for.
pub const SKIP_RESOURCES: [&str; 4] = [
    "events",
    "events.events.k8s.io",
    "leases.coordination.k8s.io",
    "endpointslices.discovery.k8s.io",
];

pub fn is_skipped(resource: &DiscoveredResource) -> bool {
    SKIP_RESOURCES.contains(&resource.skip_key().as_str())
}

/// Last seen record per id; backs label diffing and full resyncs.
pub type SharedCache = Arc<RwLock<HashMap<String, ResourceRecord>>>;

struct WatcherEntry {
    token: CancellationToken,
    version: String,
}

/// One dynamic watcher per selected `(group, version, resource)`, all owned
/// by the engine's cancellation token. Creation and teardown are serialized
/// through the map lock.
pub struct WatcherPool {
    client: Client,
    cache: SharedCache,
    changes: mpsc::Sender<ResourceChange>,
    closed: Arc<AtomicBool>,
    metrics: Arc<ControllerMetrics>,
    token: CancellationToken,
    watchers: Mutex<HashMap<String, WatcherEntry>>,
    ready: AtomicUsize,
}

impl WatcherPool {
    pub fn new(
        client: Client,
        cache: SharedCache,
        changes: mpsc::Sender<ResourceChange>,
        closed: Arc<AtomicBool>,
        metrics: Arc<ControllerMetrics>,
        token: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            client,
            cache,
            changes,
            closed,
            metrics,
            token,
            watchers: Mutex::new(HashMap::new()),
            ready: AtomicUsize::new(0),
        })
    }

    /// Start a watcher for `resource` unless one is already live. A version
    /// change (CRD storage version flips) replaces the watcher.
    pub async fn ensure_watcher(self: &Arc<Self>, resource: DiscoveredResource) {
        let key = resource.skip_key();
        let mut watchers = self.watchers.lock().await;
        if let Some(existing) = watchers.get(&key) {
            if existing.version == resource.version {
                return;
            }
            debug!(msg = "replacing watcher for new storage version", %key, version = %resource.version);
            existing.token.cancel();
            watchers.remove(&key);
        }

        let token = self.token.child_token();
        watchers.insert(
            key.clone(),
            WatcherEntry {
                token: token.clone(),
                version: resource.version.clone(),
            },
        );
        drop(watchers);

        info!(msg = "starting watcher", gvr = %resource.gvr_key());
        let pool = self.clone();
        tokio::spawn(async move {
            pool.run_watcher(resource, token).await;
        });
    }

    /// Stop and forget the watcher for a removed resource type.
    pub async fn remove_watcher(&self, resource: &DiscoveredResource) {
        let key = resource.skip_key();
        if let Some(entry) = self.watchers.lock().await.remove(&key) {
            entry.token.cancel();
            info!(msg = "stopped watcher", %key);
        }
    }

    pub async fn watcher_count(&self) -> usize {
        self.watchers.lock().await.len()
    }

    /// Watchers that have finished their initial list.
    pub fn ready_count(&self) -> usize {
        self.ready.load(Ordering::Relaxed)
    }

    async fn run_watcher(self: Arc<Self>, resource: DiscoveredResource, token: CancellationToken) {
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &resource.api_resource());
        let stream = watcher(api, watcher::Config::default().any_semantic()).default_backoff();
        let mut stream = std::pin::pin!(stream);
        let mut announced_ready = false;
        // ids seen during an in-flight re-list; None outside one
        let mut relist: Option<std::collections::HashSet<String>> = None;

        loop {
            let event = tokio::select! {
                _ = token.cancelled() => break,
                event = stream.try_next() => event,
            };
            match event {
                Ok(Some(watcher::Event::Init)) => {
                    relist = Some(std::collections::HashSet::new());
                }
                Ok(Some(watcher::Event::InitApply(obj))) => {
                    if let Some(seen) = relist.as_mut() {
                        seen.insert(
                            ResourceRecord::from_dynamic(&obj, &resource.kind, &resource.api_version())
                                .id(),
                        );
                    }
                    self.apply_object(&resource, obj).await;
                }
                Ok(Some(watcher::Event::Apply(obj))) => {
                    self.apply_object(&resource, obj).await;
                }
                Ok(Some(watcher::Event::Delete(obj))) => {
                    self.delete_object(&resource, obj).await;
                }
                Ok(Some(watcher::Event::InitDone)) => {
                    // objects that vanished during a watch gap got no Delete
                    // event; the re-list exposes them
                    if let Some(seen) = relist.take() {
                        self.drop_vanished(&resource, &seen).await;
                    }
                    if !announced_ready {
                        announced_ready = true;
                        self.ready.fetch_add(1, Ordering::Relaxed);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(msg = "watch error", gvr = %resource.gvr_key(), %e);
                    self.metrics.watch_operations_failed_inc();
                }
            }
        }
        debug!(msg = "watcher stopped", gvr = %resource.gvr_key());
    }

    /// Remove cached entries of this resource type that the re-list did not
    /// contain and emit deletes for them.
    async fn drop_vanished(
        &self,
        resource: &DiscoveredResource,
        seen: &std::collections::HashSet<String>,
    ) {
        let api_version = resource.api_version();
        let vanished: Vec<ResourceRecord> = {
            let cache = self.cache.read().await;
            cache
                .values()
                .filter(|record| {
                    record.kind == resource.kind
                        && record.api_version == api_version
                        && !seen.contains(&record.id())
                })
                .cloned()
                .collect()
        };
        if vanished.is_empty() {
            return;
        }
        let mut cache = self.cache.write().await;
        for record in vanished {
            cache.remove(&record.id());
            self.emit(ResourceChange::Delete(record.delete_identifier()));
        }
    }

    /// Emit an upsert on first sight or label drift; spec and status churn
    /// never reaches the channel.
    async fn apply_object(&self, resource: &DiscoveredResource, obj: DynamicObject) {
        let record = ResourceRecord::from_dynamic(&obj, &resource.kind, &resource.api_version());
        let id = record.id();

        let mut cache = self.cache.write().await;
        match cache.get(&id) {
            Some(previous) if previous.labels == record.labels => return,
            _ => {
                cache.insert(id, record.clone());
            }
        }
        drop(cache);

        self.emit(ResourceChange::Upsert(record));
    }

    async fn delete_object(&self, resource: &DiscoveredResource, obj: DynamicObject) {
        let record = ResourceRecord::from_dynamic(&obj, &resource.kind, &resource.api_version());
        let id = record.id();
        self.cache.write().await.remove(&id);
        self.emit(ResourceChange::Delete(record.delete_identifier()));
    }

    /// Non-blocking send; a full channel drops the change and the periodic
    /// resync restores consistency.
    fn emit(&self, change: ResourceChange) {
        if self.closed.load(Ordering::Relaxed) {
            return;
        }
        if self.changes.try_send(change).is_err() {
            self.metrics.changes_dropped_inc();
        }
    }
}

/// The served storage version of a CRD: `storage=true` wins, else the first
/// `served=true` version.
pub fn served_storage_version(crd: &CustomResourceDefinition) -> Option<String> {
    let versions = &crd.spec.versions;
    versions
        .iter()
        .find(|v| v.storage)
        .or_else(|| versions.iter().find(|v| v.served))
        .map(|v| v.name.clone())
}

/// Translate a CRD into the watch target for its served objects.
pub fn crd_to_resource(crd: &CustomResourceDefinition) -> Option<DiscoveredResource> {
    let version = served_storage_version(crd)?;
    Some(DiscoveredResource {
        group: crd.spec.group.clone(),
        version,
        kind: crd.spec.names.kind.clone(),
        plural: crd.spec.names.plural.clone(),
        namespaced: crd.spec.scope == "Namespaced",
        verbs: vec!["list".into(), "watch".into()],
    })
}

/// The always-present CRD watcher: creates a watcher when a CRD is served
/// and tears it down when the CRD goes away.
pub async fn run_crd_watcher(pool: Arc<WatcherPool>, client: Client, token: CancellationToken) {
    let api: Api<CustomResourceDefinition> = Api::all(client);
    let stream = watcher(api, watcher::Config::default().any_semantic()).default_backoff();
    let mut stream = std::pin::pin!(stream);

    loop {
        let event = tokio::select! {
            _ = token.cancelled() => break,
            event = stream.try_next() => event,
        };
        match event {
            Ok(Some(watcher::Event::Apply(crd) | watcher::Event::InitApply(crd))) => {
                if let Some(resource) = crd_to_resource(&crd) {
                    if !is_skipped(&resource) {
                        pool.ensure_watcher(resource).await;
                    }
                }
            }
            Ok(Some(watcher::Event::Delete(crd))) => {
                if let Some(resource) = crd_to_resource(&crd) {
                    pool.remove_watcher(&resource).await;
                }
            }
            Ok(_) => {}
            Err(e) => {
                warn!(msg = "CRD watch error", %e);
                pool.metrics.watch_operations_failed_inc();
            }
        }
    }
    debug!(msg = "CRD watcher stopped");
}
