use crate::error::Error;
use crate::metrics::ControllerMetrics;

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use kube::api::{Api, ListParams};
use kube::client::Client;
use kube::runtime::controller::Action;
use kube::runtime::events::Reporter;
use kube::{Resource, ResourceExt};
use prometheus_client::registry::Registry;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::time::Duration;
use tracing::error;

pub type ControllerId = &'static str;

pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
    #[serde(skip)]
    pub reporter: Reporter,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
            reporter: "dot-ai-controller".into(),
        }
    }
}

/// State shared between the controllers and the web server
#[derive(Clone)]
pub struct State {
    /// Diagnostics populated by the reconcilers
    diagnostics: Arc<RwLock<Diagnostics>>,
    /// Shared metrics registry
    registry: Arc<Registry>,
    /// Per-controller metrics
    metrics: HashMap<ControllerId, Arc<ControllerMetrics>>,
}

impl State {
    pub fn new(mut registry: Registry, controllers: &[ControllerId]) -> Self {
        let metrics = controllers
            .iter()
            .map(|id| {
                let sub_registry =
                    registry.sub_registry_with_label(("controller".into(), (*id).into()));
                let controller_metrics = ControllerMetrics::default().register(sub_registry);
                (*id, Arc::new(controller_metrics))
            })
            .collect();
        Self {
            diagnostics: Arc::default(),
            registry: Arc::new(registry),
            metrics,
        }
    }

    /// Encode all registered metrics in OpenMetrics text format
    pub fn metrics(&self) -> Result<String, std::fmt::Error> {
        let mut buffer = String::new();
        prometheus_client::encoding::text::encode(&mut buffer, &self.registry)?;
        Ok(buffer)
    }

    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }

    /// Create a controller Context that can update State
    pub fn to_context(&self, client: Client, controller_id: ControllerId) -> Arc<Context> {
        Arc::new(Context {
            client,
            metrics: self
                .metrics
                .get(controller_id)
                .cloned()
                .unwrap_or_default(),
            diagnostics: self.diagnostics.clone(),
        })
    }
}

// Context for our reconcilers
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Prometheus metrics
    pub metrics: Arc<ControllerMetrics>,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
}

/// Exit the process when a required API is not queryable; controllers cannot
/// make progress without their primary resources.
pub async fn check_api_queryable<K>(client: Client) -> Api<K>
where
    K: Resource + Clone + DeserializeOwned + Debug,
    <K as Resource>::DynamicType: Default,
{
    let api = Api::<K>::all(client.clone());
    if let Err(e) = api.list(&ListParams::default().limit(1)).await {
        error!(
            "{} is not queryable; {e:?}. Is the CRD installed?",
            dot_ai_k8s_util::types::short_type_name::<K>().unwrap_or("Unknown resource"),
        );
        std::process::exit(1);
    }
    api
}

pub fn error_policy<K: ResourceExt>(obj: Arc<K>, error: &Error, ctx: Arc<Context>) -> Action {
    error!(
        msg = "failed reconciliation",
        namespace = %obj.namespace().unwrap_or_default(),
        name = %obj.name_any(),
        %error
    );
    ctx.metrics.reconcile_failure_inc(error);
    Action::requeue(DEFAULT_RECONCILE_INTERVAL)
}
