use crate::error::Error;

use opentelemetry::trace::TraceId;
use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::{
    counter::Counter, exemplar::HistogramWithExemplars, family::Family,
};
use prometheus_client::registry::{Registry, Unit};
use tokio::time::Instant;

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug, Default)]
pub struct TraceLabel {
    pub id: String,
}

impl TryFrom<&TraceId> for TraceLabel {
    type Error = Error;

    fn try_from(id: &TraceId) -> Result<TraceLabel, Self::Error> {
        if std::matches!(id, &TraceId::INVALID) {
            Err(Error::InvalidTraceId)
        } else {
            let trace_id = id.to_string();
            Ok(Self { id: trace_id })
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Action {
    Apply,
    Delete,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct TriggerLabels {
    action: Action,
    resource: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    pub error: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct McpRequestLabels {
    pub operation: String,
    pub outcome: String,
}

/// Per-controller metrics registered under one shared registry, each family
/// labelled by controller through a sub-registry.
#[derive(Clone)]
pub struct ControllerMetrics {
    pub reconcile_runs: Counter,
    pub reconcile_failures: Family<ErrorLabels, Counter>,
    pub reconcile_duration: HistogramWithExemplars<TraceLabel>,
    pub triggered: Family<TriggerLabels, Counter>,
    pub watch_operations_failed: Counter,
    pub changes_dropped: Counter,
    pub mcp_requests: Family<McpRequestLabels, Counter>,
    pub ready: Gauge,
}

impl Default for ControllerMetrics {
    fn default() -> Self {
        Self {
            reconcile_runs: Counter::default(),
            reconcile_failures: Family::<ErrorLabels, Counter>::default(),
            reconcile_duration: HistogramWithExemplars::new([0.1, 0.5, 1., 5., 10.].into_iter()),
            triggered: Family::<TriggerLabels, Counter>::default(),
            watch_operations_failed: Counter::default(),
            changes_dropped: Counter::default(),
            mcp_requests: Family::<McpRequestLabels, Counter>::default(),
            ready: Gauge::default(),
        }
    }
}

impl ControllerMetrics {
    /// Register controller metrics to start tracking them.
    pub fn register(self, r: &mut Registry) -> Self {
        r.register_with_unit(
            "reconcile_duration",
            "reconcile duration",
            Unit::Seconds,
            self.reconcile_duration.clone(),
        );
        r.register(
            "reconcile_failures",
            "reconciliation errors",
            self.reconcile_failures.clone(),
        );
        r.register("reconcile_runs", "reconciliations", self.reconcile_runs.clone());
        r.register(
            "triggered",
            "reconciliations triggered by watched resources",
            self.triggered.clone(),
        );
        r.register(
            "watch_operations_failed",
            "failed watch operations",
            self.watch_operations_failed.clone(),
        );
        r.register(
            "changes_dropped",
            "changes dropped because the emission channel was full",
            self.changes_dropped.clone(),
        );
        r.register(
            "mcp_requests",
            "requests sent to the MCP service by operation and outcome",
            self.mcp_requests.clone(),
        );
        r.register("ready", "controller readiness", self.ready.clone());
        self
    }

    pub fn reconcile_failure_inc(&self, error: &Error) {
        self.reconcile_failures
            .get_or_create(&ErrorLabels {
                error: error.metric_label(),
            })
            .inc();
    }

    pub fn triggered_inc(&self, action: Action, resource: &str) {
        self.triggered
            .get_or_create(&TriggerLabels {
                action,
                resource: resource.to_string(),
            })
            .inc();
    }

    pub fn watch_operations_failed_inc(&self) {
        self.watch_operations_failed.inc();
    }

    pub fn changes_dropped_inc(&self) {
        self.changes_dropped.inc();
    }

    pub fn mcp_request_inc(&self, operation: &str, outcome: &str) {
        self.mcp_requests
            .get_or_create(&McpRequestLabels {
                operation: operation.to_string(),
                outcome: outcome.to_string(),
            })
            .inc();
    }

    pub fn ready_set(&self, ready: i64) {
        self.ready.set(ready);
    }

    pub fn count_and_measure(&self, trace_id: &TraceId) -> ReconcileMeasurer {
        self.reconcile_runs.inc();
        ReconcileMeasurer {
            start: Instant::now(),
            labels: trace_id.try_into().ok(),
            metric: self.reconcile_duration.clone(),
        }
    }
}

/// Smart function duration measurer
///
/// Relies on Drop to calculate duration and register the observation in the histogram
pub struct ReconcileMeasurer {
    start: Instant,
    labels: Option<TraceLabel>,
    metric: HistogramWithExemplars<TraceLabel>,
}

impl Drop for ReconcileMeasurer {
    fn drop(&mut self) {
        let duration = self.start.elapsed().as_secs_f64();
        let labels = self.labels.take();
        self.metric.observe(duration, labels);
    }
}
