use std::time::Duration;

use opentelemetry::trace::{TraceError, TraceId, TracerProvider};
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::{self as sdktrace, RandomIdGenerator, Sampler};
use opentelemetry_sdk::Resource;
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, EnvFilter, Layer, Registry};

pub const SERVICE_NAME: &str = "dot-ai-controller";

#[derive(Error, Debug)]
pub enum Error {
    /// The OTLP exporter could not be installed.
    #[error("failed to install OTLP exporter: {0}")]
    Exporter(#[source] TraceError),

    /// Something else already claimed the global subscriber.
    #[error("a global tracing subscriber is already set: {0}")]
    AlreadyInitialized(#[source] tracing::dispatcher::SetGlobalDefaultError),
}

/// Log output format, selectable from the command line.
#[derive(clap::ValueEnum, Clone, Copy, Debug)]
pub enum LogFormat {
    /// JSON lines, for log aggregation.
    Json,
    /// Plain text, for a terminal.
    Text,
}

/// Trace id of the current reconcile span, used for exemplars and log
/// correlation. `TraceId::INVALID` outside an instrumented span or when no
/// OTLP endpoint is configured.
pub fn current_trace_id() -> TraceId {
    use opentelemetry::trace::TraceContextExt as _;
    use tracing_opentelemetry::OpenTelemetrySpanExt as _;

    tracing::Span::current()
        .context()
        .span()
        .span_context()
        .trace_id()
}

/// The identity every exported span carries. One MCP service usually has
/// several operator deployments talking to it; the controller set tells
/// their traces apart.
fn otel_resource(controllers: &[&str]) -> Resource {
    Resource::new([
        KeyValue::new("service.name", SERVICE_NAME),
        KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
        KeyValue::new("dot_ai.controllers", controllers.join(",")),
    ])
}

/// Initialize logging and, when an OTLP endpoint is given, tracing.
///
/// Reconcile spans are sampled at `sample_ratio`; resource-sync engines can
/// reconcile thousands of objects per resync, so sampling everything is
/// rarely what you want.
///
/// ```no_run
/// # use dot_ai_operator::telemetry::{init, LogFormat};
/// #[tokio::main]
/// async fn main() {
///     init("info", LogFormat::Text, None, 0.1, &["resource-sync"]).unwrap();
/// }
/// ```
pub fn init(
    log_filter: &str,
    log_format: LogFormat,
    otlp_url: Option<&str>,
    sample_ratio: f64,
    controllers: &[&str],
) -> Result<(), Error> {
    let fmt_layer = match log_format {
        LogFormat::Json => tracing_subscriber::fmt::layer().json().boxed(),
        LogFormat::Text => tracing_subscriber::fmt::layer().boxed(),
    };
    let subscriber = Registry::default()
        .with(fmt_layer)
        .with(EnvFilter::new(log_filter));

    let Some(url) = otlp_url else {
        return tracing::subscriber::set_global_default(subscriber)
            .map_err(Error::AlreadyInitialized);
    };

    let provider = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(url)
                .with_timeout(Duration::from_secs(3)),
        )
        .with_trace_config(
            sdktrace::Config::default()
                .with_sampler(Sampler::TraceIdRatioBased(sample_ratio))
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(otel_resource(controllers)),
        )
        .install_batch(opentelemetry_sdk::runtime::Tokio)
        .map_err(Error::Exporter)?;
    let tracer = provider
        .tracer_builder(SERVICE_NAME)
        .with_version(env!("CARGO_PKG_VERSION"))
        .build();

    tracing::subscriber::set_global_default(
        subscriber.with(tracing_opentelemetry::OpenTelemetryLayer::new(tracer)),
    )
    .map_err(Error::AlreadyInitialized)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trace_id_is_invalid_outside_spans() {
        assert_eq!(current_trace_id(), TraceId::INVALID);
    }

    #[test]
    fn test_resource_carries_controller_set() {
        let resource = otel_resource(&["resource-sync", "solution"]);
        let controllers = resource
            .iter()
            .find(|(key, _)| key.as_str() == "dot_ai.controllers")
            .map(|(_, value)| value.as_str().to_string());
        assert_eq!(controllers.as_deref(), Some("resource-sync,solution"));

        let service = resource
            .iter()
            .find(|(key, _)| key.as_str() == "service.name")
            .map(|(_, value)| value.as_str().to_string());
        assert_eq!(service.as_deref(), Some(SERVICE_NAME));
    }
}
