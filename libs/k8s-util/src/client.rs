use crate::metrics::MetricsLayer;

use hyper_util::rt::TokioExecutor;
use kube::Result;
use kube::{client::ConfigExt, Client, Config};
use prometheus_client::registry::Registry;
use tokio::time::Duration;
use tower::ServiceBuilder;

/// Idle apiserver connections are dropped after this long. The controller
/// holds a handful of long-lived watch connections; everything else is
/// bursty reconcile traffic that should not pin sockets.
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Build the one apiserver [`Client`] every controller shares.
///
/// The metrics layer sits outermost so each request is observed exactly
/// once, whatever the inner layers rewrite; the extra-headers layer keeps
/// kubeconfigs with impersonation or auth-plugin headers working.
pub async fn instrumented_client(config: Config, registry: &mut Registry) -> Result<Client> {
    let connector = config.rustls_https_connector()?;
    let hyper_client = hyper_util::client::legacy::Client::builder(TokioExecutor::new())
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)
        .build(connector);

    let stack = ServiceBuilder::new()
        .layer(MetricsLayer::new(registry))
        .layer(config.base_uri_layer())
        .option_layer(config.auth_layer()?)
        .layer(config.extra_headers_layer()?)
        .service(hyper_client);

    Ok(Client::new(stack, config.default_namespace))
}
