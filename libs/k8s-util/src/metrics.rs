use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::future::FutureExt;
use http::Request;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::{counter::Counter, family::Family, histogram::Histogram};
use prometheus_client::registry::Registry;
use tokio::time::Instant;
use tower::{Layer, Service};

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug, Default)]
pub struct EndpointLabel {
    pub endpoint: String,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug, Default)]
pub struct RequestLabels {
    pub method: String,
    pub status_code: String,
}

/// Collapse a request path to a low-cardinality endpoint label.
///
/// The controller talks to group/version resource routes, their `status`
/// and `finalize` subresources, and the discovery documents; object names
/// and namespaces are elided so a resync over thousands of objects still
/// lands on one label per resource.
///
/// `/apis/apps/v1/namespaces/prod/deployments/web/status` becomes
/// `apis/apps/v1/deployments/status`; `/api/v1/pods/p1` becomes
/// `api/v1/pods`; anything off the API tree becomes `other`.
fn endpoint_label(path: &str) -> String {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let split = match segments.first() {
        Some(&"api") => 2,
        Some(&"apis") => 3,
        _ => return "other".to_string(),
    };
    if segments.len() <= split {
        // discovery documents: /api, /api/v1, /apis/<group>/<version>
        return segments.join("/");
    }

    let mut label = segments[..split].to_vec();
    let mut rest = &segments[split..];
    if rest[0] == "namespaces" {
        match rest.len() {
            // the namespace objects themselves
            1 | 2 => rest = &rest[..1],
            _ => rest = &rest[2..],
        }
    }
    label.push(rest[0]);
    if rest.len() > 2 {
        // /<resource>/<name>/<subresource>
        label.push(rest[rest.len() - 1]);
    }
    label.join("/")
}

/// Tower layer that observes every request the kube client makes, labelled
/// by collapsed endpoint, method and status code.
pub struct MetricsLayer {
    request_histogram: Family<EndpointLabel, Histogram>,
    requests_total: Family<RequestLabels, Counter>,
}

impl MetricsLayer {
    pub fn new(registry: &mut Registry) -> Self {
        let request_histogram = Family::<EndpointLabel, Histogram>::new_with_constructor(|| {
            Histogram::new([0.01, 0.05, 0.1, 0.5, 1., 5.].into_iter())
        });

        let requests_total = Family::<RequestLabels, Counter>::default();
        registry.register(
            "kubernetes_client_http_request_duration",
            "Latencies for the Kubernetes client's requests by endpoint.",
            request_histogram.clone(),
        );

        registry.register(
            "kubernetes_client_http_requests_total",
            "Total number of Kubernetes client requests by method and status code.",
            requests_total.clone(),
        );

        Self {
            request_histogram,
            requests_total,
        }
    }
}

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService {
            inner,
            request_histogram: self.request_histogram.clone(),
            requests_total: self.requests_total.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MetricsService<S> {
    inner: S,
    request_histogram: Family<EndpointLabel, Histogram>,
    requests_total: Family<RequestLabels, Counter>,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for MetricsService<S>
where
    S: Service<Request<ReqBody>, Response = http::Response<ResBody>>,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let labels = EndpointLabel {
            endpoint: endpoint_label(req.uri().path()),
        };
        let method = req.method().as_str().to_string();

        let start_time = Instant::now();

        let fut = self.inner.call(req);
        let request_histogram = self.request_histogram.clone();
        let requests_total = self.requests_total.clone();
        async move {
            let result = fut.await;
            let duration = start_time.elapsed().as_secs_f64();
            request_histogram.get_or_create(&labels).observe(duration);
            if let Ok(ref response) = result {
                requests_total
                    .get_or_create(&RequestLabels {
                        method,
                        status_code: response.status().as_u16().to_string(),
                    })
                    .inc();
            }
            result
        }
        .boxed()
    }
}
