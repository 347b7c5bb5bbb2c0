use actix_web::{
    get, middleware, web::Data, App, HttpRequest, HttpResponse, HttpServer, Responder,
};
use dot_ai_k8s_util::client::instrumented_client;
use dot_ai_operator::controller::State;
use dot_ai_operator::telemetry;
use dot_ai_operator::{capability_scan, git_knowledge, remediation, resource_sync, solution};

use clap::{crate_authors, crate_description, crate_version, Parser};
use kube::Config;
use prometheus_client::registry::Registry;

#[get("/metrics")]
async fn metrics(c: Data<State>, _req: HttpRequest) -> impl Responder {
    match c.metrics() {
        Ok(metrics) => HttpResponse::Ok()
            .content_type("application/openmetrics-text; version=1.0.0; charset=utf-8")
            .body(metrics),
        Err(e) => {
            tracing::error!("Failed to get metrics: {:?}", e);
            HttpResponse::InternalServerError().finish()
        }
    }
}

#[get("/health")]
async fn health(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("healthy")
}

#[derive(Parser, Debug)]
#[command(
    name="dot-ai-controller",
    about = crate_description!(),
    version = crate_version!(),
    author = crate_authors!("\n"),
)]
struct Args {
    /// Listen on given port
    #[arg(short, long, default_value_t = 8080, env)]
    port: u32,

    /// Set logging filter directive for `tracing_subscriber::filter::EnvFilter`. Example: "info,kube=debug,dot_ai_operator=debug"
    #[arg(long, default_value = "info", env)]
    log_filter: String,

    /// Set log format
    #[arg(long, value_enum, default_value_t = telemetry::LogFormat::Text, env)]
    log_format: telemetry::LogFormat,

    /// URL for the OpenTelemetry tracing endpoint.
    ///
    /// This optional argument specifies the URL to which traces will be sent using
    /// OpenTelemetry. If not provided, tracing will be disabled.
    #[arg(short, long, env = "OPENTELEMETRY_ENDPOINT_URL")]
    tracing_url: Option<String>,

    /// Sampling ratio for tracing.
    ///
    /// Specifies the ratio of traces to sample. A value of `1.0` will sample all traces,
    /// while a lower value will sample fewer traces. The default is `0.1`, meaning 10%
    /// of traces are sampled.
    #[arg(short, long, default_value_t = 0.1, env)]
    sample_ratio: f64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Args = Args::parse();

    let controllers = [
        resource_sync::controller::CONTROLLER_ID,
        capability_scan::controller::CONTROLLER_ID,
        remediation::controller::CONTROLLER_ID,
        git_knowledge::controller::CONTROLLER_ID,
        solution::controller::CONTROLLER_ID,
    ];
    telemetry::init(
        &args.log_filter,
        args.log_format,
        args.tracing_url.as_deref(),
        args.sample_ratio,
        &controllers,
    )?;

    let mut registry = Registry::with_prefix("dot_ai_controller");
    let config = Config::infer().await?;
    let client = instrumented_client(config, &mut registry).await?;
    let state = State::new(registry, &controllers);

    let controller_tasks = futures::future::join5(
        resource_sync::controller::run(state.clone(), client.clone()),
        capability_scan::controller::run(state.clone(), client.clone()),
        remediation::controller::run(state.clone(), client.clone()),
        git_knowledge::controller::run(state.clone(), client.clone()),
        solution::controller::run(state.clone(), client),
    );

    let server = HttpServer::new({
        let state = state.clone();
        move || {
            App::new()
                .app_data(Data::new(state.clone()))
                .wrap(middleware::Logger::default().exclude("/health"))
                .service(health)
                .service(metrics)
        }
    })
    .bind(format!("0.0.0.0:{}", args.port))?
    .shutdown_timeout(5);

    // Both runtimes implement graceful shutdown, so poll until both are done
    tokio::join!(controller_tasks, server.run()).1?;
    Ok(())
}
