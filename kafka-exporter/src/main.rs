use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use futures::future::ready;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use kafka_exporter::metrics::{register_metrics, render_snapshot};
use kafka_exporter::{config::Config, Exporter};

const FETCH_DURATION_BUCKETS: &[f64] = &[
    5.0, 10.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2000.0, 5000.0, 10000.0, 30000.0,
];

#[derive(Clone)]
struct AppState {
    exporter: Arc<Exporter>,
    recorder: PrometheusHandle,
}

fn setup_tracing() {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    );
    tracing_subscriber::registry().with(log_layer).init();
}

async fn index() -> &'static str {
    "kafka exporter"
}

async fn readiness(State(state): State<AppState>) -> StatusCode {
    if state.exporter.has_snapshot() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn scrape(State(state): State<AppState>) -> Response {
    match state.exporter.scrape().await {
        Ok(snapshot) => {
            let mut body = render_snapshot(&snapshot);
            body.push_str(&state.recorder.render());
            body.into_response()
        }
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/_readiness", get(readiness))
        .route("/_liveness", get(|| ready("ok")))
        .route("/metrics", get(scrape))
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
    }
    info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_tracing();
    info!("Starting Kafka exporter");

    let config = Config::init_with_defaults()
        .context("Failed to load configuration from environment variables")?;
    info!("Configuration loaded: {:?}", config);

    let options = config.exporter_options();
    let exporter = Arc::new(
        Exporter::connect(&options)
            .await
            .context("Failed to create Kafka exporter")?,
    );

    // Cluster series are rendered per scrape; this recorder only holds self metrics
    let recorder = PrometheusBuilder::new()
        .set_buckets(FETCH_DURATION_BUCKETS)
        .context("Invalid histogram buckets")?
        .install_recorder()
        .context("Failed to install metrics recorder")?;
    register_metrics();

    let refresh_loop = exporter.spawn_refresh_loop();

    let bind = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("Failed to bind {bind}"))?;
    info!("Serving metrics on {}", bind);

    let app = router(AppState {
        exporter: Arc::clone(&exporter),
        recorder,
    });
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    exporter.close().await;
    if let Err(e) = refresh_loop.await {
        error!(error = %e, "refresh loop panicked");
    }
    served.context("HTTP server failed")?;

    info!("exiting");
    Ok(())
}
