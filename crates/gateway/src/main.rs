use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{any, get};
use axum::{Json, Router};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use tokengate_common::config::GatewayConfig;

use tokengate_gateway::compressor::{Compressor, HttpCompressor};
use tokengate_gateway::forward::Forwarder;
use tokengate_gateway::pipes::{ToolDiscoveryPipe, ToolOutputPipe};
use tokengate_gateway::rate_limit::RateLimiter;
use tokengate_gateway::router::{handle_request, AppState};
use tokengate_gateway::sessions::{AuthFallbackStore, ToolSessionStore};
use tokengate_gateway::shadow::ShadowStore;
use tokengate_gateway::telemetry::{LogTelemetry, TelemetrySink, UnlimitedCostTracker};

struct MetricsState {
    handle: PrometheusHandle,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    tracing::info!("Tokengate starting");

    // Load configuration — fail loudly on misconfiguration.
    let config_path = std::env::var("TOKENGATE_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("gateway.toml"));

    let config = match GatewayConfig::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Failed to load configuration — refusing to start");
            std::process::exit(1);
        }
    };

    // Install Prometheus metrics recorder.
    let metrics_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");

    // Process-wide stores with explicit lifecycle; the driver owns one
    // instance of each and passes handles.
    let shadow = Arc::new(ShadowStore::new(&config.shadow));
    let tool_sessions = Arc::new(ToolSessionStore::new(&config.sessions));
    let auth_fallback = Arc::new(AuthFallbackStore::new(&config.auth));

    let shadow_worker = shadow.start_cleanup();
    let sessions_worker = tool_sessions.start_cleanup();
    let auth_worker = auth_fallback.start_cleanup();

    let compressor: Option<Arc<dyn Compressor>> = HttpCompressor::from_config(&config.compressor)
        .map(|c| Arc::new(c) as Arc<dyn Compressor>);

    let telemetry: Arc<dyn TelemetrySink> = Arc::new(LogTelemetry);
    let limiter = Arc::new(RateLimiter::new(config.compression.rate_limit_per_sec));

    let tool_output_pipe = ToolOutputPipe::new(
        config.compression.clone(),
        Arc::clone(&shadow),
        compressor.clone(),
        limiter,
        Arc::clone(&telemetry),
    );
    let tool_discovery_pipe = ToolDiscoveryPipe::new(
        config.discovery.clone(),
        Arc::clone(&tool_sessions),
        compressor.clone(),
        Arc::clone(&telemetry),
    );

    let forwarder = Forwarder::new(
        config.upstream.clone(),
        config.auth.clone(),
        Arc::clone(&auth_fallback),
        // Bedrock SigV4 signing is provided by a collaborator build.
        None,
    );

    let port = config.server.port;
    let state = Arc::new(AppState {
        config,
        shadow: Arc::clone(&shadow),
        tool_sessions: Arc::clone(&tool_sessions),
        auth_fallback: Arc::clone(&auth_fallback),
        tool_output_pipe,
        tool_discovery_pipe,
        forwarder,
        compressor,
        telemetry,
        cost: Arc::new(UnlimitedCostTracker),
    });

    let metrics_state = Arc::new(MetricsState {
        handle: metrics_handle,
    });

    let app = Router::new()
        .route("/health", get(health_handler))
        .route(
            "/metrics",
            get(metrics_handler).with_state(Arc::clone(&metrics_state)),
        )
        .fallback_service(any(handle_request).with_state(state))
        .into_make_service();

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port))
        .await
        .expect("Failed to bind TCP listener");

    tracing::info!(port = port, "Tokengate listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("HTTP server error");

    // Stop background workers deterministically.
    shadow.stop();
    tool_sessions.stop();
    auth_fallback.stop();
    let _ = tokio::join!(shadow_worker, sessions_worker, auth_worker);

    tracing::info!("Tokengate stopped");
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("Shutdown signal received");
}

async fn health_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(serde_json::json!({ "status": "healthy" })),
    )
}

async fn metrics_handler(State(state): State<Arc<MetricsState>>) -> String {
    state.handle.render()
}
