//! Server startup
//!
//! Builds the shared state, loads the startup models, serves the HTTP facade
//! and, on Ctrl-C, drains the dispatch queue before unloading every model.

use anyhow::Context;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::{
    config::Config,
    model_runtime::runtime_manager::read_models_file,
    shared_state::AppState,
};

/// Headroom on top of the generation timeout for downloads and loads.
/// Chat routes are bounded by the queue instead.
const REQUEST_TIMEOUT_SLACK_SECS: u64 = 60;

pub async fn run_server(cfg: Config) -> anyhow::Result<()> {
    crate::telemetry::init_tracing();
    crate::metrics::init_metrics();
    cfg.print_config();

    let state = AppState::new(cfg);

    if let Some(path) = state.config.models_config.clone() {
        match read_models_file(&path) {
            Ok(specs) => {
                let loaded = state.load_models(&specs).await;
                info!("Loaded {}/{} startup model(s) from {}", loaded.len(), specs.len(), path.display());
            }
            Err(e) => warn!("Skipping startup models: {:#}", e),
        }
    }

    let addr = state.config.api_addr()?;
    info!("Starting HTTP server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    let app = build_router(state.clone());
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    info!("HTTP server stopped; draining dispatch queue");
    state.dispatch.shutdown().await;
    for handle in state.store.drain_models() {
        handle.unload().await;
    }
    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

pub fn build_router(state: AppState) -> axum::Router {
    use crate::api::{admin_api, chat_api, conversation_api, model_api, stream_api};
    use axum::{
        routing::{delete, get, post},
        Router,
    };
    use tower_http::{
        cors::{Any, CorsLayer},
        timeout::TimeoutLayer,
        trace::TraceLayer,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([axum::http::Method::GET, axum::http::Method::POST, axum::http::Method::DELETE])
        .allow_headers(Any);
    let timeout = Duration::from_secs(state.config.generate_timeout_seconds + REQUEST_TIMEOUT_SLACK_SECS);

    // A chat can wait behind a full queue; a timeout here would drop the
    // reply while the turn is still recorded.
    let chat_routes = Router::new()
        .route("/api/chat", post(chat_api::chat))
        .route("/api/chat/stream", post(stream_api::chat_stream));

    Router::new()
        .route("/health", get(admin_api::health))
        .route("/metrics", get(crate::metrics::get_metrics))
        .route("/api/status", get(admin_api::get_status))
        // Model lifecycle
        .route("/api/initialize", post(model_api::initialize))
        .route("/api/add-llm", post(model_api::add_llm))
        .route(
            "/api/delete-llm/:model_id",
            delete(model_api::delete_llm).post(model_api::delete_llm),
        )
        .route("/api/models", get(model_api::list_models))
        .route("/api/models/:model_id/parameters", post(model_api::modify_parameters))
        .route("/api/analyze-model", post(model_api::analyze_model))
        // Conversations
        .route("/api/conversations", get(conversation_api::list_conversations))
        .route("/api/conversation", post(conversation_api::create_conversation))
        .route("/api/conversation/:id", get(conversation_api::get_conversation))
        .route("/api/conversation/:id/reset", post(conversation_api::reset_conversation))
        .layer(TimeoutLayer::new(timeout))
        .merge(chat_routes)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
