//! HTTP API for health checks and simulation status

use crate::chain::TrackedBlock;
use crate::config::ApiConfig;
use crate::error::{FanError, FanResult};
use crate::president::President;

use axum::{
    extract::{Query, State},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub president: Arc<President>,
}

pub fn router(president: Arc<President>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/status", get(get_status))
        .route("/blocks", get(get_blocks))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(AppState { president })
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, president: Arc<President>) -> FanResult<()> {
    let app = router(president);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| FanError::Config(format!("cannot bind API address {}: {}", addr, e)))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| FanError::Internal(format!("API server failed: {}", e)))?;

    Ok(())
}

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Fan pool and chain progress
async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.president.status().await)
}

/// Observed blocks, optionally only those after `since`
async fn get_blocks(
    State(state): State<AppState>,
    Query(query): Query<BlocksQuery>,
) -> impl IntoResponse {
    let history = state.president.history();
    let blocks = match query.since {
        Some(number) => history.since(number).await,
        None => history.all().await,
    };
    Json(BlocksResponse { blocks })
}

#[derive(Debug, Deserialize)]
struct BlocksQuery {
    since: Option<u64>,
}

// Response types

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct BlocksResponse {
    blocks: Vec<TrackedBlock>,
}
