//! HTTP API over the ledger.
//!
//! - GET  /v1/balances/{address}
//! - POST /v1/transfers
//! - GET  /v1/transfers/{id}
//! - GET  /v1/queue/stats
//! - GET  /v1/cache/stats
//! - GET  /v1/events (SSE)
//! - GET  /metrics
//! - GET  /health

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::sse::{KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::cache::TierSizes;
use crate::ledger::{Address, Balance};
use crate::queue::{QueuedTransfer, TransferId};
use crate::server::streaming::events_to_sse_stream;
use crate::service::{Ledger, LedgerError, QueueStats, SubmitRequest, SubmitResponse};
use crate::stats::{CacheStats, ProcessingStats};

/// Application state shared across handlers.
pub struct AppState {
    pub ledger: Arc<Ledger>,
    pub start_time: Instant,
    /// Fires on shutdown; ends open event streams.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(ledger: Arc<Ledger>, shutdown: CancellationToken) -> Self {
        Self {
            ledger,
            start_time: Instant::now(),
            shutdown,
        }
    }
}

/// Build the axum router with all API routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/balances/{address}", get(get_balance))
        .route("/v1/transfers", post(submit_transfer))
        .route("/v1/transfers/{id}", get(get_transfer))
        .route("/v1/queue/stats", get(queue_stats))
        .route("/v1/cache/stats", get(cache_stats))
        .route("/v1/events", get(events))
        .route("/metrics", get(metrics))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ─── Request/Response Types ────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    pub address: Address,
    pub balance: Balance,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub cache: TierSizes,
    pub processing: ProcessingStats,
}

/// Maps ledger errors to HTTP statuses.
pub struct ApiError(LedgerError);

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            LedgerError::Validation(_) => StatusCode::BAD_REQUEST,
            LedgerError::QueueFull { .. } => StatusCode::SERVICE_UNAVAILABLE,
            LedgerError::Store(_) | LedgerError::Metrics(_) => {
                error!(error = %self.0, "Request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = Json(ErrorResponse {
            error: self.0.to_string(),
        });

        if status == StatusCode::SERVICE_UNAVAILABLE {
            (status, [(header::RETRY_AFTER, "1")], body).into_response()
        } else {
            (status, body).into_response()
        }
    }
}

// ─── Route Handlers ────────────────────────────────────────────────────────

async fn get_balance(
    State(state): State<Arc<AppState>>,
    Path(address): Path<String>,
) -> Result<Json<BalanceResponse>, ApiError> {
    let address = Address::parse(&address).map_err(LedgerError::from)?;
    let balance = state.ledger.get_balance(address.as_str()).await?;
    Ok(Json(BalanceResponse { address, balance }))
}

async fn submit_transfer(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SubmitRequest>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    info!(
        hash = %req.hash,
        to = %req.to,
        amount = %req.amount,
        mint = req.from.is_none(),
        "Transfer submission"
    );
    let outcome = state.ledger.submit_transfer(req).await?;
    let status = if outcome.accepted {
        StatusCode::ACCEPTED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(outcome)))
}

async fn get_transfer(
    State(state): State<Arc<AppState>>,
    Path(id): Path<TransferId>,
) -> Result<Response, ApiError> {
    Ok(match state.ledger.transfer(id).await? {
        Some(transfer) => Json::<QueuedTransfer>(transfer).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("Transfer not found: {id}"),
            }),
        )
            .into_response(),
    })
}

async fn queue_stats(State(state): State<Arc<AppState>>) -> Result<Json<QueueStats>, ApiError> {
    Ok(Json(state.ledger.queue_stats().await?))
}

async fn cache_stats(State(state): State<Arc<AppState>>) -> Json<CacheStats> {
    Json(state.ledger.cache_stats())
}

async fn events(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stream = events_to_sse_stream(state.ledger.subscribe(), state.shutdown.clone());
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn metrics(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let body = state.ledger.render_metrics()?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response())
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        cache: state.ledger.cache().sizes(),
        processing: state.ledger.processing_stats(),
    })
}
