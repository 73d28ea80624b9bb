//! # REST API
//!
//! Builds the axum router for the terminal-facing HTTP interface. All
//! endpoints share application state through axum's `State` extractor.
//!
//! ## Endpoints
//!
//! | Method | Path                          | Description                        |
//! |--------|-------------------------------|------------------------------------|
//! | GET    | `/health`                     | Liveness probe                     |
//! | GET    | `/status`                     | Ledger status summary              |
//! | POST   | `/heartbeat`                  | Terminal liveness + registry       |
//! | POST   | `/sync`                       | Reconcile one terminal's batch     |
//! | GET    | `/cards/:card_id`             | Authoritative card snapshot        |
//! | GET    | `/cards/:card_id/transactions`| Confirmed history for a card       |
//! | POST   | `/cards/:card_id/topup`       | Server-originated credit           |
//! | GET    | `/terminals`                  | Terminal registry                  |

use axum::{
    extract::{Path, State},
    http::{Method, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use farebox_core::ledger::{CentralLedger, LedgerError};
use farebox_core::reconcile::Reconciler;
use farebox_core::sync::wire::{CardSnapshot, HeartbeatRequest, SyncRequest};
use farebox_core::types::TxStatus;

use crate::metrics::SharedMetrics;

// ---------------------------------------------------------------------------
// Application State
// ---------------------------------------------------------------------------

/// Shared application state available to all request handlers.
///
/// Cheap to clone — everything behind `Arc`.
#[derive(Clone)]
pub struct AppState {
    /// The server's reported version string.
    pub version: String,
    /// When this process started, for uptime reporting.
    pub started_at: DateTime<Utc>,
    /// The authoritative ledger.
    pub central: Arc<CentralLedger>,
    /// Batch ingest front door.
    pub reconciler: Arc<Reconciler>,
    /// Prometheus handles for in-handler recording.
    pub metrics: SharedMetrics,
}

// ---------------------------------------------------------------------------
// Router Construction
// ---------------------------------------------------------------------------

/// Builds the full axum [`Router`] with all API routes, CORS, and tracing.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/heartbeat", post(heartbeat_handler))
        .route("/sync", post(sync_handler))
        .route("/cards/:card_id", get(card_handler))
        .route("/cards/:card_id/transactions", get(card_transactions_handler))
        .route("/cards/:card_id/topup", post(topup_handler))
        .route("/terminals", get(terminals_handler))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(cors))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Request / Response Types
// ---------------------------------------------------------------------------

/// Response payload for `GET /status`.
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    /// Server software version.
    pub version: String,
    /// Seconds since the process started.
    pub uptime_seconds: i64,
    /// Cards registered in the central ledger.
    pub cards: usize,
    /// Transactions in the confirmed set.
    pub confirmed_transactions: usize,
    /// Terminals that have ever heartbeated.
    pub terminals: usize,
    /// ISO-8601 timestamp of the response.
    pub timestamp: String,
}

/// Request body for `POST /cards/:card_id/topup`.
#[derive(Debug, Serialize, Deserialize)]
pub struct TopupRequest {
    /// Amount to credit, in minor units. Must be positive.
    pub amount: u64,
}

/// Generic error body returned by REST endpoints on failure.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /health` — returns 200 if the server is alive.
///
/// The liveness probe for orchestrators. It intentionally checks nothing
/// internal — that belongs in `/status`.
async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}

/// `GET /status` — ledger status summary.
async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    let cards = state.central.card_count().unwrap_or(0);
    let confirmed = state.central.confirmed_count().unwrap_or(0);
    let terminals = state.central.terminals().map(|t| t.len()).unwrap_or(0);

    state.metrics.registered_cards.set(cards as i64);
    state.metrics.registered_terminals.set(terminals as i64);

    Json(StatusResponse {
        version: state.version.clone(),
        uptime_seconds: (Utc::now() - state.started_at).num_seconds(),
        cards,
        confirmed_transactions: confirmed,
        terminals,
        timestamp: Utc::now().to_rfc3339(),
    })
}

/// `POST /heartbeat` — terminal liveness probe.
async fn heartbeat_handler(
    State(state): State<AppState>,
    Json(req): Json<HeartbeatRequest>,
) -> impl IntoResponse {
    match state.reconciler.heartbeat(&req) {
        Ok(resp) => {
            state.metrics.heartbeats_total.inc();
            (StatusCode::OK, Json(resp)).into_response()
        }
        Err(e) => internal_error(e),
    }
}

/// `POST /sync` — reconcile one terminal's batch of pending transactions.
///
/// Batches from different terminals are served concurrently; per-card
/// serialization happens inside the central ledger.
async fn sync_handler(
    State(state): State<AppState>,
    Json(req): Json<SyncRequest>,
) -> impl IntoResponse {
    match state.reconciler.reconcile(req) {
        Ok(resp) => {
            state.metrics.sync_batches_total.inc();
            for result in &resp.results {
                match result.status {
                    TxStatus::Confirmed => state.metrics.transactions_confirmed_total.inc(),
                    TxStatus::Rejected => state.metrics.transactions_rejected_total.inc(),
                    // The reconciler only ever returns final verdicts.
                    TxStatus::Pending | TxStatus::Synced => {}
                }
            }
            (StatusCode::OK, Json(resp)).into_response()
        }
        Err(e) => internal_error(e),
    }
}

/// `GET /cards/:card_id` — authoritative card snapshot.
///
/// Read-only: looking up an unknown UID does not register it. Cards are
/// registered the first time money moves (a tap or a top-up).
async fn card_handler(
    Path(card_id): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    match state.central.get_card(&card_id) {
        Ok(Some(card)) => {
            let snap: CardSnapshot = card.into();
            (StatusCode::OK, Json(snap)).into_response()
        }
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("card not found: {card_id}"),
            }),
        )
            .into_response(),
        Err(e) => internal_error(e),
    }
}

/// `GET /cards/:card_id/transactions` — confirmed history for a card,
/// oldest first. An unknown card yields an empty list, not an error.
async fn card_transactions_handler(
    Path(card_id): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    match state.central.card_transactions(&card_id) {
        Ok(txs) => (StatusCode::OK, Json(txs)).into_response(),
        Err(e) => internal_error(e),
    }
}

/// `POST /cards/:card_id/topup` — server-originated credit.
///
/// The only way money enters the system. The new balance reaches terminals
/// as a correction the next time each of them syncs.
async fn topup_handler(
    Path(card_id): Path<String>,
    State(state): State<AppState>,
    Json(req): Json<TopupRequest>,
) -> impl IntoResponse {
    if req.amount == 0 {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: "topup amount must be positive".into(),
            }),
        )
            .into_response();
    }

    match state.central.credit(&card_id, req.amount) {
        Ok(card) => {
            state.metrics.topups_total.inc();
            let snap: CardSnapshot = card.into();
            (StatusCode::OK, Json(snap)).into_response()
        }
        Err(e @ LedgerError::AmountOverflow { .. }) => (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )
            .into_response(),
        Err(e) => internal_error(e),
    }
}

/// `GET /terminals` — the terminal registry, in id order.
async fn terminals_handler(State(state): State<AppState>) -> impl IntoResponse {
    match state.central.terminals() {
        Ok(terminals) => (StatusCode::OK, Json(terminals)).into_response(),
        Err(e) => internal_error(e),
    }
}

/// Maps a ledger failure to a 500. Integrity failures get an ERROR-level
/// line — a record that fails authentication is a corruption alarm, not
/// routine noise.
fn internal_error(e: LedgerError) -> axum::response::Response {
    match &e {
        LedgerError::Store(_) | LedgerError::Corrupt(_) => {
            tracing::error!(error = %e, "ledger failure serving request");
        }
        _ => tracing::warn!(error = %e, "request failed"),
    }
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: e.to_string(),
        }),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
