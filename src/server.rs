//! Bounty Escrow Server
//!
//! HTTP server for ledger operations and queries.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};

use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use crate::error::ErrorKind;
use crate::events::RecordedEvent;
use crate::ledger::{AwardReceipt, ClaimReceipt};
use crate::service::{
    BalanceView, CancelReceipt, CreatedBounty, EscrowService, ServiceError, ServiceInfo, SignedRequest,
};
use crate::types::{BountyId, BountyView, StakeRecord};

pub struct AppState {
    pub service: Arc<EscrowService>,
    pub started_at: std::time::Instant,
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/config", get(config_handler))
        .route("/bounties", get(count_handler).post(create_handler))
        .route("/bounties/:id", get(bounty_handler))
        .route("/bounties/:id/stakes/:staker", get(stake_query_handler))
        .route("/bounties/:id/stake", post(stake_handler))
        .route("/bounties/:id/winner", post(winner_handler))
        .route("/bounties/:id/claim", post(claim_handler))
        .route("/bounties/:id/cancel", post(cancel_handler))
        .route("/events", get(events_handler))
        .route("/balances/:token/:account", get(balance_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    kind: &'static str,
}

impl ServiceError {
    fn status(&self) -> StatusCode {
        match self {
            Self::Auth(_) => StatusCode::UNAUTHORIZED,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Ledger(e) => match e.kind() {
                ErrorKind::Authorization => StatusCode::FORBIDDEN,
                ErrorKind::Timing | ErrorKind::State => StatusCode::CONFLICT,
                ErrorKind::NotFound => StatusCode::NOT_FOUND,
                ErrorKind::Dependency => StatusCode::BAD_GATEWAY,
            },
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Request failed: {}", self);
        }
        let body = ErrorBody {
            error: self.to_string(),
            kind: self.kind(),
        };
        (status, Json(body)).into_response()
    }
}

// ============================================================================
// QUERIES
// ============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub uptime_secs: u64,
    pub version: String,
    pub bounty_count: u64,
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        healthy: true,
        uptime_secs: state.started_at.elapsed().as_secs(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        bounty_count: state.service.bounty_count(),
    })
}

async fn config_handler(State(state): State<Arc<AppState>>) -> Json<ServiceInfo> {
    Json(state.service.info())
}

async fn count_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "bounty_count": state.service.bounty_count() }))
}

async fn bounty_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<BountyId>,
) -> Result<Json<BountyView>, ServiceError> {
    Ok(Json(state.service.bounty(id)?))
}

async fn stake_query_handler(
    State(state): State<Arc<AppState>>,
    Path((id, staker)): Path<(BountyId, String)>,
) -> Result<Json<StakeRecord>, ServiceError> {
    Ok(Json(state.service.stake_of(id, &staker)?))
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub since: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct EventsResponse {
    pub events: Vec<RecordedEvent>,
    pub next: u64,
}

async fn events_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EventsQuery>,
) -> Json<EventsResponse> {
    let since = query.since.unwrap_or(0);
    let events = state.service.events_since(since);
    let next = events.last().map_or(since, |e| e.seq + 1);
    Json(EventsResponse { events, next })
}

async fn balance_handler(
    State(state): State<Arc<AppState>>,
    Path((token, account)): Path<(String, String)>,
) -> Json<BalanceView> {
    Json(state.service.balance(&token, &account))
}

// ============================================================================
// OPERATIONS
// ============================================================================

async fn create_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SignedRequest>,
) -> Result<(StatusCode, Json<CreatedBounty>), ServiceError> {
    let created = state.service.create_bounty(request).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn stake_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<BountyId>,
    Json(request): Json<SignedRequest>,
) -> Result<Json<StakeRecord>, ServiceError> {
    Ok(Json(state.service.stake(id, request).await?))
}

async fn winner_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<BountyId>,
    Json(request): Json<SignedRequest>,
) -> Result<Json<AwardReceipt>, ServiceError> {
    Ok(Json(state.service.set_winner(id, request).await?))
}

async fn claim_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<BountyId>,
    Json(request): Json<SignedRequest>,
) -> Result<Json<ClaimReceipt>, ServiceError> {
    Ok(Json(state.service.claim(id, request).await?))
}

async fn cancel_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<BountyId>,
    Json(request): Json<SignedRequest>,
) -> Result<Json<CancelReceipt>, ServiceError> {
    Ok(Json(state.service.cancel(id, request).await?))
}

/// Run the server
pub async fn run_server(host: &str, port: u16, service: Arc<EscrowService>) -> anyhow::Result<()> {
    let state = Arc::new(AppState {
        service,
        started_at: std::time::Instant::now(),
    });

    let app = create_router(state);
    let addr = format!("{}:{}", host, port);

    info!("Starting Bounty Escrow server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LedgerError;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (
                ServiceError::Ledger(LedgerError::NotCreator {
                    bounty_id: 0,
                    caller: "mallory".into(),
                }),
                StatusCode::FORBIDDEN,
            ),
            (
                ServiceError::Ledger(LedgerError::BountyNotExpired {
                    bounty_id: 0,
                    expires_at: 5,
                }),
                StatusCode::CONFLICT,
            ),
            (ServiceError::Ledger(LedgerError::BountyNotFound(3)), StatusCode::NOT_FOUND),
            (
                ServiceError::Ledger(LedgerError::Token(crate::token::TokenError::Rejected(
                    "paused".into(),
                ))),
                StatusCode::BAD_GATEWAY,
            ),
            (ServiceError::BadRequest("x".into()), StatusCode::BAD_REQUEST),
            (
                ServiceError::Auth(crate::auth::AuthError::BadSignature),
                StatusCode::UNAUTHORIZED,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(err.status(), status);
            assert_eq!(err.into_response().status(), status);
        }
    }
}
