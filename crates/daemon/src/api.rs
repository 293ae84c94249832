//! Operator HTTP API
//!
//! - `GET    /health`
//! - `GET    /peers`, `POST /peers`
//! - `GET    /archive`
//! - `GET    /peers/:id`, `DELETE /peers/:id[?purge=true]`
//! - `GET    /peers/:id/config`
//! - `PUT    /peers/:id/expiry`
//! - `POST   /reconcile`
//!
//! Everything but `/health` requires an `x-operator-id` header listed in
//! `admins.json`.

use crate::engine::PeerEngine;
use axum::{
    extract::{Path, Query, Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use wgwarden_common::{Error, ExpiryDate, OperatorId, PeerId, PeerRecord, PeerState, Timestamp};

pub const OPERATOR_HEADER: &str = "x-operator-id";

#[derive(Clone)]
pub struct ApiState {
    pub engine: Arc<PeerEngine>,
}

pub fn router(engine: Arc<PeerEngine>) -> Router {
    let state = ApiState { engine };

    let operator_routes = Router::new()
        .route("/peers", get(list_peers_handler).post(create_peer_handler))
        .route("/archive", get(list_archive_handler))
        .route("/peers/:id", get(get_peer_handler).delete(delete_peer_handler))
        .route("/peers/:id/config", get(peer_config_handler))
        .route("/peers/:id/expiry", put(renew_peer_handler))
        .route("/reconcile", post(reconcile_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_operator));

    Router::new()
        .route("/health", get(health_handler))
        .merge(operator_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(listen: String, engine: Arc<PeerEngine>) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(&listen).await?;
    info!("Operator API listening on {}", listen);
    axum::serve(listener, router(engine)).await?;
    Ok(())
}

// ============================================================================
// Errors
// ============================================================================

/// Engine error rendered as `{"error": .., "kind": ..}`
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

pub fn status_for(error: &Error) -> StatusCode {
    match error {
        Error::NotFound { .. } => StatusCode::NOT_FOUND,
        Error::AddressSpaceExhausted { .. } => StatusCode::CONFLICT,
        Error::PermissionDenied(_) => StatusCode::FORBIDDEN,
        Error::InvalidDate(_) | Error::InvalidConfig(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            warn!("Request failed: {}", self.0);
        }
        (
            status,
            Json(serde_json::json!({
                "error": self.0.to_string(),
                "kind": self.0.kind(),
            })),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ============================================================================
// Auth
// ============================================================================

fn operator_id(headers: &HeaderMap) -> Option<OperatorId> {
    headers
        .get(OPERATOR_HEADER)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

async fn require_operator(State(state): State<ApiState>, request: Request, next: Next) -> Response {
    let Some(operator) = operator_id(request.headers()) else {
        return ApiError(Error::PermissionDenied(format!("missing or invalid {} header", OPERATOR_HEADER)))
            .into_response();
    };

    match state.engine.store().admins() {
        Ok(admins) if admins.contains(operator) => next.run(request).await,
        Ok(_) => {
            warn!("Rejected request from operator {}", operator);
            ApiError(Error::PermissionDenied(format!("operator {} is not an admin", operator))).into_response()
        }
        Err(e) => ApiError(e).into_response(),
    }
}

// ============================================================================
// Views
// ============================================================================

/// Peer as shown to operators; secrets stay in the store
#[derive(Debug, Serialize, Deserialize)]
pub struct PeerView {
    pub id: PeerId,
    pub name: String,
    pub address: String,
    pub public_key: String,
    pub expires_at: ExpiryDate,
    pub created_at: Timestamp,
    pub state: PeerState,
}

impl PeerView {
    fn new(record: PeerRecord, state: PeerState) -> Self {
        Self {
            address: record.address.to_string(),
            id: record.id,
            name: record.name,
            public_key: record.public_key,
            expires_at: record.expires_at,
            created_at: record.created_at,
            state,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreatePeerRequest {
    pub name: String,
    pub expires_at: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreatePeerResponse {
    pub id: PeerId,
    pub address: String,
    pub expires_at: ExpiryDate,
    pub config: String,
}

#[derive(Debug, Deserialize)]
pub struct RenewPeerRequest {
    pub expires_at: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct DeleteQuery {
    #[serde(default)]
    pub purge: bool,
}

// ============================================================================
// Handlers
// ============================================================================

async fn health_handler(State(state): State<ApiState>) -> impl IntoResponse {
    let snapshot = state.engine.store().snapshot();
    Json(serde_json::json!({
        "status": "ok",
        "version": wgwarden_common::VERSION,
        "active": snapshot.active.len(),
        "archived": snapshot.archived.len(),
        "cursor": snapshot.cursor.to_string(),
        "key_provider": state.engine.key_provider(),
    }))
}

async fn list_peers_handler(State(state): State<ApiState>) -> impl IntoResponse {
    let peers: Vec<PeerView> = state
        .engine
        .list_active()
        .into_iter()
        .map(|r| PeerView::new(r, PeerState::Active))
        .collect();
    Json(peers)
}

async fn list_archive_handler(State(state): State<ApiState>) -> impl IntoResponse {
    let peers: Vec<PeerView> = state
        .engine
        .list_archived()
        .into_iter()
        .map(|r| PeerView::new(r, PeerState::Archived))
        .collect();
    Json(peers)
}

async fn create_peer_handler(
    State(state): State<ApiState>,
    Json(req): Json<CreatePeerRequest>,
) -> ApiResult<Response> {
    let expires_at = ExpiryDate::parse(&req.expires_at)?;
    let created = state.engine.create_peer(&req.name, expires_at).await?;
    state.engine.reconcile().await;

    let body = CreatePeerResponse {
        id: created.record.id,
        address: created.record.address.to_string(),
        expires_at: created.record.expires_at,
        config: created.config,
    };
    Ok((StatusCode::CREATED, Json(body)).into_response())
}

async fn get_peer_handler(State(state): State<ApiState>, Path(id): Path<String>) -> ApiResult<Json<PeerView>> {
    let (record, peer_state) = state.engine.get_peer(&id)?;
    Ok(Json(PeerView::new(record, peer_state)))
}

async fn peer_config_handler(State(state): State<ApiState>, Path(id): Path<String>) -> ApiResult<Response> {
    let config = state.engine.render_config(&id)?;
    Ok((
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}.conf\"", id),
            ),
        ],
        config,
    )
        .into_response())
}

async fn delete_peer_handler(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Query(query): Query<DeleteQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    if query.purge {
        state.engine.purge_peer(&id)?;
        return Ok(Json(serde_json::json!({ "id": id, "purged": true })));
    }

    let record = state.engine.remove_peer(&id).await?;
    Ok(Json(serde_json::json!({
        "id": record.id,
        "state": PeerState::Archived,
    })))
}

async fn renew_peer_handler(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<RenewPeerRequest>,
) -> ApiResult<Json<PeerView>> {
    let expires_at = ExpiryDate::parse(&req.expires_at)?;
    let renewal = state.engine.renew_peer(&id, expires_at).await?;
    state.engine.reconcile().await;
    Ok(Json(PeerView::new(renewal.record, PeerState::Active)))
}

async fn reconcile_handler(State(state): State<ApiState>) -> ApiResult<Response> {
    let today = state.engine.today();
    let report = state.engine.sweep_and_reconcile(today).await?;
    Ok(Json(report).into_response())
}
