//! HTTP API for the sync service.
//!
//! Endpoints per the sync contract: `/health` (unauthenticated), `/state`,
//! `/delta`, `/push` and `/reset`. Merge conflicts are part of a `200`
//! response body; HTTP errors are reserved for infrastructure failures.

use axum::{
    Extension, Json, Router,
    extract::{Query, State, rejection::JsonRejection},
    http::{StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::models::{
    DeltaBatch, DeltaResponse, HealthResponse, PushRequest, PushResponse, ResetCounts,
    ResetResponse, StateResponse,
};
use crate::server::auth::AuthUser;
use crate::server::store::Database;

/// Application state shared across handlers
pub struct AppState {
    pub db: Database,
}

impl AppState {
    pub fn new(db: Database) -> Arc<Self> {
        Arc::new(Self { db })
    }
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/state", get(full_state))
        .route("/delta", get(delta))
        .route("/push", post(push))
        .route("/reset", delete(reset))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Health check endpoint (no auth required)
async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".into(),
        timestamp: Utc::now(),
    })
}

/// Auth middleware - resolves the Bearer token to a user identity
async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut request: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Response {
    // Skip auth for health check
    if request.uri().path() == "/health" {
        return next.run(request).await;
    }

    let auth_header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok());

    let token = match auth_header {
        Some(h) if h.starts_with("Bearer ") => &h[7..],
        _ => {
            return (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({ "error": "Missing or invalid Authorization header" })),
            )
                .into_response();
        }
    };

    let user = match state.db.user_for_token(token) {
        Ok(Some(user)) => user,
        Ok(None) => {
            return (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({ "error": "Invalid API token" })),
            )
                .into_response();
        }
        Err(err) => return ApiError::from(err).into_response(),
    };

    request.extensions_mut().insert(user);
    next.run(request).await
}

/// Full state, for bootstrap syncs
async fn full_state(State(state): State<Arc<AppState>>) -> Result<Json<StateResponse>, ApiError> {
    let (todos, synced_at) = state.db.state()?;
    Ok(Json(StateResponse { todos, synced_at }))
}

#[derive(Debug, Deserialize)]
struct DeltaParams {
    since: Option<String>,
}

/// Incremental changes since the client's cursor
async fn delta(
    State(state): State<Arc<AppState>>,
    Query(params): Query<DeltaParams>,
) -> Result<Json<DeltaResponse>, ApiError> {
    let since = params
        .since
        .as_deref()
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|parsed| parsed.with_timezone(&Utc))
        .ok_or_else(|| ApiError::BadRequest("missing or malformed 'since' parameter".into()))?;

    let (upserted, deleted, synced_at) = state.db.delta(since)?;
    Ok(Json(DeltaResponse {
        todos: DeltaBatch { upserted, deleted },
        synced_at,
    }))
}

/// Batched mutations from one device, merged transactionally
async fn push(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    payload: Result<Json<PushRequest>, JsonRejection>,
) -> Result<Json<PushResponse>, ApiError> {
    let Json(request) = payload.map_err(|err| ApiError::BadRequest(err.body_text()))?;

    tracing::info!(
        user = %user.id,
        upserts = request.todos.upserted.len(),
        deletes = request.todos.deleted.len(),
        "Push received"
    );

    let outcome = state.db.apply_push(&user, &request)?;

    if !outcome.conflicts.is_empty() {
        tracing::info!(user = %user.id, conflicts = outcome.conflicts.len(), "Push conflicts detected");
    }

    let (todos, synced_at) = state.db.state()?;

    Ok(Json(PushResponse {
        state: StateResponse { todos, synced_at },
        conflicts: outcome.conflicts,
        mappings: outcome.mappings,
    }))
}

/// Drop all synced todos (a destructive admin operation)
async fn reset(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<ResetResponse>, ApiError> {
    let todos = state.db.reset()?;
    tracing::warn!(user = %user.id, todos, "Store reset");
    Ok(Json(ResetResponse {
        success: true,
        deleted: ResetCounts { todos },
    }))
}

/// API error type
#[derive(Debug)]
pub enum ApiError {
    /// Request body or query did not match the contract.
    BadRequest(String),
    /// A uniqueness constraint failed: the client state is incoherent.
    Conflict(String),
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::BadRequest(msg) => (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": msg, "code": "BAD_REQUEST" })),
            )
                .into_response(),
            Self::Conflict(msg) => (
                StatusCode::CONFLICT,
                Json(serde_json::json!({ "error": msg, "code": "SYNC_CONFLICT" })),
            )
                .into_response(),
            Self::Internal(err) => {
                tracing::error!(error = %err, "API error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(serde_json::json!({ "error": err.to_string() })),
                )
                    .into_response()
            }
        }
    }
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        let err = err.into();
        if let Some(rusqlite::Error::SqliteFailure(cause, _)) = err.downcast_ref::<rusqlite::Error>()
            && cause.code == rusqlite::ErrorCode::ConstraintViolation
        {
            return Self::Conflict(err.to_string());
        }
        Self::Internal(err)
    }
}
