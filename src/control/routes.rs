//! Control API route handlers.
//!
//! All endpoints return JSON. State is shared via `Arc<ControlState>`.

use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::engine::{Engine, EngineStatus};
use crate::providers::Provider;
use crate::settings::{SettingsUpdate, Tunables};
use crate::storage::{AuditRecord, AuditReport};
use crate::strategy::risk::RiskState;
use crate::types::{ArbiterError, Opportunity, ProviderRole};

const DEFAULT_PAGE: i64 = 50;
const MAX_PAGE: i64 = 500;

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

pub struct ControlState {
    pub engine: Arc<Engine>,
    /// Bearer token for the write endpoints. `None` disables them.
    pub reset_token: Option<SecretString>,
}

pub type AppState = Arc<ControlState>;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<ArbiterError> for ApiError {
    fn from(e: ArbiterError) -> Self {
        let status = match &e {
            ArbiterError::Settings(_) => StatusCode::BAD_REQUEST,
            ArbiterError::NotAvailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(serde_json::json!({ "error": self.message }))).into_response()
    }
}

/// Check the `Authorization: Bearer` header against the configured token.
fn authorize(state: &ControlState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = &state.reset_token else {
        return Err(ApiError::new(
            StatusCode::FORBIDDEN,
            "control token not configured; write endpoints are disabled",
        ));
    };
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match presented {
        Some(token) if constant_time_eq(token.as_bytes(), expected.expose_secret().as_bytes()) => Ok(()),
        _ => {
            warn!("Rejected control request with missing or invalid token");
            Err(ApiError::new(StatusCode::UNAUTHORIZED, "invalid or missing bearer token"))
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub providers: Vec<Provider>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PageQuery {
    pub offset: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditPage {
    pub total: i64,
    pub offset: i64,
    pub limit: i64,
    pub records: Vec<AuditRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResetResponse {
    pub state: &'static str,
    pub risk: RiskState,
}

// ---------------------------------------------------------------------------
// Route handlers
// ---------------------------------------------------------------------------

/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let registry = &state.engine.registry;
    let healthy = ProviderRole::ALL.iter().all(|r| registry.is_available(*r));
    Json(HealthResponse {
        status: if healthy { "healthy" } else { "degraded" },
        providers: registry.snapshot().all(),
    })
}

/// GET /status
pub async fn status(State(state): State<AppState>) -> Json<EngineStatus> {
    Json(state.engine.status())
}

/// GET /opportunities
pub async fn opportunities(State(state): State<AppState>) -> Json<Vec<Opportunity>> {
    Json(state.engine.scanner.recent())
}

/// GET /audit?offset=&limit=
pub async fn audit(
    State(state): State<AppState>,
    Query(page): Query<PageQuery>,
) -> Result<Json<AuditPage>, ApiError> {
    let offset = page.offset.unwrap_or(0).max(0);
    let limit = page.limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE);
    let log = state.engine.accountant.audit();

    Ok(Json(AuditPage {
        total: log.count().await?,
        offset,
        limit,
        records: log.page(offset, limit).await?,
    }))
}

/// GET /audit/report
pub async fn audit_report(State(state): State<AppState>) -> Result<Json<AuditReport>, ApiError> {
    Ok(Json(state.engine.accountant.audit().report().await?))
}

/// POST /settings
pub async fn update_settings(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(update): Json<SettingsUpdate>,
) -> Result<Json<Tunables>, ApiError> {
    authorize(&state, &headers)?;
    if update.is_empty() {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "no settings in request"));
    }
    Ok(Json(state.engine.settings.apply(&update)?))
}

/// POST /reset-halt
pub async fn reset_halt(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ResetResponse>, ApiError> {
    authorize(&state, &headers)?;
    if !state.engine.accountant.reset_halt().await? {
        return Err(ApiError::new(StatusCode::CONFLICT, "breaker is not halted"));
    }
    info!("Breaker reset via control API");
    Ok(Json(ResetResponse {
        state: "active",
        risk: (*state.engine.risk.snapshot()).clone(),
    }))
}
