// HTTP server
//
// Routes:
// - GET  /like?uid=&server_name=&key=   run one like request
// - GET  /                              liveness and pool size
// - GET  /tokens?key=                   pool listing, token values masked
// - GET|POST /force_refresh?key=        run one refresh cycle now
// - GET  /quota?key=                    per-token quota usage
// - GET  /health, /metrics

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::error::LikeError;
use crate::metrics;
use crate::orchestrator::{LikeOrchestrator, LikeReport};
use crate::tokens::RefreshOutcome;

/// Shared state handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<LikeOrchestrator>,
    access_keys: Arc<HashSet<String>>,
}

impl AppState {
    pub fn new(orchestrator: Arc<LikeOrchestrator>, access_keys: impl IntoIterator<Item = String>) -> Self {
        Self {
            orchestrator,
            access_keys: Arc::new(access_keys.into_iter().collect()),
        }
    }

    fn authorize(&self, key: Option<&str>) -> Result<(), ApiError> {
        match key {
            Some(key) if self.access_keys.contains(key) => Ok(()),
            _ => Err(ApiError::Forbidden),
        }
    }
}

/// Errors surfaced to HTTP callers
#[derive(Debug)]
pub enum ApiError {
    Forbidden,
    BadRequest(String),
    Like(LikeError),
}

impl From<LikeError> for ApiError {
    fn from(err: LikeError) -> Self {
        ApiError::Like(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::Forbidden => (StatusCode::FORBIDDEN, json!({ "error": "Invalid API key" })),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, json!({ "error": msg })),
            ApiError::Like(LikeError::NoTokens) => (
                StatusCode::SERVICE_UNAVAILABLE,
                json!({ "error": "No tokens available, try again later" }),
            ),
            ApiError::Like(LikeError::QuotaExceeded { count, limit }) => (
                StatusCode::TOO_MANY_REQUESTS,
                json!({
                    "error": "Daily like quota exhausted",
                    "remains": format!("({}/{})", limit.saturating_sub(count), limit),
                }),
            ),
            ApiError::Like(err @ LikeError::Snapshot { .. }) => {
                let detail = format!("{:#}", anyhow::Error::new(err));
                error!("Like request failed: {}", detail);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "error": "Failed to read player profile", "detail": detail }),
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct LikeParams {
    uid: Option<String>,
    server_name: Option<String>,
    key: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct KeyParams {
    key: Option<String>,
}

/// Body of a successful `/like` response
#[derive(Debug, Serialize)]
pub struct LikeResponse {
    #[serde(rename = "LikesGivenByAPI")]
    pub likes_given: i64,
    #[serde(rename = "LikesafterCommand")]
    pub likes_after: i64,
    #[serde(rename = "LikesbeforeCommand")]
    pub likes_before: i64,
    #[serde(rename = "PlayerNickname")]
    pub player_nickname: String,
    #[serde(rename = "UID")]
    pub uid: String,
    pub status: u8,
    pub remains: String,
}

impl From<LikeReport> for LikeResponse {
    fn from(report: LikeReport) -> Self {
        Self {
            likes_given: report.likes_given,
            likes_after: report.likes_after,
            likes_before: report.likes_before,
            player_nickname: report.display_name,
            uid: report.target_id,
            status: report.status.code(),
            remains: report.quota.remains(),
        }
    }
}

/// Build the application router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(status_handler))
        .route("/like", get(like_handler))
        .route("/tokens", get(tokens_handler))
        .route("/force_refresh", get(force_refresh_handler).post(force_refresh_handler))
        .route("/quota", get(quota_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve `app` on `listener` until `shutdown` resolves
pub async fn serve<F>(listener: tokio::net::TcpListener, app: Router, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr().context("Failed to read listener address")?;
    info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("HTTP server error")?;

    Ok(())
}

fn required(value: Option<String>, name: &str) -> Result<String, ApiError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v.trim().to_string()),
        _ => Err(ApiError::BadRequest(format!("Missing parameter: {}", name))),
    }
}

async fn like_handler(
    State(state): State<AppState>,
    Query(params): Query<LikeParams>,
) -> Result<Json<LikeResponse>, ApiError> {
    state.authorize(params.key.as_deref())?;
    let uid = required(params.uid, "uid")?;
    let server_name = required(params.server_name, "server_name")?;

    let report = state
        .orchestrator
        .like(&uid, &server_name.to_uppercase())
        .await?;

    Ok(Json(report.into()))
}

async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "live",
        "tokens_loaded": state.orchestrator.pool().len(),
    }))
}

async fn tokens_handler(
    State(state): State<AppState>,
    Query(params): Query<KeyParams>,
) -> Result<Response, ApiError> {
    state.authorize(params.key.as_deref())?;

    let Some(snapshot) = state.orchestrator.pool().snapshot() else {
        return Ok(Json(json!({ "error": "no tokens loaded yet" })).into_response());
    };

    let tokens: Vec<_> = snapshot
        .tokens
        .iter()
        .map(|t| {
            json!({
                "account_id": t.account_id,
                "issued_at": t.issued_at,
                "token": t.masked(),
            })
        })
        .collect();

    Ok(Json(json!({
        "generation": snapshot.generation,
        "refreshed_at": snapshot.refreshed_at,
        "tokens": tokens,
    }))
    .into_response())
}

async fn force_refresh_handler(
    State(state): State<AppState>,
    Query(params): Query<KeyParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.authorize(params.key.as_deref())?;

    let pool = state.orchestrator.pool();
    let outcome = match pool.refresh().await {
        RefreshOutcome::Replaced { issued, failed } => {
            json!({ "result": "replaced", "issued": issued, "failed": failed })
        }
        RefreshOutcome::NothingIssued { failed } => {
            json!({ "result": "nothing_issued", "failed": failed })
        }
        RefreshOutcome::CredentialsUnavailable(e) => {
            json!({ "result": "credentials_unavailable", "error": e.to_string() })
        }
    };

    Ok(Json(json!({
        "status": "refreshed",
        "tokens_loaded": pool.len(),
        "outcome": outcome,
    })))
}

async fn quota_handler(
    State(state): State<AppState>,
    Query(params): Query<KeyParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.authorize(params.key.as_deref())?;

    let quota = state.orchestrator.quota();
    let tokens: Vec<_> = state
        .orchestrator
        .pool()
        .current_tokens()
        .into_iter()
        .map(|t| {
            let usage = quota.usage(&t.value);
            json!({
                "account_id": t.account_id,
                "used": usage.used,
                "limit": usage.limit,
                "remaining": usage.remaining,
            })
        })
        .collect();

    Ok(Json(json!({ "daily_limit": quota.limit(), "tokens": tokens })))
}

async fn health_handler() -> impl IntoResponse {
    StatusCode::OK
}

async fn metrics_handler() -> Response {
    match metrics::gather_metrics() {
        Ok(metrics_text) => (StatusCode::OK, metrics_text).into_response(),
        Err(e) => {
            error!("Failed to gather metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Error gathering metrics: {}", e),
            )
                .into_response()
        }
    }
}
