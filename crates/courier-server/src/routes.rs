//! HTTP surface: health, WebSocket upgrade, and the call lifecycle API.

use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::info;

use courier_core::bridge::PubSubBridge;
use courier_core::calls::{CallKind, CallRecord, CallSignalingService, CallSnapshot};
use courier_core::error::RelayError;
use courier_core::registry::ConnectionRegistry;
use courier_core::router::EventRouter;
use courier_core::{RateLimiter, TokenGate};

use crate::config::{Config, TurnConfig};
use crate::metrics;
use crate::ws;

/// How long clients may hold the ICE server list before re-fetching.
const TURN_CREDENTIALS_TTL_SECS: u64 = 3600;

/// Public STUN servers always offered to WebRTC clients.
const STUN_SERVERS: [&str; 2] = [
    "stun:stun.l.google.com:19302",
    "stun:global.stun.twilio.com:3478",
];

/// Shared server state.
pub struct AppState {
    pub registry: Arc<ConnectionRegistry>,
    pub bridge: Arc<PubSubBridge>,
    pub router: Arc<EventRouter>,
    pub gate: Arc<TokenGate>,
    pub limiter: RateLimiter,
    pub calls: Arc<CallSignalingService>,
    pub config: Config,
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(state: Arc<AppState>) -> Result<()> {
    let config = state.config.clone();

    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            tracing::error!("Failed to start metrics server: {}", e);
        }
    }

    let app = Router::new()
        .route(&config.websocket_path, get(ws::ws_handler))
        .route("/health", get(health_handler))
        .route("/api/v1/calls/initiate", post(initiate_call))
        .route("/api/v1/calls/turn-credentials", get(turn_credentials))
        .route("/api/v1/calls/history", get(call_history))
        .route("/api/v1/calls/:call_id", get(call_status))
        .route("/api/v1/calls/:call_id/answer", post(answer_call))
        .route("/api/v1/calls/:call_id/end", post(end_call))
        .with_state(state);

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("Courier server listening on {}", addr);
    info!("WebSocket endpoint: ws://{}{}", addr, config.websocket_path);

    axum::serve(listener, app).await?;

    Ok(())
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Resolve the bearer credential from an Authorization header.
async fn bearer_subject(state: &AppState, headers: &HeaderMap) -> Result<String, ApiError> {
    let credential = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(ApiError(RelayError::Unauthorized))?;
    let subject = state.gate.authenticate(credential).await?;
    Ok(subject)
}

#[derive(Debug, Deserialize)]
struct InitiateCallRequest {
    receiver_id: String,
    call_type: CallKind,
}

#[derive(Debug, Serialize)]
struct CallResponse {
    call: CallRecord,
}

async fn initiate_call(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<InitiateCallRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let subject = bearer_subject(&state, &headers).await?;
    let record = state
        .calls
        .initiate(&subject, &body.receiver_id, body.call_type)
        .await?;
    metrics::record_call("initiate");
    Ok((StatusCode::CREATED, Json(CallResponse { call: record })))
}

async fn answer_call(
    State(state): State<Arc<AppState>>,
    Path(call_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<CallResponse>, ApiError> {
    let subject = bearer_subject(&state, &headers).await?;
    let record = state.calls.answer(&call_id, &subject).await?;
    metrics::record_call("answer");
    Ok(Json(CallResponse { call: record }))
}

async fn end_call(
    State(state): State<Arc<AppState>>,
    Path(call_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<CallResponse>, ApiError> {
    let subject = bearer_subject(&state, &headers).await?;
    let record = state.calls.end(&call_id, &subject).await?;
    metrics::record_call("end");
    Ok(Json(CallResponse { call: record }))
}

async fn call_status(
    State(state): State<Arc<AppState>>,
    Path(call_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<CallSnapshot>, ApiError> {
    let subject = bearer_subject(&state, &headers).await?;
    let snapshot = state.calls.status(&call_id, &subject).await?;
    Ok(Json(snapshot))
}

/// One STUN/TURN entry in the shape WebRTC's `RTCIceServer` expects.
#[derive(Debug, PartialEq, Serialize)]
struct IceServer {
    urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    credential: Option<String>,
}

#[derive(Debug, Serialize)]
struct TurnCredentialsResponse {
    #[serde(rename = "iceServers")]
    ice_servers: Vec<IceServer>,
    ttl: u64,
}

/// The STUN defaults, plus the configured TURN relay if there is one.
fn ice_servers(turn: &TurnConfig) -> Vec<IceServer> {
    let mut servers: Vec<IceServer> = STUN_SERVERS
        .iter()
        .map(|url| IceServer {
            urls: vec![(*url).to_string()],
            username: None,
            credential: None,
        })
        .collect();

    if let Some(url) = &turn.server_url {
        let mut urls = vec![url.clone()];
        // Offer both transports unless the URL already pins one.
        if !url.contains("?transport=") {
            urls.push(format!("{url}?transport=udp"));
            urls.push(format!("{url}?transport=tcp"));
        }
        servers.push(IceServer {
            urls,
            username: turn.username.clone(),
            credential: turn.password.clone(),
        });
    }

    servers
}

async fn turn_credentials(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<TurnCredentialsResponse>, ApiError> {
    bearer_subject(&state, &headers).await?;
    Ok(Json(TurnCredentialsResponse {
        ice_servers: ice_servers(&state.config.turn),
        ttl: TURN_CREDENTIALS_TTL_SECS,
    }))
}

#[derive(Debug, Serialize)]
struct CallHistoryResponse {
    calls: Vec<CallRecord>,
}

async fn call_history(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<CallHistoryResponse>, ApiError> {
    let subject = bearer_subject(&state, &headers).await?;
    let calls = state.calls.history(&subject).await?;
    Ok(Json(CallHistoryResponse { calls }))
}

/// HTTP projection of [`RelayError`].
#[derive(Debug)]
pub struct ApiError(RelayError);

impl From<RelayError> for ApiError {
    fn from(e: RelayError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            RelayError::Unauthorized => StatusCode::UNAUTHORIZED,
            RelayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            RelayError::NotFound(_) => StatusCode::NOT_FOUND,
            RelayError::Forbidden(_) => StatusCode::FORBIDDEN,
            RelayError::Conflict(_) => StatusCode::CONFLICT,
            RelayError::Unprocessable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            RelayError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            RelayError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            metrics::record_error("api");
        }
        let body = Json(serde_json::json!({ "detail": self.0.to_string() }));
        (status, body).into_response()
    }
}
