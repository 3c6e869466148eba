use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, put};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};

use crate::database::{EngineDatabase, ModerationRecord};
use crate::presence::{ControlCommand, PresenceEvent, PresenceStatus};
use crate::runtime::BackendRuntime;
use crate::transport::UserId;

#[derive(Clone)]
pub struct ServerState {
    pub status: Arc<RwLock<PresenceStatus>>,
    pub control_tx: flume::Sender<ControlCommand>,
    pub db: Option<Arc<EngineDatabase>>,
    pub auth: BackendAuthConfig,
    pub ws_events: broadcast::Sender<ApiEventEnvelope>,
}

#[derive(Debug, Clone)]
pub struct BackendAuthConfig {
    mode: AuthMode,
    token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthMode {
    Required,
    Disabled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiEventEnvelope {
    pub event_type: String,
    pub emitted_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct SetEnabledRequest {
    pub enabled: bool,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct EnabledResponse {
    pub enabled: bool,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ClearEscalationResponse {
    pub user_id: UserId,
    pub cleared: bool,
}

#[derive(Debug, Deserialize)]
struct ModerationQuery {
    limit: Option<usize>,
}

pub async fn serve_backend(
    runtime: BackendRuntime,
    event_rx: flume::Receiver<PresenceEvent>,
) -> Result<()> {
    let bind_addr = std::env::var("LOITER_BACKEND_BIND")
        .unwrap_or_else(|_| "127.0.0.1:8787".to_string())
        .parse::<SocketAddr>()
        .context("Invalid LOITER_BACKEND_BIND (expected host:port)")?;

    let auth = load_auth_config()?;
    let (ws_events, _) = broadcast::channel(512);

    let state = Arc::new(ServerState {
        status: runtime.status.clone(),
        control_tx: runtime.control_tx.clone(),
        db: runtime.database.clone(),
        auth,
        ws_events: ws_events.clone(),
    });

    spawn_event_bridge(event_rx, ws_events);
    runtime.spawn_presence_loop();

    let app = router(state);

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind backend server to {}", bind_addr))?;
    tracing::info!("Loiter backend listening on http://{}", bind_addr);
    axum::serve(listener, app)
        .await
        .context("Backend server failed")?;
    Ok(())
}

fn router(state: Arc<ServerState>) -> Router {
    let protected = Router::new()
        .route("/health", get(health))
        .route("/presence/status", get(get_status))
        .route("/presence/enabled", put(set_enabled))
        .route("/escalations/:user_id", delete(clear_escalation))
        .route("/moderation", get(list_moderation))
        .route("/ws/events", get(ws_events_route))
        .with_state(state.clone())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    Router::new().nest("/v1", protected)
}

fn spawn_event_bridge(
    event_rx: flume::Receiver<PresenceEvent>,
    ws_events: broadcast::Sender<ApiEventEnvelope>,
) {
    tokio::spawn(async move {
        while let Ok(event) = event_rx.recv_async().await {
            let envelope = map_presence_event(event);
            let _ = ws_events.send(envelope);
        }
    });
}

fn map_presence_event(event: PresenceEvent) -> ApiEventEnvelope {
    match event {
        PresenceEvent::MoodChanged { from, to } => envelope(
            "mood_changed",
            serde_json::json!({ "from": from, "to": to }),
        ),
        PresenceEvent::ActionTaken {
            kind,
            reason,
            target,
            text,
        } => envelope(
            "action_taken",
            serde_json::json!({
                "kind": kind,
                "reason": reason,
                "target": target,
                "text": text,
            }),
        ),
        PresenceEvent::RestrictionApplied {
            user_id,
            user_name,
            restricted,
            reasons,
        } => envelope(
            "restriction_applied",
            serde_json::json!({
                "user_id": user_id,
                "user_name": user_name,
                "restricted": restricted,
                "reasons": reasons,
            }),
        ),
        PresenceEvent::SessionReset { channel_id } => envelope(
            "session_reset",
            serde_json::json!({ "channel_id": channel_id }),
        ),
        PresenceEvent::Error { message } => {
            envelope("error", serde_json::json!({ "error": message }))
        }
    }
}

fn envelope(event_type: &str, payload: serde_json::Value) -> ApiEventEnvelope {
    ApiEventEnvelope {
        event_type: event_type.to_string(),
        emitted_at: Utc::now(),
        payload,
    }
}

fn load_auth_config() -> Result<BackendAuthConfig> {
    let mode = parse_auth_mode(std::env::var("LOITER_BACKEND_AUTH_MODE").ok())?;
    let token = std::env::var("LOITER_BACKEND_TOKEN")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());

    if mode == AuthMode::Required && token.is_none() {
        return Err(anyhow!(
            "LOITER_BACKEND_TOKEN is required when auth mode is 'required'"
        ));
    }
    if mode == AuthMode::Disabled {
        tracing::warn!("Backend auth mode is disabled; all API routes are unauthenticated");
    }

    Ok(BackendAuthConfig { mode, token })
}

fn parse_auth_mode(raw: Option<String>) -> Result<AuthMode> {
    let normalized = raw
        .unwrap_or_else(|| "required".to_string())
        .trim()
        .to_ascii_lowercase();
    match normalized.as_str() {
        "" | "required" | "on" | "enabled" | "true" => Ok(AuthMode::Required),
        "disabled" | "off" | "false" => Ok(AuthMode::Disabled),
        other => Err(anyhow!(
            "Invalid LOITER_BACKEND_AUTH_MODE '{}'. Expected 'required' or 'disabled'",
            other
        )),
    }
}

async fn auth_middleware(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: Next,
) -> Result<Response, StatusCode> {
    authorize(&headers, &state.auth)?;
    Ok(next.run(request).await)
}

fn authorize(headers: &HeaderMap, auth: &BackendAuthConfig) -> Result<(), StatusCode> {
    if auth.mode == AuthMode::Disabled {
        return Ok(());
    }
    let Some(token) = auth.token.as_deref() else {
        return Err(StatusCode::UNAUTHORIZED);
    };

    let Some(auth_value) = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
    else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    if auth_value.trim() != format!("Bearer {}", token) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(())
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn get_status(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<PresenceStatus>, (StatusCode, String)> {
    Ok(Json(state.status.read().await.clone()))
}

async fn set_enabled(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<SetEnabledRequest>,
) -> Result<Json<EnabledResponse>, (StatusCode, String)> {
    send_control(&state, ControlCommand::SetEnabled(body.enabled))?;
    tracing::info!("Presence toggle requested: {}", body.enabled);
    Ok(Json(EnabledResponse {
        enabled: body.enabled,
    }))
}

async fn clear_escalation(
    State(state): State<Arc<ServerState>>,
    Path(user_id): Path<UserId>,
) -> Result<Json<ClearEscalationResponse>, (StatusCode, String)> {
    let tracked = state
        .status
        .read()
        .await
        .escalations
        .iter()
        .any(|e| e.user_id == user_id);
    if !tracked {
        return Err(not_found(format!("no escalation record for user {}", user_id)));
    }
    send_control(&state, ControlCommand::ClearEscalation(user_id))?;
    Ok(Json(ClearEscalationResponse {
        user_id,
        cleared: true,
    }))
}

async fn list_moderation(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<ModerationQuery>,
) -> Result<Json<Vec<ModerationRecord>>, (StatusCode, String)> {
    let db = state
        .db
        .as_deref()
        .ok_or_else(|| internal_error(anyhow!("Engine database unavailable")))?;
    let limit = query.limit.unwrap_or(20).clamp(1, 200);
    let records = db.recent_moderation(limit).map_err(internal_error)?;
    Ok(Json(records))
}

fn send_control(state: &ServerState, command: ControlCommand) -> Result<(), (StatusCode, String)> {
    state
        .control_tx
        .send(command)
        .map_err(|_| internal_error(anyhow!("Presence engine is not running")))
}

async fn ws_events_route(
    State(state): State<Arc<ServerState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_events_socket(state, socket))
}

async fn handle_events_socket(state: Arc<ServerState>, mut socket: WebSocket) {
    let mut rx = state.ws_events.subscribe();

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        let payload = match serde_json::to_string(&event) {
                            Ok(serialized) => serialized,
                            Err(error) => {
                                tracing::warn!("Failed to serialize websocket event: {}", error);
                                continue;
                            }
                        };
                        if socket.send(Message::Text(payload)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!("Websocket client lagged, skipped {} events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = socket.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }
}

fn not_found(message: String) -> (StatusCode, String) {
    (StatusCode::NOT_FOUND, message)
}

fn internal_error(error: anyhow::Error) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, error.to_string())
}
