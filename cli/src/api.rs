//! HTTP and WebSocket surface over one supervised line.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine;
use fxsline_core::error::ErrorClass;
use fxsline_core::supervisor::LineStatus;
use fxsline_core::{
    DtmfDigit, DtmfEvent, HardwareSupervisor, LineError, LineState, RingRequest, SimulatedLine,
    StateTransition,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub line: Arc<HardwareSupervisor>,
    /// Handset and keypad controls for the simulated line
    pub sim: Arc<SimulatedLine>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/ring", post(ring))
        .route("/stop-ring", post(stop_ring))
        .route("/play-audio", post(play_audio))
        .route("/generate-tone", post(generate_tone))
        .route("/state", post(request_state))
        .route("/history/dtmf", get(dtmf_history))
        .route("/history/transitions", get(transition_history))
        .route("/ws", get(websocket))
        .route("/sim/hook", post(sim_hook))
        .route("/sim/dtmf", post(sim_dtmf))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Line(#[from] LineError),

    #[error("{0}")]
    BadRequest(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Line(e) => match e.class() {
                ErrorClass::InvalidState => StatusCode::CONFLICT,
                ErrorClass::Hardware => StatusCode::BAD_GATEWAY,
                ErrorClass::InvalidInput => StatusCode::BAD_REQUEST,
            },
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
        };
        debug!("Request failed with {}: {}", status, self);
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug, Serialize)]
struct CommandResponse {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    bytes_written: Option<usize>,
}

impl CommandResponse {
    fn ok() -> Self {
        Self {
            status: "ok",
            bytes_written: None,
        }
    }

    fn written(bytes: usize) -> Self {
        Self {
            status: "ok",
            bytes_written: Some(bytes),
        }
    }
}

async fn status(State(app): State<AppState>) -> Json<LineStatus> {
    Json(app.line.get_status())
}

async fn ring(State(app): State<AppState>, Json(request): Json<RingRequest>) -> ApiResult<CommandResponse> {
    info!("Ring requested: {}", request.describe());
    app.line.ring(request).await?;
    Ok(Json(CommandResponse::ok()))
}

async fn stop_ring(State(app): State<AppState>) -> ApiResult<CommandResponse> {
    app.line.stop_ring().await?;
    Ok(Json(CommandResponse::ok()))
}

#[derive(Debug, Deserialize)]
struct PlayAudioRequest {
    /// Base64 of 16-bit little-endian PCM
    audio: String,
}

async fn play_audio(
    State(app): State<AppState>,
    Json(request): Json<PlayAudioRequest>,
) -> ApiResult<CommandResponse> {
    let pcm = base64::engine::general_purpose::STANDARD
        .decode(request.audio.as_bytes())
        .map_err(|e| ApiError::BadRequest(format!("audio is not valid base64: {}", e)))?;
    let written = app.line.play_audio(&pcm).await?;
    Ok(Json(CommandResponse::written(written)))
}

#[derive(Debug, Deserialize)]
struct ToneRequest {
    frequency: f32,
    duration_ms: u32,
}

async fn generate_tone(
    State(app): State<AppState>,
    Json(request): Json<ToneRequest>,
) -> ApiResult<CommandResponse> {
    let written = app
        .line
        .generate_tone(request.frequency, request.duration_ms)
        .await?;
    Ok(Json(CommandResponse::written(written)))
}

#[derive(Debug, Deserialize)]
struct StateRequest {
    state: LineState,
    reason: Option<String>,
}

async fn request_state(
    State(app): State<AppState>,
    Json(request): Json<StateRequest>,
) -> ApiResult<StateTransition> {
    let reason = request
        .reason
        .unwrap_or_else(|| format!("Requested via API: {}", request.state));
    let transition = app.line.request_transition(request.state, reason).await?;
    Ok(Json(transition))
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
}

async fn dtmf_history(
    State(app): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Json<Vec<DtmfEvent>> {
    Json(app.line.dtmf_history(query.limit))
}

async fn transition_history(State(app): State<AppState>) -> Json<Vec<StateTransition>> {
    Json(app.line.transition_history())
}

#[derive(Debug, Deserialize)]
struct HookRequest {
    off_hook: bool,
}

async fn sim_hook(State(app): State<AppState>, Json(request): Json<HookRequest>) -> Json<CommandResponse> {
    app.sim.set_off_hook(request.off_hook);
    Json(CommandResponse::ok())
}

#[derive(Debug, Deserialize)]
struct DialRequest {
    digits: String,
    #[serde(default = "default_tone_ms")]
    tone_ms: u32,
    #[serde(default = "default_tone_ms")]
    gap_ms: u32,
}

fn default_tone_ms() -> u32 {
    100
}

async fn sim_dtmf(State(app): State<AppState>, Json(request): Json<DialRequest>) -> ApiResult<CommandResponse> {
    let digits = DtmfDigit::parse_sequence(&request.digits).map_err(LineError::from)?;
    let sample_rate = app.line.config().sample_rate;
    app.sim
        .inject_dtmf(&digits, sample_rate, request.tone_ms, request.gap_ms)?;
    Ok(Json(CommandResponse::ok()))
}

async fn websocket(ws: WebSocketUpgrade, State(app): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| stream_events(socket, app))
}

/// Push line events and committed state changes to one client as JSON
/// text frames until it disconnects.
async fn stream_events(mut socket: WebSocket, app: AppState) {
    let client = Uuid::new_v4();
    let mut events = app.line.subscribe_events();
    let (subscription, mut changes) = app.line.state_machine().subscribe_channel();
    info!(%client, "WebSocket client connected");

    loop {
        let payload = tokio::select! {
            event = events.recv() => match event {
                Ok(event) => serde_json::to_string(&event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(%client, skipped, "WebSocket client lagging, events dropped");
                    continue;
                }
                Err(RecvError::Closed) => break,
            },
            change = changes.recv() => match change {
                Some(change) => serde_json::to_string(&json!({
                    "type": "state_change",
                    "timestamp": change.timestamp,
                    "from_state": change.from_state,
                    "to_state": change.to_state,
                    "reason": change.reason,
                    "metadata": change.metadata,
                })),
                None => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => continue,
            },
        };

        match payload {
            Ok(text) => {
                if socket.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            Err(e) => warn!(%client, "Failed to encode event: {}", e),
        }
    }

    app.line.unsubscribe(subscription);
    info!(%client, "WebSocket client disconnected");
}
