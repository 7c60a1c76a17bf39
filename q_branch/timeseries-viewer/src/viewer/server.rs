//! HTTP server and API handlers for the timeseries viewer.
//!
//! - GET /api/health - liveness
//! - GET /api/schema - series available for selection
//! - POST /api/session - issue a session token
//! - DELETE /api/session - end a session
//! - POST /api/selection - apply a series assignment
//! - POST /api/viewport - change one group's window, or forward a relayout payload
//! - POST /api/clear - drop the figure
//! - GET /api/figure - current figure
//!
//! The session token travels in the `x-session-token` header. A selection
//! without a token is issued a new one.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use super::controller::{EventOutcome, ViewportEvent};
use super::data::{Assignment, Figure, FigurePatch, Window};
use super::engine::Engine;
use super::error::ViewerError;
use super::relayout::Relayout;
use super::session::SessionToken;

pub const SESSION_HEADER: &str = "x-session-token";

/// Application state shared across handlers.
pub struct AppState {
    pub engine: Engine,
}

/// Server configuration.
pub struct ServerConfig {
    pub port: u16,
    pub open_browser: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8050,
            open_browser: false,
        }
    }
}

/// API routes over `engine`, without the eviction task.
pub fn router(engine: Engine) -> Router {
    let state = Arc::new(AppState { engine });
    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/schema", get(schema_handler))
        .route(
            "/api/session",
            post(create_session_handler).delete(end_session_handler),
        )
        .route("/api/selection", post(selection_handler))
        .route("/api/viewport", post(viewport_handler))
        .route("/api/clear", post(clear_handler))
        .route("/api/figure", get(figure_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the HTTP server and the idle-session eviction.
pub async fn run_server(engine: Engine, config: ServerConfig) -> anyhow::Result<()> {
    let eviction = engine.start_eviction();
    info!(
        idle_timeout_secs = engine.config().idle_timeout_secs,
        interval_secs = engine.config().eviction_interval_secs,
        "Session eviction enabled"
    );

    let app = router(engine);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));

    if config.open_browser {
        let url = format!("http://127.0.0.1:{}", config.port);
        info!(%url, "Opening browser");
        #[cfg(target_os = "macos")]
        let _ = std::process::Command::new("open").arg(&url).spawn();
        #[cfg(target_os = "linux")]
        let _ = std::process::Command::new("xdg-open").arg(&url).spawn();
    }

    info!(%addr, "Server running, press Ctrl+C to stop");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let result = axum::serve(listener, app).await;
    eviction.abort();
    result?;

    Ok(())
}

// --- Errors ---

/// Handler failures with their HTTP status.
enum ApiError {
    Viewer(ViewerError),
    MissingToken,
    InvalidToken(String),
    /// Only one of `start` and `end` was given.
    OneSidedWindow,
}

impl From<ViewerError> for ApiError {
    fn from(e: ViewerError) -> Self {
        ApiError::Viewer(e)
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::MissingToken => (
                StatusCode::BAD_REQUEST,
                format!("Missing {} header", SESSION_HEADER),
            ),
            ApiError::InvalidToken(token) => (
                StatusCode::BAD_REQUEST,
                format!("Invalid session token '{}'", token),
            ),
            ApiError::OneSidedWindow => (
                StatusCode::BAD_REQUEST,
                "start and end must be given together".to_string(),
            ),
            ApiError::Viewer(e @ ViewerError::SessionExpired(_)) => {
                (StatusCode::NOT_FOUND, e.to_string())
            }
            ApiError::Viewer(e) if e.is_storage() || matches!(e, ViewerError::Task(_)) => {
                error!(error = %e, "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
            ApiError::Viewer(e) => (StatusCode::BAD_REQUEST, e.to_string()),
        };
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

fn header_token(headers: &HeaderMap) -> Result<Option<SessionToken>, ApiError> {
    let Some(value) = headers.get(SESSION_HEADER) else {
        return Ok(None);
    };
    let raw = value
        .to_str()
        .map_err(|_| ApiError::InvalidToken("<non-ascii>".to_string()))?;
    raw.parse()
        .map(Some)
        .map_err(|_| ApiError::InvalidToken(raw.to_string()))
}

fn require_token(headers: &HeaderMap) -> Result<SessionToken, ApiError> {
    header_token(headers)?.ok_or(ApiError::MissingToken)
}

// --- Responses ---

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct SchemaResponse {
    time_column: String,
    series: Vec<String>,
}

#[derive(Serialize)]
struct SessionResponse {
    token: String,
}

/// Result of one request carrying events.
#[derive(Serialize)]
struct EventResponse {
    token: String,
    /// The request carried events and every one was superseded.
    stale: bool,
    patches: Vec<FigurePatch>,
}

impl EventResponse {
    fn from_outcomes(token: SessionToken, outcomes: Vec<EventOutcome>) -> Self {
        let stale = !outcomes.is_empty() && outcomes.iter().all(EventOutcome::is_stale);
        let patches = outcomes
            .into_iter()
            .filter_map(|outcome| match outcome {
                EventOutcome::Applied(patch) => Some(patch),
                EventOutcome::Stale { .. } => None,
            })
            .collect();
        Self {
            token: token.to_string(),
            stale,
            patches,
        }
    }
}

// --- Handlers ---

/// GET /api/health
async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

/// GET /api/schema
async fn schema_handler(State(state): State<Arc<AppState>>) -> Json<SchemaResponse> {
    Json(SchemaResponse {
        time_column: state.engine.config().time_column.clone(),
        series: state.engine.schema(),
    })
}

/// POST /api/session
async fn create_session_handler(State(state): State<Arc<AppState>>) -> Json<SessionResponse> {
    let token = state.engine.create_session();
    Json(SessionResponse {
        token: token.to_string(),
    })
}

/// DELETE /api/session
async fn end_session_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let token = require_token(&headers)?;
    if state.engine.end_session(token) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ViewerError::SessionExpired(token.to_string()).into())
    }
}

fn default_shared_time_axis() -> bool {
    true
}

#[derive(Deserialize)]
struct SelectionRequest {
    seq: u64,
    subplots: Vec<Vec<String>>,
    #[serde(default = "default_shared_time_axis")]
    shared_time_axis: bool,
}

/// POST /api/selection
async fn selection_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<SelectionRequest>,
) -> Result<Json<EventResponse>, ApiError> {
    let token = header_token(&headers)?.unwrap_or_default();
    let event = ViewportEvent::SelectSeries {
        seq: req.seq,
        assignment: Assignment {
            subplots: req.subplots,
            shared_time_axis: req.shared_time_axis,
        },
    };
    let outcome = state.engine.dispatch(token, event).await?;
    Ok(Json(EventResponse::from_outcomes(token, vec![outcome])))
}

/// Either an explicit window (`start`/`end` in ticks, half-open; both absent
/// resets the group) or a raw relayout payload.
#[derive(Deserialize)]
struct ViewportRequest {
    seq: u64,
    #[serde(default)]
    group: usize,
    #[serde(default)]
    start: Option<i64>,
    #[serde(default)]
    end: Option<i64>,
    #[serde(default)]
    relayout: Option<Relayout>,
}

/// POST /api/viewport
async fn viewport_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<ViewportRequest>,
) -> Result<Json<EventResponse>, ApiError> {
    let token = require_token(&headers)?;

    let outcomes = match req.relayout {
        Some(payload) => state
            .engine
            .dispatch_relayout(token, req.seq, payload)
            .await?
            .into_iter()
            .collect::<Vec<_>>(),
        None => {
            let range = match (req.start, req.end) {
                (Some(start), Some(end)) => Some(Window::new(start, end)),
                (None, None) => None,
                _ => return Err(ApiError::OneSidedWindow),
            };
            let event = ViewportEvent::ViewportChange {
                seq: req.seq,
                group: req.group,
                range,
            };
            vec![state.engine.dispatch(token, event).await?]
        }
    };
    Ok(Json(EventResponse::from_outcomes(token, outcomes)))
}

#[derive(Deserialize)]
struct ClearRequest {
    seq: u64,
}

/// POST /api/clear
async fn clear_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<ClearRequest>,
) -> Result<Json<EventResponse>, ApiError> {
    let token = require_token(&headers)?;
    let outcome = state
        .engine
        .dispatch(token, ViewportEvent::ClearSelection { seq: req.seq })
        .await?;
    Ok(Json(EventResponse::from_outcomes(token, vec![outcome])))
}

/// GET /api/figure
async fn figure_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Figure>, ApiError> {
    let token = require_token(&headers)?;
    Ok(Json(state.engine.figure(token).await?))
}
