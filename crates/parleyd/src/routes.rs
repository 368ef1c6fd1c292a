//! API routes for parleyd.
//!
//! Three chat surfaces share one pipeline: `POST /chat` waits for the
//! terminal answer, `GET /chat/stream` exposes the live event stream over
//! SSE, and `GET /chat/status` recovers a result by correlation id after a
//! lost stream. The bearer token is the caller identity, passed through
//! opaque; the stream route also accepts a `token` query parameter because
//! EventSource cannot set headers.

use crate::server::AppState;
use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};
use parley_common::error::{Denial, Disposition};
use parley_common::quick_answer;
use parley_common::types::{CallerAnswer, ChatRequest, NormalizedAnswer, SessionEvent};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tracing::debug;
use uuid::Uuid;

type AppStateArc = Arc<AppState>;
type ApiError = (StatusCode, Json<Value>);

pub fn chat_routes() -> Router<AppStateArc> {
    Router::new()
        .route("/chat", post(chat))
        .route("/chat/stream", get(chat_stream))
        .route("/chat/status", get(chat_status))
}

pub fn ops_routes() -> Router<AppStateArc> {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_export))
}

// ============================================================================
// Chat
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatBody {
    #[serde(default)]
    pub message: String,
    /// Client-supplied correlation id for idempotent retries.
    pub correlation_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatResponse {
    pub correlation_id: Uuid,
    pub disposition: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    #[serde(flatten)]
    pub answer: CallerAnswer,
}

async fn chat(
    State(state): State<AppStateArc>,
    headers: HeaderMap,
    Json(body): Json<ChatBody>,
) -> Result<Json<ChatResponse>, ApiError> {
    let caller_id = bearer_caller(&headers).ok_or_else(unauthorized)?;
    state.metrics.requests_total.inc();

    let text = body.message.trim().to_string();
    if text.is_empty() {
        return Err(bad_request("message is required"));
    }

    // Deterministic fast path: no admission, no subprocess.
    if let Some(result) = quick_answer::evaluate(&text) {
        state.metrics.quick_answers_total.inc();
        debug!("Quick answer for {}", caller_id);
        return Ok(Json(ChatResponse {
            correlation_id: body.correlation_id.unwrap_or_else(Uuid::new_v4),
            disposition: Disposition::Completed.as_str().to_string(),
            timestamp: chrono::Utc::now(),
            answer: NormalizedAnswer {
                concise: result,
                full: None,
                elapsed_ms: 0,
                pending: false,
            }
            .caller_view(),
        }));
    }

    let ticket = state
        .admission
        .try_acquire(&caller_id)
        .map_err(|denial| denial_response(&state, denial))?;

    let mut request = ChatRequest::new(caller_id, text);
    if let Some(id) = body.correlation_id {
        request = request.with_correlation_id(id);
    }
    let correlation_id = request.correlation_id;

    // Drain the stream until the terminal event; dropping the receiver on
    // client disconnect cancels the session.
    let mut rx = state.sessions.spawn_session(request, ticket);
    let mut disposition = Disposition::Completed;
    while let Some(event) = rx.recv().await {
        if let SessionEvent::Done { disposition: d, .. } = event {
            disposition = d;
            break;
        }
    }

    let answer = state
        .store
        .lookup(correlation_id)
        .unwrap_or_else(|| NormalizedAnswer::pending_placeholder(0));

    Ok(Json(ChatResponse {
        correlation_id,
        disposition: disposition.as_str().to_string(),
        timestamp: chrono::Utc::now(),
        answer: answer.caller_view(),
    }))
}

// ============================================================================
// Chat stream (SSE)
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamParams {
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub message: String,
    pub correlation_id: Option<Uuid>,
}

async fn chat_stream(
    State(state): State<AppStateArc>,
    headers: HeaderMap,
    Query(params): Query<StreamParams>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let caller_id = bearer_caller(&headers)
        .or_else(|| (!params.token.is_empty()).then(|| params.token.clone()))
        .ok_or_else(unauthorized)?;
    state.metrics.requests_total.inc();

    let text = params.message.trim().to_string();
    if text.is_empty() {
        return Err(bad_request("message is required"));
    }

    let rx = if let Some(result) = quick_answer::evaluate(&text) {
        state.metrics.quick_answers_total.inc();
        // Synthesize the same three-event shape a session would produce.
        let (tx, rx) = tokio::sync::mpsc::channel(4);
        let id = params.correlation_id.unwrap_or_else(Uuid::new_v4);
        let _ = tx.try_send(SessionEvent::Correlation(id));
        let _ = tx.try_send(SessionEvent::Primary(result));
        let _ = tx.try_send(SessionEvent::Done {
            disposition: Disposition::Completed,
            pending: false,
        });
        rx
    } else {
        let ticket = state
            .admission
            .try_acquire(&caller_id)
            .map_err(|denial| denial_response(&state, denial))?;
        let mut request = ChatRequest::new(caller_id, text);
        if let Some(id) = params.correlation_id {
            request = request.with_correlation_id(id);
        }
        state.sessions.spawn_session(request, ticket)
    };

    let stream = ReceiverStream::new(rx).map(|event| Ok(to_sse_event(event)));
    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}

fn to_sse_event(event: SessionEvent) -> Event {
    let name = event.event_name();
    let data = match event {
        SessionEvent::Correlation(id) => id.to_string(),
        SessionEvent::Primary(text)
        | SessionEvent::Detail(text)
        | SessionEvent::Stderr(text) => text,
        SessionEvent::Done {
            disposition,
            pending,
        } => json!({"disposition": disposition.as_str(), "pending": pending}).to_string(),
    };
    Event::default().event(name).data(data)
}

// ============================================================================
// Chat status (poll-based recovery)
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusParams {
    pub correlation_id: Uuid,
    #[serde(default)]
    pub token: String,
}

/// Unknown or expired ids report `found: false` rather than 404: during the
/// TTL window every issued id resolves to either a pending placeholder or a
/// terminal answer.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub found: bool,
    pub correlation_id: Uuid,
    #[serde(flatten)]
    pub answer: Option<CallerAnswer>,
}

async fn chat_status(
    State(state): State<AppStateArc>,
    headers: HeaderMap,
    Query(params): Query<StatusParams>,
) -> Result<Json<StatusResponse>, ApiError> {
    bearer_caller(&headers)
        .or_else(|| (!params.token.is_empty()).then(|| params.token.clone()))
        .ok_or_else(unauthorized)?;

    let answer = state.store.lookup(params.correlation_id);
    Ok(Json(StatusResponse {
        found: answer.is_some(),
        correlation_id: params.correlation_id,
        answer: answer.map(|a| a.caller_view()),
    }))
}

// ============================================================================
// Operational surfaces
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub active_sessions: usize,
    pub stored_results: usize,
}

async fn health(State(state): State<AppStateArc>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        active_sessions: state.admission.global_active(),
        stored_results: state.store.len(),
    })
}

async fn metrics_export(State(state): State<AppStateArc>) -> ([(header::HeaderName, &'static str); 1], String) {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.export(),
    )
}

// ============================================================================
// Helpers
// ============================================================================

fn bearer_caller(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ")?.trim();
    (!token.is_empty()).then(|| token.to_string())
}

fn unauthorized() -> ApiError {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"error": "missing or malformed bearer token"})),
    )
}

fn bad_request(message: &str) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"error": message})),
    )
}

fn denial_response(state: &AppState, denial: Denial) -> ApiError {
    state.metrics.record_denial(denial.reason());
    let body = match &denial {
        Denial::RateLimited { retry_after_secs } => {
            json!({"error": "rate_limited", "retryAfterSecs": retry_after_secs})
        }
        Denial::CapacityExceeded { scope } => {
            json!({"error": "capacity_exceeded", "scope": scope.as_str()})
        }
    };
    (StatusCode::TOO_MANY_REQUESTS, Json(body))
}
