//! Request/response polling surface: `POST /apiv1/:command` plus the
//! read-only operational endpoints.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use pier_core::{
    CommandName, ErrorBody, ErrorKind, Reply, SessionSnapshot, SessionState, SignalError,
};
use serde::Serialize;
use serde_json::{json, Value};

use crate::server::AppState;

/// Session ids double as invite tokens, so stats only expose a prefix.
const REDACTED_ID_LEN: usize = 6;

#[derive(Debug)]
pub struct ApiError(SignalError);

impl From<SignalError> for ApiError {
    fn from(err: SignalError) -> Self {
        ApiError(err)
    }
}

#[derive(Serialize)]
struct ApiErrorEnvelope {
    error: ErrorBody,
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound | ErrorKind::SessionClosed | ErrorKind::UnknownCommand => {
            StatusCode::NOT_FOUND
        }
        ErrorKind::Conflict | ErrorKind::NotJoined => StatusCode::CONFLICT,
        ErrorKind::Timeout => StatusCode::REQUEST_TIMEOUT,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = self.0.to_body();
        (status_for(body.code), Json(ApiErrorEnvelope { error: body })).into_response()
    }
}

pub async fn command_handler(
    State(state): State<Arc<AppState>>,
    Path(command): Path<String>,
    body: Bytes,
) -> Result<Json<Reply>, ApiError> {
    CommandName::parse(&command)?;
    let body = parse_body(&body)?;
    let reply = state.service.handle(&command, body).await?;
    Ok(Json(reply))
}

fn parse_body(bytes: &[u8]) -> Result<Value, SignalError> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(json!({}));
    }
    serde_json::from_slice(bytes).map_err(|err| SignalError::invalid(format!("malformed JSON: {err}")))
}

pub async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

pub async fn session_status_handler(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionSnapshot>, ApiError> {
    Ok(Json(state.registry().status(&session_id)?))
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    active_sessions: usize,
    awaiting_callee: usize,
    completed: usize,
    sessions: Vec<SessionStatsEntry>,
}

#[derive(Debug, Serialize)]
struct SessionStatsEntry {
    session_id: String,
    state: SessionState,
    age_ms: u64,
    callee_joined: bool,
}

pub async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = state.registry().snapshot();
    let count = |wanted: SessionState| snapshot.iter().filter(|s| s.state == wanted).count();

    let stats = StatsResponse {
        active_sessions: snapshot.len(),
        awaiting_callee: count(SessionState::Created),
        completed: count(SessionState::Completed),
        sessions: snapshot
            .iter()
            .map(|entry| SessionStatsEntry {
                session_id: redact(&entry.session_id),
                state: entry.state,
                age_ms: entry.age_ms,
                callee_joined: entry.callee_joined,
            })
            .collect(),
    };
    Json(stats)
}

fn redact(session_id: &str) -> String {
    let prefix: String = session_id.chars().take(REDACTED_ID_LEN).collect();
    format!("{prefix}...")
}
