//! Session group control endpoints.

use axum::{extract::State, routing::{get, post}, Json, Router};
use serde::Serialize;

use crate::auth::AuthUser;
use crate::error::Result;
use crate::monitor::SessionStatus;
use crate::orchestrator::{OrchestrationStatus, SessionView};
use crate::AppState;

/// The session group and its sessions.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupResponse {
    pub group_id: uuid::Uuid,
    pub name: String,
    pub status: OrchestrationStatus,
    pub sessions: Vec<SessionView>,
    /// Latest report of every session that has published one
    pub reports: Vec<SessionStatus>,
}

/// Response of `POST /sessions/stop`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StopResponse {
    /// False when some session was still busy after the stop timeout
    pub finished: bool,
    #[serde(flatten)]
    pub group: GroupResponse,
}

/// Create session routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/sessions", get(list_sessions))
        .route("/sessions/start", post(start_sessions))
        .route("/sessions/pause", post(pause_sessions))
        .route("/sessions/resume", post(resume_sessions))
        .route("/sessions/stop", post(stop_sessions))
}

fn group_response(state: &AppState) -> GroupResponse {
    let orchestrator = &state.orchestrator;
    GroupResponse {
        group_id: orchestrator.group().group_id,
        name: orchestrator.group().name.clone(),
        status: orchestrator.status(),
        sessions: orchestrator.sessions(),
        reports: state.board.sessions(),
    }
}

/// GET /sessions
async fn list_sessions(State(state): State<AppState>) -> Json<GroupResponse> {
    Json(group_response(&state))
}

/// POST /sessions/start - Start the group, or the next trip of a completed one.
async fn start_sessions(State(state): State<AppState>, auth: AuthUser) -> Result<Json<GroupResponse>> {
    tracing::info!(anonymous = auth.is_anonymous(), "operator started session group");
    state.orchestrator.start()?;
    Ok(Json(group_response(&state)))
}

/// POST /sessions/pause
async fn pause_sessions(State(state): State<AppState>, auth: AuthUser) -> Result<Json<GroupResponse>> {
    tracing::info!(anonymous = auth.is_anonymous(), "operator paused session group");
    state.orchestrator.pause()?;
    Ok(Json(group_response(&state)))
}

/// POST /sessions/resume
async fn resume_sessions(State(state): State<AppState>, auth: AuthUser) -> Result<Json<GroupResponse>> {
    tracing::info!(anonymous = auth.is_anonymous(), "operator resumed session group");
    state.orchestrator.resume()?;
    Ok(Json(group_response(&state)))
}

/// POST /sessions/stop - Stop every session and wait for them, bounded by
/// the stop timeout.
async fn stop_sessions(State(state): State<AppState>, auth: AuthUser) -> Result<Json<StopResponse>> {
    tracing::info!(anonymous = auth.is_anonymous(), "operator stopped session group");
    let finished = state.orchestrator.stop().await?;
    Ok(Json(StopResponse {
        finished,
        group: group_response(&state),
    }))
}
