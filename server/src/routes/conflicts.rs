//! Conflict inspection and resolution endpoints.

use std::collections::BTreeMap;

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use ferry_engine::{
    ActionId, ConflictId, ConflictResolutionResult, ConflictResolutionRule, MigrationAction,
    MigrationConflict, RuleId, SessionId,
};
use serde::{Deserialize, Serialize};

use crate::auth::AuthUser;
use crate::error::Result;
use crate::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictQuery {
    pub session_id: Option<SessionId>,
}

/// Resolve a stored conflict with a new rule.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveRequest {
    pub action_id: ActionId,
    /// Defaults to the conflict's own scope
    pub scope: Option<String>,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveResponse {
    pub conflict_id: ConflictId,
    pub resolved: bool,
    pub rule_id: Option<RuleId>,
    pub result: Option<ConflictResolutionResult>,
    pub followup_actions: Vec<MigrationAction>,
}

/// Create conflict routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/conflicts", get(list_conflicts))
        .route("/conflicts/{id}", get(get_conflict))
        .route("/conflicts/{id}/resolve", post(resolve_conflict))
}

/// GET /conflicts - Unresolved conflicts, optionally of one session.
async fn list_conflicts(
    State(state): State<AppState>,
    Query(query): Query<ConflictQuery>,
) -> Result<Json<Vec<MigrationConflict>>> {
    let manager = state.orchestrator.conflict_manager()?;
    Ok(Json(manager.unresolved_conflicts(query.session_id)))
}

/// GET /conflicts/{id}
async fn get_conflict(
    State(state): State<AppState>,
    Path(id): Path<ConflictId>,
) -> Result<Json<MigrationConflict>> {
    let manager = state.orchestrator.conflict_manager()?;
    Ok(Json(manager.conflict(id)?))
}

/// POST /conflicts/{id}/resolve
///
/// Registers a rule for the conflict's type and applies it to this conflict.
/// A session paused by the conflict picks the resolution up on its next poll.
async fn resolve_conflict(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<ConflictId>,
    Json(request): Json<ResolveRequest>,
) -> Result<Json<ResolveResponse>> {
    let manager = state.orchestrator.conflict_manager()?;
    let conflict = manager.conflict(id)?;

    let scope = request.scope.unwrap_or_else(|| conflict.scope_hint.clone());
    let mut rule = ConflictResolutionRule::new(conflict.conflict_type_id, request.action_id, scope)
        .with_description(request.description);
    rule.data = request.data;

    let outcome = manager.resolve_existing_with_rule(id, rule)?;
    tracing::info!(
        conflict_id = id,
        resolved = outcome.resolved,
        anonymous = auth.is_anonymous(),
        "operator resolved conflict"
    );

    Ok(Json(ResolveResponse {
        conflict_id: outcome.conflict_id,
        resolved: outcome.resolved,
        rule_id: outcome.rule_id,
        result: outcome.result,
        followup_actions: outcome.followup_actions,
    }))
}
