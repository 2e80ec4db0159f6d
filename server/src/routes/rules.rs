//! Resolution rule endpoints.

use std::collections::BTreeMap;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get},
    Json, Router,
};
use ferry_engine::{ActionId, ConflictResolutionRule, ConflictTypeId, RuleId};
use serde::{Deserialize, Serialize};

use crate::auth::AuthUser;
use crate::error::{AppError, Result};
use crate::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleRequest {
    pub conflict_type_id: ConflictTypeId,
    pub action_id: ActionId,
    pub scope: String,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleCreated {
    pub rule_id: RuleId,
    /// Backlogged conflicts the new rule resolved right away
    pub resolved_conflicts: usize,
}

/// Create rule routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/rules", get(list_rules).post(create_rule))
        .route("/rules/{id}", delete(deprecate_rule))
}

/// GET /rules - All rules in registration order, deprecated ones included.
async fn list_rules(State(state): State<AppState>) -> Result<Json<Vec<ConflictResolutionRule>>> {
    let manager = state.orchestrator.conflict_manager()?;
    Ok(Json(manager.rules()))
}

/// POST /rules - Register a rule and re-evaluate the backlog against it.
async fn create_rule(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(request): Json<RuleRequest>,
) -> Result<(StatusCode, Json<RuleCreated>)> {
    // An empty scope covers everything; operators have to say so explicitly
    if request.scope.trim().is_empty() {
        return Err(AppError::BadRequest(
            "scope must not be empty, use \"/\" or \"*\" to cover every conflict".to_string(),
        ));
    }
    let manager = state.orchestrator.conflict_manager()?;

    let mut rule = ConflictResolutionRule::new(
        request.conflict_type_id,
        request.action_id,
        request.scope,
    )
    .with_description(request.description);
    rule.data = request.data;

    let rule_id = manager.register_resolution_rule(rule)?;
    let resolved_conflicts = manager.retry_unresolved(None)?.len();
    tracing::info!(
        rule = %rule_id,
        resolved_conflicts,
        anonymous = auth.is_anonymous(),
        "operator registered resolution rule"
    );

    Ok((
        StatusCode::CREATED,
        Json(RuleCreated {
            rule_id,
            resolved_conflicts,
        }),
    ))
}

/// DELETE /rules/{id} - Deprecate a rule. Conflicts it already resolved
/// stay resolved.
async fn deprecate_rule(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<RuleId>,
) -> Result<StatusCode> {
    let manager = state.orchestrator.conflict_manager()?;
    manager.deprecate_rule(id)?;
    tracing::info!(rule = %id, anonymous = auth.is_anonymous(), "operator deprecated rule");
    Ok(StatusCode::NO_CONTENT)
}
