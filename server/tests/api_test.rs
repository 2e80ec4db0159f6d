//! Operator API tests driving the router directly.

mod common;

use axum::body::{to_bytes, Body};
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use common::*;
use ferry_engine::{builtin, Frequency, ResolutionAction};
use ferry_server::adapters::memory::{CREATE_MISSING_ID, MISSING_ITEM_ID};
use ferry_server::{bootstrap_group, build_router, AppState};
use serde_json::{json, Value};
use tower::ServiceExt;

async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    send_with(app, method, uri, body, None).await
}

async fn send_with(
    app: &Router,
    method: Method,
    uri: &str,
    body: Option<Value>,
    token: Option<&str>,
) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        request = request.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    let request = match body {
        Some(body) => request
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into()))
    };
    (status, value)
}

/// A group whose only change edits an item the target does not have.
async fn missing_item_state() -> (AppState, uuid::Uuid) {
    let left = memory_source(
        "left",
        &[change_log(json!([
            { "name": "edit", "actions": [{ "kind": "edit", "path": "/docs/readme", "payload": { "v": 2 } }] }
        ]))],
    );
    let right = memory_source("right", &[]);
    let right_id = right.id;
    let state = bootstrap_group(config(), group(left, right, Frequency::OneTime))
        .await
        .unwrap();
    (state, right_id)
}

#[tokio::test]
async fn health_reports_group_status() {
    let (state, _) = missing_item_state().await;
    let app = build_router(state);

    let (status, body) = send(&app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["group"], "initialized");

    let (status, body) = send(&app, Method::GET, "/", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "Ferry Sync Orchestrator");
}

#[tokio::test]
async fn sessions_lists_configured_sessions() {
    let (state, _) = missing_item_state().await;
    let app = build_router(state);

    let (status, body) = send(&app, Method::GET, "/sessions", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "initialized");
    assert_eq!(body["sessions"].as_array().unwrap().len(), 1);
    assert_eq!(body["sessions"][0]["friendlyName"], "left to right");
    assert_eq!(body["sessions"][0]["state"], "default");
}

#[tokio::test]
async fn commands_in_the_wrong_status_conflict() {
    let (state, _) = missing_item_state().await;
    let app = build_router(state);

    let (status, body) = send(&app, Method::POST, "/sessions/pause", None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"].as_str().unwrap().contains("Initialized"));

    let (status, _) = send(&app, Method::POST, "/sessions/resume", None).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn conflict_resolved_over_http_unblocks_the_session() {
    let (state, right_id) = missing_item_state().await;
    let orchestrator = state.orchestrator.clone();
    let board = state.board.clone();
    let app = build_router(state.clone());

    let (status, _) = send(&app, Method::POST, "/sessions/start", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(eventually(|| board.blocking_conflicts() == 1).await);

    let (status, conflicts) = send(&app, Method::GET, "/conflicts", None).await;
    assert_eq!(status, StatusCode::OK);
    let conflicts = conflicts.as_array().unwrap().clone();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0]["conflictTypeId"], MISSING_ITEM_ID.to_string());
    assert_eq!(conflicts[0]["scopeHint"], "/docs/readme");
    let id = conflicts[0]["id"].as_u64().unwrap();

    let (status, conflict) = send(&app, Method::GET, &format!("/conflicts/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(conflict["status"], "unresolved");

    let (status, outcome) = send(
        &app,
        Method::POST,
        &format!("/conflicts/{id}/resolve"),
        Some(json!({ "actionId": CREATE_MISSING_ID, "scope": "/docs" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(outcome["resolved"], true);
    assert_eq!(outcome["followupActions"][0]["kind"], "add");

    assert!(orchestrator.block_until_all_sessions_finish(std::time::Duration::from_secs(5)).await);
    assert!(with_repository(&state, right_id, |repo| repo.contains("/docs/readme")));

    let (_, conflicts) = send(&app, Method::GET, "/conflicts", None).await;
    assert_eq!(conflicts.as_array().unwrap().len(), 0);
    let (_, group) = send(&app, Method::GET, "/sessions", None).await;
    assert_eq!(group["status"], "completed");
    assert_eq!(group["sessions"][0]["outcome"]["outcome"], "completed");
}

#[tokio::test]
async fn resolving_with_a_rule_outside_the_conflict_scope_fails() {
    let (state, _) = missing_item_state().await;
    let board = state.board.clone();
    let app = build_router(state.clone());

    send(&app, Method::POST, "/sessions/start", None).await;
    assert!(eventually(|| board.blocking_conflicts() == 1).await);
    let (_, conflicts) = send(&app, Method::GET, "/conflicts", None).await;
    let id = conflicts[0]["id"].as_u64().unwrap();

    let (status, body) = send(
        &app,
        Method::POST,
        &format!("/conflicts/{id}/resolve"),
        Some(json!({ "actionId": ResolutionAction::SKIP_ID, "scope": "/other" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("does not cover"));

    let (status, _) = send(&app, Method::GET, "/conflicts/999", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    state.orchestrator.stop().await.unwrap();
}

#[tokio::test]
async fn rules_can_be_added_listed_and_deprecated() {
    let (state, _) = missing_item_state().await;
    let app = build_router(state);

    let (status, created) = send(
        &app,
        Method::POST,
        "/rules",
        Some(json!({
            "conflictTypeId": builtin::PATH_NOT_MAPPED_ID,
            "actionId": ResolutionAction::SKIP_ID,
            "scope": "/legacy",
            "description": "legacy tree is not migrated"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["resolvedConflicts"], 0);
    let rule_id = created["ruleId"].as_str().unwrap().to_string();

    let (status, rules) = send(&app, Method::GET, "/rules", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(rules
        .as_array()
        .unwrap()
        .iter()
        .any(|r| r["referenceId"] == rule_id.as_str() && r["applicabilityScope"] == "/legacy"));

    let (status, _) = send(&app, Method::DELETE, &format!("/rules/{rule_id}"), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (_, rules) = send(&app, Method::GET, "/rules", None).await;
    let rule = rules
        .as_array()
        .unwrap()
        .iter()
        .find(|r| r["referenceId"] == rule_id.as_str())
        .cloned()
        .unwrap();
    assert_eq!(rule["deprecated"], true);

    let (status, _) = send(
        &app,
        Method::DELETE,
        &format!("/rules/{}", uuid::Uuid::new_v4()),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn invalid_rules_are_rejected() {
    let (state, _) = missing_item_state().await;
    let app = build_router(state);

    let rule = |conflict_type: uuid::Uuid, scope: &str| {
        json!({
            "conflictTypeId": conflict_type,
            "actionId": ResolutionAction::SKIP_ID,
            "scope": scope,
        })
    };

    let (status, _) = send(&app, Method::POST, "/rules", Some(rule(MISSING_ITEM_ID, ""))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(&app, Method::POST, "/rules", Some(rule(MISSING_ITEM_ID, "docs"))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("malformed scope"));

    let (status, _) = send(&app, Method::POST, "/rules", Some(rule(uuid::Uuid::new_v4(), "/docs"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn mutating_endpoints_require_the_operator_token() {
    let left = memory_source("left", &[]);
    let right = memory_source("right", &[]);
    let mut config = config();
    config.auth_secret = Some("s3cret".to_string());
    let state = bootstrap_group(config, group(left, right, Frequency::OneTime))
        .await
        .unwrap();
    let app = build_router(state);

    let (status, _) = send(&app, Method::GET, "/sessions", None).await;
    assert_eq!(status, StatusCode::OK);

    let body = json!({
        "conflictTypeId": builtin::PATH_NOT_MAPPED_ID,
        "actionId": ResolutionAction::SKIP_ID,
        "scope": "/legacy",
    });
    let (status, _) = send(&app, Method::POST, "/rules", Some(body.clone())).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send_with(&app, Method::POST, "/rules", Some(body.clone()), Some("wrong")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send_with(&app, Method::POST, "/rules", Some(body), Some("s3cret")).await;
    assert_eq!(status, StatusCode::CREATED);
}
