//! Orchestrator lifecycle tests over memory sources.

mod common;

use std::time::Duration;

use common::*;
use ferry_engine::{Error as EngineError, FaultCategory, Frequency, PipelineState, SessionOutcome};
use ferry_server::error::AppError;
use ferry_server::monitor::spawn_monitor;
use ferry_server::orchestrator::OrchestrationStatus;
use ferry_server::{bootstrap_group, build_router};
use serde_json::json;

fn two_changes() -> (&'static str, String) {
    change_log(json!([
        { "name": "create", "actions": [{ "kind": "add", "path": "/src/main.rs", "payload": { "v": 1 } }] },
        { "name": "update", "actions": [
            { "kind": "edit", "path": "/src/main.rs", "payload": { "v": 2 } },
            { "kind": "add", "path": "/README", "payload": { "v": 1 } }
        ] }
    ]))
}

#[tokio::test]
async fn one_time_group_runs_to_completion() {
    let left = memory_source("left", &[two_changes()]);
    let right = memory_source("right", &[]);
    let (left_id, right_id) = (left.id, right.id);
    let state = bootstrap_group(config(), group(left, right, Frequency::OneTime))
        .await
        .unwrap();
    let orchestrator = state.orchestrator.clone();

    orchestrator.start().unwrap();
    assert_eq!(orchestrator.status(), OrchestrationStatus::Running);
    assert!(orchestrator.block_until_all_sessions_finish(Duration::from_secs(5)).await);

    assert_eq!(orchestrator.status(), OrchestrationStatus::Completed);
    let sessions = orchestrator.sessions();
    assert_eq!(sessions[0].outcome, Some(SessionOutcome::Completed));

    with_repository(&state, right_id, |repo| {
        assert_eq!(repo.items()["/src/main.rs"], json!({ "v": 2 }));
        assert!(repo.contains("/README"));
        assert_eq!(repo.applied_count(), 3);
    });

    let snapshot = orchestrator.snapshot();
    let progress = &snapshot.sessions[&sessions[0].session_id];
    assert_eq!(progress.high_water_mark(&left_id), 2);
    assert!(progress.in_flight.is_none());

    let report = state.board.get(&sessions[0].session_id).unwrap().report;
    assert_eq!(report.change_groups_committed, 2);
    assert_eq!(report.trips_completed, 1);
}

#[tokio::test]
async fn completed_one_time_group_does_not_start_again() {
    let left = memory_source("left", &[two_changes()]);
    let right = memory_source("right", &[]);
    let right_id = right.id;
    let state = bootstrap_group(config(), group(left, right, Frequency::OneTime))
        .await
        .unwrap();
    let orchestrator = state.orchestrator.clone();

    orchestrator.start().unwrap();
    assert!(orchestrator.block_until_all_sessions_finish(Duration::from_secs(5)).await);
    assert_eq!(orchestrator.status(), OrchestrationStatus::Completed);

    let err = orchestrator.start().unwrap_err();
    assert!(matches!(err, AppError::InvalidState(_)));
    assert!(orchestrator.block_until_all_sessions_finish(Duration::from_secs(1)).await);

    assert_eq!(orchestrator.status(), OrchestrationStatus::Completed);
    let sessions = orchestrator.sessions();
    assert_eq!(sessions[0].outcome, Some(SessionOutcome::Completed));
    assert_eq!(sessions[0].state, PipelineState::Stopped);
    with_repository(&state, right_id, |repo| assert_eq!(repo.applied_count(), 3));
}

#[tokio::test]
async fn restarted_server_resumes_from_its_snapshot() {
    let state_path = temp_state_path();
    let left = memory_source("left", &[two_changes()]);
    let right = memory_source("right", &[]);
    let right_id = right.id;
    let group = group(left, right, Frequency::OneTime);
    let mut config = config();
    config.state_path = Some(state_path.clone());

    let first = bootstrap_group(config.clone(), group.clone()).await.unwrap();
    first.orchestrator.start().unwrap();
    assert!(first.orchestrator.block_until_all_sessions_finish(Duration::from_secs(5)).await);
    assert!(first.orchestrator.stop().await.unwrap());
    assert!(state_path.exists());

    // Fresh adapters: the target is empty again, but the committed change
    // groups are behind the high-water mark and are not replayed.
    let second = bootstrap_group(config, group).await.unwrap();
    second.orchestrator.start().unwrap();
    assert!(second.orchestrator.block_until_all_sessions_finish(Duration::from_secs(5)).await);

    assert_eq!(second.orchestrator.status(), OrchestrationStatus::Completed);
    with_repository(&second, right_id, |repo| assert_eq!(repo.applied_count(), 0));

    std::fs::remove_file(&state_path).ok();
}

#[tokio::test]
async fn snapshot_of_another_group_is_rejected() {
    let state_path = temp_state_path();
    let mut config = config();
    config.state_path = Some(state_path.clone());

    let first = group(memory_source("left", &[]), memory_source("right", &[]), Frequency::OneTime);
    let state = bootstrap_group(config.clone(), first).await.unwrap();
    state.orchestrator.stop().await.unwrap();

    let second = group(memory_source("left", &[]), memory_source("right", &[]), Frequency::OneTime);
    let err = bootstrap_group(config, second).await.unwrap_err();
    assert!(matches!(err, AppError::Engine(EngineError::InvalidSnapshot(_))));

    std::fs::remove_file(&state_path).ok();
}

#[tokio::test]
async fn initialization_failure_fails_the_group() {
    let left = memory_source("left", &[("failInitialization", "true".to_string())]);
    let right = memory_source("right", &[]);

    let err = bootstrap_group(config(), group(left, right, Frequency::OneTime))
        .await
        .unwrap_err();
    match err {
        AppError::Engine(EngineError::Fault(fault)) => {
            assert_eq!(fault.category, FaultCategory::Initialization);
            assert_eq!(fault.inner.unwrap().kind, "ServiceUnavailable");
        }
        other => panic!("expected an initialization fault, got {other:?}"),
    }
}

#[tokio::test]
async fn unknown_provider_is_a_configuration_error() {
    let left = memory_source("left", &[]);
    let mut right = memory_source("right", &[]);
    right.provider = "svn".to_string();

    let err = bootstrap_group(config(), group(left, right, Frequency::OneTime))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Engine(EngineError::InvalidConfig(msg)) if msg.contains("svn")));
}

#[tokio::test]
async fn stop_session_group_policy_stops_the_group() {
    let left = memory_source(
        "left",
        &[change_log(json!([
            { "name": "edit", "actions": [{ "kind": "edit", "path": "/missing", "payload": {} }] }
        ]))],
    );
    let right = memory_source(
        "right",
        &[("missingItemContinuation", "stopSessionGroup".to_string())],
    );
    let state = bootstrap_group(config(), group(left, right, Frequency::OneTime))
        .await
        .unwrap();
    let orchestrator = state.orchestrator.clone();

    orchestrator.start().unwrap();
    assert!(orchestrator.block_until_all_sessions_finish(Duration::from_secs(5)).await);

    assert_eq!(orchestrator.status(), OrchestrationStatus::Stopped);
    assert_eq!(orchestrator.sessions()[0].outcome, Some(SessionOutcome::Stopped));
    assert!(orchestrator.start().is_err());
}

#[tokio::test]
async fn conflict_pauses_only_the_affected_session() {
    let blocking = ("missingItemContinuation", "stopConflictedSession".to_string());
    let stuck_left = memory_source(
        "stuck left",
        &[change_log(json!([
            { "name": "edit", "actions": [{ "kind": "edit", "path": "/missing", "payload": {} }] },
            { "name": "after", "actions": [{ "kind": "add", "path": "/after", "payload": {} }] }
        ]))],
    );
    let stuck_right = memory_source("stuck right", &[blocking.clone()]);
    let healthy_left = memory_source("healthy left", &[two_changes()]);
    let healthy_right = memory_source("healthy right", &[blocking]);
    let (stuck_target, healthy_target) = (stuck_right.id, healthy_right.id);

    let config_group = two_sessions(
        (stuck_left, stuck_right),
        (healthy_left, healthy_right),
        Frequency::OneTime,
    );
    let state = bootstrap_group(config(), config_group).await.unwrap();
    let orchestrator = state.orchestrator.clone();
    let sessions = orchestrator.sessions();
    let (stuck, healthy) = (sessions[0].session_id, sessions[1].session_id);

    orchestrator.start().unwrap();
    let board = state.board.clone();
    assert!(eventually(|| board.get(&healthy).is_some_and(|s| s.report.trips_completed == 1)).await);
    assert!(eventually(|| {
        orchestrator
            .sessions()
            .iter()
            .any(|s| s.session_id == stuck && s.state == PipelineState::PausedByConflict)
    })
    .await);

    with_repository(&state, healthy_target, |repo| {
        assert_eq!(repo.applied_count(), 3);
        assert!(repo.contains("/README"));
    });
    with_repository(&state, stuck_target, |repo| assert!(!repo.contains("/after")));
    assert_eq!(board.get(&healthy).unwrap().report.change_groups_committed, 2);
    assert_eq!(board.get(&stuck).unwrap().report.change_groups_committed, 0);

    assert!(orchestrator.stop().await.unwrap());
    let outcomes: Vec<_> = orchestrator
        .sessions()
        .into_iter()
        .map(|s| (s.session_id, s.outcome))
        .collect();
    assert!(outcomes.contains(&(healthy, Some(SessionOutcome::Completed))));
    assert!(outcomes.contains(&(stuck, Some(SessionOutcome::Stopped))));
}

#[tokio::test]
async fn automatic_group_pauses_resumes_and_stops() {
    let left = memory_source("left", &[two_changes()]);
    let right = memory_source("right", &[]);
    let mut group = group(left, right, Frequency::ContinuousAutomatic);
    group.sessions[0].sync_wait_interval_secs = 3600;
    let state = bootstrap_group(config(), group).await.unwrap();
    let orchestrator = state.orchestrator.clone();
    let board = state.board.clone();

    orchestrator.start().unwrap();
    assert!(eventually(|| board.sessions().first().is_some_and(|s| s.report.trips_completed >= 1)).await);

    orchestrator.pause().unwrap();
    assert_eq!(orchestrator.status(), OrchestrationStatus::Paused);
    assert!(orchestrator.resume().is_ok());
    assert_eq!(orchestrator.status(), OrchestrationStatus::Running);

    // The session sleeps between trips; stop wakes it up well before the timeout.
    let started = std::time::Instant::now();
    assert!(orchestrator.stop().await.unwrap());
    assert!(started.elapsed() < Duration::from_secs(5));

    assert_eq!(orchestrator.status(), OrchestrationStatus::Stopped);
    let sessions = orchestrator.sessions();
    assert_eq!(sessions[0].outcome, Some(SessionOutcome::Stopped));
    assert_eq!(sessions[0].state, PipelineState::Stopped);
}

#[tokio::test]
async fn manual_group_runs_one_trip_per_start() {
    let left = memory_source("left", &[two_changes()]);
    let right = memory_source("right", &[]);
    let state = bootstrap_group(config(), group(left, right, Frequency::ContinuousManual))
        .await
        .unwrap();
    let orchestrator = state.orchestrator.clone();

    orchestrator.start().unwrap();
    assert!(orchestrator.block_until_all_sessions_finish(Duration::from_secs(5)).await);
    assert_eq!(orchestrator.status(), OrchestrationStatus::Completed);
    assert_eq!(orchestrator.sessions()[0].outcome, Some(SessionOutcome::TripCompleted));
    assert_eq!(orchestrator.sessions()[0].state, PipelineState::StoppedSingleTrip);

    orchestrator.start().unwrap();
    assert!(orchestrator.block_until_all_sessions_finish(Duration::from_secs(5)).await);
    let session_id = orchestrator.sessions()[0].session_id;
    assert_eq!(state.board.get(&session_id).unwrap().report.trips_completed, 2);
}

#[tokio::test]
async fn monitor_collects_finished_sessions_and_saves_progress() {
    let state_path = temp_state_path();
    let mut config = config();
    config.state_path = Some(state_path.clone());
    let left = memory_source("left", &[two_changes()]);
    let right = memory_source("right", &[]);
    let state = bootstrap_group(config, group(left, right, Frequency::OneTime))
        .await
        .unwrap();
    let orchestrator = state.orchestrator.clone();

    orchestrator.start().unwrap();
    let monitor = spawn_monitor(orchestrator.clone(), Duration::from_millis(20));

    assert!(eventually(|| orchestrator.status() == OrchestrationStatus::Completed).await);
    assert!(eventually(|| state_path.exists()).await);
    monitor.abort();

    let saved = std::fs::read_to_string(&state_path).unwrap();
    let snapshot = ferry_engine::RuntimeSnapshot::from_json(&saved).unwrap();
    assert_eq!(snapshot.session_group_id, orchestrator.group().group_id);

    std::fs::remove_file(&state_path).ok();
}

#[tokio::test]
async fn live_server_serves_status() {
    let left = memory_source("left", &[two_changes()]);
    let right = memory_source("right", &[]);
    let state = bootstrap_group(config(), group(left, right, Frequency::OneTime))
        .await
        .unwrap();
    let orchestrator = state.orchestrator.clone();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        axum::serve(listener, build_router(state)).await.unwrap();
    });

    let client = reqwest::Client::new();
    let health: serde_json::Value = client
        .get(format!("http://{addr}/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");

    let response = client
        .post(format!("http://{addr}/sessions/start"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert!(orchestrator.block_until_all_sessions_finish(Duration::from_secs(5)).await);

    let group: serde_json::Value = client
        .get(format!("http://{addr}/sessions"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(group["status"], "completed");
    assert_eq!(group["reports"][0]["changeGroupsCommitted"], 2);

    let stop: serde_json::Value = client
        .post(format!("http://{addr}/sessions/stop"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stop["finished"], true);
    assert_eq!(stop["status"], "stopped");

    server.abort();
}
