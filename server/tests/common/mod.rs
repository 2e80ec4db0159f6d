//! Session groups over memory sources, shared by the integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::time::Duration;

use ferry_engine::{
    ErrorManagementConfig, Frequency, MigrationSourceConfig, SessionConfig, SessionGroupConfig,
};
use ferry_server::adapters::memory::MemoryRepository;
use ferry_server::config::Config;
use ferry_server::AppState;
use serde_json::Value;
use uuid::Uuid;

pub fn memory_source(name: &str, settings: &[(&str, String)]) -> MigrationSourceConfig {
    MigrationSourceConfig {
        id: Uuid::new_v4(),
        friendly_name: name.to_string(),
        provider: "memory".to_string(),
        server_url: String::new(),
        settings: settings
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect::<BTreeMap<_, _>>(),
    }
}

/// `changeLog` setting for a memory source.
pub fn change_log(log: Value) -> (&'static str, String) {
    ("changeLog", log.to_string())
}

/// One session moving `left` into `right`.
pub fn group(left: MigrationSourceConfig, right: MigrationSourceConfig, frequency: Frequency) -> SessionGroupConfig {
    let mut session = SessionConfig::new(Uuid::new_v4(), "left to right", left.id, right.id);
    session.workflow.frequency = frequency;
    session.retry.base_delay_ms = 1;
    session.retry.max_delay_ms = 5;

    SessionGroupConfig {
        group_id: Uuid::new_v4(),
        name: "test group".to_string(),
        sources: vec![left, right],
        sessions: vec![session],
        error_management: ErrorManagementConfig::default(),
        resolution_rules: Vec::new(),
    }
}

/// Two independent sessions, `first.0` into `first.1` and `second.0` into
/// `second.1`, in one group.
pub fn two_sessions(
    first: (MigrationSourceConfig, MigrationSourceConfig),
    second: (MigrationSourceConfig, MigrationSourceConfig),
    frequency: Frequency,
) -> SessionGroupConfig {
    let mut config = group(first.0, first.1, frequency);
    let mut session = SessionConfig::new(Uuid::new_v4(), "second pair", second.0.id, second.1.id);
    session.workflow.frequency = frequency;
    session.retry.base_delay_ms = 1;
    session.retry.max_delay_ms = 5;
    config.sources.extend([second.0, second.1]);
    config.sessions.push(session);
    config
}

/// Server configuration with short polls.
pub fn config() -> Config {
    let mut config = Config::for_group("unused.json");
    config.conflict_poll_interval = Duration::from_millis(10);
    config.monitor_interval = Duration::from_millis(20);
    config.stop_timeout = Duration::from_secs(5);
    config
}

/// Run `f` against the memory repository of `source`.
pub fn with_repository<R>(state: &AppState, source: Uuid, f: impl FnOnce(&MemoryRepository) -> R) -> R {
    let repository = state
        .adapters
        .memory_repository(&source)
        .expect("source is a memory source");
    let guard = repository.lock().unwrap();
    f(&guard)
}

/// Poll `condition` every 10ms for up to five seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

pub fn temp_state_path() -> std::path::PathBuf {
    std::env::temp_dir().join(format!("ferry-state-{}.json", Uuid::new_v4()))
}
