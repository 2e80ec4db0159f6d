//! Session status board and the monitor task.
//!
//! Sessions publish a report after every state change; the board keeps the
//! latest one per session and fans it out to stream subscribers. Readers
//! never touch a running pipeline.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use ferry_engine::{SessionId, SessionObserver, SessionReport};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::orchestrator::{OrchestrationStatus, SyncOrchestrator};

const UPDATE_BUFFER: usize = 256;

/// Latest report of one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    #[serde(flatten)]
    pub report: SessionReport,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct StatusBoard {
    sessions: DashMap<SessionId, SessionStatus>,
    updates: broadcast::Sender<SessionStatus>,
}

impl StatusBoard {
    pub fn new() -> Self {
        let (updates, _) = broadcast::channel(UPDATE_BUFFER);
        Self {
            sessions: DashMap::new(),
            updates,
        }
    }

    /// Receive every report published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionStatus> {
        self.updates.subscribe()
    }

    pub fn get(&self, session_id: &SessionId) -> Option<SessionStatus> {
        self.sessions.get(session_id).map(|entry| entry.value().clone())
    }

    /// Latest status of every session that reported, by session name.
    pub fn sessions(&self) -> Vec<SessionStatus> {
        let mut sessions: Vec<SessionStatus> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        sessions.sort_by(|a, b| {
            a.report
                .friendly_name
                .cmp(&b.report.friendly_name)
                .then(a.report.session_id.cmp(&b.report.session_id))
        });
        sessions
    }

    /// Number of conflicts currently blocking sessions.
    pub fn blocking_conflicts(&self) -> usize {
        self.sessions
            .iter()
            .map(|entry| entry.value().report.blocking_conflicts.len())
            .sum()
    }
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionObserver for StatusBoard {
    fn publish(&self, report: &SessionReport) {
        let status = SessionStatus {
            report: report.clone(),
            updated_at: Utc::now(),
        };
        self.sessions.insert(report.session_id, status.clone());
        // No subscribers is fine
        let _ = self.updates.send(status);
    }
}

/// Poll the orchestrator every `interval`: log a summary, persist progress,
/// and collect the workers once every session has finished on its own.
pub fn spawn_monitor(orchestrator: Arc<SyncOrchestrator>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let status = orchestrator.status();
            let board = orchestrator.board();
            tracing::info!(
                group = %orchestrator.group().name,
                status = ?status,
                sessions = board.sessions().len(),
                blocking_conflicts = board.blocking_conflicts(),
                "session group status"
            );

            match status {
                OrchestrationStatus::Running | OrchestrationStatus::Paused => {
                    if orchestrator.all_workers_finished() {
                        orchestrator
                            .block_until_all_sessions_finish(orchestrator.stop_timeout())
                            .await;
                    }
                    if let Err(e) = orchestrator.save_snapshot().await {
                        tracing::warn!("failed to save runtime snapshot: {}", e);
                    }
                }
                OrchestrationStatus::Stopped => break,
                _ => {}
            }
        }
        tracing::debug!("monitor stopped");
    })
}
