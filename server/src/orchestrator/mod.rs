//! Session group orchestration.
//!
//! The orchestrator owns every pipeline of one session group. Pipelines run
//! on blocking worker threads; the orchestrator hands a pipeline to a worker
//! on `start` and gets it back when the worker finishes, so the pipeline's
//! progress is available again for the next trip and for snapshots.

mod registry;

pub use registry::ErrorManagerRegistry;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use ferry_engine::{
    CancellationToken, ConflictManager, ConflictTypeRegistry, Error as EngineError,
    ErrorManager, MigrationFault, PipelineContext, PipelineState, PipelineSyncCommand,
    RuntimeSnapshot, SessionGroupConfig, SessionId, SessionObserver, SessionOutcome,
    SessionPipeline, SyncStateMachine,
};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::adapters::AdapterCatalog;
use crate::config::Config;
use crate::error::{AppError, Result};
use crate::monitor::StatusBoard;

/// Lifecycle of a session group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OrchestrationStatus {
    Constructed,
    Initialized,
    Running,
    Paused,
    /// Stopped by an operator or a routed fault; the group does not restart
    Stopped,
    /// Every session finished its trip
    Completed,
}

/// Orchestrator knobs taken from the server configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub stop_timeout: Duration,
    pub conflict_poll_interval: Duration,
    pub resume_poll_interval: Duration,
    pub state_path: Option<PathBuf>,
}

impl From<&Config> for OrchestratorSettings {
    fn from(config: &Config) -> Self {
        Self {
            stop_timeout: config.stop_timeout,
            conflict_poll_interval: config.conflict_poll_interval,
            resume_poll_interval: ferry_engine::pipeline::RESUME_POLL_INTERVAL,
            state_path: config.state_path.clone(),
        }
    }
}

/// Per-session bookkeeping. `pipeline` is `None` while a worker owns it.
struct SessionSlot {
    session_id: SessionId,
    friendly_name: String,
    state: Arc<SyncStateMachine>,
    pipeline: Option<SessionPipeline>,
    outcome: Option<SessionOutcome>,
}

/// What the operator API shows for one session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub session_id: SessionId,
    pub friendly_name: String,
    pub state: PipelineState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<SessionOutcome>,
}

type WorkerResult = (usize, SessionPipeline, ferry_engine::Result<SessionOutcome>);

pub struct SyncOrchestrator {
    group: SessionGroupConfig,
    settings: OrchestratorSettings,
    status: Mutex<OrchestrationStatus>,
    cancel: CancellationToken,
    error_managers: Arc<ErrorManagerRegistry>,
    error_manager: Arc<ErrorManager>,
    conflict_manager: OnceLock<Arc<ConflictManager>>,
    board: Arc<StatusBoard>,
    slots: Mutex<Vec<SessionSlot>>,
    workers: Mutex<Vec<JoinHandle<WorkerResult>>>,
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl SyncOrchestrator {
    /// Create the orchestrator of a validated session group and its error
    /// manager.
    pub fn new(
        group: SessionGroupConfig,
        settings: OrchestratorSettings,
        error_managers: Arc<ErrorManagerRegistry>,
        board: Arc<StatusBoard>,
    ) -> Result<Self> {
        group.validate()?;
        let cancel = CancellationToken::new();
        let error_manager =
            error_managers.create_for_group(group.group_id, &group.error_management, &cancel);

        Ok(Self {
            group,
            settings,
            status: Mutex::new(OrchestrationStatus::Constructed),
            cancel,
            error_managers,
            error_manager,
            conflict_manager: OnceLock::new(),
            board,
            slots: Mutex::new(Vec::new()),
            workers: Mutex::new(Vec::new()),
        })
    }

    pub fn group(&self) -> &SessionGroupConfig {
        &self.group
    }

    pub fn status(&self) -> OrchestrationStatus {
        *guard(&self.status)
    }

    fn set_status(&self, status: OrchestrationStatus) {
        let mut current = guard(&self.status);
        if *current != status {
            tracing::info!(group = %self.group.group_id, from = ?*current, to = ?status, "orchestration status changed");
            *current = status;
        }
    }

    fn expect_status(&self, allowed: &[OrchestrationStatus], operation: &str) -> Result<()> {
        let status = self.status();
        if allowed.contains(&status) {
            Ok(())
        } else {
            Err(AppError::InvalidState(format!(
                "cannot {operation} a session group that is {status:?}"
            )))
        }
    }

    pub fn board(&self) -> &Arc<StatusBoard> {
        &self.board
    }

    pub fn error_manager(&self) -> &Arc<ErrorManager> {
        &self.error_manager
    }

    pub fn stop_timeout(&self) -> Duration {
        self.settings.stop_timeout
    }

    /// The group's conflict manager. Exists once pipelines are initialized.
    pub fn conflict_manager(&self) -> Result<Arc<ConflictManager>> {
        self.conflict_manager
            .get()
            .cloned()
            .ok_or_else(|| AppError::InvalidState("session group is not initialized".into()))
    }

    /// Wire each session to the endpoints of its two sources.
    pub fn construct_pipelines(&self, adapters: &AdapterCatalog) -> Result<()> {
        self.expect_status(&[OrchestrationStatus::Constructed], "construct")?;
        let mut slots = guard(&self.slots);
        if !slots.is_empty() {
            return Err(AppError::InvalidState("pipelines already constructed".into()));
        }

        for session in &self.group.sessions {
            let endpoint = |id| {
                self.group
                    .source(id)
                    .ok_or_else(|| {
                        EngineError::InvalidConfig(format!(
                            "session {} references unknown source {id}",
                            session.session_id
                        ))
                    })
                    .and_then(|source| adapters.endpoint(source))
            };
            let left = endpoint(&session.left_source)?;
            let right = endpoint(&session.right_source)?;
            let pipeline = SessionPipeline::new(session.clone(), left, right)?;

            slots.push(SessionSlot {
                session_id: session.session_id,
                friendly_name: session.friendly_name.clone(),
                state: pipeline.state_machine(),
                pipeline: Some(pipeline),
                outcome: None,
            });
        }
        tracing::info!(group = %self.group.group_id, sessions = slots.len(), "pipelines constructed");
        Ok(())
    }

    /// Run every endpoint's registration hooks, build the conflict manager,
    /// and restore progress and conflicts from `snapshot`.
    ///
    /// An endpoint that fails to initialize fails the whole group; its fault
    /// is routed to the error channels first.
    pub fn initialize_pipelines(&self, snapshot: Option<RuntimeSnapshot>) -> Result<()> {
        self.expect_status(&[OrchestrationStatus::Constructed], "initialize")?;
        if let Some(snapshot) = &snapshot {
            snapshot.validate_for(self.group.group_id)?;
        }

        let mut registry = ConflictTypeRegistry::new();
        let mut slots = guard(&self.slots);
        for slot in slots.iter_mut() {
            let Some(pipeline) = slot.pipeline.as_mut() else {
                continue;
            };
            if let Err(e) = pipeline.initialize(&mut registry) {
                if let EngineError::Fault(fault) = &e {
                    self.route_initialization_fault(slot.session_id, fault);
                }
                return Err(e.into());
            }
        }

        let conflict_manager = Arc::new(ConflictManager::new(Arc::new(registry)));
        if let Some(snapshot) = &snapshot {
            conflict_manager.import_state(snapshot.conflict_state.clone())?;
            for slot in slots.iter_mut() {
                slot.pipeline = slot
                    .pipeline
                    .take()
                    .map(|p| p.with_progress(snapshot.progress(&slot.session_id)));
            }
        }

        let known: Vec<_> = conflict_manager
            .rules()
            .iter()
            .map(|rule| rule.reference_id)
            .collect();
        for rule in &self.group.resolution_rules {
            if !known.contains(&rule.reference_id) {
                conflict_manager.register_resolution_rule(rule.clone())?;
            }
        }

        self.conflict_manager
            .set(conflict_manager)
            .map_err(|_| AppError::InvalidState("conflict manager already set".into()))?;
        drop(slots);
        self.set_status(OrchestrationStatus::Initialized);
        Ok(())
    }

    fn route_initialization_fault(&self, session_id: SessionId, fault: &MigrationFault) {
        tracing::error!(session = %session_id, fault = %fault, "session failed to initialize");
        match self.error_manager.try_handle(fault, None) {
            Ok(result) => tracing::debug!(?result, "initialization fault routed"),
            Err(e) => tracing::error!("routing initialization fault failed: {}", e),
        }
    }

    /// Hand every idle pipeline to a blocking worker. Starting a completed
    /// group runs the next trip of its sessions; sessions that already
    /// stopped for good are left alone.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<()> {
        self.expect_status(
            &[OrchestrationStatus::Initialized, OrchestrationStatus::Completed],
            "start",
        )?;
        let conflict_manager = self.conflict_manager()?;
        let observer: Arc<dyn SessionObserver> = Arc::clone(&self.board) as Arc<dyn SessionObserver>;
        let ctx = PipelineContext::new(conflict_manager, Arc::clone(&self.error_manager), self.cancel.clone())
            .with_observer(observer)
            .with_poll_intervals(
                self.settings.conflict_poll_interval,
                self.settings.resume_poll_interval,
            );

        let mut slots = guard(&self.slots);
        let mut workers = guard(&self.workers);
        let mut started = 0;
        for (index, slot) in slots.iter_mut().enumerate() {
            if slot.state.current().is_terminal() {
                tracing::debug!(session = %slot.session_id, "session has stopped, not restarting");
                continue;
            }
            let Some(mut pipeline) = slot.pipeline.take() else {
                continue;
            };
            slot.outcome = None;
            started += 1;
            let ctx = ctx.clone();
            tracing::info!(session = %slot.session_id, name = %slot.friendly_name, "starting session");
            workers.push(tokio::task::spawn_blocking(move || {
                let outcome = pipeline.run(&ctx);
                (index, pipeline, outcome)
            }));
        }
        drop(workers);
        drop(slots);
        if started == 0 {
            return Err(AppError::InvalidState(format!(
                "session group {} has no session left to start",
                self.group.group_id
            )));
        }
        self.set_status(OrchestrationStatus::Running);
        Ok(())
    }

    /// Ask every session to pause at its next change-group boundary.
    pub fn pause(&self) -> Result<()> {
        self.expect_status(&[OrchestrationStatus::Running], "pause")?;
        self.command_all(PipelineSyncCommand::Pause);
        self.set_status(OrchestrationStatus::Paused);
        Ok(())
    }

    pub fn resume(&self) -> Result<()> {
        self.expect_status(&[OrchestrationStatus::Paused], "resume")?;
        self.command_all(PipelineSyncCommand::Resume);
        self.set_status(OrchestrationStatus::Running);
        Ok(())
    }

    fn command_all(&self, command: PipelineSyncCommand) {
        for slot in guard(&self.slots).iter() {
            if let Err(e) = slot.state.try_transit(command) {
                tracing::debug!(session = %slot.session_id, "{}", e);
            }
        }
    }

    /// Cancel the group and wait for its sessions. Sessions stop at their
    /// next change-group boundary; an apply in progress finishes first.
    pub async fn stop(&self) -> Result<bool> {
        self.expect_status(
            &[
                OrchestrationStatus::Initialized,
                OrchestrationStatus::Running,
                OrchestrationStatus::Paused,
                OrchestrationStatus::Completed,
            ],
            "stop",
        )?;
        tracing::info!(group = %self.group.group_id, "stopping session group");
        self.cancel.cancel();
        let finished = self
            .block_until_all_sessions_finish(self.settings.stop_timeout)
            .await;
        self.set_status(OrchestrationStatus::Stopped);
        self.save_snapshot().await?;
        self.error_managers.dispose_for_group(&self.group.group_id);
        Ok(finished)
    }

    /// True when no worker is still running.
    pub fn all_workers_finished(&self) -> bool {
        guard(&self.workers).iter().all(|worker| worker.is_finished())
    }

    /// Wait up to `timeout` for every worker, then take the pipelines back.
    /// Returns `false` if the wait timed out; the remaining workers are left
    /// to finish on their own.
    pub async fn block_until_all_sessions_finish(&self, timeout: Duration) -> bool {
        let workers = std::mem::take(&mut *guard(&self.workers));
        if workers.is_empty() {
            return true;
        }

        let results = match tokio::time::timeout(timeout, join_all(workers)).await {
            Ok(results) => results,
            Err(_) => {
                tracing::warn!(
                    group = %self.group.group_id,
                    timeout_secs = timeout.as_secs_f64(),
                    "sessions did not finish in time"
                );
                return false;
            }
        };

        let mut slots = guard(&self.slots);
        for result in results {
            match result {
                Ok((index, pipeline, outcome)) => {
                    let Some(slot) = slots.get_mut(index) else {
                        continue;
                    };
                    slot.outcome = Some(match outcome {
                        Ok(outcome) => outcome,
                        Err(e) => {
                            tracing::error!(session = %slot.session_id, "session ended with error: {}", e);
                            SessionOutcome::Failed {
                                fault: MigrationFault::new("SessionError", e.to_string()),
                            }
                        }
                    });
                    slot.pipeline = Some(pipeline);
                }
                Err(e) => tracing::error!("session worker panicked: {}", e),
            }
        }

        let stopped = self.cancel.is_cancelled()
            || slots
                .iter()
                .any(|slot| matches!(slot.outcome, Some(SessionOutcome::Stopped)));
        drop(slots);
        if self.status() != OrchestrationStatus::Stopped {
            self.set_status(if stopped {
                OrchestrationStatus::Stopped
            } else {
                OrchestrationStatus::Completed
            });
        }
        true
    }

    pub fn sessions(&self) -> Vec<SessionView> {
        guard(&self.slots)
            .iter()
            .map(|slot| SessionView {
                session_id: slot.session_id,
                friendly_name: slot.friendly_name.clone(),
                state: slot.state.current(),
                outcome: slot.outcome.clone(),
            })
            .collect()
    }

    /// Progress of every session plus the conflict store. Sessions owned by
    /// a worker contribute their last published progress.
    pub fn snapshot(&self) -> RuntimeSnapshot {
        let mut snapshot = RuntimeSnapshot::new(self.group.group_id);
        for slot in guard(&self.slots).iter() {
            let progress = match &slot.pipeline {
                Some(pipeline) => Some(pipeline.progress().clone()),
                None => self
                    .board
                    .get(&slot.session_id)
                    .map(|status| status.report.progress),
            };
            if let Some(progress) = progress {
                snapshot.sessions.insert(slot.session_id, progress);
            }
        }
        if let Some(conflict_manager) = self.conflict_manager.get() {
            snapshot.conflict_state = conflict_manager.export_state();
        }
        snapshot
    }

    /// Write the snapshot to the configured state path, if any.
    pub async fn save_snapshot(&self) -> Result<()> {
        let Some(path) = &self.settings.state_path else {
            return Ok(());
        };
        let json = self.snapshot().to_json_pretty()?;
        tokio::fs::write(path, json).await?;
        tracing::debug!(path = %path.display(), "runtime snapshot saved");
        Ok(())
    }

    /// Read a snapshot written by [`save_snapshot`](Self::save_snapshot).
    /// A missing file is not an error.
    pub async fn load_snapshot(path: &Path) -> Result<Option<RuntimeSnapshot>> {
        match tokio::fs::read_to_string(path).await {
            Ok(json) => {
                let snapshot = RuntimeSnapshot::from_json(&json)?;
                tracing::info!(path = %path.display(), sessions = snapshot.sessions.len(), "runtime snapshot loaded");
                Ok(Some(snapshot))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl std::fmt::Debug for SyncOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncOrchestrator")
            .field("group_id", &self.group.group_id)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}
