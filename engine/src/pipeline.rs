//! Session pipeline - the analysis -> migration loop of one session.
//!
//! A trip polls the source for change groups past the session's high-water
//! mark and applies them to the target in execution order. Each change group
//! is a unit of commit: the mark only advances once every action in it is
//! applied or deliberately skipped. An interrupted group is replayed from its
//! start on the next attempt, and its [`ApplyJournal`] keeps already-applied
//! actions from being sent twice.
//!
//! Conflicts go to the [`ConflictManager`]; faults go to the
//! [`ErrorManager`]. The pipeline checks its state and the group's
//! cancellation token only between change groups.

use crate::action::{ApplyJournal, ChangeGroup, MigrationAction};
use crate::builtin;
use crate::cancel::CancellationToken;
use crate::config::{Frequency, PathMapping, SessionConfig, SyncContext, SyncDirection};
use crate::conflict::{ContinuationPolicy, MigrationConflict};
use crate::error::{Error, Result};
use crate::error_manager::{ErrorHandlingResult, ErrorManager, FaultOrigin};
use crate::fault::kinds;
use crate::manager::ConflictManager;
use crate::provider::Endpoint;
use crate::registry::ConflictTypeRegistry;
use crate::snapshot::SessionProgress;
use crate::state::{PipelineState, PipelineSyncCommand, SyncStateMachine};
use crate::{ActionId, ConflictId, MigrationFault, SessionId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// How often a paused session checks for a resume command.
pub const RESUME_POLL_INTERVAL: Duration = Duration::from_millis(1000);

/// How often a session paused by a conflict re-checks its conflicts.
pub const DEFAULT_CONFLICT_POLL_INTERVAL: Duration = Duration::from_millis(3000);

/// Resolutions may produce follow-up actions that raise conflicts of their
/// own; give up on a change group after this many rounds.
const MAX_FOLLOWUP_ROUNDS: usize = 3;

/// How a call to [`SessionPipeline::run`] ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum SessionOutcome {
    /// One-time session finished its trip.
    Completed,
    /// Manual session finished a trip and waits for the next start.
    TripCompleted,
    Stopped,
    Failed { fault: MigrationFault },
}

/// Point-in-time view of a session, published after every state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionReport {
    pub session_id: SessionId,
    pub friendly_name: String,
    pub state: PipelineState,
    pub progress: SessionProgress,
    pub trips_completed: u64,
    pub change_groups_committed: u64,
    pub blocking_conflicts: Vec<ConflictId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_fault: Option<MigrationFault>,
}

/// Receives session reports. Must not block.
pub trait SessionObserver: Send + Sync {
    fn publish(&self, report: &SessionReport);
}

#[derive(Debug, Default)]
pub struct NoopObserver;

impl SessionObserver for NoopObserver {
    fn publish(&self, _report: &SessionReport) {}
}

/// Group-wide collaborators shared by every session.
#[derive(Clone)]
pub struct PipelineContext {
    pub conflict_manager: Arc<ConflictManager>,
    pub error_manager: Arc<ErrorManager>,
    pub group_cancel: CancellationToken,
    pub conflict_poll_interval: Duration,
    pub resume_poll_interval: Duration,
    pub observer: Arc<dyn SessionObserver>,
}

impl PipelineContext {
    pub fn new(
        conflict_manager: Arc<ConflictManager>,
        error_manager: Arc<ErrorManager>,
        group_cancel: CancellationToken,
    ) -> Self {
        Self {
            conflict_manager,
            error_manager,
            group_cancel,
            conflict_poll_interval: DEFAULT_CONFLICT_POLL_INTERVAL,
            resume_poll_interval: RESUME_POLL_INTERVAL,
            observer: Arc::new(NoopObserver),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn SessionObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_poll_intervals(mut self, conflict: Duration, resume: Duration) -> Self {
        self.conflict_poll_interval = conflict;
        self.resume_poll_interval = resume;
        self
    }
}

impl fmt::Debug for PipelineContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineContext")
            .field("group_id", &self.error_manager.group_id())
            .field("conflict_poll_interval", &self.conflict_poll_interval)
            .field("resume_poll_interval", &self.resume_poll_interval)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Checkpoint {
    Proceed,
    EndTrip,
    Stop,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum TripOutcome {
    Completed,
    Ended,
    Stopped,
    Failed(MigrationFault),
}

enum Step {
    Committed,
    Blocked(Vec<ConflictId>),
    StopGroup,
    Fault(MigrationFault),
}

enum Disposition {
    /// Resolved; apply these actions in place of the conflicted one
    Resolved(Vec<MigrationAction>),
    /// Unresolved but the type says carry on
    Skipped,
    Blocked(ConflictId),
    StopGroup,
    Fault(MigrationFault),
}

enum FaultDisposition {
    Retry,
    Blocked(ConflictId),
    Stop,
    Fail,
}

enum Recovery {
    Retry,
    Abort(TripOutcome),
}

/// Pipeline of one session: two endpoints and the state that lets the
/// session resume where it stopped.
#[derive(Debug)]
pub struct SessionPipeline {
    config: SessionConfig,
    left: Endpoint,
    right: Endpoint,
    state: Arc<SyncStateMachine>,
    progress: SessionProgress,
    initialized: bool,
    trips_completed: u64,
    change_groups_committed: u64,
    blocking: Vec<ConflictId>,
    /// Blocking conflicts resolved while the session was paused, consumed
    /// by the replay of their change group
    resolved_while_paused: Vec<MigrationConflict>,
    last_fault: Option<MigrationFault>,
}

impl SessionPipeline {
    pub fn new(config: SessionConfig, left: Endpoint, right: Endpoint) -> Result<Self> {
        if left.source_id != config.left_source || right.source_id != config.right_source {
            return Err(Error::InvalidConfig(format!(
                "endpoints do not match the sources of session {}",
                config.session_id
            )));
        }
        Ok(Self {
            config,
            left,
            right,
            state: Arc::new(SyncStateMachine::new()),
            progress: SessionProgress::default(),
            initialized: false,
            trips_completed: 0,
            change_groups_committed: 0,
            blocking: Vec::new(),
            resolved_while_paused: Vec::new(),
            last_fault: None,
        })
    }

    /// Resume from previously saved progress.
    pub fn with_progress(mut self, progress: SessionProgress) -> Self {
        self.progress = progress;
        self
    }

    pub fn session_id(&self) -> SessionId {
        self.config.session_id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Shared handle for issuing commands while the session runs.
    pub fn state_machine(&self) -> Arc<SyncStateMachine> {
        Arc::clone(&self.state)
    }

    pub fn progress(&self) -> &SessionProgress {
        &self.progress
    }

    pub fn endpoint(&self, from_left: bool) -> &Endpoint {
        if from_left {
            &self.left
        } else {
            &self.right
        }
    }

    pub fn report(&self) -> SessionReport {
        SessionReport {
            session_id: self.config.session_id,
            friendly_name: self.config.friendly_name.clone(),
            state: self.state.current(),
            progress: self.progress.clone(),
            trips_completed: self.trips_completed,
            change_groups_committed: self.change_groups_committed,
            blocking_conflicts: self.blocking.clone(),
            last_fault: self.last_fault.clone(),
        }
    }

    fn publish(&self, ctx: &PipelineContext) {
        ctx.observer.publish(&self.report());
    }

    /// Run every provider registration hook, in order, for both endpoints,
    /// then establish context if the workflow asks for it.
    ///
    /// Failures come back as initialization faults.
    pub fn initialize(&mut self, registry: &mut ConflictTypeRegistry) -> Result<()> {
        if self.initialized {
            return Ok(());
        }
        tracing::info!(session = %self.config.session_id, "initializing session pipeline");
        self.left.initialize(registry)?;
        self.right.initialize(registry)?;

        let (left_id, right_id) = (self.left.source_id, self.right.source_id);
        match self.config.workflow.sync_context {
            SyncContext::Disabled => {}
            SyncContext::Unidirectional => self
                .right
                .migration
                .establish_context(left_id)
                .map_err(MigrationFault::into_initialization)?,
            SyncContext::Bidirectional => {
                self.right
                    .migration
                    .establish_context(left_id)
                    .map_err(MigrationFault::into_initialization)?;
                self.left
                    .migration
                    .establish_context(right_id)
                    .map_err(MigrationFault::into_initialization)?;
            }
        }
        self.initialized = true;
        Ok(())
    }

    /// Run the session until its workflow says it is done, it is stopped, or
    /// it fails.
    pub fn run(&mut self, ctx: &PipelineContext) -> Result<SessionOutcome> {
        if !self.initialized {
            return Err(Error::InvalidConfig(format!(
                "session {} was not initialized",
                self.config.session_id
            )));
        }
        match self.state.current() {
            PipelineState::StoppedSingleTrip => {
                self.state.try_transit(PipelineSyncCommand::StartNewTrip)?;
            }
            PipelineState::Default => {
                self.state.try_transit(PipelineSyncCommand::Start)?;
            }
            state if state.is_terminal() => {
                return Err(Error::InvalidTransition {
                    from: state.to_string(),
                    command: PipelineSyncCommand::Start.to_string(),
                });
            }
            _ => {}
        }
        tracing::info!(
            session = %self.config.session_id,
            frequency = ?self.config.workflow.frequency,
            "session started"
        );

        let outcome = loop {
            let trip = match self.checkpoint(ctx) {
                Checkpoint::Stop => break SessionOutcome::Stopped,
                Checkpoint::EndTrip => TripOutcome::Ended,
                Checkpoint::Proceed => self.run_trip(ctx)?,
            };
            match trip {
                TripOutcome::Completed => self.trips_completed += 1,
                TripOutcome::Ended => {}
                TripOutcome::Stopped => break SessionOutcome::Stopped,
                TripOutcome::Failed(fault) => break SessionOutcome::Failed { fault },
            }
            self.publish(ctx);

            match self.config.workflow.frequency {
                Frequency::OneTime => break SessionOutcome::Completed,
                Frequency::ContinuousManual => break SessionOutcome::TripCompleted,
                Frequency::ContinuousAutomatic => {
                    if ctx.group_cancel.wait_timeout(self.config.sync_wait_interval()) {
                        break SessionOutcome::Stopped;
                    }
                    if self.state.current() == PipelineState::StoppedSingleTrip {
                        self.state.try_transit(PipelineSyncCommand::StartNewTrip)?;
                    }
                }
            }
        };
        self.finish(ctx, outcome)
    }

    fn finish(&mut self, ctx: &PipelineContext, outcome: SessionOutcome) -> Result<SessionOutcome> {
        let command = match &outcome {
            SessionOutcome::Completed => PipelineSyncCommand::Finish,
            SessionOutcome::TripCompleted => PipelineSyncCommand::StopCurrentTrip,
            SessionOutcome::Stopped => PipelineSyncCommand::Stop,
            SessionOutcome::Failed { fault } => {
                tracing::error!(session = %self.config.session_id, fault = %fault, "session failed");
                self.last_fault = Some(fault.clone());
                PipelineSyncCommand::Stop
            }
        };
        self.state.try_transit(command)?;
        self.state.command_transit_finished();
        tracing::info!(
            session = %self.config.session_id,
            outcome = ?outcome,
            state = %self.state.current(),
            "session finished"
        );
        self.publish(ctx);
        Ok(outcome)
    }

    /// Carry out pending commands at a change-group boundary.
    fn checkpoint(&mut self, ctx: &PipelineContext) -> Checkpoint {
        loop {
            if ctx.group_cancel.is_cancelled() {
                return Checkpoint::Stop;
            }
            match self.state.current() {
                PipelineState::Stopping | PipelineState::Stopped => return Checkpoint::Stop,
                PipelineState::StoppingSingleTrip => {
                    self.state.command_transit_finished();
                    self.publish(ctx);
                    return Checkpoint::EndTrip;
                }
                PipelineState::StoppedSingleTrip => return Checkpoint::EndTrip,
                PipelineState::Pausing => {
                    self.state.command_transit_finished();
                    tracing::info!(session = %self.config.session_id, "session paused");
                    self.publish(ctx);
                }
                PipelineState::Paused => {
                    if ctx.group_cancel.wait_timeout(ctx.resume_poll_interval) {
                        return Checkpoint::Stop;
                    }
                }
                PipelineState::Starting => {
                    self.state.command_transit_finished();
                    self.publish(ctx);
                }
                PipelineState::Default
                | PipelineState::Running
                | PipelineState::PausingForConflict
                | PipelineState::PausedByConflict => return Checkpoint::Proceed,
            }
        }
    }

    fn run_trip(&mut self, ctx: &PipelineContext) -> Result<TripOutcome> {
        let directions: &[bool] = match self.config.workflow.direction {
            SyncDirection::Unidirectional => &[true],
            SyncDirection::Bidirectional => &[true, false],
        };
        for &from_left in directions {
            let outcome = self.run_direction(ctx, from_left)?;
            if outcome != TripOutcome::Completed {
                return Ok(outcome);
            }
        }
        Ok(TripOutcome::Completed)
    }

    fn run_direction(&mut self, ctx: &PipelineContext, from_left: bool) -> Result<TripOutcome> {
        let source_id = self.endpoint(from_left).source_id;
        let since = self.progress.high_water_mark(&source_id);

        let mut attempt = 0;
        let mut groups = loop {
            let source = if from_left { &mut self.left } else { &mut self.right };
            match source.analysis.generate_delta_table(since) {
                Ok(groups) => break groups,
                Err(fault) => match self.recover(ctx, fault, &mut attempt)? {
                    Recovery::Retry => continue,
                    Recovery::Abort(outcome) => return Ok(outcome),
                },
            }
        };
        groups.retain(|g| g.execution_order > since);
        groups.sort();
        tracing::debug!(
            session = %self.config.session_id,
            source = %source_id,
            since,
            count = groups.len(),
            "delta table generated"
        );

        for group in groups {
            match self.checkpoint(ctx) {
                Checkpoint::Proceed => {}
                Checkpoint::EndTrip => return Ok(TripOutcome::Ended),
                Checkpoint::Stop => return Ok(TripOutcome::Stopped),
            }
            if let Some(outcome) = self.migrate_change_group(ctx, from_left, group)? {
                return Ok(outcome);
            }
        }
        Ok(TripOutcome::Completed)
    }

    /// Apply one change group until it commits. Returns `Some` when the trip
    /// has to end early.
    fn migrate_change_group(
        &mut self,
        ctx: &PipelineContext,
        from_left: bool,
        mut group: ChangeGroup,
    ) -> Result<Option<TripOutcome>> {
        let mut journal = match self.progress.in_flight.take() {
            Some(journal) if journal.tracks(&group) => {
                tracing::info!(
                    session = %self.config.session_id,
                    change_group = group.id,
                    done = journal.done().len(),
                    "replaying interrupted change group"
                );
                journal
            }
            _ => ApplyJournal::new(group.id, group.source_id),
        };

        let mut attempt = 0;
        loop {
            group.mark_applied(journal.done());
            let step = {
                let (source, target) = if from_left {
                    (&mut self.left, &mut self.right)
                } else {
                    (&mut self.right, &mut self.left)
                };
                GroupApply {
                    ctx,
                    config: &self.config,
                    source,
                    target,
                    from_left,
                    resolved: &mut self.resolved_while_paused,
                }
                .run(&group, &mut journal)
            };
            self.progress.in_flight = Some(journal.clone());

            let fault = match step? {
                Step::Committed => {
                    self.progress.record_commit(group.source_id, group.execution_order);
                    self.progress.in_flight = None;
                    self.change_groups_committed += 1;
                    self.blocking.clear();
                    self.resolved_while_paused.clear();
                    tracing::debug!(
                        session = %self.config.session_id,
                        change_group = group.id,
                        "change group committed"
                    );
                    self.publish(ctx);
                    return Ok(None);
                }
                Step::Blocked(conflicts) => match self.pause_until_resolved(ctx, conflicts)? {
                    Checkpoint::Proceed => {
                        attempt = 0;
                        continue;
                    }
                    Checkpoint::EndTrip => return Ok(Some(TripOutcome::Ended)),
                    Checkpoint::Stop => return Ok(Some(TripOutcome::Stopped)),
                },
                Step::StopGroup => return Ok(Some(TripOutcome::Stopped)),
                Step::Fault(fault) => fault,
            };

            match self.recover(ctx, fault, &mut attempt)? {
                Recovery::Retry => continue,
                Recovery::Abort(outcome) => return Ok(Some(outcome)),
            }
        }
    }

    /// Route a fault and decide whether to retry, with backoff.
    fn recover(
        &mut self,
        ctx: &PipelineContext,
        fault: MigrationFault,
        attempt: &mut u32,
    ) -> Result<Recovery> {
        match self.handle_fault(ctx, &fault)? {
            FaultDisposition::Retry => {
                *attempt += 1;
                if *attempt >= self.config.retry.max_attempts {
                    return Ok(Recovery::Abort(self.give_up(fault)));
                }
                let delay = self.config.retry.delay_for(*attempt);
                tracing::debug!(
                    session = %self.config.session_id,
                    attempt = *attempt,
                    delay_ms = delay.as_millis() as u64,
                    "retrying after fault"
                );
                if ctx.group_cancel.wait_timeout(delay) {
                    return Ok(Recovery::Abort(TripOutcome::Stopped));
                }
                Ok(Recovery::Retry)
            }
            FaultDisposition::Blocked(conflict_id) => {
                *attempt = 0;
                Ok(match self.pause_until_resolved(ctx, vec![conflict_id])? {
                    Checkpoint::Proceed => Recovery::Retry,
                    Checkpoint::EndTrip => Recovery::Abort(TripOutcome::Ended),
                    Checkpoint::Stop => Recovery::Abort(TripOutcome::Stopped),
                })
            }
            FaultDisposition::Stop => Ok(Recovery::Abort(TripOutcome::Stopped)),
            FaultDisposition::Fail => Ok(Recovery::Abort(TripOutcome::Failed(fault))),
        }
    }

    /// Automatic sessions try again next trip; others fail.
    fn give_up(&mut self, fault: MigrationFault) -> TripOutcome {
        if self.config.workflow.frequency == Frequency::ContinuousAutomatic {
            tracing::warn!(
                session = %self.config.session_id,
                fault = %fault,
                "retries exhausted, deferring to next trip"
            );
            self.last_fault = Some(fault);
            TripOutcome::Ended
        } else {
            TripOutcome::Failed(fault)
        }
    }

    fn handle_fault(
        &mut self,
        ctx: &PipelineContext,
        fault: &MigrationFault,
    ) -> Result<FaultDisposition> {
        self.last_fault = Some(fault.clone());
        let origin = FaultOrigin {
            session_id: Some(self.config.session_id),
            source_id: None,
        };
        let result =
            ctx.error_manager
                .try_handle_from(fault, Some(ctx.conflict_manager.as_ref()), origin)?;
        tracing::debug!(session = %self.config.session_id, result = ?result, "fault handled");

        Ok(match result {
            ErrorHandlingResult::RoutedToChannels {
                stop_requested: true,
                ..
            } => FaultDisposition::Stop,
            ErrorHandlingResult::RoutedToChannels { .. } => FaultDisposition::Fail,
            ErrorHandlingResult::PolicyConditionIsNotMet => FaultDisposition::Retry,
            ErrorHandlingResult::RaisedAsRuntimeConflict { resolved: true, .. } => {
                FaultDisposition::Retry
            }
            ErrorHandlingResult::RaisedAsRuntimeConflict { conflict_id, .. } => {
                FaultDisposition::Blocked(conflict_id)
            }
            ErrorHandlingResult::Unhandled => FaultDisposition::Fail,
        })
    }

    /// Park the session until the blocking conflicts are resolved, the
    /// operator resumes it, or it is stopped.
    fn pause_until_resolved(
        &mut self,
        ctx: &PipelineContext,
        conflicts: Vec<ConflictId>,
    ) -> Result<Checkpoint> {
        self.blocking = conflicts;
        if self
            .state
            .try_transit(PipelineSyncCommand::PauseForConflict)
            .is_err()
        {
            // A stop already in progress takes precedence.
            return Ok(self.checkpoint(ctx));
        }
        self.state.command_transit_finished();
        tracing::warn!(
            session = %self.config.session_id,
            conflicts = ?self.blocking,
            "session paused until conflicts are resolved"
        );
        self.publish(ctx);

        loop {
            if ctx.group_cancel.wait_timeout(ctx.conflict_poll_interval) {
                return Ok(Checkpoint::Stop);
            }
            match self.state.current() {
                PipelineState::Stopping | PipelineState::Stopped => return Ok(Checkpoint::Stop),
                PipelineState::StoppingSingleTrip | PipelineState::StoppedSingleTrip => {
                    self.state.command_transit_finished();
                    return Ok(Checkpoint::EndTrip);
                }
                // Operator resumed without resolving; replay re-raises.
                PipelineState::Starting => break,
                _ => {}
            }

            let retried = ctx
                .conflict_manager
                .retry_unresolved(Some(self.config.session_id))?;
            if !retried.is_empty() {
                tracing::debug!(
                    session = %self.config.session_id,
                    resolved = retried.len(),
                    "backlogged conflicts resolved by new rules"
                );
            }
            // Resolutions, whoever made them, are kept for the replay so the
            // handlers do not run a second time.
            for id in std::mem::take(&mut self.blocking) {
                match ctx.conflict_manager.conflict(id) {
                    Ok(conflict) if conflict.is_resolved() => {
                        self.resolved_while_paused.push(conflict)
                    }
                    Ok(_) => self.blocking.push(id),
                    Err(_) => {}
                }
            }
            if self.blocking.is_empty() {
                break;
            }
        }

        tracing::info!(session = %self.config.session_id, "resuming after conflict pause");
        if self.state.current() == PipelineState::PausedByConflict {
            self.state.try_transit(PipelineSyncCommand::Resume)?;
        }
        self.state.command_transit_finished();
        self.publish(ctx);
        Ok(Checkpoint::Proceed)
    }
}

/// One attempt at applying a change group from `source` to `target`.
struct GroupApply<'a> {
    ctx: &'a PipelineContext,
    config: &'a SessionConfig,
    source: &'a mut Endpoint,
    target: &'a mut Endpoint,
    from_left: bool,
    resolved: &'a mut Vec<MigrationConflict>,
}

impl GroupApply<'_> {
    fn run(&mut self, group: &ChangeGroup, journal: &mut ApplyJournal) -> Result<Step> {
        let mut blocked = Vec::new();
        let mut batch = Vec::new();
        let mut replacements: BTreeMap<ActionId, Disposition> = BTreeMap::new();

        let detected = match self.source.analysis.detect_conflicts(group) {
            Ok(conflicts) => conflicts,
            Err(fault) => return Ok(Step::Fault(fault)),
        };
        for conflict in detected {
            let action_id = conflict.migration_action().map(|a| a.action_id);
            let disposition = self.raise(group, conflict)?;
            match (action_id, disposition) {
                (_, Disposition::StopGroup) => return Ok(Step::StopGroup),
                (_, Disposition::Fault(fault)) => return Ok(Step::Fault(fault)),
                (Some(id), disposition) => {
                    replacements.insert(id, disposition);
                }
                (None, Disposition::Blocked(conflict_id)) => blocked.push(conflict_id),
                (None, Disposition::Resolved(followups)) => {
                    for action in followups {
                        self.push_mapped(action, journal, &mut batch);
                    }
                }
                (None, Disposition::Skipped) => {}
            }
        }

        for action in group.pending_actions() {
            if journal.is_done(&action.action_id) {
                continue;
            }
            let disposition = match replacements.remove(&action.action_id) {
                Some(disposition) => disposition,
                None => match self.prepare(group, action, &mut batch)? {
                    Some(disposition) => disposition,
                    None => continue,
                },
            };
            match disposition {
                Disposition::Resolved(followups) if followups.is_empty() => {
                    journal.record(action.action_id)
                }
                Disposition::Resolved(followups) => {
                    for followup in followups {
                        self.push_mapped(followup, journal, &mut batch);
                    }
                }
                Disposition::Skipped => journal.record(action.action_id),
                Disposition::Blocked(conflict_id) => blocked.push(conflict_id),
                Disposition::StopGroup => return Ok(Step::StopGroup),
                Disposition::Fault(fault) => return Ok(Step::Fault(fault)),
            }
        }

        if !blocked.is_empty() {
            return Ok(Step::Blocked(blocked));
        }
        self.apply(group, batch, journal)
    }

    /// Check an action against the source's registrations and the session
    /// filters. Mapped actions go into `batch`; cloaked ones are dropped.
    /// Returns a disposition when the action raised a conflict.
    fn prepare(
        &mut self,
        group: &ChangeGroup,
        action: &MigrationAction,
        batch: &mut Vec<MigrationAction>,
    ) -> Result<Option<Disposition>> {
        if !self.source.change_actions.is_supported(&action.kind) {
            let conflict = builtin::unhandled_change_action_conflict(action);
            return self.raise(group, conflict).map(Some);
        }
        match self.config.map_path(&action.path, self.from_left) {
            PathMapping::Mapped(path) => {
                batch.push(self.translate(action, path));
                Ok(None)
            }
            PathMapping::Cloaked => Ok(Some(Disposition::Skipped)),
            PathMapping::NotMapped => {
                let conflict = builtin::path_not_mapped_conflict(action);
                self.raise(group, conflict).map(Some)
            }
        }
    }

    fn translate(&self, action: &MigrationAction, path: String) -> MigrationAction {
        let mut translated = action.clone();
        translated.path = path;
        if let Some(from_path) = &action.from_path {
            if let PathMapping::Mapped(mapped) = self.config.map_path(from_path, self.from_left) {
                translated.from_path = Some(mapped);
            }
        }
        translated
    }

    /// Follow-up actions are mapped but not checked for conflicts again.
    fn push_mapped(
        &self,
        action: MigrationAction,
        journal: &mut ApplyJournal,
        batch: &mut Vec<MigrationAction>,
    ) {
        match self.config.map_path(&action.path, self.from_left) {
            PathMapping::Mapped(path) => batch.push(self.translate(&action, path)),
            PathMapping::Cloaked | PathMapping::NotMapped => journal.record(action.action_id),
        }
    }

    /// Send the batch to the target, handling target-side conflicts and the
    /// follow-up actions their resolutions produce.
    fn apply(
        &mut self,
        group: &ChangeGroup,
        batch: Vec<MigrationAction>,
        journal: &mut ApplyJournal,
    ) -> Result<Step> {
        let mut blocked = Vec::new();
        let mut pending = batch;

        for _ in 0..MAX_FOLLOWUP_ROUNDS {
            if pending.is_empty() {
                break;
            }
            let outgoing = ChangeGroup::new(
                group.id,
                group.execution_order,
                group.source_id,
                group.name.clone(),
                std::mem::take(&mut pending),
            );
            let result = match self
                .target
                .migration
                .process_change_group(&outgoing, journal)
            {
                Ok(result) => result,
                Err(fault) => return Ok(Step::Fault(fault)),
            };
            for id in result.applied.iter().chain(&result.skipped) {
                journal.record(*id);
            }

            for conflict in result.conflicts {
                let action_id = conflict.migration_action().map(|a| a.action_id);
                match self.raise(group, conflict)? {
                    Disposition::Resolved(followups) if followups.is_empty() => {
                        if let Some(id) = action_id {
                            journal.record(id);
                        }
                    }
                    Disposition::Resolved(followups) => pending.extend(followups),
                    Disposition::Skipped => {
                        if let Some(id) = action_id {
                            journal.record(id);
                        }
                    }
                    Disposition::Blocked(conflict_id) => blocked.push(conflict_id),
                    Disposition::StopGroup => return Ok(Step::StopGroup),
                    Disposition::Fault(fault) => return Ok(Step::Fault(fault)),
                }
            }
        }

        if !pending.is_empty() {
            return Ok(Step::Fault(MigrationFault::new(
                kinds::UNRESOLVED_CONFLICT,
                format!(
                    "change group {} still has follow-up actions after {} rounds",
                    group.id, MAX_FOLLOWUP_ROUNDS
                ),
            )));
        }
        if !blocked.is_empty() {
            return Ok(Step::Blocked(blocked));
        }
        Ok(Step::Committed)
    }

    /// Take the earlier resolution of the same conflict, if there is one.
    fn take_resolved(&mut self, conflict: &MigrationConflict) -> Option<MigrationConflict> {
        let action_id = conflict.migration_action().map(|a| a.action_id);
        let index = self.resolved.iter().position(|resolved| {
            resolved.conflict_type_id == conflict.conflict_type_id
                && resolved.change_group_id == conflict.change_group_id
                && resolved.scope_hint == conflict.scope_hint
                && resolved.migration_action().map(|a| a.action_id) == action_id
        })?;
        Some(self.resolved.remove(index))
    }

    fn raise(&mut self, group: &ChangeGroup, conflict: MigrationConflict) -> Result<Disposition> {
        let conflict = conflict
            .in_session(self.config.session_id, group.source_id)
            .in_change_group(group.id);

        if let Some(resolved) = self.take_resolved(&conflict) {
            tracing::debug!(
                session = %self.config.session_id,
                conflict_id = ?resolved.id,
                "reusing resolution from conflict pause"
            );
            return Ok(Disposition::Resolved(resolved.followup_actions));
        }

        let outcome = match self.ctx.conflict_manager.raise_conflict(conflict) {
            Ok(outcome) => outcome,
            Err(Error::Fault(fault)) => return Ok(Disposition::Fault(fault)),
            Err(other) => return Err(other),
        };
        if outcome.resolved {
            return Ok(Disposition::Resolved(outcome.followup_actions));
        }

        Ok(match outcome.continuation {
            ContinuationPolicy::Continue => {
                tracing::warn!(
                    session = %self.config.session_id,
                    conflict_id = outcome.conflict_id,
                    "unresolved conflict recorded, continuing"
                );
                Disposition::Skipped
            }
            ContinuationPolicy::StopConflictedSession => Disposition::Blocked(outcome.conflict_id),
            ContinuationPolicy::StopSessionGroup => {
                let fault = MigrationFault::new(
                    kinds::UNRESOLVED_CONFLICT,
                    format!(
                        "conflict {} requires the session group to stop",
                        outcome.conflict_id
                    ),
                );
                if !self.ctx.error_manager.stop_session_group(&fault)? {
                    self.ctx.group_cancel.cancel();
                }
                Disposition::StopGroup
            }
        })
    }
}
