//! Scripted providers shared by the integration tests.

#![allow(dead_code)]

use ferry_engine::{
    ActionId, ActionKind, AnalysisProvider, ApplyJournal, CancellationToken, ChangeActionRegistry,
    ChangeGroup, ConflictDetails, ConflictManager, ConflictType, ConflictTypeRegistry,
    ConflictedAction, ContinuationPolicy, ConversionResult, Endpoint, ErrorManager,
    MigrationAction, MigrationConflict, MigrationFault, MigrationProvider, MigrationSourceId,
    PipelineContext, ProviderResult, ResolutionAction, ScopeInterpreter, SessionConfig,
    SessionObserver, SessionPipeline, SessionReport,
};
use serde_json::json;
use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

/// Conflict type the scripted target raises for edits of unknown items.
pub const MISSING_ITEM_ID: Uuid = Uuid::from_u128(0x7a11_0000_0000_4000_8000_0000_0000_0001);

pub fn missing_item_type() -> ConflictType {
    ConflictType::builder(MISSING_ITEM_ID, "MissingItem")
        .scope(ScopeInterpreter::BasicPath)
        .action(ResolutionAction::skip())
        .action(ResolutionAction::retry())
        .action(ResolutionAction::manual())
        .build()
}

pub fn action(kind: ActionKind, path: &str) -> MigrationAction {
    MigrationAction::new(Uuid::new_v4(), kind, path, json!({ "content": path }))
}

pub fn group(source: MigrationSourceId, order: u64, actions: Vec<MigrationAction>) -> ChangeGroup {
    ChangeGroup::new(order, order, source, format!("changeset {order}"), actions)
}

/// Source that serves a fixed change log.
#[derive(Default)]
pub struct ScriptedSource {
    pub groups: Vec<ChangeGroup>,
    /// Faults returned by the next delta table requests
    pub delta_faults: VecDeque<MigrationFault>,
}

impl ScriptedSource {
    pub fn new(groups: Vec<ChangeGroup>) -> Self {
        Self {
            groups,
            delta_faults: VecDeque::new(),
        }
    }
}

impl AnalysisProvider for ScriptedSource {
    fn initialize_services(&mut self) -> ProviderResult<()> {
        Ok(())
    }

    fn initialize_client(&mut self) -> ProviderResult<()> {
        Ok(())
    }

    fn register_conflict_types(
        &mut self,
        _registry: &mut ConflictTypeRegistry,
        _source_id: MigrationSourceId,
    ) -> ProviderResult<()> {
        Ok(())
    }

    fn register_supported_content_types(
        &mut self,
        content_types: &mut BTreeSet<String>,
    ) -> ProviderResult<()> {
        content_types.insert("file".into());
        Ok(())
    }

    fn register_supported_change_actions(
        &mut self,
        actions: &mut ChangeActionRegistry,
    ) -> ProviderResult<()> {
        for kind in [ActionKind::Add, ActionKind::Edit, ActionKind::Delete, ActionKind::Rename] {
            actions.register(kind);
        }
        Ok(())
    }

    fn generate_delta_table(&mut self, since: u64) -> ProviderResult<Vec<ChangeGroup>> {
        if let Some(fault) = self.delta_faults.pop_front() {
            return Err(fault);
        }
        Ok(self
            .groups
            .iter()
            .filter(|g| g.execution_order > since)
            .cloned()
            .collect())
    }

    fn detect_conflicts(&mut self, _group: &ChangeGroup) -> ProviderResult<Vec<MigrationConflict>> {
        Ok(Vec::new())
    }
}

/// What the scripted target has seen, shared with the test.
#[derive(Debug, Default)]
pub struct TargetLog {
    /// Every action id the target applied, in order, duplicates included
    pub applied: Vec<ActionId>,
    pub items: BTreeSet<String>,
}

/// Target that applies actions into a path set.
///
/// Edits and deletes of unknown items raise `MissingItem`. Faults queued in
/// `faults_after` fire after the given number of actions of the next call.
#[derive(Default)]
pub struct ScriptedTarget {
    pub log: Arc<Mutex<TargetLog>>,
    pub faults_after: Arc<Mutex<VecDeque<(usize, MigrationFault)>>>,
    pub continuation: ContinuationPolicy,
}

impl ScriptedTarget {
    pub fn new(log: Arc<Mutex<TargetLog>>) -> Self {
        Self {
            log,
            faults_after: Arc::default(),
            continuation: ContinuationPolicy::StopConflictedSession,
        }
    }

    pub fn with_continuation(mut self, continuation: ContinuationPolicy) -> Self {
        self.continuation = continuation;
        self
    }

    pub fn fail_after(&self, applied: usize, fault: MigrationFault) {
        self.faults_after.lock().unwrap().push_back((applied, fault));
    }
}

impl MigrationProvider for ScriptedTarget {
    fn initialize_services(&mut self) -> ProviderResult<()> {
        Ok(())
    }

    fn initialize_client(&mut self) -> ProviderResult<()> {
        Ok(())
    }

    fn register_conflict_types(
        &mut self,
        registry: &mut ConflictTypeRegistry,
        source_id: MigrationSourceId,
    ) -> ProviderResult<()> {
        registry.register_for_source(source_id, missing_item_type(), self.continuation);
        Ok(())
    }

    fn establish_context(&mut self, _peer: MigrationSourceId) -> ProviderResult<()> {
        Ok(())
    }

    fn process_change_group(
        &mut self,
        group: &ChangeGroup,
        journal: &mut ApplyJournal,
    ) -> ProviderResult<ConversionResult> {
        let fault = self.faults_after.lock().unwrap().pop_front();
        let mut result = ConversionResult::default();
        let mut log = self.log.lock().unwrap();

        for (count, action) in group.pending_actions().enumerate() {
            if let Some((after, fault)) = &fault {
                if count == *after {
                    return Err(fault.clone());
                }
            }
            if log.applied.contains(&action.action_id) {
                result.skipped.push(action.action_id);
                continue;
            }
            let exists = log.items.contains(&action.path);
            match action.kind {
                ActionKind::Edit | ActionKind::Delete if !exists => {
                    let conflict = MigrationConflict::new(
                        MISSING_ITEM_ID,
                        action.path.clone(),
                        ConflictDetails::properties([("path".to_string(), action.path.clone())]),
                    )
                    .with_action(ConflictedAction::Migration(action.clone()));
                    result.conflicts.push(conflict);
                    continue;
                }
                ActionKind::Delete => {
                    log.items.remove(&action.path);
                }
                _ => {
                    log.items.insert(action.path.clone());
                }
            }
            log.applied.push(action.action_id);
            journal.record(action.action_id);
            result.applied.push(action.action_id);
        }
        Ok(result)
    }
}

/// Migration provider for the side of a session that only reads.
#[derive(Default)]
pub struct IdleTarget;

impl MigrationProvider for IdleTarget {
    fn initialize_services(&mut self) -> ProviderResult<()> {
        Ok(())
    }

    fn initialize_client(&mut self) -> ProviderResult<()> {
        Ok(())
    }

    fn register_conflict_types(
        &mut self,
        _registry: &mut ConflictTypeRegistry,
        _source_id: MigrationSourceId,
    ) -> ProviderResult<()> {
        Ok(())
    }

    fn establish_context(&mut self, _peer: MigrationSourceId) -> ProviderResult<()> {
        Ok(())
    }

    fn process_change_group(
        &mut self,
        _group: &ChangeGroup,
        _journal: &mut ApplyJournal,
    ) -> ProviderResult<ConversionResult> {
        Ok(ConversionResult::default())
    }
}

/// Observer that keeps every published report.
#[derive(Default)]
pub struct RecordingObserver {
    pub reports: Mutex<Vec<SessionReport>>,
}

impl RecordingObserver {
    pub fn last(&self) -> Option<SessionReport> {
        self.reports.lock().unwrap().last().cloned()
    }
}

impl SessionObserver for RecordingObserver {
    fn publish(&self, report: &SessionReport) {
        self.reports.lock().unwrap().push(report.clone());
    }
}

pub struct Harness {
    pub left_id: MigrationSourceId,
    pub right_id: MigrationSourceId,
    pub config: SessionConfig,
    pub registry: ConflictTypeRegistry,
}

impl Harness {
    pub fn new() -> Self {
        let left_id = Uuid::new_v4();
        let right_id = Uuid::new_v4();
        let mut config = SessionConfig::new(Uuid::new_v4(), "left to right", left_id, right_id);
        config.retry.base_delay_ms = 1;
        config.retry.max_delay_ms = 5;
        Self {
            left_id,
            right_id,
            config,
            registry: ConflictTypeRegistry::new(),
        }
    }

    /// Initialized pipeline moving `source`'s change log into `target`.
    pub fn pipeline(&mut self, source: ScriptedSource, target: ScriptedTarget) -> SessionPipeline {
        let left = Endpoint::new(self.left_id, Box::new(source), Box::new(IdleTarget));
        let right = Endpoint::new(self.right_id, Box::new(ScriptedSource::default()), Box::new(target));
        let mut pipeline = SessionPipeline::new(self.config.clone(), left, right)
            .expect("endpoints match the session");
        pipeline
            .initialize(&mut self.registry)
            .expect("scripted providers initialize");
        pipeline
    }

    pub fn context(&self, error_manager: ErrorManager, cancel: CancellationToken) -> PipelineContext {
        PipelineContext::new(
            Arc::new(ConflictManager::new(Arc::new(self.registry.clone()))),
            Arc::new(error_manager),
            cancel,
        )
        .with_poll_intervals(Duration::from_millis(5), Duration::from_millis(5))
    }
}

/// Run `f` on a helper thread once `condition` holds, polling briefly.
pub fn when<C, F>(condition: C, f: F) -> std::thread::JoinHandle<()>
where
    C: Fn() -> bool + Send + 'static,
    F: FnOnce() + Send + 'static,
{
    std::thread::spawn(move || {
        for _ in 0..2_000 {
            if condition() {
                break;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        f();
    })
}
