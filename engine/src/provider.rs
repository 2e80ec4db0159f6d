//! Adapter contracts.
//!
//! A migration source is represented by two providers: an
//! [`AnalysisProvider`] that reads its change history and a
//! [`MigrationProvider`] that writes changes into it. Providers report
//! failures as [`MigrationFault`]s; the pipeline routes them.

use crate::action::{ApplyJournal, ChangeActionRegistry, ChangeGroup};
use crate::conflict::MigrationConflict;
use crate::registry::ConflictTypeRegistry;
use crate::{ActionId, HighWaterMark, MigrationFault, MigrationSourceId};
use std::collections::BTreeSet;

pub type ProviderResult<T> = std::result::Result<T, MigrationFault>;

/// Reads a source system's change history.
///
/// The pipeline calls the registration hooks exactly once, in this order,
/// before the first call to [`generate_delta_table`](Self::generate_delta_table):
/// `initialize_services`, `initialize_client`, `register_conflict_types`,
/// `register_supported_content_types`, `register_supported_change_actions`.
pub trait AnalysisProvider: Send {
    fn initialize_services(&mut self) -> ProviderResult<()>;

    fn initialize_client(&mut self) -> ProviderResult<()>;

    fn register_conflict_types(
        &mut self,
        registry: &mut ConflictTypeRegistry,
        source_id: MigrationSourceId,
    ) -> ProviderResult<()>;

    fn register_supported_content_types(
        &mut self,
        content_types: &mut BTreeSet<String>,
    ) -> ProviderResult<()>;

    fn register_supported_change_actions(
        &mut self,
        actions: &mut ChangeActionRegistry,
    ) -> ProviderResult<()>;

    /// Change groups committed after `since`, the execution order of the
    /// last group the session committed.
    fn generate_delta_table(&mut self, since: HighWaterMark) -> ProviderResult<Vec<ChangeGroup>>;

    /// Conflicts the source can see before the group is applied.
    fn detect_conflicts(&mut self, group: &ChangeGroup) -> ProviderResult<Vec<MigrationConflict>>;
}

/// Outcome of applying a change group to a target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversionResult {
    pub applied: Vec<ActionId>,
    /// Actions the target already had, e.g. after a replay
    pub skipped: Vec<ActionId>,
    /// Conflicts the target raised; their actions were not applied
    pub conflicts: Vec<MigrationConflict>,
}

/// Writes changes into a target system.
pub trait MigrationProvider: Send {
    fn initialize_services(&mut self) -> ProviderResult<()>;

    fn initialize_client(&mut self) -> ProviderResult<()>;

    fn register_conflict_types(
        &mut self,
        registry: &mut ConflictTypeRegistry,
        source_id: MigrationSourceId,
    ) -> ProviderResult<()>;

    /// Synchronize endpoint context (metadata) from `peer` before changes.
    fn establish_context(&mut self, peer: MigrationSourceId) -> ProviderResult<()>;

    /// Apply the pending actions of `group`, recording each applied action
    /// in `journal` as soon as it is durable on the target.
    fn process_change_group(
        &mut self,
        group: &ChangeGroup,
        journal: &mut ApplyJournal,
    ) -> ProviderResult<ConversionResult>;
}

/// Both providers of one migration source, plus what the source registered.
pub struct Endpoint {
    pub source_id: MigrationSourceId,
    pub analysis: Box<dyn AnalysisProvider>,
    pub migration: Box<dyn MigrationProvider>,
    pub(crate) content_types: BTreeSet<String>,
    pub(crate) change_actions: ChangeActionRegistry,
}

impl Endpoint {
    pub fn new(
        source_id: MigrationSourceId,
        analysis: Box<dyn AnalysisProvider>,
        migration: Box<dyn MigrationProvider>,
    ) -> Self {
        Self {
            source_id,
            analysis,
            migration,
            content_types: BTreeSet::new(),
            change_actions: ChangeActionRegistry::new(),
        }
    }

    pub fn content_types(&self) -> &BTreeSet<String> {
        &self.content_types
    }

    pub fn change_actions(&self) -> &ChangeActionRegistry {
        &self.change_actions
    }

    /// Run the registration hooks in their required order. Any failure is
    /// returned as an initialization fault.
    pub(crate) fn initialize(&mut self, registry: &mut ConflictTypeRegistry) -> ProviderResult<()> {
        self.run_registration_hooks(registry)
            .map_err(MigrationFault::into_initialization)
    }

    fn run_registration_hooks(&mut self, registry: &mut ConflictTypeRegistry) -> ProviderResult<()> {
        let source_id = self.source_id;
        self.analysis.initialize_services()?;
        self.migration.initialize_services()?;
        self.analysis.initialize_client()?;
        self.migration.initialize_client()?;
        self.analysis.register_conflict_types(registry, source_id)?;
        self.migration.register_conflict_types(registry, source_id)?;
        self.analysis
            .register_supported_content_types(&mut self.content_types)?;
        self.analysis
            .register_supported_change_actions(&mut self.change_actions)?;
        Ok(())
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("source_id", &self.source_id)
            .field("content_types", &self.content_types)
            .finish_non_exhaustive()
    }
}
