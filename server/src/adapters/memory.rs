//! In-memory reference adapter.
//!
//! A memory source serves a change log seeded from its configuration and
//! accepts migrated changes into a path-keyed item map. It is what the
//! server runs when no real system is wired in, and what the integration
//! tests drive.
//!
//! Settings (all optional):
//!
//! - `changeLog`: JSON array of `{ "name", "actions": [{ "kind", "path", "payload" }] }`
//! - `items`: comma-separated paths that exist before the first trip
//! - `requiredFields`: comma-separated payload fields every add/edit must carry
//! - `missingItemContinuation`: continuation policy of `MissingItem`
//!   (`continue`, `stopConflictedSession` or `stopSessionGroup`)
//! - `failInitialization`: `"true"` makes `initialize_services` fail

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use ferry_engine::{
    ActionId, ActionKind, AnalysisProvider, ApplyJournal, ChangeActionRegistry, ChangeGroup,
    ConflictDetails, ConflictHandler, ConflictResolutionResult, ConflictType,
    ConflictTypeRegistry, ConflictedAction, ContinuationPolicy, ConversionResult, Error,
    MigrationAction, MigrationConflict, MigrationFault, MigrationProvider, MigrationSourceConfig,
    MigrationSourceId, ProviderResult, ResolutionAction, ResolutionOutcome, ResolutionType,
    ScopeInterpreter,
};
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

/// Edit or delete of an item the target does not have.
pub const MISSING_ITEM_ID: Uuid = Uuid::from_u128(0x3d9e_51a0_6b2c_4f7e_a418_c0de_0000_0001);
/// An add or edit whose payload lacks a required field.
pub const INVALID_FIELD_ID: Uuid = Uuid::from_u128(0x3d9e_51a0_6b2c_4f7e_a418_c0de_0000_0002);
/// Resolution of `MissingItem` that re-applies an edit as an add.
pub const CREATE_MISSING_ID: ActionId = Uuid::from_u128(0x3d9e_51a0_6b2c_4f7e_a418_c0de_0000_0101);

pub fn missing_item_type() -> ConflictType {
    let fallback = ConflictHandler::action_driven();
    ConflictType::builder(MISSING_ITEM_ID, "MissingItem")
        .scope(ScopeInterpreter::BasicPath)
        .action(ResolutionAction::skip())
        .action(ResolutionAction::retry())
        .action(ResolutionAction::manual())
        .action(ResolutionAction::new(CREATE_MISSING_ID, "CreateMissing"))
        .detail_key("path")
        .handler(ConflictHandler::new(
            |_, _| true,
            move |conflict, rule| {
                if rule.action_id != CREATE_MISSING_ID {
                    return fallback.resolve(conflict, rule);
                }
                let mut outcome = ResolutionOutcome::new(ConflictResolutionResult::resolved(
                    ResolutionType::UpdatedConflictedChange,
                ));
                if let Some(action) = conflict.migration_action() {
                    if action.kind != ActionKind::Delete {
                        let mut add = action.clone();
                        add.kind = ActionKind::Add;
                        outcome.followup_actions.push(add);
                    }
                }
                Ok(outcome)
            },
        ))
        .build()
}

pub fn invalid_field_type() -> ConflictType {
    ConflictType::builder(INVALID_FIELD_ID, "InvalidField")
        .scope(ScopeInterpreter::ExactString)
        .action(ResolutionAction::skip())
        .action(ResolutionAction::manual())
        .detail_key("field")
        .detail_key("path")
        .build()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SeedChangeSet {
    name: String,
    actions: Vec<SeedAction>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SeedAction {
    kind: ActionKind,
    path: String,
    #[serde(default)]
    from_path: Option<String>,
    #[serde(default)]
    payload: Value,
}

/// State of one memory source, shared by its two providers.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    source_id: MigrationSourceId,
    log: Vec<ChangeGroup>,
    items: BTreeMap<String, Value>,
    applied: BTreeSet<ActionId>,
    required_fields: Vec<String>,
    missing_item_continuation: ContinuationPolicy,
    fail_initialization: bool,
}

pub type SharedRepository = Arc<Mutex<MemoryRepository>>;

fn csv(raw: Option<&String>) -> impl Iterator<Item = String> + '_ {
    raw.into_iter()
        .flat_map(|s| s.split(','))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

impl MemoryRepository {
    pub fn new(source_id: MigrationSourceId) -> Self {
        Self {
            source_id,
            ..Self::default()
        }
    }

    /// Build a repository from a source's settings.
    pub fn from_config(config: &MigrationSourceConfig) -> ferry_engine::Result<Self> {
        let mut repository = Self::new(config.id);
        repository.items = csv(config.settings.get("items"))
            .map(|path| (path, Value::Null))
            .collect();
        repository.required_fields = csv(config.settings.get("requiredFields")).collect();
        repository.fail_initialization = config
            .settings
            .get("failInitialization")
            .is_some_and(|v| v.eq_ignore_ascii_case("true"));
        if let Some(raw) = config.settings.get("missingItemContinuation") {
            repository.missing_item_continuation =
                serde_json::from_value(Value::String(raw.clone())).map_err(|_| {
                    Error::InvalidConfig(format!("unknown continuation policy '{raw}'"))
                })?;
        }

        if let Some(raw) = config.settings.get("changeLog") {
            let seed: Vec<SeedChangeSet> = serde_json::from_str(raw).map_err(|e| {
                Error::InvalidConfig(format!(
                    "changeLog of source '{}': {e}",
                    config.friendly_name
                ))
            })?;
            for change_set in seed {
                let actions = change_set
                    .actions
                    .into_iter()
                    .map(|seed| (seed.kind, seed.path, seed.from_path, seed.payload))
                    .collect();
                repository.append_change_set(change_set.name, actions);
            }
        }
        Ok(repository)
    }

    /// Append a committed change set to the log and return its execution
    /// order. Action ids are derived from the source, order and position so
    /// a restarted server sees the same ids.
    pub fn append_change_set(
        &mut self,
        name: impl Into<String>,
        actions: Vec<(ActionKind, String, Option<String>, Value)>,
    ) -> u64 {
        let order = self.log.len() as u64 + 1;
        let actions = actions
            .into_iter()
            .enumerate()
            .map(|(index, (kind, path, from_path, payload))| {
                let id = Uuid::new_v5(&self.source_id, format!("{order}/{index}").as_bytes());
                let action = MigrationAction::new(id, kind, path, payload);
                match from_path {
                    Some(from) => action.with_from_path(from),
                    None => action,
                }
            })
            .collect();
        self.log
            .push(ChangeGroup::new(order, order, self.source_id, name, actions));
        order
    }

    pub fn items(&self) -> &BTreeMap<String, Value> {
        &self.items
    }

    pub fn contains(&self, path: &str) -> bool {
        self.items.contains_key(path)
    }

    pub fn applied_count(&self) -> usize {
        self.applied.len()
    }

    pub fn log_len(&self) -> usize {
        self.log.len()
    }

    fn missing_field(&self, action: &MigrationAction) -> Option<&str> {
        if !matches!(action.kind, ActionKind::Add | ActionKind::Edit) {
            return None;
        }
        self.required_fields
            .iter()
            .find(|field| action.payload.get(field.as_str()).is_none())
            .map(String::as_str)
    }

    /// Apply one action. Returns a conflict when the action cannot apply.
    fn apply(&mut self, action: &MigrationAction) -> Option<MigrationConflict> {
        let exists = self.items.contains_key(&action.path);
        match action.kind {
            ActionKind::Edit | ActionKind::Delete if !exists => {
                return Some(
                    MigrationConflict::new(
                        MISSING_ITEM_ID,
                        action.path.clone(),
                        ConflictDetails::properties([("path".to_string(), action.path.clone())]),
                    )
                    .with_action(ConflictedAction::Migration(action.clone())),
                );
            }
            ActionKind::Delete => {
                self.items.remove(&action.path);
            }
            ActionKind::Rename => {
                let value = action
                    .from_path
                    .as_ref()
                    .and_then(|from| self.items.remove(from))
                    .unwrap_or_else(|| action.payload.clone());
                self.items.insert(action.path.clone(), value);
            }
            _ => {
                self.items.insert(action.path.clone(), action.payload.clone());
            }
        }
        self.applied.insert(action.action_id);
        None
    }
}

fn lock(repository: &SharedRepository) -> MutexGuard<'_, MemoryRepository> {
    repository.lock().unwrap_or_else(|e| e.into_inner())
}

fn check_initialization(repository: &SharedRepository) -> ProviderResult<()> {
    if lock(repository).fail_initialization {
        return Err(MigrationFault::new(
            "ServiceUnavailable",
            "memory source configured to fail initialization",
        ));
    }
    Ok(())
}

/// Reads the seeded change log.
pub struct MemoryAnalysis {
    repository: SharedRepository,
}

impl MemoryAnalysis {
    pub fn new(repository: SharedRepository) -> Self {
        Self { repository }
    }
}

impl AnalysisProvider for MemoryAnalysis {
    fn initialize_services(&mut self) -> ProviderResult<()> {
        check_initialization(&self.repository)
    }

    fn initialize_client(&mut self) -> ProviderResult<()> {
        Ok(())
    }

    fn register_conflict_types(
        &mut self,
        registry: &mut ConflictTypeRegistry,
        source_id: MigrationSourceId,
    ) -> ProviderResult<()> {
        registry.register_for_source(
            source_id,
            invalid_field_type(),
            ContinuationPolicy::StopConflictedSession,
        );
        Ok(())
    }

    fn register_supported_content_types(
        &mut self,
        content_types: &mut BTreeSet<String>,
    ) -> ProviderResult<()> {
        content_types.insert("item".to_string());
        Ok(())
    }

    fn register_supported_change_actions(
        &mut self,
        actions: &mut ChangeActionRegistry,
    ) -> ProviderResult<()> {
        for kind in [
            ActionKind::Add,
            ActionKind::Edit,
            ActionKind::Delete,
            ActionKind::Rename,
        ] {
            actions.register(kind);
        }
        Ok(())
    }

    fn generate_delta_table(&mut self, since: u64) -> ProviderResult<Vec<ChangeGroup>> {
        Ok(lock(&self.repository)
            .log
            .iter()
            .filter(|group| group.execution_order > since)
            .cloned()
            .collect())
    }

    fn detect_conflicts(&mut self, group: &ChangeGroup) -> ProviderResult<Vec<MigrationConflict>> {
        let repository = lock(&self.repository);
        Ok(group
            .pending_actions()
            .filter_map(|action| {
                let field = repository.missing_field(action)?;
                Some(
                    MigrationConflict::new(
                        INVALID_FIELD_ID,
                        field,
                        ConflictDetails::properties([
                            ("field".to_string(), field.to_string()),
                            ("path".to_string(), action.path.clone()),
                        ]),
                    )
                    .with_action(ConflictedAction::Migration(action.clone())),
                )
            })
            .collect())
    }
}

/// Applies migrated changes to the item map.
///
/// Actions the repository already applied are reported as skipped, so a
/// replayed change group never applies an action twice.
pub struct MemoryMigration {
    repository: SharedRepository,
}

impl MemoryMigration {
    pub fn new(repository: SharedRepository) -> Self {
        Self { repository }
    }
}

impl MigrationProvider for MemoryMigration {
    fn initialize_services(&mut self) -> ProviderResult<()> {
        check_initialization(&self.repository)
    }

    fn initialize_client(&mut self) -> ProviderResult<()> {
        Ok(())
    }

    fn register_conflict_types(
        &mut self,
        registry: &mut ConflictTypeRegistry,
        source_id: MigrationSourceId,
    ) -> ProviderResult<()> {
        let continuation = lock(&self.repository).missing_item_continuation;
        registry.register_for_source(source_id, missing_item_type(), continuation);
        Ok(())
    }

    fn establish_context(&mut self, peer: MigrationSourceId) -> ProviderResult<()> {
        tracing::debug!(source = %lock(&self.repository).source_id, %peer, "context established");
        Ok(())
    }

    fn process_change_group(
        &mut self,
        group: &ChangeGroup,
        journal: &mut ApplyJournal,
    ) -> ProviderResult<ConversionResult> {
        let mut repository = lock(&self.repository);
        let mut result = ConversionResult::default();

        for action in group.pending_actions() {
            if repository.applied.contains(&action.action_id) {
                result.skipped.push(action.action_id);
                continue;
            }
            match repository.apply(action) {
                Some(conflict) => result.conflicts.push(conflict),
                None => {
                    journal.record(action.action_id);
                    result.applied.push(action.action_id);
                }
            }
        }
        Ok(result)
    }
}
