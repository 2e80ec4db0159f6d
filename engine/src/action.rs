//! Change actions and change groups.
//!
//! Analysis providers express the delta of a source system as change groups:
//! ordered batches of actions that must be applied to the target together.
//! A change group is the unit of commit, cancellation and replay.

use crate::{ActionId, ChangeGroupId, MigrationSourceId};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;

/// What a migration action does to the target item.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ActionKind {
    Add,
    Edit,
    Delete,
    Rename,
    Branch,
    Merge,
    Undelete,
    Label,
    AddAttachment,
    DeleteAttachment,
    /// Adapter-specific action, identified by name
    Custom(String),
}

/// Application state of a single action within its change group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ActionState {
    #[default]
    Pending,
    Applied,
    Skipped,
}

/// A single change to replay on the target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationAction {
    /// Action ID, stable across replays
    pub action_id: ActionId,
    pub kind: ActionKind,
    /// Source-side path of the item
    pub path: String,
    /// Previous path, for renames, branches and merges
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_path: Option<String>,
    /// Adapter-specific content
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub state: ActionState,
}

impl MigrationAction {
    /// Create a pending action.
    pub fn new(
        action_id: ActionId,
        kind: ActionKind,
        path: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            action_id,
            kind,
            path: path.into(),
            from_path: None,
            payload,
            state: ActionState::Pending,
        }
    }

    pub fn with_from_path(mut self, from_path: impl Into<String>) -> Self {
        self.from_path = Some(from_path.into());
        self
    }

    pub fn is_pending(&self) -> bool {
        self.state == ActionState::Pending
    }
}

/// Kind of link change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LinkActionKind {
    Add,
    Delete,
}

/// A change to a link between two items.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkChangeAction {
    pub action_id: ActionId,
    pub kind: LinkActionKind,
    pub source_item: String,
    pub target_item: String,
    pub link_type: String,
}

impl LinkChangeAction {
    pub fn new(
        action_id: ActionId,
        kind: LinkActionKind,
        source_item: impl Into<String>,
        target_item: impl Into<String>,
        link_type: impl Into<String>,
    ) -> Self {
        Self {
            action_id,
            kind,
            source_item: source_item.into(),
            target_item: target_item.into(),
            link_type: link_type.into(),
        }
    }
}

/// Commit progress of a change group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChangeGroupStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
}

/// An ordered batch of actions from one source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeGroup {
    /// Source-assigned id; also the high-water mark once committed
    pub id: ChangeGroupId,
    /// Position in the source's commit order
    pub execution_order: u64,
    pub source_id: MigrationSourceId,
    pub name: String,
    pub actions: Vec<MigrationAction>,
    #[serde(default)]
    pub status: ChangeGroupStatus,
}

impl ChangeGroup {
    /// Create a pending change group.
    pub fn new(
        id: ChangeGroupId,
        execution_order: u64,
        source_id: MigrationSourceId,
        name: impl Into<String>,
        actions: Vec<MigrationAction>,
    ) -> Self {
        Self {
            id,
            execution_order,
            source_id,
            name: name.into(),
            actions,
            status: ChangeGroupStatus::Pending,
        }
    }

    /// Actions that still need to be applied.
    pub fn pending_actions(&self) -> impl Iterator<Item = &MigrationAction> {
        self.actions.iter().filter(|a| a.is_pending())
    }

    /// Mark actions as applied, e.g. when replaying an interrupted group.
    pub fn mark_applied(&mut self, applied: &BTreeSet<ActionId>) {
        for action in &mut self.actions {
            if applied.contains(&action.action_id) {
                action.state = ActionState::Applied;
            }
        }
    }
}

/// Change groups are applied by (execution_order, id).
impl Ord for ChangeGroup {
    fn cmp(&self, other: &Self) -> Ordering {
        self.execution_order
            .cmp(&other.execution_order)
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for ChangeGroup {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Record of the actions of one change group that are already done
/// (applied or deliberately skipped). Survives an interrupted apply so a
/// replay only sends what is left.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyJournal {
    pub change_group_id: ChangeGroupId,
    pub source_id: MigrationSourceId,
    #[serde(default)]
    done: BTreeSet<ActionId>,
}

impl ApplyJournal {
    pub fn new(change_group_id: ChangeGroupId, source_id: MigrationSourceId) -> Self {
        Self {
            change_group_id,
            source_id,
            done: BTreeSet::new(),
        }
    }

    /// Whether this journal belongs to `group`.
    pub fn tracks(&self, group: &ChangeGroup) -> bool {
        self.change_group_id == group.id && self.source_id == group.source_id
    }

    pub fn record(&mut self, action_id: ActionId) {
        self.done.insert(action_id);
    }

    pub fn is_done(&self, action_id: &ActionId) -> bool {
        self.done.contains(action_id)
    }

    pub fn done(&self) -> &BTreeSet<ActionId> {
        &self.done
    }
}

/// Change action kinds a source has declared it can produce.
#[derive(Debug, Clone, Default)]
pub struct ChangeActionRegistry {
    supported: BTreeSet<ActionKind>,
}

impl ChangeActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: ActionKind) {
        self.supported.insert(kind);
    }

    /// Only registered kinds are supported; an empty registry supports nothing.
    pub fn is_supported(&self, kind: &ActionKind) -> bool {
        self.supported.contains(kind)
    }

    pub fn len(&self) -> usize {
        self.supported.len()
    }

    pub fn is_empty(&self) -> bool {
        self.supported.is_empty()
    }
}
