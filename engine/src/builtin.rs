//! Conflict types every session group understands.

use crate::action::MigrationAction;
use crate::conflict::{
    ConflictDetails, ConflictType, ConflictedAction, ContinuationPolicy, MigrationConflict,
    ResolutionAction,
};
use crate::scope::ScopeInterpreter;
use crate::{ConflictTypeId, MigrationFault};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Unhandled runtime fault surfaced as a conflict.
pub const RUNTIME_ERROR_ID: ConflictTypeId = Uuid::from_u128(0x1b6c_2e4a_8f0d_4a3e_b5c1_77d2_9e40_0001);
/// A path that no filter pair of the session maps.
pub const PATH_NOT_MAPPED_ID: ConflictTypeId = Uuid::from_u128(0x1b6c_2e4a_8f0d_4a3e_b5c1_77d2_9e40_0002);
/// A change action kind the source never registered.
pub const UNHANDLED_CHANGE_ACTION_ID: ConflictTypeId =
    Uuid::from_u128(0x1b6c_2e4a_8f0d_4a3e_b5c1_77d2_9e40_0003);

pub fn runtime_error_type() -> ConflictType {
    ConflictType::builder(RUNTIME_ERROR_ID, "RuntimeError")
        .scope(ScopeInterpreter::Global)
        .action(ResolutionAction::manual())
        .action(ResolutionAction::skip())
        .detail_key("kind")
        .detail_key("message")
        .build()
}

pub fn path_not_mapped_type() -> ConflictType {
    ConflictType::builder(PATH_NOT_MAPPED_ID, "PathNotMapped")
        .scope(ScopeInterpreter::BasicPath)
        .action(ResolutionAction::skip())
        .action(ResolutionAction::manual())
        .detail_key("path")
        .build()
}

pub fn unhandled_change_action_type() -> ConflictType {
    ConflictType::builder(UNHANDLED_CHANGE_ACTION_ID, "UnhandledChangeAction")
        .scope(ScopeInterpreter::ExactString)
        .action(ResolutionAction::skip())
        .action(ResolutionAction::manual())
        .detail_key("actionKind")
        .detail_key("path")
        .build()
}

pub(crate) fn toolkit_conflict_types() -> Vec<(ConflictType, ContinuationPolicy)> {
    vec![
        (runtime_error_type(), ContinuationPolicy::StopConflictedSession),
        (path_not_mapped_type(), ContinuationPolicy::StopConflictedSession),
        (unhandled_change_action_type(), ContinuationPolicy::StopConflictedSession),
    ]
}

/// Conflict raised for a fault no error signature claimed.
pub fn runtime_error_conflict(fault: &MigrationFault) -> MigrationConflict {
    let mut details = BTreeMap::new();
    details.insert("kind".to_string(), fault.kind.clone());
    details.insert("message".to_string(), fault.message.clone());
    if let Some(inner) = fault.inner() {
        details.insert("inner".to_string(), inner.to_string());
    }
    MigrationConflict::new(RUNTIME_ERROR_ID, fault.kind.clone(), ConflictDetails::Properties(details))
}

pub fn path_not_mapped_conflict(action: &MigrationAction) -> MigrationConflict {
    let details = ConflictDetails::properties([("path".to_string(), action.path.clone())]);
    MigrationConflict::new(PATH_NOT_MAPPED_ID, action.path.clone(), details)
        .with_action(ConflictedAction::Migration(action.clone()))
}

/// The scope hint is the action kind name, so rules can target one kind.
pub fn unhandled_change_action_conflict(action: &MigrationAction) -> MigrationConflict {
    let kind = action_kind_name(action);
    let details = ConflictDetails::properties([
        ("actionKind".to_string(), kind.clone()),
        ("path".to_string(), action.path.clone()),
    ]);
    MigrationConflict::new(UNHANDLED_CHANGE_ACTION_ID, kind, details)
        .with_action(ConflictedAction::Migration(action.clone()))
}

fn action_kind_name(action: &MigrationAction) -> String {
    match &action.kind {
        crate::action::ActionKind::Custom(name) => name.clone(),
        other => serde_json::to_value(other)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| format!("{other:?}")),
    }
}
