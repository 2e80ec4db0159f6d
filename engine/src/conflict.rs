//! Conflict types, conflicts and resolution rules.
//!
//! A [`ConflictType`] is an immutable descriptor: identity, a
//! [`ConflictHandler`] (a pair of closures), the [`ResolutionAction`]s it
//! accepts and the [`ScopeInterpreter`] used to match rule scopes.
//!
//! Conflicts are raised as [`MigrationConflict`] values and resolved by
//! [`ConflictResolutionRule`]s registered against their type.

use crate::action::{LinkChangeAction, MigrationAction};
use crate::scope::ScopeInterpreter;
use crate::{
    ActionId, ChangeGroupId, ConflictId, ConflictTypeId, MigrationFault, MigrationSourceId,
    RuleId, SessionId,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// A named way of resolving a conflict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionAction {
    pub reference_id: ActionId,
    pub name: String,
    /// Keys a rule using this action is expected to carry in its data
    #[serde(default)]
    pub data_keys: Vec<String>,
}

impl ResolutionAction {
    pub const SKIP_ID: ActionId = Uuid::from_u128(0x5e0b_4f3c_7d1a_4c52_9b7e_2f6a_0c11_d001);
    pub const MANUAL_ID: ActionId = Uuid::from_u128(0x5e0b_4f3c_7d1a_4c52_9b7e_2f6a_0c11_d002);
    pub const RETRY_ID: ActionId = Uuid::from_u128(0x5e0b_4f3c_7d1a_4c52_9b7e_2f6a_0c11_d003);

    pub fn new(reference_id: ActionId, name: impl Into<String>) -> Self {
        Self {
            reference_id,
            name: name.into(),
            data_keys: Vec::new(),
        }
    }

    pub fn with_data_key(mut self, key: impl Into<String>) -> Self {
        self.data_keys.push(key.into());
        self
    }

    /// Drop the conflicted change and move on.
    pub fn skip() -> Self {
        Self::new(Self::SKIP_ID, "Skip")
    }

    /// Leave the conflict for a human.
    pub fn manual() -> Self {
        Self::new(Self::MANUAL_ID, "Manual")
    }

    /// Re-apply the conflicted change.
    pub fn retry() -> Self {
        Self::new(Self::RETRY_ID, "Retry")
    }
}

/// What the pipeline does when a conflict of a type stays unresolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ContinuationPolicy {
    /// Record the conflict and keep going.
    Continue,
    /// Pause the conflicted session until the conflict is resolved.
    #[default]
    StopConflictedSession,
    /// Stop every session in the group.
    StopSessionGroup,
}

/// Conflict details: a structured property bag, or legacy free text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum ConflictDetails {
    Text(String),
    Properties(BTreeMap<String, String>),
}

impl ConflictDetails {
    /// Parse raw details. A JSON object becomes a property bag; anything
    /// else is kept as text.
    pub fn parse(raw: &str) -> Self {
        Self::try_parse_properties(raw).unwrap_or_else(|| ConflictDetails::Text(raw.to_string()))
    }

    fn try_parse_properties(raw: &str) -> Option<Self> {
        let trimmed = raw.trim_start();
        if !trimmed.starts_with('{') {
            return None;
        }
        let object: BTreeMap<String, serde_json::Value> = serde_json::from_str(trimmed).ok()?;
        let properties = object
            .into_iter()
            .map(|(key, value)| match value {
                serde_json::Value::String(s) => (key, s),
                other => (key, other.to_string()),
            })
            .collect();
        Some(ConflictDetails::Properties(properties))
    }

    pub fn properties(entries: impl IntoIterator<Item = (String, String)>) -> Self {
        ConflictDetails::Properties(entries.into_iter().collect())
    }

    /// Look up a property. Text details have none.
    pub fn get(&self, key: &str) -> Option<&str> {
        match self {
            ConflictDetails::Text(_) => None,
            ConflictDetails::Properties(map) => map.get(key).map(String::as_str),
        }
    }
}

impl Default for ConflictDetails {
    fn default() -> Self {
        ConflictDetails::Text(String::new())
    }
}

impl fmt::Display for ConflictDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictDetails::Text(text) => f.write_str(text),
            ConflictDetails::Properties(map) => {
                let mut first = true;
                for (key, value) in map {
                    if !first {
                        f.write_str(", ")?;
                    }
                    write!(f, "{key}={value}")?;
                    first = false;
                }
                Ok(())
            }
        }
    }
}

/// The change a conflict was raised against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ConflictedAction {
    Migration(MigrationAction),
    Link(LinkChangeAction),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConflictStatus {
    #[default]
    Unresolved,
    Resolved,
}

/// A conflict instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationConflict {
    /// Assigned when the conflict is persisted
    #[serde(default)]
    pub id: Option<ConflictId>,
    pub conflict_type_id: ConflictTypeId,
    #[serde(default)]
    pub status: ConflictStatus,
    #[serde(default)]
    pub details: ConflictDetails,
    /// Matched against rule scopes by the type's interpreter
    pub scope_hint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflicted_action: Option<ConflictedAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<MigrationSourceId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_group_id: Option<ChangeGroupId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_by_rule: Option<RuleId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution_comment: Option<String>,
    /// Actions the accepted resolution asked the pipeline to apply
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub followup_actions: Vec<MigrationAction>,
}

impl MigrationConflict {
    pub fn new(
        conflict_type_id: ConflictTypeId,
        scope_hint: impl Into<String>,
        details: ConflictDetails,
    ) -> Self {
        Self {
            id: None,
            conflict_type_id,
            status: ConflictStatus::Unresolved,
            details,
            scope_hint: scope_hint.into(),
            conflicted_action: None,
            session_id: None,
            source_id: None,
            change_group_id: None,
            resolved_by_rule: None,
            resolution_comment: None,
            followup_actions: Vec::new(),
        }
    }

    pub fn with_action(mut self, action: ConflictedAction) -> Self {
        self.conflicted_action = Some(action);
        self
    }

    pub fn in_session(mut self, session_id: SessionId, source_id: MigrationSourceId) -> Self {
        self.session_id = Some(session_id);
        self.source_id = Some(source_id);
        self
    }

    pub fn in_change_group(mut self, change_group_id: ChangeGroupId) -> Self {
        self.change_group_id = Some(change_group_id);
        self
    }

    pub fn is_resolved(&self) -> bool {
        self.status == ConflictStatus::Resolved
    }

    /// The conflicted migration action, if the conflict carries one.
    pub fn migration_action(&self) -> Option<&MigrationAction> {
        match &self.conflicted_action {
            Some(ConflictedAction::Migration(action)) => Some(action),
            _ => None,
        }
    }
}

/// A stored resolution rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictResolutionRule {
    pub reference_id: RuleId,
    pub conflict_type_id: ConflictTypeId,
    /// Resolution action this rule applies
    pub action_id: ActionId,
    /// Interpreted by the conflict type's scope interpreter
    pub applicability_scope: String,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
    #[serde(default)]
    pub description: String,
    /// Registration order, assigned by the conflict manager
    #[serde(default)]
    pub sequence: u64,
    #[serde(default)]
    pub deprecated: bool,
}

impl ConflictResolutionRule {
    pub fn new(
        conflict_type_id: ConflictTypeId,
        action_id: ActionId,
        applicability_scope: impl Into<String>,
    ) -> Self {
        Self {
            reference_id: Uuid::new_v4(),
            conflict_type_id,
            action_id,
            applicability_scope: applicability_scope.into(),
            data: BTreeMap::new(),
            description: String::new(),
            sequence: 0,
            deprecated: false,
        }
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// How a conflict got resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResolutionType {
    SkipConflictedChange,
    RetryConflictedChange,
    UpdatedConflictedChange,
    Manual,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictResolutionResult {
    pub resolved: bool,
    pub resolution_type: ResolutionType,
    #[serde(default)]
    pub comment: String,
}

impl ConflictResolutionResult {
    pub fn resolved(resolution_type: ResolutionType) -> Self {
        Self {
            resolved: true,
            resolution_type,
            comment: String::new(),
        }
    }

    pub fn unresolved(resolution_type: ResolutionType, comment: impl Into<String>) -> Self {
        Self {
            resolved: false,
            resolution_type,
            comment: comment.into(),
        }
    }
}

/// Result of a handler's `resolve` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolutionOutcome {
    pub result: ConflictResolutionResult,
    /// Actions the pipeline must apply as part of the resolution
    pub followup_actions: Vec<MigrationAction>,
}

impl ResolutionOutcome {
    pub fn new(result: ConflictResolutionResult) -> Self {
        Self {
            result,
            followup_actions: Vec::new(),
        }
    }
}

type CanResolveFn = dyn Fn(&MigrationConflict, &ConflictResolutionRule) -> bool + Send + Sync;
type ResolveFn = dyn Fn(&MigrationConflict, &ConflictResolutionRule) -> std::result::Result<ResolutionOutcome, MigrationFault>
    + Send
    + Sync;

/// Resolution behavior of a conflict type.
#[derive(Clone)]
pub struct ConflictHandler {
    can_resolve: Arc<CanResolveFn>,
    resolve: Arc<ResolveFn>,
}

impl ConflictHandler {
    pub fn new<C, R>(can_resolve: C, resolve: R) -> Self
    where
        C: Fn(&MigrationConflict, &ConflictResolutionRule) -> bool + Send + Sync + 'static,
        R: Fn(&MigrationConflict, &ConflictResolutionRule) -> std::result::Result<ResolutionOutcome, MigrationFault>
            + Send
            + Sync
            + 'static,
    {
        Self {
            can_resolve: Arc::new(can_resolve),
            resolve: Arc::new(resolve),
        }
    }

    /// Handler that resolves by the rule's built-in action: Skip resolves,
    /// Retry resolves and replays the conflicted action, Manual and anything
    /// else leave the conflict unresolved.
    pub fn action_driven() -> Self {
        Self::new(|_, _| true, resolve_by_action)
    }

    pub fn can_resolve(&self, conflict: &MigrationConflict, rule: &ConflictResolutionRule) -> bool {
        (self.can_resolve)(conflict, rule)
    }

    pub fn resolve(
        &self,
        conflict: &MigrationConflict,
        rule: &ConflictResolutionRule,
    ) -> std::result::Result<ResolutionOutcome, MigrationFault> {
        (self.resolve)(conflict, rule)
    }
}

impl Default for ConflictHandler {
    fn default() -> Self {
        Self::action_driven()
    }
}

impl fmt::Debug for ConflictHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConflictHandler").finish_non_exhaustive()
    }
}

fn resolve_by_action(
    conflict: &MigrationConflict,
    rule: &ConflictResolutionRule,
) -> std::result::Result<ResolutionOutcome, MigrationFault> {
    let outcome = match rule.action_id {
        id if id == ResolutionAction::SKIP_ID => ResolutionOutcome::new(
            ConflictResolutionResult::resolved(ResolutionType::SkipConflictedChange),
        ),
        id if id == ResolutionAction::RETRY_ID => {
            let mut outcome = ResolutionOutcome::new(ConflictResolutionResult::resolved(
                ResolutionType::RetryConflictedChange,
            ));
            if let Some(action) = conflict.migration_action() {
                outcome.followup_actions.push(action.clone());
            }
            outcome
        }
        id if id == ResolutionAction::MANUAL_ID => ResolutionOutcome::new(
            ConflictResolutionResult::unresolved(ResolutionType::Manual, "manual resolution required"),
        ),
        other => ResolutionOutcome::new(ConflictResolutionResult::unresolved(
            ResolutionType::Other,
            format!("no automatic resolution for action {other}"),
        )),
    };
    Ok(outcome)
}

/// Descriptor of a kind of conflict.
#[derive(Debug, Clone)]
pub struct ConflictType {
    pub reference_id: ConflictTypeId,
    pub name: String,
    pub handler: ConflictHandler,
    pub supported_actions: BTreeMap<ActionId, ResolutionAction>,
    pub scope: ScopeInterpreter,
    /// Property keys the type puts in its details
    pub detail_keys: Vec<String>,
}

impl ConflictType {
    pub fn builder(reference_id: ConflictTypeId, name: impl Into<String>) -> ConflictTypeBuilder {
        ConflictTypeBuilder {
            inner: ConflictType {
                reference_id,
                name: name.into(),
                handler: ConflictHandler::action_driven(),
                supported_actions: BTreeMap::new(),
                scope: ScopeInterpreter::default(),
                detail_keys: Vec::new(),
            },
        }
    }

    pub fn supports_action(&self, action_id: &ActionId) -> bool {
        self.supported_actions.contains_key(action_id)
    }

    pub fn action(&self, action_id: &ActionId) -> Option<&ResolutionAction> {
        self.supported_actions.get(action_id)
    }
}

/// Builder for [`ConflictType`].
pub struct ConflictTypeBuilder {
    inner: ConflictType,
}

impl ConflictTypeBuilder {
    pub fn handler(mut self, handler: ConflictHandler) -> Self {
        self.inner.handler = handler;
        self
    }

    pub fn action(mut self, action: ResolutionAction) -> Self {
        self.inner
            .supported_actions
            .insert(action.reference_id, action);
        self
    }

    pub fn scope(mut self, scope: ScopeInterpreter) -> Self {
        self.inner.scope = scope;
        self
    }

    pub fn detail_key(mut self, key: impl Into<String>) -> Self {
        self.inner.detail_keys.push(key.into());
        self
    }

    pub fn build(self) -> ConflictType {
        self.inner
    }
}
