//! Conflict manager - persists conflicts and applies resolution rules.
//!
//! Every raised conflict is stored as Unresolved first. The manager then
//! gathers the rules registered for the conflict's type whose scope covers
//! the conflict's scope hint, ranks them most-specific-first (ties go to the
//! most recently registered rule) and hands the conflict to the type's
//! handler with the first rule the handler accepts.
//!
//! Handlers are invoked without the store lock held, so a handler may call
//! back into the manager.

use crate::action::MigrationAction;
use crate::conflict::{
    ConflictResolutionResult, ConflictResolutionRule, ConflictStatus, ConflictType,
    ContinuationPolicy, MigrationConflict,
};
use crate::error::{Error, Result};
use crate::registry::ConflictTypeRegistry;
use crate::snapshot::ConflictState;
use crate::{ConflictId, RuleId, SessionId};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// Result of raising (or re-evaluating) a conflict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaiseOutcome {
    pub conflict_id: ConflictId,
    pub resolved: bool,
    /// Rule whose handler accepted the conflict, resolved or not
    pub rule_id: Option<RuleId>,
    pub result: Option<ConflictResolutionResult>,
    /// Actions the pipeline must apply to complete the resolution
    pub followup_actions: Vec<MigrationAction>,
    /// What to do if the conflict stays unresolved
    pub continuation: ContinuationPolicy,
}

#[derive(Debug)]
struct ConflictStore {
    next_conflict_id: ConflictId,
    next_rule_sequence: u64,
    conflicts: BTreeMap<ConflictId, MigrationConflict>,
    rules: BTreeMap<RuleId, ConflictResolutionRule>,
}

impl Default for ConflictStore {
    fn default() -> Self {
        Self {
            next_conflict_id: 1,
            next_rule_sequence: 1,
            conflicts: BTreeMap::new(),
            rules: BTreeMap::new(),
        }
    }
}

impl ConflictStore {
    /// Active rules for the conflict's type that cover its scope hint,
    /// most specific first.
    fn candidate_rules(
        &self,
        conflict_type: &ConflictType,
        conflict: &MigrationConflict,
    ) -> Vec<ConflictResolutionRule> {
        let mut rules: Vec<_> = self
            .rules
            .values()
            .filter(|r| !r.deprecated && r.conflict_type_id == conflict_type.reference_id)
            .filter(|r| {
                conflict_type
                    .scope
                    .is_in_scope(&conflict.scope_hint, &r.applicability_scope)
            })
            .cloned()
            .collect();
        rank_rules(conflict_type, &mut rules);
        rules
    }
}

/// Sort rules most-specific-first; equally specific rules go newest first.
fn rank_rules(conflict_type: &ConflictType, rules: &mut [ConflictResolutionRule]) {
    rules.sort_by(|a, b| {
        conflict_type
            .scope
            .compare_specificity(&a.applicability_scope, &b.applicability_scope)
            .then_with(|| b.sequence.cmp(&a.sequence))
    });
}

/// Conflict manager for one session group.
#[derive(Debug)]
pub struct ConflictManager {
    registry: Arc<ConflictTypeRegistry>,
    store: Mutex<ConflictStore>,
}

impl ConflictManager {
    pub fn new(registry: Arc<ConflictTypeRegistry>) -> Self {
        Self {
            registry,
            store: Mutex::new(ConflictStore::default()),
        }
    }

    pub fn registry(&self) -> &Arc<ConflictTypeRegistry> {
        &self.registry
    }

    fn store(&self) -> MutexGuard<'_, ConflictStore> {
        self.store.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Persist a new conflict and try to resolve it automatically.
    ///
    /// Fails with [`Error::ConflictTypeNotFound`] for unregistered types and
    /// with [`Error::Fault`] when the handler fails; in the latter case the
    /// conflict stays persisted as Unresolved.
    pub fn raise_conflict(&self, mut conflict: MigrationConflict) -> Result<RaiseOutcome> {
        let conflict_type = self.registry.lookup(&conflict.conflict_type_id)?;

        let conflict_id = {
            let mut store = self.store();
            let id = store.next_conflict_id;
            store.next_conflict_id += 1;
            conflict.id = Some(id);
            conflict.status = ConflictStatus::Unresolved;
            conflict.resolved_by_rule = None;
            conflict.followup_actions.clear();
            store.conflicts.insert(id, conflict.clone());
            id
        };
        tracing::debug!(
            conflict_id,
            conflict_type = %conflict_type.name,
            scope = %conflict.scope_hint,
            "conflict raised"
        );

        self.evaluate(&conflict_type, conflict_id, &conflict)
    }

    /// Try the stored rules against a persisted conflict.
    fn evaluate(
        &self,
        conflict_type: &ConflictType,
        conflict_id: ConflictId,
        conflict: &MigrationConflict,
    ) -> Result<RaiseOutcome> {
        let continuation = self.registry.continuation(&conflict_type.reference_id)?;
        let candidates = self.store().candidate_rules(conflict_type, conflict);
        self.resolve_with(conflict_type, conflict_id, conflict, &candidates, continuation)
    }

    fn resolve_with(
        &self,
        conflict_type: &ConflictType,
        conflict_id: ConflictId,
        conflict: &MigrationConflict,
        candidates: &[ConflictResolutionRule],
        continuation: ContinuationPolicy,
    ) -> Result<RaiseOutcome> {
        let mut outcome = RaiseOutcome {
            conflict_id,
            resolved: false,
            rule_id: None,
            result: None,
            followup_actions: Vec::new(),
            continuation,
        };

        let Some(rule) = candidates
            .iter()
            .find(|rule| conflict_type.handler.can_resolve(conflict, rule))
        else {
            tracing::debug!(conflict_id, "no applicable rule, conflict backlogged");
            return Ok(outcome);
        };

        let resolution = conflict_type.handler.resolve(conflict, rule)?;
        outcome.rule_id = Some(rule.reference_id);
        outcome.resolved = resolution.result.resolved;

        if outcome.resolved {
            let mut store = self.store();
            if let Some(stored) = store.conflicts.get_mut(&conflict_id) {
                stored.status = ConflictStatus::Resolved;
                stored.resolved_by_rule = Some(rule.reference_id);
                stored.resolution_comment = Some(resolution.result.comment.clone());
                stored.followup_actions = resolution.followup_actions.clone();
            }
            tracing::debug!(conflict_id, rule_id = %rule.reference_id, "conflict resolved");
        } else {
            tracing::debug!(
                conflict_id,
                rule_id = %rule.reference_id,
                comment = %resolution.result.comment,
                "rule applied but conflict remains unresolved"
            );
        }

        outcome.result = Some(resolution.result);
        outcome.followup_actions = resolution.followup_actions;
        Ok(outcome)
    }

    /// Validate and store a resolution rule. Returns the rule's id.
    pub fn register_resolution_rule(&self, mut rule: ConflictResolutionRule) -> Result<RuleId> {
        let conflict_type = self.registry.lookup(&rule.conflict_type_id)?;
        if !conflict_type.supports_action(&rule.action_id) {
            return Err(Error::InvalidRule(format!(
                "action {} is not supported by conflict type {}",
                rule.action_id, conflict_type.name
            )));
        }
        conflict_type
            .scope
            .validate_rule_scope(&rule.applicability_scope)
            .map_err(|hint| Error::MalformedScope {
                scope: rule.applicability_scope.clone(),
                hint: hint.to_string(),
            })?;

        let mut store = self.store();
        if store.rules.contains_key(&rule.reference_id) {
            return Err(Error::InvalidRule(format!(
                "rule {} is already registered",
                rule.reference_id
            )));
        }
        rule.sequence = store.next_rule_sequence;
        rule.deprecated = false;
        store.next_rule_sequence += 1;
        let id = rule.reference_id;
        tracing::info!(
            rule_id = %id,
            conflict_type = %conflict_type.name,
            scope = %rule.applicability_scope,
            "resolution rule registered"
        );
        store.rules.insert(id, rule);
        Ok(id)
    }

    /// Resolve one persisted conflict with a specific rule, registering the
    /// rule first if it is new.
    pub fn resolve_existing_with_rule(
        &self,
        conflict_id: ConflictId,
        rule: ConflictResolutionRule,
    ) -> Result<RaiseOutcome> {
        let conflict = self.conflict(conflict_id)?;
        if rule.conflict_type_id != conflict.conflict_type_id {
            return Err(Error::InvalidRule(format!(
                "rule targets conflict type {}, conflict {} is of type {}",
                rule.conflict_type_id, conflict_id, conflict.conflict_type_id
            )));
        }
        let conflict_type = self.registry.lookup(&conflict.conflict_type_id)?;
        if !conflict_type
            .scope
            .is_in_scope(&conflict.scope_hint, &rule.applicability_scope)
        {
            return Err(Error::InvalidRule(format!(
                "rule scope '{}' does not cover conflict {}",
                rule.applicability_scope, conflict_id
            )));
        }

        let rule_id = rule.reference_id;
        let existing = self.store().rules.get(&rule_id).cloned();
        let rule = match existing {
            Some(stored) => stored,
            None => {
                self.register_resolution_rule(rule)?;
                self.store()
                    .rules
                    .get(&rule_id)
                    .cloned()
                    .ok_or(Error::RuleNotFound(rule_id))?
            }
        };

        let continuation = self.registry.continuation(&conflict.conflict_type_id)?;
        if conflict.is_resolved() {
            return Ok(RaiseOutcome {
                conflict_id,
                resolved: true,
                rule_id: conflict.resolved_by_rule,
                result: None,
                followup_actions: conflict.followup_actions.clone(),
                continuation,
            });
        }
        self.resolve_with(
            &conflict_type,
            conflict_id,
            &conflict,
            std::slice::from_ref(&rule),
            continuation,
        )
    }

    /// Re-evaluate backlogged conflicts against the current rules and return
    /// the outcomes of those that are now resolved.
    pub fn retry_unresolved(&self, session_id: Option<SessionId>) -> Result<Vec<RaiseOutcome>> {
        let mut resolved = Vec::new();
        for conflict in self.unresolved_conflicts(session_id) {
            let Some(conflict_id) = conflict.id else {
                continue;
            };
            let conflict_type = self.registry.lookup(&conflict.conflict_type_id)?;
            let outcome = self.evaluate(&conflict_type, conflict_id, &conflict)?;
            if outcome.resolved {
                resolved.push(outcome);
            }
        }
        Ok(resolved)
    }

    /// Unresolved conflicts, optionally restricted to one session, in id order.
    pub fn unresolved_conflicts(&self, session_id: Option<SessionId>) -> Vec<MigrationConflict> {
        self.store()
            .conflicts
            .values()
            .filter(|c| !c.is_resolved())
            .filter(|c| session_id.is_none() || c.session_id == session_id)
            .cloned()
            .collect()
    }

    pub fn has_unresolved(&self, session_id: Option<SessionId>) -> bool {
        self.store()
            .conflicts
            .values()
            .any(|c| !c.is_resolved() && (session_id.is_none() || c.session_id == session_id))
    }

    pub fn conflict(&self, conflict_id: ConflictId) -> Result<MigrationConflict> {
        self.store()
            .conflicts
            .get(&conflict_id)
            .cloned()
            .ok_or(Error::ConflictNotFound(conflict_id))
    }

    /// All rules, in registration order.
    pub fn rules(&self) -> Vec<ConflictResolutionRule> {
        let mut rules: Vec<_> = self.store().rules.values().cloned().collect();
        rules.sort_by_key(|r| r.sequence);
        rules
    }

    /// Stop a rule from matching new conflicts. The rule stays on record.
    pub fn deprecate_rule(&self, rule_id: RuleId) -> Result<()> {
        let mut store = self.store();
        let rule = store
            .rules
            .get_mut(&rule_id)
            .ok_or(Error::RuleNotFound(rule_id))?;
        rule.deprecated = true;
        tracing::info!(rule_id = %rule_id, "resolution rule deprecated");
        Ok(())
    }

    /// Export conflicts and rules for persistence.
    pub fn export_state(&self) -> ConflictState {
        let store = self.store();
        ConflictState {
            next_conflict_id: store.next_conflict_id,
            next_rule_sequence: store.next_rule_sequence,
            conflicts: store.conflicts.clone(),
            rules: store.rules.clone(),
        }
    }

    /// Replace conflicts and rules with a previously exported state.
    pub fn import_state(&self, state: ConflictState) -> Result<()> {
        state.validate()?;
        for conflict in state.conflicts.values() {
            self.registry.lookup(&conflict.conflict_type_id)?;
        }
        for rule in state.rules.values() {
            self.registry.lookup(&rule.conflict_type_id)?;
        }
        let mut store = self.store();
        store.next_conflict_id = state.next_conflict_id;
        store.next_rule_sequence = state.next_rule_sequence;
        store.conflicts = state.conflicts;
        store.rules = state.rules;
        Ok(())
    }
}
