//! Snapshot types for persisting and restoring runtime state.
//!
//! A [`RuntimeSnapshot`] captures what a session group needs to resume after
//! a restart: per-session high-water marks, the journal of a change group
//! that was interrupted mid-apply, and the conflict/rule store.
//! BTreeMaps keep serialization deterministic.

use crate::action::ApplyJournal;
use crate::conflict::{ConflictResolutionRule, MigrationConflict};
use crate::error::{Error, Result};
use crate::{ConflictId, HighWaterMark, MigrationSourceId, RuleId, SessionGroupId, SessionId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Version of the snapshot format for future compatibility.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// Replay position of one session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionProgress {
    /// Execution order of the last committed change group, per source
    #[serde(default)]
    pub high_water_marks: BTreeMap<MigrationSourceId, HighWaterMark>,
    /// Change group being applied when the snapshot was taken
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_flight: Option<ApplyJournal>,
}

impl SessionProgress {
    pub fn high_water_mark(&self, source_id: &MigrationSourceId) -> HighWaterMark {
        self.high_water_marks.get(source_id).copied().unwrap_or(0)
    }

    /// Advance the mark for `source_id`. Marks never move backwards.
    pub fn record_commit(&mut self, source_id: MigrationSourceId, mark: HighWaterMark) {
        let entry = self.high_water_marks.entry(source_id).or_insert(0);
        *entry = (*entry).max(mark);
        if self
            .in_flight
            .as_ref()
            .is_some_and(|j| j.source_id == source_id)
        {
            self.in_flight = None;
        }
    }
}

/// Exported contents of a conflict manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictState {
    pub next_conflict_id: ConflictId,
    pub next_rule_sequence: u64,
    #[serde(default)]
    pub conflicts: BTreeMap<ConflictId, MigrationConflict>,
    #[serde(default)]
    pub rules: BTreeMap<RuleId, ConflictResolutionRule>,
}

impl Default for ConflictState {
    fn default() -> Self {
        Self {
            next_conflict_id: 1,
            next_rule_sequence: 1,
            conflicts: BTreeMap::new(),
            rules: BTreeMap::new(),
        }
    }
}

impl ConflictState {
    /// Check that ids are consistent and counters are ahead of every
    /// stored id.
    pub fn validate(&self) -> Result<()> {
        for (id, conflict) in &self.conflicts {
            if conflict.id != Some(*id) {
                return Err(Error::InvalidSnapshot(format!(
                    "conflict stored under {id} carries id {:?}",
                    conflict.id
                )));
            }
            if *id >= self.next_conflict_id {
                return Err(Error::InvalidSnapshot(format!(
                    "conflict id {id} is not below next id {}",
                    self.next_conflict_id
                )));
            }
        }
        for (id, rule) in &self.rules {
            if rule.reference_id != *id {
                return Err(Error::InvalidSnapshot(format!(
                    "rule stored under {id} carries id {}",
                    rule.reference_id
                )));
            }
            if rule.sequence >= self.next_rule_sequence {
                return Err(Error::InvalidSnapshot(format!(
                    "rule sequence {} is not below next sequence {}",
                    rule.sequence, self.next_rule_sequence
                )));
            }
        }
        Ok(())
    }
}

/// A point-in-time snapshot of a session group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeSnapshot {
    pub format_version: u32,
    pub session_group_id: SessionGroupId,
    #[serde(default)]
    pub sessions: BTreeMap<SessionId, SessionProgress>,
    #[serde(default)]
    pub conflict_state: ConflictState,
}

impl RuntimeSnapshot {
    pub fn new(session_group_id: SessionGroupId) -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            session_group_id,
            sessions: BTreeMap::new(),
            conflict_state: ConflictState::default(),
        }
    }

    pub fn progress(&self, session_id: &SessionId) -> SessionProgress {
        self.sessions.get(session_id).cloned().unwrap_or_default()
    }

    /// Check that the snapshot belongs to `session_group_id` and is
    /// internally consistent.
    pub fn validate_for(&self, session_group_id: SessionGroupId) -> Result<()> {
        if self.session_group_id != session_group_id {
            return Err(Error::InvalidSnapshot(format!(
                "snapshot belongs to session group {}, expected {}",
                self.session_group_id, session_group_id
            )));
        }
        self.conflict_state.validate()
    }

    /// Serialize to JSON with deterministic ordering.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: Self =
            serde_json::from_str(json).map_err(|e| Error::InvalidSnapshot(e.to_string()))?;

        if snapshot.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(Error::InvalidSnapshot(format!(
                "unsupported snapshot format version: {} (max supported: {})",
                snapshot.format_version, SNAPSHOT_FORMAT_VERSION
            )));
        }

        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::{ConflictDetails, ResolutionAction};
    use uuid::Uuid;

    fn snapshot_with_state() -> RuntimeSnapshot {
        let group = Uuid::new_v4();
        let source = Uuid::new_v4();
        let mut snapshot = RuntimeSnapshot::new(group);

        let mut progress = SessionProgress::default();
        progress.record_commit(source, 12);
        let mut journal = ApplyJournal::new(13, source);
        journal.record(Uuid::new_v4());
        progress.in_flight = Some(journal);
        snapshot.sessions.insert(Uuid::new_v4(), progress);

        let type_id = Uuid::new_v4();
        let mut conflict = MigrationConflict::new(type_id, "/p", ConflictDetails::default());
        conflict.id = Some(1);
        snapshot.conflict_state.conflicts.insert(1, conflict);
        snapshot.conflict_state.next_conflict_id = 2;

        let mut rule = ConflictResolutionRule::new(type_id, ResolutionAction::SKIP_ID, "/p");
        rule.sequence = 1;
        snapshot.conflict_state.rules.insert(rule.reference_id, rule);
        snapshot.conflict_state.next_rule_sequence = 2;
        snapshot
    }

    #[test]
    fn high_water_marks_never_regress() {
        let source = Uuid::new_v4();
        let mut progress = SessionProgress::default();
        assert_eq!(progress.high_water_mark(&source), 0);
        progress.record_commit(source, 5);
        progress.record_commit(source, 3);
        assert_eq!(progress.high_water_mark(&source), 5);
    }

    #[test]
    fn commit_clears_matching_journal() {
        let source = Uuid::new_v4();
        let mut progress = SessionProgress {
            in_flight: Some(ApplyJournal::new(4, source)),
            ..Default::default()
        };
        progress.record_commit(Uuid::new_v4(), 1);
        assert!(progress.in_flight.is_some());
        progress.record_commit(source, 4);
        assert!(progress.in_flight.is_none());
    }

    #[test]
    fn json_is_deterministic() {
        let snapshot = snapshot_with_state();
        let first = snapshot.to_json().unwrap();
        let second = RuntimeSnapshot::from_json(&first).unwrap().to_json().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn validate_checks_group_and_counters() {
        let snapshot = snapshot_with_state();
        assert!(snapshot.validate_for(snapshot.session_group_id).is_ok());
        assert!(snapshot.validate_for(Uuid::new_v4()).is_err());

        let mut stale = snapshot.clone();
        stale.conflict_state.next_conflict_id = 1;
        assert!(matches!(
            stale.validate_for(stale.session_group_id),
            Err(Error::InvalidSnapshot(_))
        ));
    }

    #[test]
    fn newer_format_is_rejected() {
        let mut snapshot = snapshot_with_state();
        snapshot.format_version = SNAPSHOT_FORMAT_VERSION + 1;
        let json = snapshot.to_json().unwrap();
        assert!(RuntimeSnapshot::from_json(&json).is_err());
    }
}
