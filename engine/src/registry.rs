//! Conflict type registry.
//!
//! Built mutably while pipelines initialize, then shared read-only behind an
//! `Arc`. Registration is idempotent per reference id: the first registration
//! wins and later ones are ignored.

use crate::builtin;
use crate::conflict::{ConflictType, ContinuationPolicy};
use crate::error::{Error, Result};
use crate::{ConflictTypeId, MigrationSourceId};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

#[derive(Debug, Clone)]
struct RegisteredType {
    conflict_type: Arc<ConflictType>,
    continuation: ContinuationPolicy,
}

/// Registry of known conflict types and their continuation policies.
#[derive(Debug, Clone)]
pub struct ConflictTypeRegistry {
    types: BTreeMap<ConflictTypeId, RegisteredType>,
    by_source: BTreeMap<MigrationSourceId, BTreeSet<ConflictTypeId>>,
}

impl ConflictTypeRegistry {
    /// Create a registry holding the built-in toolkit conflict types.
    pub fn new() -> Self {
        let mut registry = Self::empty();
        for (conflict_type, continuation) in builtin::toolkit_conflict_types() {
            registry.register_conflict_type(conflict_type, continuation);
        }
        registry
    }

    /// Create a registry with no types at all.
    pub fn empty() -> Self {
        Self {
            types: BTreeMap::new(),
            by_source: BTreeMap::new(),
        }
    }

    /// Register a conflict type. Returns `false` if a type with the same
    /// reference id was already registered; the existing one is kept.
    pub fn register_conflict_type(
        &mut self,
        conflict_type: ConflictType,
        continuation: ContinuationPolicy,
    ) -> bool {
        if self.types.contains_key(&conflict_type.reference_id) {
            tracing::debug!(
                conflict_type = %conflict_type.name,
                "conflict type already registered, keeping first registration"
            );
            return false;
        }
        self.types.insert(
            conflict_type.reference_id,
            RegisteredType {
                conflict_type: Arc::new(conflict_type),
                continuation,
            },
        );
        true
    }

    /// Register a conflict type on behalf of a migration source.
    pub fn register_for_source(
        &mut self,
        source_id: MigrationSourceId,
        conflict_type: ConflictType,
        continuation: ContinuationPolicy,
    ) -> bool {
        let id = conflict_type.reference_id;
        let added = self.register_conflict_type(conflict_type, continuation);
        self.by_source.entry(source_id).or_default().insert(id);
        added
    }

    pub fn lookup(&self, id: &ConflictTypeId) -> Result<Arc<ConflictType>> {
        self.types
            .get(id)
            .map(|r| Arc::clone(&r.conflict_type))
            .ok_or(Error::ConflictTypeNotFound(*id))
    }

    pub fn continuation(&self, id: &ConflictTypeId) -> Result<ContinuationPolicy> {
        self.types
            .get(id)
            .map(|r| r.continuation)
            .ok_or(Error::ConflictTypeNotFound(*id))
    }

    /// Conflict types a source registered, in id order.
    pub fn source_types(&self, source_id: &MigrationSourceId) -> Vec<Arc<ConflictType>> {
        self.by_source
            .get(source_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.types.get(id))
            .map(|r| Arc::clone(&r.conflict_type))
            .collect()
    }

    pub fn contains(&self, id: &ConflictTypeId) -> bool {
        self.types.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// All registered types, in id order.
    pub fn types(&self) -> impl Iterator<Item = &ConflictType> {
        self.types.values().map(|r| r.conflict_type.as_ref())
    }
}

impl Default for ConflictTypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}
