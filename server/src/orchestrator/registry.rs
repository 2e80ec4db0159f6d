//! One error manager per session group.

use std::sync::Arc;

use dashmap::DashMap;
use ferry_engine::{CancellationToken, ErrorManagementConfig, ErrorManager, SessionGroupId};

/// Owns the error managers of the running session groups.
///
/// A manager lives from `create_for_group` until `dispose_for_group`; there
/// is no process-wide instance.
#[derive(Debug, Default)]
pub struct ErrorManagerRegistry {
    managers: DashMap<SessionGroupId, Arc<ErrorManager>>,
}

impl ErrorManagerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the manager of a group from its configuration, replacing any
    /// previous manager of the same group.
    pub fn create_for_group(
        &self,
        group_id: SessionGroupId,
        config: &ErrorManagementConfig,
        group_cancel: &CancellationToken,
    ) -> Arc<ErrorManager> {
        let manager = Arc::new(ErrorManager::from_config(group_id, config, group_cancel));
        if self.managers.insert(group_id, Arc::clone(&manager)).is_some() {
            tracing::warn!(group = %group_id, "replaced existing error manager");
        }
        tracing::info!(
            group = %group_id,
            registrations = manager.registration_count(),
            channels = ?manager.channel_names(),
            "error manager created"
        );
        manager
    }

    pub fn get(&self, group_id: &SessionGroupId) -> Option<Arc<ErrorManager>> {
        self.managers.get(group_id).map(|entry| Arc::clone(entry.value()))
    }

    /// Drop the group's manager. Returns `false` if there was none.
    pub fn dispose_for_group(&self, group_id: &SessionGroupId) -> bool {
        let removed = self.managers.remove(group_id).is_some();
        if removed {
            tracing::info!(group = %group_id, "error manager disposed");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.managers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.managers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn managers_are_scoped_to_their_group() {
        let registry = ErrorManagerRegistry::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let token = CancellationToken::new();

        let manager_a = registry.create_for_group(a, &ErrorManagementConfig::default(), &token);
        registry.create_for_group(b, &ErrorManagementConfig::default(), &token);

        assert_eq!(registry.len(), 2);
        assert!(Arc::ptr_eq(&manager_a, &registry.get(&a).unwrap()));
        assert_eq!(manager_a.group_id(), a);

        assert!(registry.dispose_for_group(&a));
        assert!(!registry.dispose_for_group(&a));
        assert!(registry.get(&a).is_none());
        assert!(registry.get(&b).is_some());
    }

    #[test]
    fn recreating_a_group_replaces_its_manager() {
        let registry = ErrorManagerRegistry::new();
        let group = Uuid::new_v4();
        let token = CancellationToken::new();

        let first = registry.create_for_group(group, &ErrorManagementConfig::default(), &token);
        let second = registry.create_for_group(group, &ErrorManagementConfig::default(), &token);

        assert_eq!(registry.len(), 1);
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&second, &registry.get(&group).unwrap()));
    }
}
