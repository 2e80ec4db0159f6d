//! Adapters the server can wire into a session, selected by provider name.

pub mod memory;

use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use ferry_engine::{Endpoint, Error, MigrationSourceConfig, MigrationSourceId};

use self::memory::{MemoryAnalysis, MemoryMigration, MemoryRepository, SharedRepository};

/// Builds endpoints for configured migration sources.
///
/// Sessions that share a source share its state, so every memory source is
/// backed by exactly one repository.
#[derive(Debug, Default)]
pub struct AdapterCatalog {
    memory: DashMap<MigrationSourceId, SharedRepository>,
}

impl AdapterCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create both providers of `source`.
    pub fn endpoint(&self, source: &MigrationSourceConfig) -> ferry_engine::Result<Endpoint> {
        match source.provider.to_ascii_lowercase().as_str() {
            "memory" => {
                let repository = self.memory_source(source)?;
                Ok(Endpoint::new(
                    source.id,
                    Box::new(MemoryAnalysis::new(Arc::clone(&repository))),
                    Box::new(MemoryMigration::new(repository)),
                ))
            }
            other => Err(Error::InvalidConfig(format!(
                "source '{}' uses unknown provider '{other}'",
                source.friendly_name
            ))),
        }
    }

    /// Repository behind a memory source, if one was built.
    pub fn memory_repository(&self, source_id: &MigrationSourceId) -> Option<SharedRepository> {
        self.memory.get(source_id).map(|entry| Arc::clone(entry.value()))
    }

    fn memory_source(&self, source: &MigrationSourceConfig) -> ferry_engine::Result<SharedRepository> {
        if let Some(existing) = self.memory_repository(&source.id) {
            return Ok(existing);
        }
        let repository = Arc::new(Mutex::new(MemoryRepository::from_config(source)?));
        let entry = self.memory.entry(source.id).or_insert(repository);
        Ok(Arc::clone(entry.value()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn source(provider: &str) -> MigrationSourceConfig {
        MigrationSourceConfig {
            id: Uuid::new_v4(),
            friendly_name: "left".to_string(),
            provider: provider.to_string(),
            server_url: String::new(),
            settings: BTreeMap::new(),
        }
    }

    #[test]
    fn memory_sources_share_one_repository() {
        let catalog = AdapterCatalog::new();
        let config = source("Memory");
        catalog.endpoint(&config).unwrap();
        let first = catalog.memory_repository(&config.id).unwrap();
        catalog.endpoint(&config).unwrap();
        let second = catalog.memory_repository(&config.id).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn unknown_provider_is_rejected() {
        let catalog = AdapterCatalog::new();
        let err = catalog.endpoint(&source("tfs")).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(msg) if msg.contains("tfs")));
    }
}
