//! Faults raised by providers, handlers and channels.
//!
//! A [`MigrationFault`] is what an adapter hands back when something goes
//! wrong that is not a recognizable conflict. The error manager classifies
//! faults by `kind` (and optionally message and inner fault) against its
//! registered signatures.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Well-known fault kinds used by the toolkit defaults.
pub mod kinds {
    pub const OUT_OF_MEMORY: &str = "OutOfMemory";
    pub const NULL_REFERENCE: &str = "NullReference";
    pub const IO: &str = "Io";
    pub const NOT_SUPPORTED: &str = "NotSupported";
    pub const UNAUTHORIZED: &str = "Unauthorized";
    pub const DATABASE: &str = "Database";
    pub const DATABASE_CONNECTION: &str = "DatabaseConnection";
    pub const TIMEOUT: &str = "Timeout";
    pub const DEADLOCK: &str = "Deadlock";
    pub const SERVICE_UNAVAILABLE: &str = "ServiceUnavailable";
    pub const TRANSACTION_ABORTED: &str = "TransactionAborted";
    pub const REPOSITORY_NOT_FOUND: &str = "RepositoryNotFound";
    pub const INITIALIZATION: &str = "Initialization";
    pub const ADDIN: &str = "Addin";
    pub const UNRESOLVED_CONFLICT: &str = "UnresolvedConflict";
}

/// Message fragments matched by the default error registrations.
pub mod messages {
    pub const NOT_ENOUGH_SPACE_ON_DISK: &str = "not enough space on the disk";
    pub const WORKSPACE_IS_REQUIRED: &str = "workspace is required";
}

/// Broad class of a fault.
///
/// Initialization and addin faults are always fatal to the session group,
/// regardless of configured thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FaultCategory {
    #[default]
    General,
    Initialization,
    Addin,
}

impl FaultCategory {
    /// Whether faults of this category bypass routing thresholds.
    pub fn is_always_fatal(&self) -> bool {
        matches!(self, FaultCategory::Initialization | FaultCategory::Addin)
    }
}

/// A raised fault, optionally wrapping the fault that caused it.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[error("{kind}: {message}")]
pub struct MigrationFault {
    /// Type name used for signature matching
    pub kind: String,
    /// Human-readable message
    pub message: String,
    #[serde(default)]
    pub category: FaultCategory,
    #[source]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inner: Option<Box<MigrationFault>>,
}

impl MigrationFault {
    /// Create a general fault.
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            category: FaultCategory::General,
            inner: None,
        }
    }

    /// Create a fault raised while initializing a provider.
    pub fn initialization(message: impl Into<String>) -> Self {
        Self::new(kinds::INITIALIZATION, message).with_category(FaultCategory::Initialization)
    }

    /// Create a fault raised by an addin.
    pub fn addin(message: impl Into<String>) -> Self {
        Self::new(kinds::ADDIN, message).with_category(FaultCategory::Addin)
    }

    pub fn with_category(mut self, category: FaultCategory) -> Self {
        self.category = category;
        self
    }

    pub fn with_inner(mut self, inner: MigrationFault) -> Self {
        self.inner = Some(Box::new(inner));
        self
    }

    /// The directly wrapped fault, if any.
    pub fn inner(&self) -> Option<&MigrationFault> {
        self.inner.as_deref()
    }

    /// Wrap this fault as an initialization fault, keeping it as the inner cause.
    pub fn into_initialization(self) -> Self {
        if self.category == FaultCategory::Initialization {
            return self;
        }
        let message = format!("provider initialization failed: {}", self.message);
        MigrationFault::initialization(message).with_inner(self)
    }
}
