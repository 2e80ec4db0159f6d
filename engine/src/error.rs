//! Error types for the Ferry engine.

use crate::{ConflictId, ConflictTypeId, MigrationFault, RuleId};
use thiserror::Error;

/// All possible errors from the Ferry engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Registry errors
    #[error("conflict type not found: {0}")]
    ConflictTypeNotFound(ConflictTypeId),

    #[error("conflict not found: {0}")]
    ConflictNotFound(ConflictId),

    #[error("resolution rule not found: {0}")]
    RuleNotFound(RuleId),

    #[error("invalid resolution rule: {0}")]
    InvalidRule(String),

    #[error("malformed scope '{scope}': expected {hint}")]
    MalformedScope { scope: String, hint: String },

    // Pipeline errors
    #[error("invalid transition: {command} is not accepted in state {from}")]
    InvalidTransition { from: String, command: String },

    #[error(transparent)]
    Fault(#[from] MigrationFault),

    #[error("session stopped")]
    SessionStopped,

    // State errors
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
