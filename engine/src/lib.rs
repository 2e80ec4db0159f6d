//! # Ferry Engine
//!
//! Conflict management, error routing and the session pipeline of a
//! bidirectional migration and synchronization toolkit.
//!
//! A session moves change groups from one migration source to another. The
//! engine decides what happens when a change cannot be applied as-is
//! (conflicts) and when something goes wrong while applying it (faults).
//! Everything that touches a real system lives behind the adapter traits in
//! [`provider`].
//!
//! ## Design Principles
//!
//! - **No IO**: Adapters do the IO; the engine only orders and routes
//! - **Deterministic**: Rule selection and snapshots do not depend on hash order
//! - **Resumable**: A session restarts from its high-water mark and replays
//!   an interrupted change group without reapplying finished actions
//! - **Synchronous**: Sessions run on plain threads; callers pick the runtime
//!
//! ## Core Concepts
//!
//! ### Conflicts
//!
//! Conflict types are registered in a [`ConflictTypeRegistry`]. Each type
//! names the resolution actions it accepts and the [`ScopeInterpreter`] used
//! to match rule scopes. The [`ConflictManager`] stores raised conflicts and
//! resolution rules, and resolves a conflict with the most specific rule
//! whose scope covers it.
//!
//! ### Error routing
//!
//! An [`ErrorManager`] per session group matches faults against
//! [`ErrorSignature`]s. Each signature has an [`ErrorRoutingPolicy`]: faults
//! are counted, and only the occurrence that reaches the threshold goes to
//! the routing channels. Faults no signature claims become runtime conflicts.
//!
//! ### Pipelines
//!
//! A [`SessionPipeline`] runs trips over its two [`Endpoint`]s, driven by a
//! [`SyncStateMachine`]. Commands (pause, resume, stop) take effect at
//! change-group boundaries.
//!
//! ## Quick Start
//!
//! ```rust
//! use ferry_engine::{
//!     builtin, ActionKind, ConflictManager, ConflictResolutionRule, ConflictTypeRegistry,
//!     MigrationAction, ResolutionAction,
//! };
//! use serde_json::json;
//! use std::sync::Arc;
//! use uuid::Uuid;
//!
//! // 1. Registry with the built-in conflict types
//! let manager = ConflictManager::new(Arc::new(ConflictTypeRegistry::new()));
//!
//! // 2. Skip anything under /legacy that no filter maps
//! manager.register_resolution_rule(ConflictResolutionRule::new(
//!     builtin::PATH_NOT_MAPPED_ID,
//!     ResolutionAction::SKIP_ID,
//!     "/legacy",
//! ))?;
//!
//! // 3. Raise a conflict; the rule resolves it
//! let action = MigrationAction::new(Uuid::new_v4(), ActionKind::Add, "/legacy/readme.txt", json!({}));
//! let outcome = manager.raise_conflict(builtin::path_not_mapped_conflict(&action))?;
//! assert!(outcome.resolved);
//! assert!(!manager.has_unresolved(None));
//! # Ok::<(), ferry_engine::Error>(())
//! ```
//!
//! ## Persistence
//!
//! [`RuntimeSnapshot`] holds per-session progress and the conflict store
//! ([`ConflictManager::export_state`]). It serializes to JSON with
//! deterministic ordering.

pub mod action;
pub mod builtin;
pub mod cancel;
pub mod config;
pub mod conflict;
pub mod error;
pub mod error_manager;
pub mod fault;
pub mod manager;
pub mod pipeline;
pub mod provider;
pub mod registry;
pub mod routing;
pub mod scope;
pub mod signature;
pub mod snapshot;
pub mod state;

// Re-export main types at crate root
pub use action::{
    ActionKind, ActionState, ApplyJournal, ChangeActionRegistry, ChangeGroup, ChangeGroupStatus,
    LinkActionKind, LinkChangeAction, MigrationAction,
};
pub use cancel::CancellationToken;
pub use config::{
    ChannelConfig, ChannelKind, ErrorManagementConfig, ErrorRouterConfig, FilterPair, Frequency,
    MigrationSourceConfig, PathMapping, RetryPolicy, SessionConfig, SessionGroupConfig,
    SyncContext, SyncDirection, WorkFlowType,
};
pub use conflict::{
    ConflictDetails, ConflictHandler, ConflictResolutionResult, ConflictResolutionRule,
    ConflictStatus, ConflictType, ConflictedAction, ContinuationPolicy, MigrationConflict,
    ResolutionAction, ResolutionOutcome, ResolutionType,
};
pub use error::{Error, Result};
pub use error_manager::{ErrorHandlingResult, ErrorManager, FaultOrigin};
pub use fault::{FaultCategory, MigrationFault};
pub use manager::{ConflictManager, RaiseOutcome};
pub use pipeline::{
    NoopObserver, PipelineContext, SessionObserver, SessionOutcome, SessionPipeline,
    SessionReport,
};
pub use provider::{AnalysisProvider, ConversionResult, Endpoint, MigrationProvider, ProviderResult};
pub use registry::ConflictTypeRegistry;
pub use routing::{
    AssertChannel, BlockingSessionGroupChannel, ErrorRoutingChannel, ErrorRoutingPolicy,
    EventLogChannel, PolicyDecision, RouteOutcome,
};
pub use scope::ScopeInterpreter;
pub use signature::ErrorSignature;
pub use snapshot::{ConflictState, RuntimeSnapshot, SessionProgress, SNAPSHOT_FORMAT_VERSION};
pub use state::{PipelineState, PipelineSyncCommand, SyncStateMachine};

/// Type aliases for clarity
pub type ConflictId = u64;
pub type ConflictTypeId = uuid::Uuid;
pub type ActionId = uuid::Uuid;
pub type RuleId = uuid::Uuid;
pub type SessionId = uuid::Uuid;
pub type SessionGroupId = uuid::Uuid;
pub type MigrationSourceId = uuid::Uuid;
pub type ChangeGroupId = u64;
/// Execution order of the last committed change group of a source.
pub type HighWaterMark = u64;
