//! Session group configuration.
//!
//! The configuration document is JSON (camelCase). It is deserialized with
//! serde and then validated as a whole before any pipeline is built.

use crate::conflict::ConflictResolutionRule;
use crate::error::{Error, Result};
use crate::scope::{self, ScopeInterpreter, WILDCARD};
use crate::signature::ErrorSignature;
use crate::{MigrationSourceId, SessionGroupId, SessionId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

/// Default wait between trips of a continuous automatic session.
pub const DEFAULT_SYNC_WAIT_INTERVAL_SECS: u64 = 30;

/// One endpoint of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationSourceConfig {
    pub id: MigrationSourceId,
    pub friendly_name: String,
    /// Name of the adapter implementing this endpoint
    pub provider: String,
    #[serde(default)]
    pub server_url: String,
    /// Adapter-specific settings
    #[serde(default)]
    pub settings: BTreeMap<String, String>,
}

/// Maps a path on the left endpoint to a path on the right endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterPair {
    pub left: String,
    pub right: String,
    /// Cloaked: changes under this path are dropped silently
    #[serde(default)]
    pub neglect: bool,
}

impl FilterPair {
    pub fn new(left: impl Into<String>, right: impl Into<String>) -> Self {
        Self {
            left: left.into(),
            right: right.into(),
            neglect: false,
        }
    }

    pub fn cloaked(left: impl Into<String>, right: impl Into<String>) -> Self {
        Self {
            neglect: true,
            ..Self::new(left, right)
        }
    }

    fn side(&self, from_left: bool) -> (&str, &str) {
        if from_left {
            (&self.left, &self.right)
        } else {
            (&self.right, &self.left)
        }
    }

    /// Rewrite `path` from one side of the pair to the other.
    pub fn translate(&self, path: &str, from_left: bool) -> Option<String> {
        let (from, to) = self.side(from_left);
        if !ScopeInterpreter::BasicPath.is_in_scope(path, from) {
            return None;
        }
        let depth = scope::path_segments(from).len();
        let mut mapped = to.trim().trim_end_matches('/').to_string();
        for segment in scope::path_segments(path).into_iter().skip(depth) {
            mapped.push('/');
            mapped.push_str(segment);
        }
        if mapped.is_empty() {
            mapped.push('/');
        }
        Some(mapped)
    }
}

/// Result of mapping a path through a session's filters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathMapping {
    Mapped(String),
    Cloaked,
    NotMapped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncDirection {
    #[default]
    Unidirectional,
    Bidirectional,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Frequency {
    /// One trip, then the session completes.
    #[default]
    OneTime,
    /// One trip per manual start.
    ContinuousManual,
    /// Trips repeat, separated by the sync wait interval.
    ContinuousAutomatic,
}

/// Whether endpoint context (metadata) is synchronized before changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncContext {
    #[default]
    Disabled,
    Unidirectional,
    Bidirectional,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkFlowType {
    #[serde(default)]
    pub direction: SyncDirection,
    #[serde(default)]
    pub frequency: Frequency,
    #[serde(default)]
    pub sync_context: SyncContext,
}

/// Retry with exponential backoff for change groups whose faults are below
/// their routing threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), doubling each time.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let delay = self.base_delay_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
        }
    }
}

fn default_sync_wait_interval() -> u64 {
    DEFAULT_SYNC_WAIT_INTERVAL_SECS
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    pub session_id: SessionId,
    pub friendly_name: String,
    pub left_source: MigrationSourceId,
    pub right_source: MigrationSourceId,
    #[serde(default)]
    pub filters: Vec<FilterPair>,
    #[serde(default)]
    pub workflow: WorkFlowType,
    #[serde(default = "default_sync_wait_interval")]
    pub sync_wait_interval_secs: u64,
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl SessionConfig {
    pub fn new(
        session_id: SessionId,
        friendly_name: impl Into<String>,
        left_source: MigrationSourceId,
        right_source: MigrationSourceId,
    ) -> Self {
        Self {
            session_id,
            friendly_name: friendly_name.into(),
            left_source,
            right_source,
            filters: Vec::new(),
            workflow: WorkFlowType::default(),
            sync_wait_interval_secs: DEFAULT_SYNC_WAIT_INTERVAL_SECS,
            retry: RetryPolicy::default(),
        }
    }

    pub fn sync_wait_interval(&self) -> Duration {
        Duration::from_secs(self.sync_wait_interval_secs)
    }

    /// Map a path through the most specific covering filter. Without any
    /// filters every path maps to itself.
    pub fn map_path(&self, path: &str, from_left: bool) -> PathMapping {
        if self.filters.is_empty() {
            return PathMapping::Mapped(path.to_string());
        }
        let best = self
            .filters
            .iter()
            .filter(|f| ScopeInterpreter::BasicPath.is_in_scope(path, f.side(from_left).0))
            .min_by(|a, b| {
                ScopeInterpreter::BasicPath.compare_specificity(a.side(from_left).0, b.side(from_left).0)
            });
        match best {
            None => PathMapping::NotMapped,
            Some(filter) if filter.neglect => PathMapping::Cloaked,
            Some(filter) => filter
                .translate(path, from_left)
                .map(PathMapping::Mapped)
                .unwrap_or(PathMapping::NotMapped),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRouterConfig {
    pub signature: ErrorSignature,
    pub max_occurrence: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChannelKind {
    BlockingSessionGroup,
    EventLog,
    Assert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelConfig {
    pub kind: ChannelKind,
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorManagementConfig {
    #[serde(default)]
    pub routers: Vec<ErrorRouterConfig>,
    #[serde(default = "default_channels")]
    pub channels: Vec<ChannelConfig>,
}

fn default_channels() -> Vec<ChannelConfig> {
    vec![
        ChannelConfig {
            kind: ChannelKind::EventLog,
            enabled: true,
        },
        ChannelConfig {
            kind: ChannelKind::BlockingSessionGroup,
            enabled: false,
        },
    ]
}

impl Default for ErrorManagementConfig {
    fn default() -> Self {
        Self {
            routers: Vec::new(),
            channels: default_channels(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionGroupConfig {
    pub group_id: SessionGroupId,
    pub name: String,
    pub sources: Vec<MigrationSourceConfig>,
    pub sessions: Vec<SessionConfig>,
    #[serde(default)]
    pub error_management: ErrorManagementConfig,
    /// Rules registered before any session starts
    #[serde(default)]
    pub resolution_rules: Vec<ConflictResolutionRule>,
}

impl SessionGroupConfig {
    /// Parse and validate a configuration document.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| Error::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::InvalidConfig(e.to_string()))
    }

    pub fn source(&self, id: &MigrationSourceId) -> Option<&MigrationSourceConfig> {
        self.sources.iter().find(|s| &s.id == id)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sessions.is_empty() {
            return Err(Error::InvalidConfig("session group has no sessions".into()));
        }

        let mut source_ids = BTreeSet::new();
        for source in &self.sources {
            if !source_ids.insert(source.id) {
                return Err(Error::InvalidConfig(format!(
                    "duplicate migration source {}",
                    source.id
                )));
            }
            if source.provider.trim().is_empty() {
                return Err(Error::InvalidConfig(format!(
                    "migration source {} has no provider",
                    source.id
                )));
            }
        }

        let mut session_ids = BTreeSet::new();
        for session in &self.sessions {
            if !session_ids.insert(session.session_id) {
                return Err(Error::InvalidConfig(format!(
                    "duplicate session {}",
                    session.session_id
                )));
            }
            validate_session(session, &source_ids)?;
        }
        Ok(())
    }
}

fn validate_session(session: &SessionConfig, sources: &BTreeSet<MigrationSourceId>) -> Result<()> {
    let id = session.session_id;
    for endpoint in [session.left_source, session.right_source] {
        if !sources.contains(&endpoint) {
            return Err(Error::InvalidConfig(format!(
                "session {id} references unknown source {endpoint}"
            )));
        }
    }
    if session.left_source == session.right_source {
        return Err(Error::InvalidConfig(format!(
            "session {id} uses the same source on both sides"
        )));
    }
    if session.retry.max_attempts == 0 {
        return Err(Error::InvalidConfig(format!(
            "session {id} retry policy needs at least one attempt"
        )));
    }
    for filter in &session.filters {
        for path in [&filter.left, &filter.right] {
            let malformed = ScopeInterpreter::BasicPath.validate_rule_scope(path).is_err()
                || scope::path_segments(path).contains(&WILDCARD);
            if malformed {
                return Err(Error::InvalidConfig(format!(
                    "session {id} has malformed filter path '{path}'"
                )));
            }
        }
    }
    Ok(())
}
