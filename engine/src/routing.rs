//! Routing policies and routing channels.
//!
//! A policy decides *whether* a matched fault is forwarded; channels decide
//! *what happens* once it is. The max-occurrence policy counts matches and
//! routes on every `threshold`-th one, resetting its counter each time.

use crate::cancel::CancellationToken;
use crate::MigrationFault;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Mutex;

/// Threshold used for implicit and generic registrations.
pub const DEFAULT_MAX_OCCURRENCE: u64 = 60;

/// Threshold for environmental faults (database, network, timeouts).
pub const ENVIRONMENTAL_MAX_OCCURRENCE: u64 = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyDecision {
    Route,
    ConditionNotMet,
}

/// Max-occurrence routing policy. The default threshold of 1 routes every
/// occurrence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRoutingPolicy {
    max_occurrence: u64,
    #[serde(skip)]
    occurrences: u64,
}

impl ErrorRoutingPolicy {
    /// A threshold of 0 is treated as 1.
    pub fn max_occurrence(threshold: u64) -> Self {
        Self {
            max_occurrence: threshold.max(1),
            occurrences: 0,
        }
    }

    /// Route on the first occurrence.
    pub fn fatal() -> Self {
        Self::max_occurrence(1)
    }

    pub fn threshold(&self) -> u64 {
        self.max_occurrence
    }

    /// Occurrences counted since the last routing.
    pub fn occurrences(&self) -> u64 {
        self.occurrences
    }

    /// Count one occurrence; route and reset once the threshold is reached.
    pub fn record_occurrence(&mut self) -> PolicyDecision {
        self.occurrences += 1;
        if self.occurrences >= self.max_occurrence {
            self.occurrences = 0;
            PolicyDecision::Route
        } else {
            PolicyDecision::ConditionNotMet
        }
    }
}

impl Default for ErrorRoutingPolicy {
    fn default() -> Self {
        Self::fatal()
    }
}

/// What a channel did with a routed fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Reported,
    SessionGroupStopped,
    Ignored,
}

/// Sink for routed faults. A channel failure propagates to the caller.
pub trait ErrorRoutingChannel: Send + Sync {
    fn name(&self) -> &str;

    fn route_error(&self, fault: &MigrationFault) -> Result<RouteOutcome, MigrationFault>;

    /// Stop the session group regardless of configuration. Channels that
    /// cannot stop anything ignore the request.
    fn stop_session_group(&self, _fault: &MigrationFault) -> Result<RouteOutcome, MigrationFault> {
        Ok(RouteOutcome::Ignored)
    }
}

impl fmt::Debug for dyn ErrorRoutingChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorRoutingChannel")
            .field("name", &self.name())
            .finish()
    }
}

/// Stops the whole session group by cancelling its token.
///
/// Initialization and addin faults always stop the group; other faults only
/// when the channel is enabled.
#[derive(Debug, Clone)]
pub struct BlockingSessionGroupChannel {
    token: CancellationToken,
    enabled: bool,
}

impl BlockingSessionGroupChannel {
    pub fn new(token: CancellationToken, enabled: bool) -> Self {
        Self { token, enabled }
    }

    fn stop(&self, fault: &MigrationFault) -> RouteOutcome {
        tracing::warn!(
            kind = %fault.kind,
            message = %fault.message,
            "stopping session group"
        );
        self.token.cancel();
        RouteOutcome::SessionGroupStopped
    }
}

impl ErrorRoutingChannel for BlockingSessionGroupChannel {
    fn name(&self) -> &str {
        "blockingSessionGroup"
    }

    fn route_error(&self, fault: &MigrationFault) -> Result<RouteOutcome, MigrationFault> {
        if fault.category.is_always_fatal() || self.enabled {
            Ok(self.stop(fault))
        } else {
            Ok(RouteOutcome::Ignored)
        }
    }

    fn stop_session_group(&self, fault: &MigrationFault) -> Result<RouteOutcome, MigrationFault> {
        Ok(self.stop(fault))
    }
}

/// Writes routed faults to the log.
#[derive(Debug, Clone)]
pub struct EventLogChannel {
    enabled: bool,
}

impl EventLogChannel {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }
}

impl Default for EventLogChannel {
    fn default() -> Self {
        Self::new(true)
    }
}

impl ErrorRoutingChannel for EventLogChannel {
    fn name(&self) -> &str {
        "eventLog"
    }

    fn route_error(&self, fault: &MigrationFault) -> Result<RouteOutcome, MigrationFault> {
        if !self.enabled {
            return Ok(RouteOutcome::Ignored);
        }
        match fault.inner() {
            Some(inner) => tracing::error!(
                kind = %fault.kind,
                category = ?fault.category,
                inner = %inner,
                "{}",
                fault.message
            ),
            None => tracing::error!(kind = %fault.kind, category = ?fault.category, "{}", fault.message),
        }
        Ok(RouteOutcome::Reported)
    }
}

/// Debugging sink that keeps every routed fault for inspection.
#[derive(Debug, Default)]
pub struct AssertChannel {
    routed: Mutex<Vec<MigrationFault>>,
}

impl AssertChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn routed(&self) -> Vec<MigrationFault> {
        self.routed.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl ErrorRoutingChannel for AssertChannel {
    fn name(&self) -> &str {
        "assert"
    }

    fn route_error(&self, fault: &MigrationFault) -> Result<RouteOutcome, MigrationFault> {
        tracing::debug!(fault = %fault, "assert channel hit");
        self.routed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(fault.clone());
        Ok(RouteOutcome::Reported)
    }
}
