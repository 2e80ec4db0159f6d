//! Per-session-group error manager.
//!
//! Faults are matched against registered signatures most-specific-first.
//! The matching signature's policy decides whether to route; routed faults
//! go to every channel in registration order. A fault no signature claims is
//! raised as a RuntimeError conflict when a conflict manager is supplied.
//!
//! All state sits behind one lock, so sessions of the same group share
//! occurrence counters.

use crate::builtin;
use crate::config::{ChannelKind, ErrorManagementConfig};
use crate::error::Result;
use crate::fault::{kinds, messages};
use crate::manager::ConflictManager;
use crate::routing::{
    AssertChannel, BlockingSessionGroupChannel, ErrorRoutingChannel, ErrorRoutingPolicy,
    EventLogChannel, PolicyDecision, RouteOutcome, DEFAULT_MAX_OCCURRENCE,
    ENVIRONMENTAL_MAX_OCCURRENCE,
};
use crate::signature::ErrorSignature;
use crate::{CancellationToken, ConflictId, MigrationFault, MigrationSourceId, SessionGroupId, SessionId};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorHandlingResult {
    /// The fault was forwarded to the channels
    RoutedToChannels {
        signature: Option<String>,
        stop_requested: bool,
    },
    /// A signature matched but its threshold was not reached
    PolicyConditionIsNotMet,
    /// No signature matched; the fault became a RuntimeError conflict
    RaisedAsRuntimeConflict {
        conflict_id: ConflictId,
        resolved: bool,
    },
    /// No signature matched and there was no conflict manager to escalate to
    Unhandled,
}

impl ErrorHandlingResult {
    pub fn stop_requested(&self) -> bool {
        matches!(
            self,
            ErrorHandlingResult::RoutedToChannels {
                stop_requested: true,
                ..
            }
        )
    }
}

/// Session context attached to runtime conflicts raised for unclaimed faults.
#[derive(Debug, Clone, Copy, Default)]
pub struct FaultOrigin {
    pub session_id: Option<SessionId>,
    pub source_id: Option<MigrationSourceId>,
}

#[derive(Debug, Default)]
struct ManagerState {
    registrations: BTreeMap<ErrorSignature, ErrorRoutingPolicy>,
    channels: Vec<Arc<dyn ErrorRoutingChannel>>,
}

impl ManagerState {
    fn route(&self, fault: &MigrationFault) -> Result<bool> {
        let mut stop_requested = false;
        for channel in &self.channels {
            let outcome = channel.route_error(fault)?;
            stop_requested |= outcome == RouteOutcome::SessionGroupStopped;
        }
        Ok(stop_requested)
    }
}

#[derive(Debug)]
pub struct ErrorManager {
    group_id: SessionGroupId,
    state: Mutex<ManagerState>,
}

impl ErrorManager {
    /// A manager with no registrations and no channels.
    pub fn new(group_id: SessionGroupId) -> Self {
        Self {
            group_id,
            state: Mutex::new(ManagerState::default()),
        }
    }

    /// Build a fully configured manager: toolkit defaults, then configured
    /// routers, then implicit wildcards; channels in configured order.
    pub fn from_config(
        group_id: SessionGroupId,
        config: &ErrorManagementConfig,
        group_cancel: &CancellationToken,
    ) -> Self {
        let manager = Self::new(group_id);
        manager.register_default_errors();
        for router in &config.routers {
            manager.register_error(
                router.signature.clone(),
                Some(ErrorRoutingPolicy::max_occurrence(router.max_occurrence)),
            );
        }
        manager.register_implicit_defaults();

        for channel in &config.channels {
            let channel: Arc<dyn ErrorRoutingChannel> = match channel.kind {
                ChannelKind::BlockingSessionGroup => Arc::new(BlockingSessionGroupChannel::new(
                    group_cancel.clone(),
                    channel.enabled,
                )),
                ChannelKind::EventLog => Arc::new(EventLogChannel::new(channel.enabled)),
                ChannelKind::Assert => Arc::new(AssertChannel::new()),
            };
            manager.add_channel(channel);
        }
        manager
    }

    pub fn group_id(&self) -> SessionGroupId {
        self.group_id
    }

    fn state(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a signature. Re-registering replaces the earlier policy.
    pub fn register_error(&self, signature: ErrorSignature, policy: Option<ErrorRoutingPolicy>) {
        let policy = policy.unwrap_or_default();
        tracing::debug!(
            group_id = %self.group_id,
            signature = %signature,
            threshold = policy.threshold(),
            "error signature registered"
        );
        let mut state = self.state();
        state.registrations.remove(&signature);
        state.registrations.insert(signature, policy);
    }

    /// Toolkit defaults: fatal local conditions, noisy runtime faults at the
    /// default threshold, environmental faults at a very high threshold.
    pub fn register_default_errors(&self) {
        let fatal = [
            ErrorSignature::with_message(kinds::IO, messages::NOT_ENOUGH_SPACE_ON_DISK),
            ErrorSignature::with_message(kinds::NOT_SUPPORTED, messages::WORKSPACE_IS_REQUIRED),
            ErrorSignature::one_level(kinds::UNAUTHORIZED),
        ];
        for signature in fatal {
            self.register_error(signature, Some(ErrorRoutingPolicy::fatal()));
        }

        for kind in [kinds::OUT_OF_MEMORY, kinds::NULL_REFERENCE] {
            self.register_error(
                ErrorSignature::one_level(kind),
                Some(ErrorRoutingPolicy::max_occurrence(DEFAULT_MAX_OCCURRENCE)),
            );
        }

        let environmental = [
            kinds::DATABASE,
            kinds::DATABASE_CONNECTION,
            kinds::TIMEOUT,
            kinds::DEADLOCK,
            kinds::SERVICE_UNAVAILABLE,
            kinds::TRANSACTION_ABORTED,
            kinds::REPOSITORY_NOT_FOUND,
        ];
        for kind in environmental {
            self.register_error(
                ErrorSignature::one_level(kind),
                Some(ErrorRoutingPolicy::max_occurrence(ENVIRONMENTAL_MAX_OCCURRENCE)),
            );
        }
    }

    /// Wildcard signatures for any fault. Never replaces an existing
    /// registration.
    pub fn register_implicit_defaults(&self) {
        let mut state = self.state();
        for signature in [ErrorSignature::any(), ErrorSignature::any_wrapped()] {
            state
                .registrations
                .entry(signature)
                .or_insert_with(|| ErrorRoutingPolicy::max_occurrence(DEFAULT_MAX_OCCURRENCE));
        }
    }

    pub fn add_channel(&self, channel: Arc<dyn ErrorRoutingChannel>) {
        self.state().channels.push(channel);
    }

    pub fn channel_names(&self) -> Vec<String> {
        self.state()
            .channels
            .iter()
            .map(|c| c.name().to_string())
            .collect()
    }

    /// The policy registered for a signature, with its current counter.
    pub fn policy(&self, signature: &ErrorSignature) -> Option<ErrorRoutingPolicy> {
        self.state().registrations.get(signature).cloned()
    }

    pub fn registration_count(&self) -> usize {
        self.state().registrations.len()
    }

    pub fn try_handle(
        &self,
        fault: &MigrationFault,
        conflict_manager: Option<&ConflictManager>,
    ) -> Result<ErrorHandlingResult> {
        self.try_handle_from(fault, conflict_manager, FaultOrigin::default())
    }

    /// Classify and route a fault raised by a session.
    ///
    /// Channel failures and conflict-manager failures propagate.
    pub fn try_handle_from(
        &self,
        fault: &MigrationFault,
        conflict_manager: Option<&ConflictManager>,
        origin: FaultOrigin,
    ) -> Result<ErrorHandlingResult> {
        {
            let mut state = self.state();

            if fault.category.is_always_fatal() {
                tracing::warn!(group_id = %self.group_id, fault = %fault, "fatal fault, routing immediately");
                let stop_requested = state.route(fault)?;
                return Ok(ErrorHandlingResult::RoutedToChannels {
                    signature: None,
                    stop_requested,
                });
            }

            let matched = state
                .registrations
                .iter_mut()
                .find(|(signature, _)| signature.matches(fault))
                .map(|(signature, policy)| (signature.to_string(), policy.record_occurrence()));

            if let Some((signature, decision)) = matched {
                return match decision {
                    PolicyDecision::ConditionNotMet => {
                        tracing::debug!(signature = %signature, "occurrence counted, below threshold");
                        Ok(ErrorHandlingResult::PolicyConditionIsNotMet)
                    }
                    PolicyDecision::Route => {
                        let stop_requested = state.route(fault)?;
                        Ok(ErrorHandlingResult::RoutedToChannels {
                            signature: Some(signature),
                            stop_requested,
                        })
                    }
                };
            }
        }

        let Some(conflict_manager) = conflict_manager else {
            tracing::warn!(group_id = %self.group_id, fault = %fault, "fault matched no signature");
            return Ok(ErrorHandlingResult::Unhandled);
        };

        let mut conflict = builtin::runtime_error_conflict(fault);
        conflict.session_id = origin.session_id;
        conflict.source_id = origin.source_id;
        let outcome = conflict_manager.raise_conflict(conflict)?;
        Ok(ErrorHandlingResult::RaisedAsRuntimeConflict {
            conflict_id: outcome.conflict_id,
            resolved: outcome.resolved,
        })
    }

    /// Stop the session group through every channel able to, regardless of
    /// thresholds or enabled flags. Returns whether any channel stopped it.
    pub fn stop_session_group(&self, fault: &MigrationFault) -> Result<bool> {
        let state = self.state();
        let mut stopped = false;
        for channel in &state.channels {
            stopped |= channel.stop_session_group(fault)? == RouteOutcome::SessionGroupStopped;
        }
        Ok(stopped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChannelConfig;
    use crate::fault::FaultCategory;
    use crate::registry::ConflictTypeRegistry;
    use uuid::Uuid;

    fn manager_with_assert() -> (ErrorManager, Arc<AssertChannel>) {
        let manager = ErrorManager::new(Uuid::new_v4());
        let channel = Arc::new(AssertChannel::new());
        manager.add_channel(channel.clone());
        (manager, channel)
    }

    #[test]
    fn threshold_two_routes_on_second_occurrence() {
        let (manager, channel) = manager_with_assert();
        manager.register_error(
            ErrorSignature::one_level(kinds::OUT_OF_MEMORY),
            Some(ErrorRoutingPolicy::max_occurrence(2)),
        );
        let fault = MigrationFault::new(kinds::OUT_OF_MEMORY, "heap");

        assert_eq!(
            manager.try_handle(&fault, None).unwrap(),
            ErrorHandlingResult::PolicyConditionIsNotMet
        );
        assert!(matches!(
            manager.try_handle(&fault, None).unwrap(),
            ErrorHandlingResult::RoutedToChannels { .. }
        ));
        assert_eq!(channel.routed().len(), 1);
        let policy = manager
            .policy(&ErrorSignature::one_level(kinds::OUT_OF_MEMORY))
            .unwrap();
        assert_eq!(policy.occurrences(), 0);
    }

    #[test]
    fn last_registration_wins() {
        let (manager, _) = manager_with_assert();
        let sig = ErrorSignature::one_level("Io");
        manager.register_error(sig.clone(), Some(ErrorRoutingPolicy::max_occurrence(5)));
        manager.register_error(sig.clone(), Some(ErrorRoutingPolicy::fatal()));
        assert_eq!(manager.policy(&sig).unwrap().threshold(), 1);
        assert_eq!(manager.registration_count(), 1);
    }

    #[test]
    fn implicit_defaults_do_not_override() {
        let (manager, _) = manager_with_assert();
        manager.register_error(ErrorSignature::any(), Some(ErrorRoutingPolicy::fatal()));
        manager.register_implicit_defaults();
        assert_eq!(manager.policy(&ErrorSignature::any()).unwrap().threshold(), 1);
        assert_eq!(
            manager.policy(&ErrorSignature::any_wrapped()).unwrap().threshold(),
            DEFAULT_MAX_OCCURRENCE
        );
    }

    #[test]
    fn most_specific_signature_is_used() {
        let (manager, channel) = manager_with_assert();
        manager.register_error(ErrorSignature::one_level("Io"), Some(ErrorRoutingPolicy::max_occurrence(10)));
        manager.register_error(ErrorSignature::with_message("Io", "disk full"), None);

        let result = manager
            .try_handle(&MigrationFault::new("Io", "the disk full again"), None)
            .unwrap();
        assert!(matches!(result, ErrorHandlingResult::RoutedToChannels { .. }));
        assert_eq!(channel.routed().len(), 1);

        let result = manager
            .try_handle(&MigrationFault::new("Io", "file locked"), None)
            .unwrap();
        assert_eq!(result, ErrorHandlingResult::PolicyConditionIsNotMet);
    }

    #[test]
    fn wrapped_faults_reach_explicit_signatures_before_catch_alls() {
        let (manager, channel) = manager_with_assert();
        manager.register_default_errors();
        manager.register_error(ErrorSignature::one_level("Io"), Some(ErrorRoutingPolicy::fatal()));
        manager.register_implicit_defaults();

        let wrapped = MigrationFault::new("Io", "write failed").with_inner(MigrationFault::new("Os", "EIO"));
        assert_eq!(
            manager.try_handle(&wrapped, None).unwrap(),
            ErrorHandlingResult::RoutedToChannels {
                signature: Some("Io".into()),
                stop_requested: false
            }
        );

        let denied = MigrationFault::new(kinds::UNAUTHORIZED, "token expired")
            .with_inner(MigrationFault::new("Http", "401"));
        assert!(matches!(
            manager.try_handle(&denied, None).unwrap(),
            ErrorHandlingResult::RoutedToChannels { .. }
        ));
        assert_eq!(channel.routed().len(), 2);

        let unknown = MigrationFault::new("Weird", "x").with_inner(MigrationFault::new("Os", "y"));
        assert_eq!(
            manager.try_handle(&unknown, None).unwrap(),
            ErrorHandlingResult::PolicyConditionIsNotMet
        );
        assert_eq!(
            manager
                .policy(&ErrorSignature::any_wrapped())
                .unwrap()
                .occurrences(),
            1
        );
    }

    #[test]
    fn concurrent_sessions_share_occurrence_counters() {
        const THRESHOLD: u64 = 7;
        const THREADS: usize = 8;
        const PER_THREAD: usize = 35;

        let (manager, channel) = manager_with_assert();
        manager.register_error(
            ErrorSignature::one_level(kinds::TIMEOUT),
            Some(ErrorRoutingPolicy::max_occurrence(THRESHOLD)),
        );
        let manager = Arc::new(manager);

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let manager = Arc::clone(&manager);
                std::thread::spawn(move || {
                    let fault = MigrationFault::new(kinds::TIMEOUT, "slow target");
                    (0..PER_THREAD)
                        .filter(|_| {
                            matches!(
                                manager.try_handle(&fault, None).unwrap(),
                                ErrorHandlingResult::RoutedToChannels { .. }
                            )
                        })
                        .count()
                })
            })
            .collect();
        let routed: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

        let total = (THREADS * PER_THREAD) as u64;
        assert_eq!(routed as u64, total / THRESHOLD);
        assert_eq!(channel.routed().len() as u64, total / THRESHOLD);
        let policy = manager
            .policy(&ErrorSignature::one_level(kinds::TIMEOUT))
            .unwrap();
        assert_eq!(policy.occurrences(), total % THRESHOLD);
    }

    #[test]
    fn unmatched_fault_without_conflict_manager_is_unhandled() {
        let (manager, _) = manager_with_assert();
        let result = manager.try_handle(&MigrationFault::new("Weird", "x"), None).unwrap();
        assert_eq!(result, ErrorHandlingResult::Unhandled);
    }

    #[test]
    fn unmatched_fault_becomes_runtime_conflict() {
        let (manager, _) = manager_with_assert();
        let conflicts = ConflictManager::new(Arc::new(ConflictTypeRegistry::new()));
        let session = Uuid::new_v4();
        let origin = FaultOrigin {
            session_id: Some(session),
            source_id: None,
        };

        let result = manager
            .try_handle_from(&MigrationFault::new("Weird", "x"), Some(&conflicts), origin)
            .unwrap();
        let ErrorHandlingResult::RaisedAsRuntimeConflict { conflict_id, resolved } = result else {
            panic!("expected runtime conflict, got {result:?}");
        };
        assert!(!resolved);
        let conflict = conflicts.conflict(conflict_id).unwrap();
        assert_eq!(conflict.conflict_type_id, builtin::RUNTIME_ERROR_ID);
        assert_eq!(conflict.session_id, Some(session));
    }

    #[test]
    fn initialization_faults_bypass_thresholds() {
        let token = CancellationToken::new();
        let manager = ErrorManager::new(Uuid::new_v4());
        manager.register_implicit_defaults();
        manager.add_channel(Arc::new(BlockingSessionGroupChannel::new(token.clone(), false)));

        let result = manager
            .try_handle(&MigrationFault::initialization("adapter failed"), None)
            .unwrap();
        assert!(result.stop_requested());
        assert!(token.is_cancelled());
    }

    #[test]
    fn general_faults_do_not_stop_with_disabled_channel() {
        let token = CancellationToken::new();
        let manager = ErrorManager::new(Uuid::new_v4());
        manager.register_error(ErrorSignature::one_level("Io"), None);
        manager.add_channel(Arc::new(BlockingSessionGroupChannel::new(token.clone(), false)));

        let result = manager.try_handle(&MigrationFault::new("Io", "x"), None).unwrap();
        assert_eq!(
            result,
            ErrorHandlingResult::RoutedToChannels {
                signature: Some("Io".into()),
                stop_requested: false
            }
        );
        assert!(!token.is_cancelled());

        assert!(manager.stop_session_group(&MigrationFault::new("Io", "x")).unwrap());
        assert!(token.is_cancelled());
    }

    #[test]
    fn defaults_register_expected_thresholds() {
        let manager = ErrorManager::new(Uuid::new_v4());
        manager.register_default_errors();
        assert_eq!(
            manager
                .policy(&ErrorSignature::one_level(kinds::TIMEOUT))
                .unwrap()
                .threshold(),
            ENVIRONMENTAL_MAX_OCCURRENCE
        );
        assert_eq!(
            manager
                .policy(&ErrorSignature::one_level(kinds::UNAUTHORIZED))
                .unwrap()
                .threshold(),
            1
        );
        assert_eq!(
            manager
                .policy(&ErrorSignature::one_level(kinds::NULL_REFERENCE))
                .unwrap()
                .threshold(),
            DEFAULT_MAX_OCCURRENCE
        );
    }

    #[test]
    fn channel_failure_propagates() {
        struct Broken;
        impl ErrorRoutingChannel for Broken {
            fn name(&self) -> &str {
                "broken"
            }
            fn route_error(&self, _: &MigrationFault) -> std::result::Result<RouteOutcome, MigrationFault> {
                Err(MigrationFault::new("Io", "event log full"))
            }
        }
        let manager = ErrorManager::new(Uuid::new_v4());
        manager.register_error(ErrorSignature::any(), None);
        manager.add_channel(Arc::new(Broken));
        assert!(manager.try_handle(&MigrationFault::new("X", "y"), None).is_err());
    }

    #[test]
    fn from_config_wires_channels_in_order() {
        let config = ErrorManagementConfig {
            routers: vec![],
            channels: vec![
                ChannelConfig {
                    kind: ChannelKind::EventLog,
                    enabled: true,
                },
                ChannelConfig {
                    kind: ChannelKind::BlockingSessionGroup,
                    enabled: false,
                },
            ],
        };
        let manager = ErrorManager::from_config(Uuid::new_v4(), &config, &CancellationToken::new());
        assert_eq!(manager.channel_names(), vec!["eventLog", "blockingSessionGroup"]);
        assert!(manager.policy(&ErrorSignature::any()).is_some());

        let general = MigrationFault::new("Io", "x").with_category(FaultCategory::General);
        assert_eq!(
            manager.try_handle(&general, None).unwrap(),
            ErrorHandlingResult::PolicyConditionIsNotMet
        );
    }
}
