//! Error signatures.
//!
//! A signature describes a class of [`MigrationFault`]s. Signatures are
//! totally ordered most-specific-first, which is the order the error manager
//! tries them in:
//!
//! 1. custom predicates
//! 2. two-level signatures (outer fault and its inner fault)
//! 3. one-level signatures with a message fragment
//! 4. one-level signatures on the kind alone
//! 5. catch-alls: signatures made of nothing but [`WILDCARD`] kinds
//!
//! Within each tier, signatures using the [`WILDCARD`] kind sort last. Kinds
//! compare case-insensitively, so `Timeout` and `timeout` are the same
//! signature.

use crate::MigrationFault;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

/// Kind that matches any fault.
pub const WILDCARD: &str = "*";

pub type FaultPredicate = dyn Fn(&MigrationFault) -> bool + Send + Sync;

#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ErrorSignature {
    OneLevel {
        kind: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    TwoLevel {
        #[serde(rename = "outerKind")]
        outer_kind: String,
        #[serde(rename = "outerMessage", default, skip_serializing_if = "Option::is_none")]
        outer_message: Option<String>,
        #[serde(rename = "innerKind")]
        inner_kind: String,
        #[serde(rename = "innerMessage", default, skip_serializing_if = "Option::is_none")]
        inner_message: Option<String>,
    },
    /// Arbitrary predicate, identified by name. Not serializable.
    #[serde(skip)]
    Custom {
        name: String,
        predicate: Arc<FaultPredicate>,
    },
}

impl ErrorSignature {
    pub fn one_level(kind: impl Into<String>) -> Self {
        ErrorSignature::OneLevel {
            kind: kind.into(),
            message: None,
        }
    }

    /// Match faults of `kind` whose message contains `message`.
    pub fn with_message(kind: impl Into<String>, message: impl Into<String>) -> Self {
        ErrorSignature::OneLevel {
            kind: kind.into(),
            message: Some(message.into()),
        }
    }

    pub fn two_level(outer_kind: impl Into<String>, inner_kind: impl Into<String>) -> Self {
        ErrorSignature::TwoLevel {
            outer_kind: outer_kind.into(),
            outer_message: None,
            inner_kind: inner_kind.into(),
            inner_message: None,
        }
    }

    pub fn custom<F>(name: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&MigrationFault) -> bool + Send + Sync + 'static,
    {
        ErrorSignature::Custom {
            name: name.into(),
            predicate: Arc::new(predicate),
        }
    }

    /// One-level signature matching every fault.
    pub fn any() -> Self {
        Self::one_level(WILDCARD)
    }

    /// Two-level signature matching every fault that wraps another.
    pub fn any_wrapped() -> Self {
        Self::two_level(WILDCARD, WILDCARD)
    }

    pub fn matches(&self, fault: &MigrationFault) -> bool {
        match self {
            ErrorSignature::OneLevel { kind, message } => level_matches(kind, message, fault),
            ErrorSignature::TwoLevel {
                outer_kind,
                outer_message,
                inner_kind,
                inner_message,
            } => {
                level_matches(outer_kind, outer_message, fault)
                    && fault
                        .inner()
                        .is_some_and(|inner| level_matches(inner_kind, inner_message, inner))
            }
            ErrorSignature::Custom { predicate, .. } => predicate(fault),
        }
    }

    /// (catch-all, tier, wildcard kinds, missing messages); lower is more
    /// specific.
    fn specificity(&self) -> (u8, u8, u8, u8) {
        match self {
            ErrorSignature::Custom { .. } => (0, 0, 0, 0),
            ErrorSignature::TwoLevel {
                outer_kind,
                outer_message,
                inner_kind,
                inner_message,
            } => (
                self.is_catch_all() as u8,
                1,
                is_wildcard(outer_kind) as u8 + is_wildcard(inner_kind) as u8,
                outer_message.is_none() as u8 + inner_message.is_none() as u8,
            ),
            ErrorSignature::OneLevel { kind, message } => (
                self.is_catch_all() as u8,
                2 + message.is_none() as u8,
                is_wildcard(kind) as u8,
                0,
            ),
        }
    }

    /// Wildcard kinds only and no message fragments, like [`any`](Self::any)
    /// and [`any_wrapped`](Self::any_wrapped).
    pub fn is_catch_all(&self) -> bool {
        match self {
            ErrorSignature::OneLevel { kind, message } => is_wildcard(kind) && message.is_none(),
            ErrorSignature::TwoLevel {
                outer_kind,
                outer_message,
                inner_kind,
                inner_message,
            } => {
                is_wildcard(outer_kind)
                    && is_wildcard(inner_kind)
                    && outer_message.is_none()
                    && inner_message.is_none()
            }
            ErrorSignature::Custom { .. } => false,
        }
    }

    fn identity(&self) -> Vec<String> {
        let lower = |s: &str| s.to_lowercase();
        let lower_opt = |s: &Option<String>| s.as_deref().map(lower).unwrap_or_default();
        match self {
            ErrorSignature::Custom { name, .. } => vec![name.clone()],
            ErrorSignature::TwoLevel {
                outer_kind,
                outer_message,
                inner_kind,
                inner_message,
            } => vec![
                lower(outer_kind),
                lower_opt(outer_message),
                lower(inner_kind),
                lower_opt(inner_message),
            ],
            ErrorSignature::OneLevel { kind, message } => vec![lower(kind), lower_opt(message)],
        }
    }
}

fn is_wildcard(kind: &str) -> bool {
    kind.trim() == WILDCARD
}

fn level_matches(kind: &str, message: &Option<String>, fault: &MigrationFault) -> bool {
    let kind_ok = is_wildcard(kind) || kind.eq_ignore_ascii_case(&fault.kind);
    let message_ok = match message {
        None => true,
        Some(fragment) => fault
            .message
            .to_lowercase()
            .contains(&fragment.to_lowercase()),
    };
    kind_ok && message_ok
}

impl Ord for ErrorSignature {
    fn cmp(&self, other: &Self) -> Ordering {
        self.specificity()
            .cmp(&other.specificity())
            .then_with(|| self.identity().cmp(&other.identity()))
    }
}

impl PartialOrd for ErrorSignature {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for ErrorSignature {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ErrorSignature {}

impl fmt::Debug for ErrorSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSignature::OneLevel { kind, message } => f
                .debug_struct("OneLevel")
                .field("kind", kind)
                .field("message", message)
                .finish(),
            ErrorSignature::TwoLevel {
                outer_kind,
                outer_message,
                inner_kind,
                inner_message,
            } => f
                .debug_struct("TwoLevel")
                .field("outer_kind", outer_kind)
                .field("outer_message", outer_message)
                .field("inner_kind", inner_kind)
                .field("inner_message", inner_message)
                .finish(),
            ErrorSignature::Custom { name, .. } => {
                f.debug_struct("Custom").field("name", name).finish_non_exhaustive()
            }
        }
    }
}

impl fmt::Display for ErrorSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSignature::OneLevel { kind, message: None } => write!(f, "{kind}"),
            ErrorSignature::OneLevel {
                kind,
                message: Some(m),
            } => write!(f, "{kind}(\"{m}\")"),
            ErrorSignature::TwoLevel {
                outer_kind,
                inner_kind,
                ..
            } => write!(f, "{outer_kind} > {inner_kind}"),
            ErrorSignature::Custom { name, .. } => write!(f, "custom:{name}"),
        }
    }
}
