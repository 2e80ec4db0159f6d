//! Applicability scope interpreters.
//!
//! Every conflict type carries a [`ScopeInterpreter`] that decides whether a
//! conflict's scope hint falls inside a resolution rule's applicability
//! scope, and how rule scopes rank against each other by specificity.
//!
//! All comparisons are case-insensitive. Interpreters are pure: no state, no
//! side effects, and malformed input is simply "not in scope".

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Path separator used by [`ScopeInterpreter::BasicPath`].
pub const PATH_SEPARATOR: char = '/';

/// Wildcard accepted by path segments and string scopes.
pub const WILDCARD: &str = "*";

/// How a conflict type interprets scope strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ScopeInterpreter {
    /// UNIX-style hierarchical path, e.g. `/root/a/b`. A rule scope covers
    /// itself and everything nested under it; `*` matches one segment.
    #[default]
    BasicPath,
    /// Every scope is in scope.
    Global,
    /// Exact (case-insensitive) string match; `*` or empty matches all.
    ExactString,
    /// Exact change group id match.
    ChangeGroup,
    /// Inclusive integer range `a-b`, or a single integer.
    IntegerRange,
}

impl ScopeInterpreter {
    /// Determine whether `scope_hint` falls within `rule_scope`.
    pub fn is_in_scope(&self, scope_hint: &str, rule_scope: &str) -> bool {
        let hint = scope_hint.trim();
        let rule = rule_scope.trim();
        match self {
            ScopeInterpreter::BasicPath => path_in_scope(hint, rule),
            ScopeInterpreter::Global => true,
            ScopeInterpreter::ExactString => {
                hint.is_empty() || rule.is_empty() || rule == WILDCARD || eq_ci(hint, rule)
            }
            ScopeInterpreter::ChangeGroup => {
                if hint.is_empty() || rule.is_empty() {
                    return true;
                }
                match (hint.parse::<i64>(), rule.parse::<i64>()) {
                    (Ok(h), Ok(r)) => h == r,
                    _ => false,
                }
            }
            ScopeInterpreter::IntegerRange => {
                if hint.is_empty() || rule.is_empty() {
                    return true;
                }
                match (hint.parse::<i64>(), parse_range(rule)) {
                    (Ok(value), Some((lo, hi))) => lo <= value && value <= hi,
                    _ => false,
                }
            }
        }
    }

    /// Validate a rule scope before it is accepted into the rule store.
    ///
    /// Returns the syntax hint on failure.
    pub fn validate_rule_scope(&self, rule_scope: &str) -> std::result::Result<(), &'static str> {
        let rule = rule_scope.trim();
        let valid = match self {
            ScopeInterpreter::BasicPath => is_well_formed_path(rule),
            ScopeInterpreter::Global | ScopeInterpreter::ExactString => true,
            ScopeInterpreter::ChangeGroup => rule.is_empty() || rule.parse::<i64>().is_ok(),
            ScopeInterpreter::IntegerRange => {
                rule.is_empty() || parse_range(rule).is_some_and(|(lo, hi)| lo <= hi)
            }
        };
        if valid {
            Ok(())
        } else {
            Err(self.syntax_hint())
        }
    }

    /// Human-readable description of the accepted scope syntax.
    pub fn syntax_hint(&self) -> &'static str {
        match self {
            ScopeInterpreter::BasicPath => "UNIX-style path, e.g. /a/b/c",
            ScopeInterpreter::Global => "any string; always in scope",
            ScopeInterpreter::ExactString => "an exact string, or * for any",
            ScopeInterpreter::ChangeGroup => "an integer change group id",
            ScopeInterpreter::IntegerRange => "an integer (2) or inclusive range (0-123)",
        }
    }

    /// Rank two rule scopes. `Ordering::Less` means `a` is more specific
    /// than `b` and should be tried first.
    pub fn compare_specificity(&self, a: &str, b: &str) -> Ordering {
        match self {
            ScopeInterpreter::BasicPath => path_specificity(a).cmp(&path_specificity(b)),
            ScopeInterpreter::Global => Ordering::Equal,
            ScopeInterpreter::ExactString | ScopeInterpreter::ChangeGroup => {
                is_catch_all(a).cmp(&is_catch_all(b))
            }
            ScopeInterpreter::IntegerRange => range_width(a).cmp(&range_width(b)),
        }
    }
}

fn eq_ci(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b) || a.to_lowercase() == b.to_lowercase()
}

fn is_catch_all(scope: &str) -> bool {
    let scope = scope.trim();
    scope.is_empty() || scope == WILDCARD
}

fn is_well_formed_path(scope: &str) -> bool {
    scope.is_empty() || scope.starts_with(PATH_SEPARATOR)
}

/// Split a well-formed path into its segments, ignoring the leading and any
/// trailing separators. The root (`/`) and the empty scope have no segments.
pub(crate) fn path_segments(scope: &str) -> Vec<&str> {
    let trimmed = scope.trim().trim_end_matches(PATH_SEPARATOR);
    if trimmed.is_empty() {
        return Vec::new();
    }
    trimmed
        .strip_prefix(PATH_SEPARATOR)
        .unwrap_or(trimmed)
        .split(PATH_SEPARATOR)
        .collect()
}

fn path_in_scope(hint: &str, rule: &str) -> bool {
    if !is_well_formed_path(hint) || !is_well_formed_path(rule) {
        return false;
    }
    let rule_segments = path_segments(rule);
    if rule_segments.is_empty() {
        return true;
    }
    let hint_segments = path_segments(hint);
    if rule_segments.len() > hint_segments.len() {
        return false;
    }
    rule_segments
        .iter()
        .zip(hint_segments.iter())
        .all(|(r, h)| *r == WILDCARD || eq_ci(r, h))
}

/// Sort key for path rule scopes: deeper paths first, then fewer wildcards.
/// The catch-all scope always sorts last.
fn path_specificity(scope: &str) -> (bool, std::cmp::Reverse<usize>, usize) {
    let segments = path_segments(scope);
    let wildcards = segments.iter().filter(|s| **s == WILDCARD).count();
    (
        segments.is_empty(),
        std::cmp::Reverse(segments.len()),
        wildcards,
    )
}

fn parse_range(scope: &str) -> Option<(i64, i64)> {
    let scope = scope.trim();
    // A leading '-' is a sign, not the range symbol.
    let split_at = scope
        .char_indices()
        .skip(1)
        .find(|(_, c)| *c == '-')
        .map(|(i, _)| i);
    match split_at {
        None => scope.parse::<i64>().ok().map(|v| (v, v)),
        Some(i) => {
            let lo = scope[..i].trim().parse::<i64>().ok()?;
            let hi = scope[i + 1..].trim().parse::<i64>().ok()?;
            Some((lo, hi))
        }
    }
}

fn range_width(scope: &str) -> (bool, u128) {
    match parse_range(scope) {
        Some((lo, hi)) => (false, (hi as i128 - lo as i128).unsigned_abs()),
        None => (true, u128::MAX),
    }
}
