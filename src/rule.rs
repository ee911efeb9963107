//! Pure rule evaluation: given a signal's rolling average and current
//! reading, decide whether it has crossed its configured thresholds.
//!
//! This module has no side effects and knows nothing about `enable` flags,
//! cooldowns, or warm-up sample counts — those are a [`crate::detectors`]
//! concern. Kept pure and dependency-free so its invariants (totality,
//! monotonicity) are simple to state as property tests.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Per-signal threshold configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalRule {
    /// Whether this signal is evaluated at all (checked by the detector,
    /// not by [`evaluate`]).
    pub enable: bool,
    /// Hard floor below which a signal is considered noise, regardless of
    /// how far it has drifted from its rolling average.
    pub min: i64,
    /// Absolute ceiling that fires unconditionally once cleared.
    pub abs: i64,
    /// Percent the current reading must clear the rolling average by.
    pub diff: i64,
    /// Optional hard ceiling; at or above it the rule never fires (used
    /// only for task-count, whose dump cost scales with the count).
    pub max: Option<i64>,
    /// Minimum interval between two fires of this rule.
    pub cooldown: Duration,
}

impl Default for SignalRule {
    fn default() -> Self {
        SignalRule {
            enable: false,
            min: 10,
            abs: 70,
            diff: 25,
            max: None,
            cooldown: Duration::from_secs(60),
        }
    }
}

/// The five closed outcomes of [`evaluate`]. Exactly one is returned for
/// every input tuple (spec invariant: rule totality).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    /// `cur < min`: below the noise floor. Non-fire.
    CurLessMin,
    /// Cleared `min` but neither `abs` nor `diff`. Non-fire; the
    /// catch-all "nothing interesting happened" result.
    CurGreaterMin,
    /// `max` configured and `cur >= max`: signal already unhealthy enough
    /// that a dump would make things worse. Non-fire.
    CurGreaterMax,
    /// `cur > abs`: hard ceiling cleared. Fires unconditionally.
    CurGreaterAbs,
    /// `cur` cleared the rolling average by at least `diff` percent. Fires.
    Diff,
}

impl Reason {
    /// True for the two reasons that mean "take a dump".
    pub fn fires(self) -> bool {
        matches!(self, Reason::CurGreaterAbs | Reason::Diff)
    }
}

/// Evaluate one signal reading against its threshold configuration.
///
/// Evaluation order is fixed and total (spec §4.B):
/// 1. `cur < min` -> `CurLessMin`.
/// 2. `max` configured and `cur >= max` -> `CurGreaterMax`.
/// 3. `cur > abs` -> `CurGreaterAbs`.
/// 4. `avg != 0 && cur >= avg * (100 + diff) / 100` -> `Diff`.
/// 5. otherwise -> `CurGreaterMin`.
///
/// Step 4 treats `avg == 0` as "no baseline established yet" rather than
/// a trivially-satisfied threshold, per the open-question resolution: an
/// all-zero history must not make every positive reading fire `Diff`.
pub fn evaluate(avg: i64, cur: i64, min: i64, abs: i64, diff: i64, max: Option<i64>) -> (bool, Reason) {
    if cur < min {
        return (false, Reason::CurLessMin);
    }
    if let Some(max) = max {
        if cur >= max {
            return (false, Reason::CurGreaterMax);
        }
    }
    if cur > abs {
        return (true, Reason::CurGreaterAbs);
    }
    if avg != 0 && cur >= avg.saturating_mul(100 + diff) / 100 {
        return (true, Reason::Diff);
    }
    (false, Reason::CurGreaterMin)
}

/// Evaluate a reading against a [`SignalRule`]'s thresholds (ignores
/// `enable`/`cooldown`, which the caller has already checked).
pub fn evaluate_rule(rule: &SignalRule, avg: i64, cur: i64) -> (bool, Reason) {
    evaluate(avg, cur, rule.min, rule.abs, rule.diff, rule.max)
}

/// Snapshot of a signal's configuration and observed values, handed to the
/// Reporter Worker for context (spec §4.I).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scene {
    pub trigger_min: i64,
    pub trigger_abs: i64,
    pub trigger_diff: i64,
    pub trigger_max: Option<i64>,
    pub current: i64,
    pub avg: i64,
}

impl Scene {
    /// Build a `Scene` from the same inputs [`evaluate_rule`] consumed, so
    /// callers don't repeat the five fields by hand at each call site.
    pub fn from_rule(rule: &SignalRule, avg: i64, cur: i64) -> Self {
        Scene {
            trigger_min: rule.min,
            trigger_abs: rule.abs,
            trigger_diff: rule.diff,
            trigger_max: rule.max,
            current: cur,
            avg,
        }
    }
}
