//! Detectors (spec §4.E): per-signal "check enable, check cooldown, call
//! the Rule Evaluator, fire the matching Profile Action" logic, plus the
//! thread-shrink controller's sibling, the thread-count's paired dump.
//!
//! The shared sequence is factored into [`run`], matching the teacher's
//! `BenchmarkWatchdog` pattern of one behavior (heartbeat timeout ->
//! teardown) reused by every caller instead of copy-pasted per signal
//! (`system/performance/watchdog.rs`).

use std::time::{Duration, Instant};

use crate::actions::{self, ProfileProducer};
use crate::dumpfile::Kind;
use crate::options::DumpOptions;
use crate::reporter::ReporterHandle;
use crate::rule::{self, Reason, Scene, SignalRule};
use crate::sinks;

/// Per-signal cooldown clock. Lives inside the engine alongside the
/// signal's [`crate::ring::Ring`] — not behind a lock, since the sample
/// loop is the sole writer and reader (spec §5 reentrancy discipline).
#[derive(Debug, Clone, Copy, Default)]
pub struct Cooldown {
    not_before: Option<Instant>,
}

impl Cooldown {
    pub fn is_cooling(&self, now: Instant) -> bool {
        matches!(self.not_before, Some(t) if now < t)
    }

    pub fn arm(&mut self, now: Instant, cooldown: Duration) {
        self.not_before = Some(now + cooldown);
    }
}

/// What happened when a detector ran for one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Disabled,
    Cooling,
    NotFired(Reason),
    /// Fired, action + file write succeeded; cooldown armed.
    Dumped,
    /// Fired, but capturing the profile or writing it failed; cooldown not
    /// armed, detector will retry next tick (spec §4.G).
    DumpFailed,
}

/// Evaluate and, if warranted, fire one non-thread, non-GC-heap signal
/// (task, mem, or cpu share this shape — cpu's caller passes its own
/// action closure since it needs the sampling duration).
#[allow(clippy::too_many_arguments)]
fn run(
    rule: &SignalRule,
    cooldown: &mut Cooldown,
    avg: i64,
    cur: i64,
    trigger_count: &mut u64,
    action: impl FnOnce(Reason, Scene) -> Result<Vec<crate::actions::DumpOutcome>, crate::error::DumpError>,
    dump_options: &DumpOptions,
    reporter: Option<&ReporterHandle>,
) -> Outcome {
    if !rule.enable {
        return Outcome::Disabled;
    }
    let now = Instant::now();
    if cooldown.is_cooling(now) {
        return Outcome::Cooling;
    }
    let (fire, reason) = rule::evaluate_rule(rule, avg, cur);
    if !fire {
        return Outcome::NotFired(reason);
    }
    let scene = Scene::from_rule(rule, avg, cur);
    let outcomes = match action(reason, scene) {
        Ok(outcomes) => outcomes,
        Err(err) => {
            log::warn!("profile capture failed: {}", err);
            return Outcome::DumpFailed;
        }
    };
    for outcome in &outcomes {
        if let Err(err) = sinks::fan_out(outcome, dump_options, reporter) {
            log::warn!("dump write failed: {}", err);
            return Outcome::DumpFailed;
        }
    }
    cooldown.arm(now, rule.cooldown);
    *trigger_count += 1;
    Outcome::Dumped
}

/// Task-stack detector (spec §4.E "task dump").
#[allow(clippy::too_many_arguments)]
pub fn task_detector(
    rule: &SignalRule,
    cooldown: &mut Cooldown,
    avg: i64,
    cur: i64,
    trigger_count: &mut u64,
    producer: &dyn ProfileProducer,
    dump_options: &DumpOptions,
    reporter: Option<&ReporterHandle>,
) -> Outcome {
    run(
        rule,
        cooldown,
        avg,
        cur,
        trigger_count,
        |reason, scene| actions::task_dump(producer, reason, scene).map(|o| vec![o]),
        dump_options,
        reporter,
    )
}

/// Memory detector (spec §4.E "memory dump").
#[allow(clippy::too_many_arguments)]
pub fn mem_detector(
    rule: &SignalRule,
    cooldown: &mut Cooldown,
    avg: i64,
    cur: i64,
    trigger_count: &mut u64,
    producer: &dyn ProfileProducer,
    dump_options: &DumpOptions,
    reporter: Option<&ReporterHandle>,
) -> Outcome {
    run(
        rule,
        cooldown,
        avg,
        cur,
        trigger_count,
        |reason, scene| actions::mem_dump(producer, reason, scene).map(|o| vec![o]),
        dump_options,
        reporter,
    )
}

/// CPU detector (spec §4.E "CPU dump"). Blocks the sample loop for
/// `sampling_time` by design (spec §9 "cooperative CPU sampling").
#[allow(clippy::too_many_arguments)]
pub fn cpu_detector(
    rule: &SignalRule,
    cooldown: &mut Cooldown,
    avg: i64,
    cur: i64,
    trigger_count: &mut u64,
    producer: &dyn ProfileProducer,
    sampling_time: Duration,
    dump_options: &DumpOptions,
    reporter: Option<&ReporterHandle>,
) -> Outcome {
    run(
        rule,
        cooldown,
        avg,
        cur,
        trigger_count,
        |reason, scene| actions::cpu_dump(producer, sampling_time, reason, scene).map(|o| vec![o]),
        dump_options,
        reporter,
    )
}

/// Thread-create detector (spec §4.E "thread-create dump"): fires two
/// correlated blobs (thread-create profile + task-stacks) sharing one
/// event-id.
#[allow(clippy::too_many_arguments)]
pub fn thread_detector(
    rule: &SignalRule,
    cooldown: &mut Cooldown,
    avg: i64,
    cur: i64,
    trigger_count: &mut u64,
    producer: &dyn ProfileProducer,
    dump_options: &DumpOptions,
    reporter: Option<&ReporterHandle>,
) -> Outcome {
    let next_trigger_count = *trigger_count + 1;
    run(
        rule,
        cooldown,
        avg,
        cur,
        trigger_count,
        move |reason, scene| {
            let (thread_out, stack_out) =
                actions::thread_dump(producer, reason, scene, next_trigger_count)?;
            Ok(vec![thread_out, stack_out])
        },
        dump_options,
        reporter,
    )
}

/// Kinds this module's detectors fire, re-exported for convenience of
/// callers matching on what happened.
pub const SIGNAL_KINDS: [Kind; 4] = [Kind::Goroutine, Kind::Mem, Kind::Cpu, Kind::Thread];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::MockProfileProducer;
    use crate::options::DumpFormat;

    fn enabled_rule() -> SignalRule {
        SignalRule {
            enable: true,
            min: 10,
            abs: 70,
            diff: 25,
            max: None,
            cooldown: Duration::from_secs(60),
        }
    }

    fn dump_options(dir: &std::path::Path) -> DumpOptions {
        DumpOptions {
            dump_path: dir.to_path_buf(),
            format: DumpFormat::Text,
            full_stack: false,
            dump_to_logger: false,
        }
    }

    #[test]
    fn disabled_rule_short_circuits() {
        let mut rule = enabled_rule();
        rule.enable = false;
        let mut cooldown = Cooldown::default();
        let mut count = 0;
        let tmp = tempfile::tempdir().unwrap();
        let producer = MockProfileProducer::default();
        let outcome = mem_detector(
            &rule,
            &mut cooldown,
            40,
            90,
            &mut count,
            &producer,
            &dump_options(tmp.path()),
            None,
        );
        assert_eq!(outcome, Outcome::Disabled);
        assert_eq!(count, 0);
    }

    #[test]
    fn s2_fires_then_cools_down() {
        let rule = enabled_rule();
        let mut cooldown = Cooldown::default();
        let mut count = 0;
        let tmp = tempfile::tempdir().unwrap();
        let producer = MockProfileProducer::default();
        let dump = dump_options(tmp.path());

        let first = mem_detector(&rule, &mut cooldown, 50, 81, &mut count, &producer, &dump, None);
        assert_eq!(first, Outcome::Dumped);
        assert_eq!(count, 1);

        let second = mem_detector(&rule, &mut cooldown, 50, 81, &mut count, &producer, &dump, None);
        assert_eq!(second, Outcome::Cooling);
        assert_eq!(count, 1);
    }

    #[test]
    fn dump_failure_does_not_arm_cooldown() {
        let rule = enabled_rule();
        let mut cooldown = Cooldown::default();
        let mut count = 0;
        let tmp = tempfile::tempdir().unwrap();
        let producer = MockProfileProducer {
            fail: true,
            ..Default::default()
        };
        let dump = dump_options(tmp.path());

        let outcome = mem_detector(&rule, &mut cooldown, 50, 81, &mut count, &producer, &dump, None);
        assert_eq!(outcome, Outcome::DumpFailed);
        assert_eq!(count, 0);
        assert!(!cooldown.is_cooling(Instant::now()));
    }

    #[test]
    fn thread_detector_increments_trigger_count_once() {
        let rule = enabled_rule();
        let mut cooldown = Cooldown::default();
        let mut count = 0;
        let tmp = tempfile::tempdir().unwrap();
        let producer = MockProfileProducer::default();
        let dump = dump_options(tmp.path());

        let outcome =
            thread_detector(&rule, &mut cooldown, 50, 81, &mut count, &producer, &dump, None);
        assert_eq!(outcome, Outcome::Dumped);
        assert_eq!(count, 1);
    }
}
