//! GC-Heap Detector (spec §4.F), rearchitected per spec §9 design note
//! (iii): Rust has no tracing-GC finalizer to drive this off of, so the
//! finalizer-reregistration cycle is replaced with a tick-based live-set
//! estimator. [`HeapEpochSource`] reports a new "epoch" each time the
//! underlying allocator's next-collection threshold changes; the double-
//! dump rule becomes "dump on every qualifying tick, dedup by epoch"
//! rather than the original "re-register on a fresh anchor object".
//!
//! The consumer loop shape (fixed poll interval, non-blocking feed,
//! `catch_unwind`-free since there's no finalizer to recover from) mirrors
//! the teacher's `DiagnosticBuffer` consumer loop
//! (`system/performance/diagnostic_buffer.rs`).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::actions::{self, ProfileProducer};
use crate::detectors::Cooldown;
use crate::options::{DumpOptions, Options};
use crate::reporter::ReporterHandle;
use crate::ring::Ring;
use crate::rule::{self, Reason, Scene, SignalRule};
use crate::sinks;
use crate::telemetry::TelemetrySource;

/// Default poll interval for the epoch source (spec §1 expansion: "e.g.
/// every 200ms").
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Supplies one epoch each time the allocator's next-collection estimate
/// changes. Replaces the spec's GC finalizer.
pub trait HeapEpochSource: Send {
    /// Poll once. Returns `Some(live_estimate_bytes)` when this poll
    /// observed a new epoch (the reported next-GC threshold moved since
    /// the last poll); `None` otherwise (no-op tick, matching the original
    /// "one tick per GC sweep" cadence by skipping non-sweep polls).
    fn poll(&mut self) -> Option<u64>;
}

/// Default epoch source: polls [`TelemetrySource::heap_next_gc_bytes`] and
/// emits an epoch whenever the value changes. A runtime with no managed
/// heap (the common Rust case) returns `0` from that method forever, so
/// this source never emits and the detector is effectively inert —
/// matching spec §4.C's guidance that a missing capability should degrade
/// gracefully rather than error.
pub struct DefaultHeapEpochSource {
    telemetry: Arc<dyn TelemetrySource>,
    last_next_gc: Option<u64>,
}

impl DefaultHeapEpochSource {
    pub fn new(telemetry: Arc<dyn TelemetrySource>) -> Self {
        DefaultHeapEpochSource {
            telemetry,
            last_next_gc: None,
        }
    }
}

impl HeapEpochSource for DefaultHeapEpochSource {
    fn poll(&mut self) -> Option<u64> {
        let next_gc = self.telemetry.heap_next_gc_bytes().ok()?;
        if next_gc == 0 {
            return None;
        }
        let changed = self.last_next_gc != Some(next_gc);
        self.last_next_gc = Some(next_gc);
        if changed {
            Some(next_gc / 2)
        } else {
            None
        }
    }
}

/// Owns the per-epoch ring, cooldown, and double-dump arm flag. Lives for
/// the lifetime of the engine's gc-heap background task; single-owner, no
/// lock needed (same reentrancy discipline as the other detectors).
pub struct GcHeapDetector {
    ring: Ring,
    cooldown: Cooldown,
    armed: bool,
    trigger_count: u64,
    warm_up: u64,
    collect_count: u64,
}

impl GcHeapDetector {
    pub fn new(warm_up: usize) -> Self {
        GcHeapDetector {
            ring: Ring::new(warm_up),
            cooldown: Cooldown::default(),
            armed: false,
            trigger_count: 0,
            warm_up: warm_up as u64,
            collect_count: 0,
        }
    }

    /// Process one epoch tick: push into the ring, then apply the
    /// double-dump rule (spec §4.F).
    fn tick(
        &mut self,
        live_estimate_bytes: u64,
        memory_limit_bytes: u64,
        rule: &SignalRule,
        producer: &dyn ProfileProducer,
        dump_options: &DumpOptions,
        reporter: Option<&ReporterHandle>,
    ) {
        if memory_limit_bytes == 0 {
            log::warn!("gc-heap detector: memory limit unavailable, skipping tick");
            return;
        }
        let avg_before_push = self.ring.avg();
        let cur = (live_estimate_bytes.saturating_mul(100) / memory_limit_bytes) as i64;
        self.ring.push(cur);
        self.collect_count += 1;

        if !rule.enable {
            return;
        }

        if self.collect_count < self.warm_up {
            // Invariant 5: no dump before `warm_up` epochs have been collected.
            return;
        }

        if self.armed {
            // Forced second dump: skip the rule entirely.
            let scene = Scene::from_rule(rule, avg_before_push, cur);
            self.dump(Reason::Diff, scene, producer, dump_options, reporter);
            self.armed = false;
            self.cooldown.arm(std::time::Instant::now(), rule.cooldown);
            return;
        }

        if self.cooldown.is_cooling(std::time::Instant::now()) {
            return;
        }

        let (fire, reason) = rule::evaluate_rule(rule, avg_before_push, cur);
        if !fire {
            return;
        }
        let scene = Scene::from_rule(rule, avg_before_push, cur);
        self.dump(reason, scene, producer, dump_options, reporter);
        self.armed = true;
    }

    fn dump(
        &mut self,
        reason: Reason,
        scene: Scene,
        producer: &dyn ProfileProducer,
        dump_options: &DumpOptions,
        reporter: Option<&ReporterHandle>,
    ) {
        match actions::gc_heap_dump(producer, reason, scene) {
            Ok(outcome) => {
                if let Err(err) = sinks::fan_out(&outcome, dump_options, reporter) {
                    log::warn!("gc-heap dump write failed: {}", err);
                    return;
                }
                self.trigger_count += 1;
            }
            Err(err) => log::warn!("gc-heap dump capture failed: {}", err),
        }
    }

    pub fn trigger_count(&self) -> u64 {
        self.trigger_count
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }
}

/// Drive the gc-heap loop until `running` flips false. Spawned as one of
/// the engine's four long-lived background tasks (spec §5).
pub async fn run(
    mut source: Box<dyn HeapEpochSource>,
    poll_interval: Duration,
    warm_up: usize,
    options: crate::options::OptionsRegistry,
    telemetry: Arc<dyn TelemetrySource>,
    producer: Arc<dyn ProfileProducer>,
    reporter: Option<ReporterHandle>,
    running: Arc<AtomicBool>,
) {
    let mut detector = GcHeapDetector::new(warm_up);
    let mut ticker = tokio::time::interval(poll_interval);
    while running.load(Ordering::Relaxed) {
        ticker.tick().await;
        if !running.load(Ordering::Relaxed) {
            break;
        }
        let Some(live_estimate) = source.poll() else {
            continue;
        };
        let opts: Options = options.snapshot().await;
        let memory_limit = opts
            .memory_limit_override
            .or_else(|| telemetry.memory_limit_bytes().ok())
            .unwrap_or(0);
        detector.tick(
            live_estimate,
            memory_limit,
            &opts.gc_heap,
            producer.as_ref(),
            &opts.dump,
            reporter.as_ref(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::MockProfileProducer;
    use crate::options::DumpFormat;

    fn rule() -> SignalRule {
        SignalRule {
            enable: true,
            min: 10,
            abs: 40,
            diff: 20,
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
    fn s4_gc_double_dump() {
        let tmp = tempfile::tempdir().unwrap();
        let producer = MockProfileProducer::default();
        let dump = dump_options(tmp.path());
        let mut detector = GcHeapDetector::new(10);
        let rule = rule();

        // memory_limit=100 so live_estimate bytes map 1:1 to percent.
        for _ in 0..9 {
            detector.tick(10, 100, &rule, &producer, &dump, None);
        }
        assert!(!detector.is_armed());

        // Tick 10: cur=41 > abs=40, fires, arms.
        detector.tick(41, 100, &rule, &producer, &dump, None);
        assert!(detector.is_armed());
        assert_eq!(detector.trigger_count(), 1);

        // Tick 11: cur=15, would not fire on its own, but armed forces a
        // second dump, then clears armed and arms cooldown.
        detector.tick(15, 100, &rule, &producer, &dump, None);
        assert!(!detector.is_armed());
        assert_eq!(detector.trigger_count(), 2);
    }

    #[test]
    fn warm_up_gate_suppresses_early_qualifying_reading() {
        let tmp = tempfile::tempdir().unwrap();
        let producer = MockProfileProducer::default();
        let dump = dump_options(tmp.path());
        let mut detector = GcHeapDetector::new(10);
        let rule = rule();

        // First tick already clears abs=40, but warm_up=10 hasn't elapsed.
        detector.tick(90, 100, &rule, &producer, &dump, None);
        assert!(!detector.is_armed());
        assert_eq!(detector.trigger_count(), 0);

        // Ticks 2..9: still below warm_up.
        for _ in 0..8 {
            detector.tick(90, 100, &rule, &producer, &dump, None);
        }
        assert_eq!(detector.trigger_count(), 0);

        // Tick 10: warm_up satisfied, qualifying reading now fires.
        detector.tick(90, 100, &rule, &producer, &dump, None);
        assert!(detector.is_armed());
        assert_eq!(detector.trigger_count(), 1);
    }

    #[test]
    fn disabled_rule_never_dumps() {
        let tmp = tempfile::tempdir().unwrap();
        let producer = MockProfileProducer::default();
        let dump = dump_options(tmp.path());
        let mut detector = GcHeapDetector::new(10);
        let mut r = rule();
        r.enable = false;
        for _ in 0..10 {
            detector.tick(90, 100, &r, &producer, &dump, None);
        }
        assert_eq!(detector.trigger_count(), 0);
    }

    #[test]
    fn zero_memory_limit_skips_tick() {
        let tmp = tempfile::tempdir().unwrap();
        let producer = MockProfileProducer::default();
        let dump = dump_options(tmp.path());
        let mut detector = GcHeapDetector::new(1);
        detector.tick(90, 0, &rule(), &producer, &dump, None);
        assert_eq!(detector.trigger_count(), 0);
    }

    #[test]
    fn default_epoch_source_emits_only_on_change() {
        struct FakeTelemetry(std::sync::Mutex<Vec<u64>>);
        impl TelemetrySource for FakeTelemetry {
            fn usage(&self) -> Result<crate::telemetry::Usage, crate::error::TelemetryError> {
                unreachable!()
            }
            fn cpu_cores(&self) -> Result<f64, crate::error::TelemetryError> {
                unreachable!()
            }
            fn memory_limit_bytes(&self) -> Result<u64, crate::error::TelemetryError> {
                unreachable!()
            }
            fn heap_next_gc_bytes(&self) -> Result<u64, crate::error::TelemetryError> {
                let mut values = self.0.lock().unwrap();
                Ok(values.remove(0))
            }
        }
        let telemetry = Arc::new(FakeTelemetry(std::sync::Mutex::new(vec![100, 100, 200])));
        let mut source = DefaultHeapEpochSource::new(telemetry);
        assert_eq!(source.poll(), Some(50));
        assert_eq!(source.poll(), None);
        assert_eq!(source.poll(), Some(100));
    }
}
