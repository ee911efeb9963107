//! The Sample Loop and the `Engine` that owns it (spec §4.D, §5).
//!
//! `Engine` is the crate's top-level handle: construct it with options and
//! collaborators, `start()` it, `set()` options at runtime, `stop()` it.
//! Lifecycle mirrors the teacher's `AsyncOrchestrator`
//! (`src/orchestrator/mod.rs`): a `running` flag gates reentrancy, and
//! cancellation is observed cooperatively at tick/channel boundaries
//! rather than by killing tasks outright.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::actions::{ProfileProducer, DEFAULT_CPU_SAMPLING_TIME};
use crate::detectors::{self, Cooldown};
use crate::error::{ConfigError, Error, Result};
use crate::gc_heap::{self, HeapEpochSource};
use crate::options::{Options, OptionsPatch, OptionsRegistry};
use crate::reporter::{Report, ReporterHandle, ReporterWorker};
use crate::ring::Ring;
use crate::shrink::{self, ShrinkState};
use crate::telemetry::TelemetrySource;

/// Ring capacity for every per-signal history (spec §3 "WarmUp", default 10).
pub const DEFAULT_WARM_UP: usize = 10;

/// Everything the sample loop needs that isn't in `Options` (collaborators
/// supplied once at construction, spec §3 "Ownership").
struct Collaborators {
    telemetry: Arc<dyn TelemetrySource>,
    producer: Arc<dyn ProfileProducer>,
}

/// Per-tick mutable state the sample loop owns exclusively (spec §3
/// "Engine state"): rings, cooldowns, counters. Never touched by any other
/// task, so no lock is needed (spec §5 reentrancy).
struct SampleState {
    task_ring: Ring,
    mem_ring: Ring,
    cpu_ring: Ring,
    thread_ring: Ring,
    task_cooldown: Cooldown,
    mem_cooldown: Cooldown,
    cpu_cooldown: Cooldown,
    thread_cooldown: Cooldown,
    shrink_state: ShrinkState,
    collect_count: u64,
    task_trigger_count: u64,
    mem_trigger_count: u64,
    cpu_trigger_count: u64,
    thread_trigger_count: u64,
}

impl SampleState {
    fn new(warm_up: usize) -> Self {
        SampleState {
            task_ring: Ring::new(warm_up),
            mem_ring: Ring::new(warm_up),
            cpu_ring: Ring::new(warm_up),
            thread_ring: Ring::new(warm_up),
            task_cooldown: Cooldown::default(),
            mem_cooldown: Cooldown::default(),
            cpu_cooldown: Cooldown::default(),
            thread_cooldown: Cooldown::default(),
            shrink_state: ShrinkState::default(),
            collect_count: 0,
            task_trigger_count: 0,
            mem_trigger_count: 0,
            cpu_trigger_count: 0,
            thread_trigger_count: 0,
        }
    }
}

/// The sampling-and-detection engine (spec §1, core #1) plus the dump
/// orchestrator (core #2) and live reconfiguration handle (core #3).
pub struct Engine {
    options: OptionsRegistry,
    collaborators: Arc<Collaborators>,
    running: Arc<AtomicBool>,
    warm_up: usize,
    reporter_worker: Option<ReporterWorker>,
    reporter_handle: Option<ReporterHandle>,
    sample_task: Option<tokio::task::JoinHandle<()>>,
    gc_heap_task: Option<tokio::task::JoinHandle<()>>,
    /// Builds a fresh [`HeapEpochSource`] on every `start()` (spec §3: "after
    /// Stop the engine may be Start-ed again"). A one-shot `Option<Box<dyn
    /// ..>>` would be consumed by the first run and never respawn the
    /// gc-heap loop on restart, so this is a factory instead.
    heap_epoch_source_factory: Arc<dyn Fn() -> Box<dyn HeapEpochSource + Send> + Send + Sync>,
}

impl Engine {
    /// Build an engine. `report` is optional: without one, dumps are still
    /// written to disk but nothing is enqueued to the Reporter Worker.
    pub fn new(
        options: Options,
        telemetry: Arc<dyn TelemetrySource>,
        producer: Arc<dyn ProfileProducer>,
        report: Option<Arc<dyn Report>>,
    ) -> Self {
        let warm_up = DEFAULT_WARM_UP;
        let reporter_enabled = options.reporter_enabled;
        let reporter_worker = report.map(|r| {
            ReporterWorker::spawn(r, crate::reporter::DEFAULT_QUEUE_CAPACITY, reporter_enabled)
        });
        let reporter_handle = reporter_worker.as_ref().map(ReporterWorker::handle);
        let telemetry_for_factory = telemetry.clone();
        let heap_epoch_source_factory: Arc<dyn Fn() -> Box<dyn HeapEpochSource + Send> + Send + Sync> =
            Arc::new(move || {
                Box::new(gc_heap::DefaultHeapEpochSource::new(telemetry_for_factory.clone()))
            });

        Engine {
            options: OptionsRegistry::new(options),
            collaborators: Arc::new(Collaborators { telemetry, producer }),
            running: Arc::new(AtomicBool::new(false)),
            warm_up,
            reporter_worker,
            reporter_handle,
            sample_task: None,
            gc_heap_task: None,
            heap_epoch_source_factory,
        }
    }

    /// Install a factory for a non-default heap epoch source (e.g. one
    /// backed by a real allocator's stats API), called once per `start()` so
    /// restarting the engine gets a fresh source rather than a stale,
    /// already-consumed one.
    pub fn with_heap_epoch_source(
        mut self,
        factory: impl Fn() -> Box<dyn HeapEpochSource + Send> + Send + Sync + 'static,
    ) -> Self {
        self.heap_epoch_source_factory = Arc::new(factory);
        self
    }

    /// Read-only snapshot of the current options.
    pub async fn options(&self) -> Options {
        self.options.snapshot().await
    }

    /// Apply a batch of option changes (spec §4.J `Set`).
    pub async fn set(&self, patch: OptionsPatch) {
        self.options.set(patch).await;
        if let Some(reporter) = &self.reporter_handle {
            let enabled = self.options.snapshot().await.reporter_enabled;
            reporter.set_enabled(enabled);
        }
    }

    /// Start the sample loop and gc-heap loop. Idempotent: a second call
    /// while already running returns `Error::AlreadyRunning` and spawns no
    /// extra tasks (spec invariant 9).
    pub fn start(&mut self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyRunning);
        }

        let options = self.options.clone();
        let collaborators = self.collaborators.clone();
        let running = self.running.clone();
        let reporter = self.reporter_handle.clone();
        let warm_up = self.warm_up;

        self.sample_task = Some(tokio::spawn(sample_loop(
            options.clone(),
            collaborators.clone(),
            reporter.clone(),
            running.clone(),
            warm_up,
        )));

        let source = (self.heap_epoch_source_factory)();
        self.gc_heap_task = Some(tokio::spawn(gc_heap::run(
            source,
            gc_heap::DEFAULT_POLL_INTERVAL,
            warm_up,
            options,
            collaborators.telemetry.clone(),
            collaborators.producer.clone(),
            reporter,
            running,
        )));

        Ok(())
    }

    /// Stop both background loops. Idempotent: a second call returns
    /// `Error::AlreadyStopped` (spec invariant 9). The reporter worker's
    /// consumer thread is joined when the `Engine` is dropped.
    pub async fn stop(&mut self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(Error::AlreadyStopped);
        }
        if let Some(task) = self.sample_task.take() {
            let _ = task.await;
        }
        if let Some(task) = self.gc_heap_task.take() {
            let _ = task.await;
        }
        Ok(())
    }
}

/// The periodic scheduler (spec §4.D). Runs the fixed 8-step algorithm on
/// every tick, rebuilding its ticker when `collect_interval` changes.
async fn sample_loop(
    options: OptionsRegistry,
    collaborators: Arc<Collaborators>,
    reporter: Option<ReporterHandle>,
    running: Arc<AtomicBool>,
    warm_up: usize,
) {
    let mut state = SampleState::new(warm_up);
    let mut interval_watch = options.interval_watch();
    let mut ticker = tokio::time::interval(*interval_watch.borrow());
    ticker.tick().await; // first tick fires immediately; consume it.

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = interval_watch.changed() => {
                ticker = tokio::time::interval(*interval_watch.borrow());
                ticker.tick().await;
            }
        }

        // Step 1: cancellation.
        if !running.load(Ordering::Relaxed) {
            break;
        }

        let opts = options.snapshot().await;

        // Step 2: cpu_cores / memory_limit resolution. Fatal if either is
        // unavailable (spec §4.D step 2, §7 ConfigError).
        let cpu_cores = match resolve_cpu_cores(&opts, &collaborators) {
            Ok(c) => c,
            Err(err) => {
                log::error!("sample loop exiting: {}", err);
                break;
            }
        };
        let memory_limit = match resolve_memory_limit(&opts, &collaborators) {
            Ok(m) => m,
            Err(err) => {
                log::error!("sample loop exiting: {}", err);
                break;
            }
        };

        // Step 3: read_usage, normalise. Transient errors skip the tick.
        let usage = match collaborators.telemetry.usage() {
            Ok(u) => u,
            Err(err) => {
                log::warn!("telemetry read failed, skipping tick: {}", err);
                continue;
            }
        };
        let cpu_percent = if cpu_cores > 0.0 {
            (usage.cpu_percent as f64 / cpu_cores).round() as i64
        } else {
            usage.cpu_percent
        };
        let mem_percent = if memory_limit > 0 {
            (usage.rss_bytes.saturating_mul(100) / memory_limit) as i64
        } else {
            0
        };

        // Step 4: push samples, increment collect_count.
        state.task_ring.push(usage.task_num as i64);
        state.mem_ring.push(mem_percent);
        state.cpu_ring.push(cpu_percent);
        state.thread_ring.push(usage.thread_num as i64);
        state.collect_count += 1;

        // Step 5: warm-up gate.
        if state.collect_count < warm_up as u64 {
            continue;
        }

        // Step 6: safety valve.
        if let Some(cap) = opts.cpu_max_percent {
            if cpu_percent >= cap {
                log::warn!("cpu {}% >= cap {}%, suppressing all dumps this tick", cpu_percent, cap);
                continue;
            }
        }

        // Step 7: detectors in fixed order (task, mem, cpu, thread).
        detectors::task_detector(
            &opts.task,
            &mut state.task_cooldown,
            state.task_ring.avg(),
            usage.task_num as i64,
            &mut state.task_trigger_count,
            collaborators.producer.as_ref(),
            &opts.dump,
            reporter.as_ref(),
        );

        detectors::mem_detector(
            &opts.mem,
            &mut state.mem_cooldown,
            state.mem_ring.avg(),
            mem_percent,
            &mut state.mem_trigger_count,
            collaborators.producer.as_ref(),
            &opts.dump,
            reporter.as_ref(),
        );

        // CPU dump blocks the loop for the sampling window by design
        // (spec §9 "cooperative CPU sampling").
        detectors::cpu_detector(
            &opts.cpu,
            &mut state.cpu_cooldown,
            state.cpu_ring.avg(),
            cpu_percent,
            &mut state.cpu_trigger_count,
            collaborators.producer.as_ref(),
            DEFAULT_CPU_SAMPLING_TIME,
            &opts.dump,
            reporter.as_ref(),
        );

        detectors::thread_detector(
            &opts.thread,
            &mut state.thread_cooldown,
            state.thread_ring.avg(),
            usage.thread_num as i64,
            &mut state.thread_trigger_count,
            collaborators.producer.as_ref(),
            &opts.dump,
            reporter.as_ref(),
        );

        // Step 8: optional shrink-thread controller.
        let _ = shrink::maybe_schedule(&opts.shrink, &mut state.shrink_state, usage.thread_num);
    }
}

/// Resolution order (spec §4.C): explicit override > process-max (if
/// `use_process_max_as_cpu_core`) > cgroup quota (if `use_cgroup`) > OS core
/// count.
fn resolve_cpu_cores(opts: &Options, collaborators: &Collaborators) -> std::result::Result<f64, ConfigError> {
    if let Some(n) = opts.cpu_cores_override {
        return Ok(n);
    }
    if opts.use_process_max_as_cpu_core {
        if let Some(n) = collaborators.telemetry.process_max_cores() {
            return Ok(n);
        }
    }
    if opts.use_cgroup {
        if let Some(n) = collaborators.telemetry.cgroup_cpu_quota_cores() {
            return Ok(n);
        }
    }
    collaborators
        .telemetry
        .cpu_cores()
        .map_err(|e| ConfigError::CpuCoresUnavailable(e.to_string()))
}

/// Resolution order (spec §4.C): explicit override > cgroup limit (if
/// `use_cgroup`) > OS total.
fn resolve_memory_limit(opts: &Options, collaborators: &Collaborators) -> std::result::Result<u64, ConfigError> {
    if let Some(bytes) = opts.memory_limit_override {
        return Ok(bytes);
    }
    let limit = if opts.use_cgroup {
        collaborators.telemetry.memory_limit_bytes()
    } else {
        collaborators.telemetry.os_total_memory_bytes()
    };
    limit.map_err(|e| ConfigError::MemoryLimitUnavailable(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::MockProfileProducer;
    use crate::options::OptionsBuilder;
    use crate::rule::SignalRule;
    use crate::telemetry::{TelemetrySource, Usage};
    use std::sync::atomic::AtomicU64;
    use std::time::Duration;

    struct FakeTelemetry {
        cpu_percent: AtomicU64,
        cores: f64,
        memory_limit: u64,
    }

    impl TelemetrySource for FakeTelemetry {
        fn usage(&self) -> std::result::Result<Usage, crate::error::TelemetryError> {
            Ok(Usage {
                cpu_percent: self.cpu_percent.load(Ordering::Relaxed) as i64,
                rss_bytes: self.memory_limit / 2,
                task_num: 5,
                thread_num: 5,
            })
        }
        fn cpu_cores(&self) -> std::result::Result<f64, crate::error::TelemetryError> {
            Ok(self.cores)
        }
        fn memory_limit_bytes(&self) -> std::result::Result<u64, crate::error::TelemetryError> {
            Ok(self.memory_limit)
        }
    }

    #[tokio::test]
    async fn s9_idempotent_start_stop() {
        let telemetry: Arc<dyn TelemetrySource> = Arc::new(FakeTelemetry {
            cpu_percent: AtomicU64::new(10),
            cores: 4.0,
            memory_limit: 1_000_000,
        });
        let producer: Arc<dyn ProfileProducer> = Arc::new(MockProfileProducer::default());
        let options = OptionsBuilder::new()
            .collect_interval(Duration::from_millis(10))
            .build();
        let mut engine = Engine::new(options, telemetry, producer, None);

        engine.start().unwrap();
        assert!(matches!(engine.start(), Err(Error::AlreadyRunning)));

        engine.stop().await.unwrap();
        assert!(matches!(engine.stop().await, Err(Error::AlreadyStopped)));
    }

    #[tokio::test]
    async fn restart_after_stop_is_allowed() {
        let telemetry: Arc<dyn TelemetrySource> = Arc::new(FakeTelemetry {
            cpu_percent: AtomicU64::new(10),
            cores: 4.0,
            memory_limit: 1_000_000,
        });
        let producer: Arc<dyn ProfileProducer> = Arc::new(MockProfileProducer::default());
        let options = OptionsBuilder::new()
            .collect_interval(Duration::from_millis(10))
            .build();
        let mut engine = Engine::new(options, telemetry, producer, None);

        engine.start().unwrap();
        engine.stop().await.unwrap();
        engine.start().unwrap();
        engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn restart_respawns_gc_heap_loop() {
        use std::sync::atomic::AtomicUsize;

        struct CountingSource(Arc<AtomicUsize>);
        impl HeapEpochSource for CountingSource {
            fn poll(&mut self) -> Option<u64> {
                self.0.fetch_add(1, Ordering::Relaxed);
                None
            }
        }

        let telemetry: Arc<dyn TelemetrySource> = Arc::new(FakeTelemetry {
            cpu_percent: AtomicU64::new(10),
            cores: 4.0,
            memory_limit: 1_000_000,
        });
        let producer: Arc<dyn ProfileProducer> = Arc::new(MockProfileProducer::default());
        let built = Arc::new(AtomicUsize::new(0));
        let polls = Arc::new(AtomicUsize::new(0));
        let built_for_factory = built.clone();
        let polls_for_factory = polls.clone();
        let options = OptionsBuilder::new()
            .collect_interval(Duration::from_millis(10))
            .build();
        let mut engine = Engine::new(options, telemetry, producer, None).with_heap_epoch_source(
            move || {
                built_for_factory.fetch_add(1, Ordering::Relaxed);
                Box::new(CountingSource(polls_for_factory.clone())) as Box<dyn HeapEpochSource + Send>
            },
        );

        engine.start().unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        engine.stop().await.unwrap();
        assert_eq!(built.load(Ordering::Relaxed), 1);
        assert!(polls.load(Ordering::Relaxed) > 0, "gc-heap loop must poll while running");

        // A second start after a clean stop must rebuild the epoch source,
        // not silently run with none (the factory is the fix for this).
        engine.start().unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        engine.stop().await.unwrap();
        assert_eq!(
            built.load(Ordering::Relaxed),
            2,
            "restart must rebuild the heap epoch source, not reuse a consumed one"
        );
    }

    #[tokio::test]
    async fn set_updates_snapshot() {
        let telemetry: Arc<dyn TelemetrySource> = Arc::new(FakeTelemetry {
            cpu_percent: AtomicU64::new(10),
            cores: 4.0,
            memory_limit: 1_000_000,
        });
        let producer: Arc<dyn ProfileProducer> = Arc::new(MockProfileProducer::default());
        let engine = Engine::new(Options::default(), telemetry, producer, None);
        engine.set(Box::new(|o| o.cpu_max_percent = Some(95))).await;
        assert_eq!(engine.options().await.cpu_max_percent, Some(95));
    }

    #[tokio::test]
    async fn s3_cpu_cap_suppresses_dumps_but_keeps_running() {
        let telemetry: Arc<dyn TelemetrySource> = Arc::new(FakeTelemetry {
            cpu_percent: AtomicU64::new(9600),
            cores: 100.0,
            memory_limit: 1_000_000,
        });
        let producer: Arc<dyn ProfileProducer> = Arc::new(MockProfileProducer::default());
        let tmp = tempfile::tempdir().unwrap();
        let options = OptionsBuilder::new()
            .collect_interval(Duration::from_millis(5))
            .cpu_max_percent(95)
            .mem_dump(SignalRule {
                min: 0,
                abs: 0,
                diff: 0,
                max: None,
                enable: false,
                cooldown: Duration::from_secs(60),
            })
            .dump(crate::options::DumpOptions {
                dump_path: tmp.path().to_path_buf(),
                format: crate::options::DumpFormat::Text,
                full_stack: false,
                dump_to_logger: false,
            })
            .build();
        let mut engine = Engine::new(options, telemetry, producer, None);
        engine.start().unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        engine.stop().await.unwrap();
        // No files should have been written: the 96% >= 95% cap suppresses
        // every detector regardless of whether a rule would otherwise fire.
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    struct TieredTelemetry;

    impl TelemetrySource for TieredTelemetry {
        fn usage(&self) -> std::result::Result<Usage, crate::error::TelemetryError> {
            Ok(Usage {
                cpu_percent: 0,
                rss_bytes: 0,
                task_num: 0,
                thread_num: 0,
            })
        }
        fn cpu_cores(&self) -> std::result::Result<f64, crate::error::TelemetryError> {
            Ok(64.0)
        }
        fn memory_limit_bytes(&self) -> std::result::Result<u64, crate::error::TelemetryError> {
            Ok(2_000_000)
        }
        fn cgroup_cpu_quota_cores(&self) -> Option<f64> {
            Some(4.0)
        }
        fn process_max_cores(&self) -> Option<f64> {
            Some(2.0)
        }
        fn os_total_memory_bytes(&self) -> std::result::Result<u64, crate::error::TelemetryError> {
            Ok(8_000_000)
        }
    }

    #[test]
    fn s4c_cpu_cores_resolution_order() {
        let collaborators = Collaborators {
            telemetry: Arc::new(TieredTelemetry),
            producer: Arc::new(MockProfileProducer::default()),
        };

        // override wins over everything.
        let overridden = Options {
            cpu_cores_override: Some(16.0),
            use_process_max_as_cpu_core: true,
            use_cgroup: true,
            ..Options::default()
        };
        assert_eq!(resolve_cpu_cores(&overridden, &collaborators).unwrap(), 16.0);

        // process-max wins over cgroup quota and OS count.
        let process_max = Options {
            use_process_max_as_cpu_core: true,
            use_cgroup: true,
            ..Options::default()
        };
        assert_eq!(resolve_cpu_cores(&process_max, &collaborators).unwrap(), 2.0);

        // cgroup quota wins over OS count once process-max is disabled.
        let cgroup_only = Options {
            use_process_max_as_cpu_core: false,
            use_cgroup: true,
            ..Options::default()
        };
        assert_eq!(resolve_cpu_cores(&cgroup_only, &collaborators).unwrap(), 4.0);

        // falls back to OS count when neither flag is set.
        let os_only = Options {
            use_process_max_as_cpu_core: false,
            use_cgroup: false,
            ..Options::default()
        };
        assert_eq!(resolve_cpu_cores(&os_only, &collaborators).unwrap(), 64.0);
    }

    #[test]
    fn s4c_memory_limit_resolution_order() {
        let collaborators = Collaborators {
            telemetry: Arc::new(TieredTelemetry),
            producer: Arc::new(MockProfileProducer::default()),
        };

        let overridden = Options {
            memory_limit_override: Some(123),
            use_cgroup: true,
            ..Options::default()
        };
        assert_eq!(resolve_memory_limit(&overridden, &collaborators).unwrap(), 123);

        let cgroup = Options {
            use_cgroup: true,
            ..Options::default()
        };
        assert_eq!(resolve_memory_limit(&cgroup, &collaborators).unwrap(), 2_000_000);

        let os_total = Options {
            use_cgroup: false,
            ..Options::default()
        };
        assert_eq!(resolve_memory_limit(&os_total, &collaborators).unwrap(), 8_000_000);
    }
}
