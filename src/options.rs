//! The read-mostly configuration registry (spec §4.J).
//!
//! `Options` is held behind an `Arc<tokio::sync::RwLock<Options>>` the same
//! way the teacher guards `OrchestrationState` behind a `tokio::sync::RwLock`
//! (`orchestrator/mod.rs`): readers take the lock only long enough to clone
//! the struct, then work against the snapshot. Writers go through `set`,
//! which applies a whole batch of field changes under one write lock.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, RwLock};

use crate::rule::SignalRule;

/// Binary or text dump output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DumpFormat {
    Binary,
    Text,
}

/// Dump-file behavior, shared across every signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DumpOptions {
    pub dump_path: PathBuf,
    pub format: DumpFormat,
    /// When `format == Text`: keep the full stack trace instead of the
    /// top-10 groups / first-K-bytes trim (§3).
    pub full_stack: bool,
    /// Also emit the text form to the logger.
    pub dump_to_logger: bool,
}

impl Default for DumpOptions {
    fn default() -> Self {
        DumpOptions {
            dump_path: PathBuf::from("/tmp"),
            format: DumpFormat::Text,
            full_stack: false,
            dump_to_logger: false,
        }
    }
}

/// Thread-shrink controller configuration (§4.E, last sub-bullet).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShrinkConfig {
    pub enable: bool,
    pub threshold: u64,
    pub delay: Duration,
}

impl Default for ShrinkConfig {
    fn default() -> Self {
        ShrinkConfig {
            enable: false,
            threshold: 1000,
            delay: Duration::from_secs(60),
        }
    }
}

/// Log file rotation knobs (ambient: logging is carried even though a
/// concrete rotating-file sink is out of scope).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRotationConfig {
    pub enabled: bool,
    pub max_size_bytes: u64,
}

impl Default for LogRotationConfig {
    fn default() -> Self {
        LogRotationConfig {
            enabled: false,
            max_size_bytes: 64 * 1024 * 1024,
        }
    }
}

/// The full configuration registry (spec §4.J).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Options {
    pub collect_interval: Duration,
    pub dump: DumpOptions,
    pub task: SignalRule,
    pub mem: SignalRule,
    pub cpu: SignalRule,
    pub thread: SignalRule,
    pub gc_heap: SignalRule,
    pub shrink: ShrinkConfig,
    /// Global dump suppression above this CPU percent (spec invariant 10).
    pub cpu_max_percent: Option<i64>,
    pub cpu_cores_override: Option<f64>,
    pub memory_limit_override: Option<u64>,
    pub use_cgroup: bool,
    pub use_process_max_as_cpu_core: bool,
    pub reporter_enabled: bool,
    #[serde(skip, default = "default_log_level")]
    pub log_level: log::LevelFilter,
    pub log_rotation: LogRotationConfig,
}

fn default_log_level() -> log::LevelFilter {
    log::LevelFilter::Info
}

impl Default for Options {
    fn default() -> Self {
        Options {
            collect_interval: Duration::from_secs(5),
            dump: DumpOptions::default(),
            task: SignalRule {
                min: 3000,
                abs: 200_000,
                diff: 20,
                ..SignalRule::default()
            },
            mem: SignalRule {
                min: 10,
                abs: 80,
                diff: 25,
                ..SignalRule::default()
            },
            cpu: SignalRule {
                min: 10,
                abs: 70,
                diff: 25,
                ..SignalRule::default()
            },
            thread: SignalRule {
                min: 10,
                abs: 70,
                diff: 25,
                ..SignalRule::default()
            },
            gc_heap: SignalRule::default(),
            shrink: ShrinkConfig::default(),
            cpu_max_percent: None,
            cpu_cores_override: None,
            memory_limit_override: None,
            use_cgroup: true,
            use_process_max_as_cpu_core: false,
            reporter_enabled: false,
            log_level: log::LevelFilter::Info,
            log_rotation: LogRotationConfig::default(),
        }
    }
}

/// Construction-time builder mirroring the abstract option names of spec §6.
#[derive(Debug, Clone, Default)]
pub struct OptionsBuilder {
    options: Options,
}

impl OptionsBuilder {
    pub fn new() -> Self {
        OptionsBuilder {
            options: Options::default(),
        }
    }

    pub fn collect_interval(mut self, interval: Duration) -> Self {
        self.options.collect_interval = interval;
        self
    }

    pub fn dump(mut self, dump: DumpOptions) -> Self {
        self.options.dump = dump;
        self
    }

    pub fn task_dump(mut self, rule: SignalRule) -> Self {
        self.options.task = SignalRule { enable: true, ..rule };
        self
    }

    pub fn mem_dump(mut self, rule: SignalRule) -> Self {
        self.options.mem = SignalRule { enable: true, ..rule };
        self
    }

    pub fn cpu_dump(mut self, rule: SignalRule) -> Self {
        self.options.cpu = SignalRule { enable: true, ..rule };
        self
    }

    pub fn thread_dump(mut self, rule: SignalRule) -> Self {
        self.options.thread = SignalRule { enable: true, ..rule };
        self
    }

    pub fn gc_heap_dump(mut self, rule: SignalRule) -> Self {
        self.options.gc_heap = SignalRule { enable: true, ..rule };
        self
    }

    pub fn shrink_thread(mut self, threshold: u64, delay: Duration) -> Self {
        self.options.shrink = ShrinkConfig {
            enable: true,
            threshold,
            delay,
        };
        self
    }

    pub fn memory_limit(mut self, bytes: u64) -> Self {
        self.options.memory_limit_override = Some(bytes);
        self
    }

    pub fn cpu_cores(mut self, n: f64) -> Self {
        self.options.cpu_cores_override = Some(n);
        self
    }

    pub fn cpu_max_percent(mut self, p: i64) -> Self {
        self.options.cpu_max_percent = Some(p);
        self
    }

    pub fn use_cgroup(mut self, enabled: bool) -> Self {
        self.options.use_cgroup = enabled;
        self
    }

    pub fn use_process_max_as_cpu_core(mut self, enabled: bool) -> Self {
        self.options.use_process_max_as_cpu_core = enabled;
        self
    }

    pub fn reporter_enabled(mut self, enabled: bool) -> Self {
        self.options.reporter_enabled = enabled;
        self
    }

    pub fn log_level(mut self, level: log::LevelFilter) -> Self {
        self.options.log_level = level;
        self
    }

    pub fn log_rotation(mut self, rotation: LogRotationConfig) -> Self {
        self.options.log_rotation = rotation;
        self
    }

    pub fn build(self) -> Options {
        self.options
    }
}

/// A closure applied to the whole `Options` struct under one write lock,
/// matching spec §4.J: "each individual option is mutated only through
/// `Set`, which takes a write lock covering the whole update batch."
pub type OptionsPatch = Box<dyn FnOnce(&mut Options) + Send>;

/// Shared, hot-swappable options handle plus the interval-change signal the
/// sample loop listens on.
#[derive(Clone)]
pub struct OptionsRegistry {
    inner: Arc<RwLock<Options>>,
    interval_tx: watch::Sender<Duration>,
}

impl OptionsRegistry {
    pub fn new(options: Options) -> Self {
        let (interval_tx, _) = watch::channel(options.collect_interval);
        OptionsRegistry {
            inner: Arc::new(RwLock::new(options)),
            interval_tx,
        }
    }

    /// A receiver that observes every published `collect_interval` change.
    pub fn interval_watch(&self) -> watch::Receiver<Duration> {
        self.interval_tx.subscribe()
    }

    /// Take a snapshot of the current options (cloned, so callers never
    /// hold the lock across slow work).
    pub async fn snapshot(&self) -> Options {
        self.inner.read().await.clone()
    }

    /// Apply a batch of changes under one write lock. If `collect_interval`
    /// changed, publish it on the watch channel so the sample loop can
    /// rebuild its ticker on the next tick boundary.
    pub async fn set(&self, patch: OptionsPatch) {
        let mut guard = self.inner.write().await;
        let previous_interval = guard.collect_interval;
        patch(&mut guard);
        let new_interval = guard.collect_interval;
        drop(guard);
        if new_interval != previous_interval {
            let _ = self.interval_tx.send(new_interval);
        }
    }
}
