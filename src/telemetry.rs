//! The process telemetry capability: everything the sample loop needs to
//! read about the current process each tick.
//!
//! Hosts that embed this crate in an environment this module's default
//! implementation doesn't understand (a container runtime with its own
//! accounting, a language runtime with its own heap) supply their own
//! [`TelemetrySource`] rather than forking the crate.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use sysinfo::{Pid, System};

use crate::error::TelemetryError;

/// One tick's worth of process readings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Usage {
    /// CPU usage as a percent of one core's capacity for the whole process,
    /// i.e. `200` means fully saturating two cores.
    pub cpu_percent: i64,
    /// Resident set size in bytes.
    pub rss_bytes: u64,
    /// Concurrent logical tasks (see [`TelemetrySource::task_num`]).
    pub task_num: u64,
    /// OS thread count.
    pub thread_num: u64,
}

/// Capability object the sample loop polls once per tick.
///
/// Implementations are expected to be cheap to call repeatedly; the default
/// [`SystemTelemetrySource`] keeps a long-lived [`System`] handle rather than
/// rebuilding process tables on every call.
pub trait TelemetrySource: Send + Sync {
    /// Read the current process's usage. Transient failures should surface
    /// as `Err` rather than a zeroed reading, so the sample loop can skip
    /// the tick instead of polluting the rings with a false zero.
    fn usage(&self) -> Result<Usage, TelemetryError>;

    /// Number of CPU cores available to the process (cgroup quota aware).
    fn cpu_cores(&self) -> Result<f64, TelemetryError>;

    /// Memory limit in bytes (cgroup limit if present, else OS total).
    fn memory_limit_bytes(&self) -> Result<u64, TelemetryError>;

    /// Estimated bytes the heap will occupy at its next collection, used as
    /// the GC-heap detector's proxy signal. Implementations with no managed
    /// heap (most Rust programs) may return `Ok(0)` to disable that
    /// detector without erroring.
    fn heap_next_gc_bytes(&self) -> Result<u64, TelemetryError> {
        Ok(0)
    }

    /// Cgroup CPU quota expressed in whole cores (spec §4.C "cgroup quota"
    /// tier), consulted only when `Options::use_cgroup` is set. `None` when
    /// no quota is configured or cgroups are unavailable.
    fn cgroup_cpu_quota_cores(&self) -> Option<f64> {
        None
    }

    /// Cores available to this process' own scheduling domain (e.g. CPU
    /// affinity), independent of any cgroup quota (spec §4.C "process-max"
    /// tier), consulted only when `Options::use_process_max_as_cpu_core` is
    /// set. `None` when unsupported.
    fn process_max_cores(&self) -> Option<f64> {
        None
    }

    /// Memory ceiling ignoring any cgroup limit (spec §4.C "OS total" tier),
    /// consulted when `Options::use_cgroup` is unset.
    fn os_total_memory_bytes(&self) -> Result<u64, TelemetryError> {
        self.memory_limit_bytes()
    }
}

/// Caller-maintained concurrent-task counter.
///
/// Rust has no runtime-wide analogue of a goroutine count; a host that wants
/// `task_num` to mean something increments this around spawned work and
/// shares it with [`SystemTelemetrySource::with_task_counter`].
#[derive(Debug, Clone, Default)]
pub struct TaskCounter(Arc<AtomicU64>);

impl TaskCounter {
    pub fn new() -> Self {
        TaskCounter(Arc::new(AtomicU64::new(0)))
    }

    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decrement(&self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Default [`TelemetrySource`] backed by `sysinfo`.
pub struct SystemTelemetrySource {
    system: std::sync::Mutex<System>,
    pid: Pid,
    task_counter: Option<TaskCounter>,
}

impl SystemTelemetrySource {
    /// Build a telemetry source for the current process.
    pub fn new() -> Self {
        let pid = Pid::from_u32(std::process::id());
        let mut system = System::new();
        system.refresh_processes(sysinfo::ProcessesToUpdate::All, true);
        SystemTelemetrySource {
            system: std::sync::Mutex::new(system),
            pid,
            task_counter: None,
        }
    }

    /// Attach a [`TaskCounter`] so `task_num()` reports something other
    /// than the thread-count fallback.
    pub fn with_task_counter(mut self, counter: TaskCounter) -> Self {
        self.task_counter = Some(counter);
        self
    }
}

impl Default for SystemTelemetrySource {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetrySource for SystemTelemetrySource {
    fn usage(&self) -> Result<Usage, TelemetryError> {
        let mut system = self
            .system
            .lock()
            .map_err(|_| TelemetryError::UsageUnavailable("telemetry lock poisoned".into()))?;
        system.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[self.pid]), true);
        let process = system.process(self.pid).ok_or_else(|| {
            TelemetryError::UsageUnavailable(format!("process {} not found", self.pid))
        })?;

        let thread_num = num_threads(self.pid).unwrap_or(1);
        let task_num = self
            .task_counter
            .as_ref()
            .map(TaskCounter::get)
            .unwrap_or(thread_num);

        Ok(Usage {
            cpu_percent: process.cpu_usage().round() as i64,
            rss_bytes: process.memory(),
            task_num,
            thread_num,
        })
    }

    fn cpu_cores(&self) -> Result<f64, TelemetryError> {
        Ok(num_cpus::get() as f64)
    }

    fn memory_limit_bytes(&self) -> Result<u64, TelemetryError> {
        if let Some(limit) = crate::cgroup::memory_limit_bytes() {
            return Ok(limit);
        }
        self.os_total_memory_bytes()
    }

    fn cgroup_cpu_quota_cores(&self) -> Option<f64> {
        crate::cgroup::cpu_quota_cores()
    }

    fn process_max_cores(&self) -> Option<f64> {
        std::thread::available_parallelism()
            .ok()
            .map(|n| n.get() as f64)
    }

    fn os_total_memory_bytes(&self) -> Result<u64, TelemetryError> {
        let mut system = self
            .system
            .lock()
            .map_err(|_| TelemetryError::UsageUnavailable("telemetry lock poisoned".into()))?;
        system.refresh_memory();
        Ok(system.total_memory())
    }
}

#[cfg(target_os = "linux")]
fn num_threads(pid: Pid) -> Option<u64> {
    let path = format!("/proc/{}/status", pid);
    let contents = std::fs::read_to_string(path).ok()?;
    for line in contents.lines() {
        if let Some(rest) = line.strip_prefix("Threads:") {
            return rest.trim().parse().ok();
        }
    }
    None
}

#[cfg(not(target_os = "linux"))]
fn num_threads(_pid: Pid) -> Option<u64> {
    None
}
