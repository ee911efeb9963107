//! Profile Actions (spec §4.G): the glue from "a rule fired" to a concrete
//! profile blob, filename, and correlation metadata.
//!
//! Actual profile capture is supplied by the host: nothing in the standard
//! library takes a CPU sampling profile or walks a heap. [`ProfileProducer`]
//! is the capability trait a caller implements on top of a real profiler —
//! the `pprof` crate for CPU sampling, a jemalloc-ctl or custom allocator
//! hook for heap snapshots — the same "trigger -> bytes" shape used for
//! TiKV's status-server profile endpoints.

use std::time::{Duration, SystemTime};

use crate::dumpfile::{self, Kind};
use crate::error::DumpError;
use crate::rule::{Reason, Scene};

/// Default wall-clock CPU sampling window (spec §4.E CPU dump).
pub const DEFAULT_CPU_SAMPLING_TIME: Duration = Duration::from_secs(5);

/// Host-supplied profile capture capability.
///
/// All methods are synchronous and may block: `sample_cpu` blocks for the
/// whole sampling window by design (spec §9 "cooperative CPU sampling" —
/// the detector owns the sample loop until sampling ends).
pub trait ProfileProducer: Send + Sync {
    /// Snapshot a heap profile. Fast, in-memory.
    fn dump_heap(&self) -> Result<Vec<u8>, DumpError>;
    /// Snapshot all live task stacks. Fast, in-memory.
    fn dump_task_stacks(&self) -> Result<Vec<u8>, DumpError>;
    /// Snapshot the thread-creation-site profile (where each OS thread was
    /// spawned from). Fast, in-memory.
    fn dump_threads(&self) -> Result<Vec<u8>, DumpError>;
    /// Sample CPU usage for `duration`. Blocking.
    fn sample_cpu(&self, duration: Duration) -> Result<Vec<u8>, DumpError>;
}

/// The result of one dump: ready to hand to [`crate::sinks::fan_out`].
#[derive(Debug, Clone)]
pub struct DumpOutcome {
    pub kind: Kind,
    pub bytes: Vec<u8>,
    pub filename: String,
    pub reason: Reason,
    pub event_id: Option<String>,
    pub scene: Scene,
    pub sample_time: SystemTime,
}

fn outcome(
    kind: Kind,
    bytes: Vec<u8>,
    reason: Reason,
    event_id: Option<String>,
    scene: Scene,
) -> DumpOutcome {
    let filename = dumpfile::filename(kind, event_id.as_deref());
    DumpOutcome {
        kind,
        bytes,
        filename,
        reason,
        event_id,
        scene,
        sample_time: SystemTime::now(),
    }
}

/// Task-stack dump, filename prefix `goroutine` (spec §4.E "task dump").
pub fn task_dump(
    producer: &dyn ProfileProducer,
    reason: Reason,
    scene: Scene,
) -> Result<DumpOutcome, DumpError> {
    let bytes = producer.dump_task_stacks()?;
    Ok(outcome(Kind::Goroutine, bytes, reason, None, scene))
}

/// Heap dump, filename prefix `mem` (spec §4.E "memory dump").
pub fn mem_dump(
    producer: &dyn ProfileProducer,
    reason: Reason,
    scene: Scene,
) -> Result<DumpOutcome, DumpError> {
    let bytes = producer.dump_heap()?;
    Ok(outcome(Kind::Mem, bytes, reason, None, scene))
}

/// Heap dump driven by the GC-heap detector, filename prefix `gcheap`.
pub fn gc_heap_dump(
    producer: &dyn ProfileProducer,
    reason: Reason,
    scene: Scene,
) -> Result<DumpOutcome, DumpError> {
    let bytes = producer.dump_heap()?;
    Ok(outcome(Kind::GcHeap, bytes, reason, None, scene))
}

/// Thread-create dump: two correlated blobs sharing one event-id (spec
/// §4.E "thread-create dump" — the thread-creation profile plus the
/// task-stack profile, so an analyst can see which tasks are pinning
/// threads via blocking syscalls).
pub fn thread_dump(
    producer: &dyn ProfileProducer,
    reason: Reason,
    scene: Scene,
    trigger_count: u64,
) -> Result<(DumpOutcome, DumpOutcome), DumpError> {
    let event_id = dumpfile::event_id(Kind::Thread, trigger_count);
    let thread_bytes = producer.dump_threads()?;
    let stack_bytes = producer.dump_task_stacks()?;
    let thread_outcome = outcome(
        Kind::Thread,
        thread_bytes,
        reason,
        Some(event_id.clone()),
        scene,
    );
    let stack_outcome = outcome(Kind::Goroutine, stack_bytes, reason, Some(event_id), scene);
    Ok((thread_outcome, stack_outcome))
}

/// CPU dump: blocking wall-clock sample for `duration`, filename prefix
/// `cpu` (spec §4.E "CPU dump").
pub fn cpu_dump(
    producer: &dyn ProfileProducer,
    duration: Duration,
    reason: Reason,
    scene: Scene,
) -> Result<DumpOutcome, DumpError> {
    let bytes = producer.sample_cpu(duration)?;
    Ok(outcome(Kind::Cpu, bytes, reason, None, scene))
}

#[cfg(test)]
pub struct MockProfileProducer {
    pub heap_bytes: Vec<u8>,
    pub task_bytes: Vec<u8>,
    pub thread_bytes: Vec<u8>,
    pub cpu_bytes: Vec<u8>,
    pub fail: bool,
}

#[cfg(test)]
impl Default for MockProfileProducer {
    fn default() -> Self {
        MockProfileProducer {
            heap_bytes: b"heap-profile".to_vec(),
            task_bytes: b"task-stacks".to_vec(),
            thread_bytes: b"thread-creates".to_vec(),
            cpu_bytes: b"cpu-samples".to_vec(),
            fail: false,
        }
    }
}

#[cfg(test)]
impl ProfileProducer for MockProfileProducer {
    fn dump_heap(&self) -> Result<Vec<u8>, DumpError> {
        if self.fail {
            return Err(DumpError::CaptureFailed {
                kind: "heap".into(),
                reason: "mock failure".into(),
            });
        }
        Ok(self.heap_bytes.clone())
    }

    fn dump_task_stacks(&self) -> Result<Vec<u8>, DumpError> {
        if self.fail {
            return Err(DumpError::CaptureFailed {
                kind: "task".into(),
                reason: "mock failure".into(),
            });
        }
        Ok(self.task_bytes.clone())
    }

    fn dump_threads(&self) -> Result<Vec<u8>, DumpError> {
        if self.fail {
            return Err(DumpError::CaptureFailed {
                kind: "thread".into(),
                reason: "mock failure".into(),
            });
        }
        Ok(self.thread_bytes.clone())
    }

    fn sample_cpu(&self, _duration: Duration) -> Result<Vec<u8>, DumpError> {
        if self.fail {
            return Err(DumpError::CaptureFailed {
                kind: "cpu".into(),
                reason: "mock failure".into(),
            });
        }
        Ok(self.cpu_bytes.clone())
    }
}
