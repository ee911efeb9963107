//! sentryprof: an in-process, self-triggering diagnostic profile dumper for
//! long-running server processes.
//!
//! Continuously samples coarse resource usage of the host process (CPU
//! fraction, resident memory fraction, live-task count, OS-thread count,
//! heap live-set ratio), compares each signal against a configurable rule,
//! and when a rule fires, captures a matching diagnostic profile to disk
//! and/or an external reporter. Built to catch transient production
//! anomalies — leaks, runaway CPU loops, native-thread fork bombs,
//! deadlocks — whose evidence is gone by the time a human attaches a live
//! profiler.
//!
//! The crate is organized leaf-first:
//! - **ring**: fixed-capacity circular sample history.
//! - **rule**: pure trigger-rule evaluation.
//! - **telemetry**: process/cgroup usage readings (`cgroup` backs its
//!   default implementation).
//! - **options**: the read-mostly, hot-swappable configuration registry.
//! - **dumpfile**: filename grammar and text-trimming rules.
//! - **actions**: signal -> concrete profile glue.
//! - **sinks**: file / logger / reporter fan-out.
//! - **reporter**: the bounded-queue Reporter Worker.
//! - **detectors**: per-signal cooldown/rule/action orchestration.
//! - **shrink**: the optional thread-shrink controller.
//! - **gc_heap**: the tick-based heap live-set detector.
//! - **engine**: the sample loop and public `Engine` handle.

#![allow(dead_code)]

pub mod actions;
pub mod cgroup;
pub mod detectors;
pub mod dumpfile;
pub mod engine;
pub mod error;
pub mod gc_heap;
pub mod options;
pub mod reporter;
pub mod ring;
pub mod rule;
pub mod shrink;
pub mod sinks;
pub mod telemetry;

// Re-export the log crate for macro usage in host applications.
pub use log;

pub use engine::Engine;
pub use error::{ConfigError, DumpError, Error, ReporterError, Result, TelemetryError};
pub use options::{DumpFormat, DumpOptions, Options, OptionsBuilder, OptionsPatch};
pub use reporter::{Report, ReportEvent, ReporterHandle};
pub use rule::{Reason, Scene, SignalRule};
pub use telemetry::{SystemTelemetrySource, TaskCounter, TelemetrySource};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
