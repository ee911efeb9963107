//! Unified error type hierarchy for sentryprof.
//!
//! Mirrors the error taxonomy of the sampling-and-detection engine: a fatal
//! `ConfigError` that halts the sample loop, a transient `TelemetryError` that
//! only skips one tick, a `DumpError` for failed profile writes, and a
//! `ReporterError` for the async reporter. All are collected under one
//! `Error` so callers can match broadly or narrowly.

use thiserror::Error;

/// Core/cpu-count or memory-limit could not be determined. Fatal to the
/// sample loop: the engine must be reconfigured and restarted.
#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    #[error("cpu core count unavailable: {0}")]
    CpuCoresUnavailable(String),

    #[error("memory limit unavailable: {0}")]
    MemoryLimitUnavailable(String),

    #[error("invalid signal rule: {0}")]
    InvalidRule(String),
}

/// One bad telemetry tick. Never fatal — the sample loop skips the tick and
/// continues without pushing stale values into the rings.
#[derive(Error, Debug, Clone)]
pub enum TelemetryError {
    #[error("failed to read process usage: {0}")]
    UsageUnavailable(String),

    #[error("failed to read heap next-gc estimate: {0}")]
    HeapEstimateUnavailable(String),
}

/// Profile capture or file-write failure. Logged; the detector's cooldown is
/// not armed so it retries on the next tick.
#[derive(Error, Debug, Clone)]
pub enum DumpError {
    #[error("failed to capture {kind} profile: {reason}")]
    CaptureFailed { kind: String, reason: String },

    #[error("failed to create dump directory {path}: {reason}")]
    DirCreateFailed { path: String, reason: String },

    #[error("failed to write dump file {path}: {reason}")]
    WriteFailed { path: String, reason: String },
}

/// Reporter transport failure. Logged by the worker; never retried.
#[derive(Error, Debug, Clone)]
pub enum ReporterError {
    #[error("report delivery failed: {0}")]
    DeliveryFailed(String),
}

/// Crate-wide error type. Runtime errors (`TelemetryError`, `DumpError`,
/// `ReporterError`) are normally only observed through logs and counters —
/// this type exists for the handful of APIs (construction, explicit
/// `Engine::start`) that do surface a `Result`.
#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Telemetry(#[from] TelemetryError),

    #[error(transparent)]
    Dump(#[from] DumpError),

    #[error(transparent)]
    Reporter(#[from] ReporterError),

    #[error("engine already running")]
    AlreadyRunning,

    #[error("engine already stopped")]
    AlreadyStopped,
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_display() {
        let err = ConfigError::CpuCoresUnavailable("cgroup read failed".to_string());
        assert_eq!(
            err.to_string(),
            "cpu core count unavailable: cgroup read failed"
        );
    }

    #[test]
    fn error_from_config_error() {
        let err: Error = ConfigError::InvalidRule("min > abs".to_string()).into();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn lifecycle_errors_are_distinct() {
        assert_ne!(Error::AlreadyRunning.to_string(), Error::AlreadyStopped.to_string());
    }
}
