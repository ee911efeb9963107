//! Best-effort cgroup v1/v2 memory-limit reader.
//!
//! Resolution order matches the original system: an explicit override wins,
//! then a cgroup-reported limit, then the OS-reported total. cgroup v2 is
//! tried first since v1 paths are increasingly absent on modern distros.

use std::fs;
use std::path::Path;

const V2_MEMORY_MAX: &str = "/sys/fs/cgroup/memory.max";
const V1_MEMORY_LIMIT: &str = "/sys/fs/cgroup/memory/memory.limit_in_bytes";
const V2_CPU_MAX: &str = "/sys/fs/cgroup/cpu.max";
const V1_CPU_QUOTA_US: &str = "/sys/fs/cgroup/cpu/cpu.cfs_quota_us";
const V1_CPU_PERIOD_US: &str = "/sys/fs/cgroup/cpu/cpu.cfs_period_us";

/// A limit so large it is effectively "unset" (cgroup v1 reports this for
/// an unlimited memory controller).
const V1_UNLIMITED_SENTINEL: u64 = 0x7FFF_FFFF_FFFF_F000;

/// cgroup v1 reports this for an unconstrained CPU quota.
const V1_CPU_QUOTA_UNLIMITED: i64 = -1;

/// Read the current cgroup memory limit in bytes, if one is in effect.
///
/// Returns `None` when cgroups are not present, not readable, or report no
/// limit (cgroup v2 `"max"`, or the v1 sentinel value).
pub fn memory_limit_bytes() -> Option<u64> {
    read_v2_limit().or_else(read_v1_limit)
}

fn read_v2_limit() -> Option<u64> {
    read_v2_limit_at(V2_MEMORY_MAX)
}

fn read_v1_limit() -> Option<u64> {
    read_v1_limit_at(V1_MEMORY_LIMIT)
}

fn read_v2_limit_at(path: impl AsRef<Path>) -> Option<u64> {
    let raw = fs::read_to_string(path).ok()?;
    let trimmed = raw.trim();
    if trimmed == "max" {
        return None;
    }
    trimmed.parse::<u64>().ok()
}

fn read_v1_limit_at(path: impl AsRef<Path>) -> Option<u64> {
    let raw = fs::read_to_string(path).ok()?;
    let value: u64 = raw.trim().parse().ok()?;
    if value >= V1_UNLIMITED_SENTINEL {
        None
    } else {
        Some(value)
    }
}

/// Read the current cgroup CPU quota expressed in whole cores, if one is in
/// effect. `None` when cgroups are not present, not readable, or report no
/// quota (cgroup v2 `"max"`, or the v1 `-1` sentinel).
pub fn cpu_quota_cores() -> Option<f64> {
    read_v2_cpu_quota_cores().or_else(read_v1_cpu_quota_cores)
}

fn read_v2_cpu_quota_cores() -> Option<f64> {
    read_v2_cpu_quota_cores_at(V2_CPU_MAX)
}

fn read_v2_cpu_quota_cores_at(path: impl AsRef<Path>) -> Option<f64> {
    let raw = fs::read_to_string(path).ok()?;
    let mut parts = raw.trim().split_whitespace();
    let quota = parts.next()?;
    let period: f64 = parts.next()?.parse().ok()?;
    if quota == "max" {
        return None;
    }
    let quota: f64 = quota.parse().ok()?;
    if period <= 0.0 {
        return None;
    }
    Some(quota / period)
}

fn read_v1_cpu_quota_cores() -> Option<f64> {
    read_v1_cpu_quota_cores_at(V1_CPU_QUOTA_US, V1_CPU_PERIOD_US)
}

fn read_v1_cpu_quota_cores_at(
    quota_path: impl AsRef<Path>,
    period_path: impl AsRef<Path>,
) -> Option<f64> {
    let quota: i64 = fs::read_to_string(quota_path).ok()?.trim().parse().ok()?;
    if quota == V1_CPU_QUOTA_UNLIMITED {
        return None;
    }
    let period: i64 = fs::read_to_string(period_path).ok()?.trim().parse().ok()?;
    if period <= 0 {
        return None;
    }
    Some(quota as f64 / period as f64)
}
