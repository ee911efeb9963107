//! Dump filename grammar, text-trimming rules, and file creation discipline
//! (spec §4.G, §6).
//!
//! Filename grammar: `<kind>[.<event-id>].<YYYYMMDDhhmmss.SSS>.log`.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Local;

use crate::error::DumpError;

/// The profile kinds this crate's filename grammar recognises.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Cpu,
    Mem,
    Goroutine,
    Thread,
    GcHeap,
}

impl Kind {
    pub fn as_str(self) -> &'static str {
        match self {
            Kind::Cpu => "cpu",
            Kind::Mem => "mem",
            Kind::Goroutine => "goroutine",
            Kind::Thread => "thread",
            Kind::GcHeap => "gcheap",
        }
    }
}

/// Number of stack groups (blank-line-delimited blocks) kept when trimming
/// heap/gc-heap/task text dumps.
const TOP_N_STACK_GROUPS: usize = 10;

/// Number of leading bytes kept when trimming a thread-creation text dump.
const THREAD_TRIM_BYTES: usize = 64 * 1024;

/// Build a dump filename: `<kind>[.<event-id>].<timestamp>.log`.
pub fn filename(kind: Kind, event_id: Option<&str>) -> String {
    let timestamp = Local::now().format("%Y%m%d%H%M%S%.3f");
    match event_id {
        Some(id) if !id.is_empty() => format!("{}.{}.{}.log", kind.as_str(), id, timestamp),
        _ => format!("{}.{}.log", kind.as_str(), timestamp),
    }
}

/// Build the `<kind>-<trigger_count>` event-id convention for multi-blob
/// dumps that must be correlated (e.g. `heap-7`, `thr-3`).
pub fn event_id(kind: Kind, trigger_count: u64) -> String {
    let prefix = match kind {
        Kind::Thread => "thr",
        other => other.as_str(),
    };
    format!("{}-{}", prefix, trigger_count)
}

/// Write `bytes` to `dump_path/<filename>`, creating the directory (mode
/// `0755`) if it does not exist, then the file with create+append (mode
/// `0644`).
pub fn write_dump(dump_path: &Path, filename: &str, bytes: &[u8]) -> Result<PathBuf, DumpError> {
    if !dump_path.exists() {
        fs::create_dir_all(dump_path).map_err(|e| DumpError::DirCreateFailed {
            path: dump_path.display().to_string(),
            reason: e.to_string(),
        })?;
        set_mode(dump_path, 0o755);
    }
    let full_path = dump_path.join(filename);
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&full_path)
        .map_err(|e| DumpError::WriteFailed {
            path: full_path.display().to_string(),
            reason: e.to_string(),
        })?;
    set_mode(&full_path, 0o644);
    file.write_all(bytes).map_err(|e| DumpError::WriteFailed {
        path: full_path.display().to_string(),
        reason: e.to_string(),
    })?;
    Ok(full_path)
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(metadata) = fs::metadata(path) {
        let mut perms = metadata.permissions();
        perms.set_mode(mode);
        let _ = fs::set_permissions(path, perms);
    }
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) {}

/// Trim a text-form dump per spec §3: heap/gc-heap/task keep the top-N
/// blank-line-delimited stack groups; thread keeps the first K bytes.
pub fn trim_text(kind: Kind, text: &str, full_stack: bool) -> String {
    if full_stack {
        return text.to_string();
    }
    match kind {
        Kind::Thread => {
            let bytes = text.as_bytes();
            let cut = bytes.len().min(THREAD_TRIM_BYTES);
            // Avoid splitting a multi-byte UTF-8 sequence.
            let mut cut = cut;
            while cut > 0 && !text.is_char_boundary(cut) {
                cut -= 1;
            }
            text[..cut].to_string()
        }
        Kind::Cpu => text.to_string(),
        Kind::Mem | Kind::Goroutine | Kind::GcHeap => {
            let groups: Vec<&str> = text.split("\n\n").collect();
            groups
                .into_iter()
                .take(TOP_N_STACK_GROUPS)
                .collect::<Vec<_>>()
                .join("\n\n")
        }
    }
}
