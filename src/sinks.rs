//! Sink Fan-out (spec §4.H): after a successful dump, write the file,
//! optionally mirror the text form to the logger, and enqueue a report.
//!
//! The logger sink wires through the `log` facade the same way the
//! teacher's `LogCollector` implements `log::Log` (`log_collector.rs`), so
//! a host application can plug in any `log`-compatible backend (env_logger,
//! tracing-log, ...) without this crate depending on one directly.

use std::sync::Arc;

use crate::actions::DumpOutcome;
use crate::dumpfile::{self, trim_text};
use crate::error::DumpError;
use crate::options::{DumpFormat, DumpOptions};
use crate::reporter::{ReportEvent, ReporterHandle};

/// Write the dump to disk, optionally log its text form, and enqueue a
/// report. File write failures are returned (the caller must not arm the
/// signal's cooldown on failure, per spec §4.G); reporter failures are
/// never surfaced here since enqueueing is always best-effort.
pub fn fan_out(
    outcome: &DumpOutcome,
    dump: &DumpOptions,
    reporter: Option<&ReporterHandle>,
) -> Result<std::path::PathBuf, DumpError> {
    let path = dumpfile::write_dump(&dump.dump_path, &outcome.filename, &outcome.bytes)?;

    if dump.dump_to_logger && dump.format == DumpFormat::Text {
        if let Ok(text) = std::str::from_utf8(&outcome.bytes) {
            let trimmed = trim_text(outcome.kind, text, dump.full_stack);
            log::info!(
                "dump {} ({}): {}",
                outcome.filename,
                format_reason(outcome),
                trimmed
            );
        }
    }

    if let Some(reporter) = reporter {
        reporter.submit(ReportEvent {
            kind: outcome.kind,
            filename: outcome.filename.clone(),
            reason: outcome.reason,
            event_id: outcome.event_id.clone(),
            sample_time: outcome.sample_time,
            bytes: Arc::from(outcome.bytes.as_slice()),
            scene: outcome.scene,
        });
    }

    Ok(path)
}

fn format_reason(outcome: &DumpOutcome) -> String {
    format!("{:?}", outcome.reason)
}
