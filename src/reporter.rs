//! Reporter Worker (spec §4.I): a bounded queue plus a single background
//! consumer thread that hands report events to the pluggable [`Report`]
//! capability.
//!
//! Directly grounded on the teacher's `DiagnosticBuffer`
//! (`system/performance/diagnostic_buffer.rs`): non-blocking `try_send` so
//! the sample loop never stalls on a full queue, `recv_timeout` polling so
//! the consumer notices shutdown promptly, and a `catch_unwind` wrapper so
//! a panicking `Report` implementation cannot take the worker thread down.

use std::panic;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

use crate::dumpfile::Kind;
use crate::rule::{Reason, Scene};

/// Default queue capacity (spec §4.I: "bounded (capacity 32 in reference;
/// configurable)").
pub const DEFAULT_QUEUE_CAPACITY: usize = 32;

/// One report handed to the pluggable [`Report`] capability.
#[derive(Debug, Clone)]
pub struct ReportEvent {
    pub kind: Kind,
    pub filename: String,
    pub reason: Reason,
    pub event_id: Option<String>,
    pub sample_time: SystemTime,
    pub bytes: Arc<[u8]>,
    pub scene: Scene,
}

/// Host-supplied report transport. Implementations should not block for
/// long: the consumer thread is single, so a slow `report` call delays
/// every event behind it.
pub trait Report: Send + Sync {
    fn report(&self, event: &ReportEvent) -> anyhow::Result<()>;
}

/// Producer handle: the only part of the reporter the sample loop touches.
#[derive(Clone)]
pub struct ReporterHandle {
    sender: Sender<ReportEvent>,
    enabled: Arc<AtomicBool>,
}

impl ReporterHandle {
    /// Enqueue a report, non-blocking. Drops and logs a warning if the
    /// queue is full (spec invariant 8: back-pressure never blocks the
    /// sample loop) or if the reporter is disabled.
    pub fn submit(&self, event: ReportEvent) {
        if !self.enabled.load(Ordering::Relaxed) {
            return;
        }
        match self.sender.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                log::warn!("reporter queue full, dropping report event");
            }
            Err(TrySendError::Disconnected(_)) => {
                log::warn!("reporter worker gone, dropping report event");
            }
        }
    }

    /// Toggle reporting without closing the channel (spec §4.I: "enabling
    /// / disabling the reporter is an atomic flag read on the producer
    /// side; it does not close the channel").
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }
}

/// Owns the queue's consumer thread. Dropping it signals shutdown and
/// joins the thread, mirroring `DiagnosticBuffer`'s `Drop` impl.
pub struct ReporterWorker {
    handle: ReporterHandle,
    sender: Option<Sender<ReportEvent>>,
    consumer_thread: Option<thread::JoinHandle<()>>,
}

impl ReporterWorker {
    /// Spawn a reporter worker backed by `report`, with the given queue
    /// capacity.
    pub fn spawn(report: Arc<dyn Report>, capacity: usize, enabled: bool) -> Self {
        let (sender, receiver): (Sender<ReportEvent>, Receiver<ReportEvent>) = bounded(capacity);
        let enabled_flag = Arc::new(AtomicBool::new(enabled));

        let consumer_thread = thread::Builder::new()
            .name("sentryprof-reporter".into())
            .spawn(move || consume(receiver, report))
            .expect("failed to spawn reporter consumer thread");

        ReporterWorker {
            handle: ReporterHandle {
                sender: sender.clone(),
                enabled: enabled_flag,
            },
            sender: Some(sender),
            consumer_thread: Some(consumer_thread),
        }
    }

    /// Cloneable producer-side handle.
    pub fn handle(&self) -> ReporterHandle {
        self.handle.clone()
    }
}

fn consume(receiver: Receiver<ReportEvent>, report: Arc<dyn Report>) {
    loop {
        match receiver.recv_timeout(Duration::from_millis(100)) {
            Ok(event) => {
                let result = panic::catch_unwind(panic::AssertUnwindSafe(|| report.report(&event)));
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => log::warn!("reporter delivery failed: {}", err),
                    Err(panic_info) => {
                        let msg = panic_message(&panic_info);
                        log::error!("reporter panicked, recovered: {}", msg);
                    }
                }
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

impl Drop for ReporterWorker {
    fn drop(&mut self) {
        self.sender.take();
        if let Some(thread) = self.consumer_thread.take() {
            let _ = thread.join();
        }
    }
}

/// Default HTTP multipart reporter (ambient addition: a default transport
/// so the worker is exercised end-to-end without forcing every caller to
/// supply their own). Grounded on `original_source/reporters/http_reporter`.
pub struct HttpReporter {
    endpoint: String,
    client: reqwest::blocking::Client,
}

impl HttpReporter {
    pub fn new(endpoint: impl Into<String>) -> Self {
        HttpReporter {
            endpoint: endpoint.into(),
            client: reqwest::blocking::Client::new(),
        }
    }
}

impl Report for HttpReporter {
    fn report(&self, event: &ReportEvent) -> anyhow::Result<()> {
        let part = reqwest::blocking::multipart::Part::bytes(event.bytes.to_vec())
            .file_name(event.filename.clone());
        let form = reqwest::blocking::multipart::Form::new()
            .text("kind", event.kind.as_str())
            .text("filename", event.filename.clone())
            .part("profile", part);
        self.client
            .post(&self.endpoint)
            .multipart(form)
            .send()?
            .error_for_status()?;
        Ok(())
    }
}
