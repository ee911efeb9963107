//! Thread-shrink controller (spec §4.E, last sub-bullet): an optional,
//! independent mechanism that pins idle tasks to fresh OS threads to
//! cooperate with the runtime's thread-reaper heuristic when the thread
//! count has crept up.
//!
//! Grounded on the teacher's `BenchmarkWatchdog::spawn` shape: a named
//! background task plus a stop handle, rather than a bare `tokio::spawn`
//! the caller has no way to cancel (`system/performance/watchdog.rs`).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::options::ShrinkConfig;

/// Minimum cooldown between two shrink jobs (spec: "arm the shrink
/// cooldown to `max(1h, 100 x delay)`").
const MIN_SHRINK_COOLDOWN: Duration = Duration::from_secs(3600);
/// Cap on the computed cooldown (spec: "... <= 24h").
const MAX_SHRINK_COOLDOWN: Duration = Duration::from_secs(24 * 3600);
/// Stagger between pinning each new task (spec: "~100ms between tasks").
const PIN_STAGGER: Duration = Duration::from_millis(100);

fn shrink_cooldown(delay: Duration) -> Duration {
    let computed = delay.saturating_mul(100);
    computed.clamp(MIN_SHRINK_COOLDOWN, MAX_SHRINK_COOLDOWN)
}

/// Cooldown + "a job is already scheduled" gate for the shrink controller.
/// Owned by the engine, consulted once per tick alongside the other
/// per-signal cooldowns.
#[derive(Debug, Default)]
pub struct ShrinkState {
    not_before: Option<Instant>,
}

impl ShrinkState {
    pub fn is_cooling(&self, now: Instant) -> bool {
        matches!(self.not_before, Some(t) if now < t)
    }

    fn arm(&mut self, now: Instant, delay: Duration) {
        self.not_before = Some(now + shrink_cooldown(delay));
    }
}

/// A single pinned idle task's stop handle. Dropping (or calling
/// [`PinnedTask::stop`]) releases it so the thread can be reaped.
pub struct PinnedTask {
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl PinnedTask {
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// If `current_threads > config.threshold`, schedule a one-shot job at
/// `now + config.delay` that pins `current_threads - config.threshold` new
/// tasks to idle. Returns immediately; the pinning happens on a
/// `tokio::spawn`ed scheduling task. Arms `state`'s cooldown up front so a
/// second tick can't schedule an overlapping job while this one is pending.
pub fn maybe_schedule(
    config: &ShrinkConfig,
    state: &mut ShrinkState,
    current_threads: u64,
) -> Option<tokio::task::JoinHandle<Vec<PinnedTask>>> {
    let now = Instant::now();
    if !config.enable || state.is_cooling(now) || current_threads <= config.threshold {
        return None;
    }
    let excess = current_threads - config.threshold;
    state.arm(now, config.delay);

    let delay = config.delay;
    Some(tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let mut pinned = Vec::with_capacity(excess as usize);
        for _ in 0..excess {
            pinned.push(pin_idle_task());
            tokio::time::sleep(PIN_STAGGER).await;
        }
        pinned
    }))
}

/// Spawns a dedicated OS thread that parks until told to stop. `tokio::spawn`
/// would schedule a cooperative task on the existing worker pool instead of
/// occupying a new thread, which would do nothing to the OS thread count.
fn pin_idle_task() -> PinnedTask {
    let stop = Arc::new(AtomicBool::new(false));
    let stop_clone = stop.clone();
    let handle = thread::spawn(move || {
        while !stop_clone.load(Ordering::Relaxed) {
            thread::sleep(Duration::from_secs(1));
        }
    });
    PinnedTask {
        stop,
        handle: Some(handle),
    }
}
