//! In-process event bus and global statistics.
//!
//! Events are append-only facts. Subscribers must not assume ordering
//! across sessions beyond per-session monotonicity. Publishing snapshots
//! the subscriber list under the lock and invokes handlers without it; a
//! panicking subscriber is isolated so it cannot damage the bus.
//!
//! Counters are atomics with no cross-counter consistency guarantee.
//! Rolling rates are derived by a sampler from delta-over-window
//! calculations.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::warn;

/// Kinds of facts the daemon emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Upload,
    Download,
    Delete,
    Mkdir,
    Rmdir,
    Login,
    Logout,
    Nuke,
    Unnuke,
    Pre,
    RaceUpdate,
    RaceComplete,
    ZipscriptStatus,
}

/// A typed event record.
#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    pub timestamp_unix: i64,
    pub session_id: u64,
    pub user: Option<String>,
    pub group: Option<String>,
    pub section: Option<String>,
    pub path: Option<String>,
    pub bytes: u64,
    pub reason: Option<String>,
    pub remote_host: Option<String>,
}

impl Event {
    pub fn new(kind: EventKind, session_id: u64) -> Self {
        Event {
            kind,
            timestamp_unix: chrono::Utc::now().timestamp(),
            session_id,
            user: None,
            group: None,
            section: None,
            path: None,
            bytes: 0,
            reason: None,
            remote_host: None,
        }
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn section(mut self, section: impl Into<String>) -> Self {
        self.section = Some(section.into());
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn bytes(mut self, bytes: u64) -> Self {
        self.bytes = bytes;
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn remote_host(mut self, host: impl Into<String>) -> Self {
        self.remote_host = Some(host.into());
        self
    }
}

type Handler = std::sync::Arc<dyn Fn(&Event) + Send + Sync>;

/// Fire-and-forget pub/sub.
#[derive(Default)]
pub struct EventBus {
    handlers: Mutex<Vec<Handler>>,
}

impl EventBus {
    pub fn new() -> Self {
        EventBus::default()
    }

    pub fn subscribe(&self, handler: impl Fn(&Event) + Send + Sync + 'static) {
        self.handlers
            .lock()
            .expect("event bus lock poisoned")
            .push(std::sync::Arc::new(handler));
    }

    /// Invokes every subscriber outside the lock. Panics are swallowed.
    pub fn publish(&self, event: Event) {
        let snapshot: Vec<Handler> =
            self.handlers.lock().expect("event bus lock poisoned").clone();
        for handler in snapshot {
            if catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
                warn!(kind = ?event.kind, "event subscriber panicked");
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.handlers.lock().expect("event bus lock poisoned").len()
    }
}

/// Global best-effort counters.
#[derive(Default)]
pub struct Stats {
    pub active_connections: AtomicU64,
    pub total_connections: AtomicU64,
    pub total_commands: AtomicU64,
    pub failed_logins: AtomicU64,
    pub aborted_transfers: AtomicU64,
    pub active_transfers: AtomicU64,
    pub total_transfers: AtomicU64,
    pub bytes_uploaded: AtomicU64,
    pub bytes_downloaded: AtomicU64,
    pub transfer_millis: AtomicU64,
    pub peak_concurrent_transfers: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Stats::default()
    }

    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn command_executed(&self) {
        self.total_commands.fetch_add(1, Ordering::Relaxed);
    }

    pub fn login_failed(&self) {
        self.failed_logins.fetch_add(1, Ordering::Relaxed);
    }

    pub fn transfer_started(&self) {
        let active = self.active_transfers.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak_concurrent_transfers.fetch_max(active, Ordering::Relaxed);
        self.total_transfers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn transfer_finished(&self, elapsed: Duration, aborted: bool) {
        self.active_transfers.fetch_sub(1, Ordering::Relaxed);
        self.transfer_millis.fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
        if aborted {
            self.aborted_transfers.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn add_uploaded(&self, bytes: u64) {
        self.bytes_uploaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_downloaded(&self, bytes: u64) {
        self.bytes_downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            active_connections: self.active_connections.load(Ordering::Relaxed),
            total_connections: self.total_connections.load(Ordering::Relaxed),
            total_commands: self.total_commands.load(Ordering::Relaxed),
            failed_logins: self.failed_logins.load(Ordering::Relaxed),
            aborted_transfers: self.aborted_transfers.load(Ordering::Relaxed),
            active_transfers: self.active_transfers.load(Ordering::Relaxed),
            total_transfers: self.total_transfers.load(Ordering::Relaxed),
            bytes_uploaded: self.bytes_uploaded.load(Ordering::Relaxed),
            bytes_downloaded: self.bytes_downloaded.load(Ordering::Relaxed),
            transfer_millis: self.transfer_millis.load(Ordering::Relaxed),
            peak_concurrent_transfers: self.peak_concurrent_transfers.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub active_connections: u64,
    pub total_connections: u64,
    pub total_commands: u64,
    pub failed_logins: u64,
    pub aborted_transfers: u64,
    pub active_transfers: u64,
    pub total_transfers: u64,
    pub bytes_uploaded: u64,
    pub bytes_downloaded: u64,
    pub transfer_millis: u64,
    pub peak_concurrent_transfers: u64,
}

/// Byte and command rates over a window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Default)]
pub struct Rates {
    pub upload_bytes_per_sec: f64,
    pub download_bytes_per_sec: f64,
    pub commands_per_sec: f64,
}

struct Sample {
    at: Instant,
    uploaded: u64,
    downloaded: u64,
    commands: u64,
}

/// Delta-over-window rate calculator fed by a periodic sampler task.
pub struct RateSampler {
    samples: Mutex<VecDeque<Sample>>,
}

/// Longest window the sampler retains (the 5-minute rate).
pub const MAX_RATE_WINDOW: Duration = Duration::from_secs(300);

impl Default for RateSampler {
    fn default() -> Self {
        RateSampler::new()
    }
}

impl RateSampler {
    pub fn new() -> Self {
        RateSampler { samples: Mutex::new(VecDeque::new()) }
    }

    /// Records a sample and drops everything older than the longest
    /// window.
    pub fn record(&self, stats: &Stats) {
        let now = Instant::now();
        let mut samples = self.samples.lock().expect("rate sampler lock poisoned");
        samples.push_back(Sample {
            at: now,
            uploaded: stats.bytes_uploaded.load(Ordering::Relaxed),
            downloaded: stats.bytes_downloaded.load(Ordering::Relaxed),
            commands: stats.total_commands.load(Ordering::Relaxed),
        });
        while let Some(front) = samples.front() {
            if now.duration_since(front.at) > MAX_RATE_WINDOW + Duration::from_secs(5) {
                samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Rate over the trailing `window`, computed from the oldest sample
    /// inside it against the newest.
    pub fn rate_over(&self, window: Duration) -> Rates {
        let samples = self.samples.lock().expect("rate sampler lock poisoned");
        let Some(newest) = samples.back() else { return Rates::default() };
        let oldest = samples
            .iter()
            .find(|s| newest.at.duration_since(s.at) <= window)
            .unwrap_or(newest);
        let secs = newest.at.duration_since(oldest.at).as_secs_f64();
        if secs <= 0.0 {
            return Rates::default();
        }
        Rates {
            upload_bytes_per_sec: (newest.uploaded - oldest.uploaded) as f64 / secs,
            download_bytes_per_sec: (newest.downloaded - oldest.downloaded) as f64 / secs,
            commands_per_sec: (newest.commands - oldest.commands) as f64 / secs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn bus_delivers_to_all_subscribers() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let hits = hits.clone();
            bus.subscribe(move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }
        bus.publish(Event::new(EventKind::Login, 1).user("alice"));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn panicking_subscriber_is_isolated() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        bus.subscribe(|_| panic!("bad subscriber"));
        let h = hits.clone();
        bus.subscribe(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        bus.publish(Event::new(EventKind::Upload, 7).bytes(42));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn counters_and_peak() {
        let stats = Stats::new();
        stats.transfer_started();
        stats.transfer_started();
        stats.transfer_finished(Duration::from_millis(100), false);
        stats.transfer_started();
        let snap = stats.snapshot();
        assert_eq!(snap.total_transfers, 3);
        assert_eq!(snap.active_transfers, 2);
        assert_eq!(snap.peak_concurrent_transfers, 2);
        assert_eq!(snap.transfer_millis, 100);
    }

    #[test]
    fn rates_from_deltas() {
        let stats = Stats::new();
        let sampler = RateSampler::new();
        sampler.record(&stats);
        stats.add_uploaded(10_000);
        std::thread::sleep(Duration::from_millis(50));
        sampler.record(&stats);
        let rates = sampler.rate_over(Duration::from_secs(5));
        assert!(rates.upload_bytes_per_sec > 0.0);
        assert_eq!(rates.download_bytes_per_sec, 0.0);
    }
}
