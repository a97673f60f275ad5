//! Client-side counters in Prometheus text format
//!
//! Nothing here is served over the network; the viewer dumps the text on
//! shutdown and embedders can scrape it however they like.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::controller::ConnectionStatus;

const APPLY_HISTORY: usize = 1000;

/// Metrics registry for one client process
#[derive(Debug)]
pub struct ClientMetrics {
    // Session lifecycle
    pub join_attempts: AtomicU64,
    pub joins_succeeded: AtomicU64,
    pub reconnects: AtomicU64,
    pub bots_not_found: AtomicU64,
    pub uploads_rejected: AtomicU64,

    // Update stream
    pub messages_applied: AtomicU64,
    pub stale_updates_dropped: AtomicU64,

    // Reducer timing (microseconds)
    pub apply_time_us: AtomicU64,
    pub apply_time_p95_us: AtomicU64,
    pub apply_time_max_us: AtomicU64,

    // 0=connecting, 1=reconnecting, 2=connected, 3=closing
    pub status: AtomicU64,

    start_time: Instant,
    apply_history: RwLock<VecDeque<u64>>,
}

impl ClientMetrics {
    pub fn new() -> Self {
        Self {
            join_attempts: AtomicU64::new(0),
            joins_succeeded: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            bots_not_found: AtomicU64::new(0),
            uploads_rejected: AtomicU64::new(0),
            messages_applied: AtomicU64::new(0),
            stale_updates_dropped: AtomicU64::new(0),
            apply_time_us: AtomicU64::new(0),
            apply_time_p95_us: AtomicU64::new(0),
            apply_time_max_us: AtomicU64::new(0),
            status: AtomicU64::new(0),
            start_time: Instant::now(),
            apply_history: RwLock::new(VecDeque::with_capacity(APPLY_HISTORY)),
        }
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_status(&self, status: ConnectionStatus) {
        let value = match status {
            ConnectionStatus::Connecting => 0,
            ConnectionStatus::Reconnecting => 1,
            ConnectionStatus::Connected => 2,
            ConnectionStatus::Closing => 3,
        };
        self.status.store(value, Ordering::Relaxed);
    }

    /// Record how long folding one update took
    pub fn record_apply_time(&self, duration: Duration) {
        let us = duration.as_micros() as u64;
        self.apply_time_us.store(us, Ordering::Relaxed);
        self.messages_applied.fetch_add(1, Ordering::Relaxed);

        let mut history = self.apply_history.write();
        history.push_back(us);

        while history.len() > APPLY_HISTORY {
            history.pop_front();
        }

        if history.len() >= 10 {
            let mut sorted: Vec<u64> = history.iter().copied().collect();
            sorted.sort_unstable();

            let p95_idx = (sorted.len() as f32 * 0.95) as usize;
            self.apply_time_p95_us
                .store(sorted[p95_idx.min(sorted.len() - 1)], Ordering::Relaxed);
            self.apply_time_max_us
                .store(sorted.last().copied().unwrap_or(0), Ordering::Relaxed);
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Generate Prometheus-format metrics output
    pub fn to_prometheus(&self) -> String {
        let mut output = String::with_capacity(2048);

        macro_rules! metric {
            ($name:expr, $help:expr, $type:expr, $value:expr) => {
                output.push_str(&format!(
                    "# HELP {} {}\n# TYPE {} {}\n{} {}\n",
                    $name, $help, $name, $type, $name, $value
                ));
            };
        }

        metric!("botworld_client_join_attempts", "Join attempts issued to the backend", "counter",
            self.join_attempts.load(Ordering::Relaxed));
        metric!("botworld_client_joins_succeeded", "Joins that opened a stream", "counter",
            self.joins_succeeded.load(Ordering::Relaxed));
        metric!("botworld_client_reconnects", "Transport losses recovered by reconnecting", "counter",
            self.reconnects.load(Ordering::Relaxed));
        metric!("botworld_client_bots_not_found", "Joins whose bot did not exist", "counter",
            self.bots_not_found.load(Ordering::Relaxed));
        metric!("botworld_client_uploads_rejected", "Bot uploads rejected by the world", "counter",
            self.uploads_rejected.load(Ordering::Relaxed));

        metric!("botworld_client_messages_applied", "Update messages folded into the snapshot", "counter",
            self.messages_applied.load(Ordering::Relaxed));
        metric!("botworld_client_stale_updates_dropped", "Updates dropped for a superseded listener", "counter",
            self.stale_updates_dropped.load(Ordering::Relaxed));

        metric!("botworld_client_apply_time_microseconds", "Last update fold time", "gauge",
            self.apply_time_us.load(Ordering::Relaxed));
        metric!("botworld_client_apply_time_p95_microseconds", "95th percentile update fold time", "gauge",
            self.apply_time_p95_us.load(Ordering::Relaxed));
        metric!("botworld_client_apply_time_max_microseconds", "Maximum update fold time", "gauge",
            self.apply_time_max_us.load(Ordering::Relaxed));

        metric!("botworld_client_status", "Connection status (0=connecting, 1=reconnecting, 2=connected, 3=closing)", "gauge",
            self.status.load(Ordering::Relaxed));
        metric!("botworld_client_uptime_seconds", "Client uptime", "counter",
            self.uptime_seconds());

        output
    }
}

impl Default for ClientMetrics {
    fn default() -> Self {
        Self::new()
    }
}
