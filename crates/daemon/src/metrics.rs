//! Negotiation counters and the periodic summary task.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::info;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::interval;

/// Process-wide negotiation counters.
///
/// `record` increments `total` before `succeeded`, and `snapshot` reads in
/// the opposite order, so a snapshot can never observe more successes than
/// attempts.
pub struct Metrics {
    total: AtomicU64,
    succeeded: AtomicU64,
    cumulative_latency_ms: AtomicU64,
}

/// A consistent point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub total: u64,
    pub succeeded: u64,
    pub cumulative_latency_ms: u64,
}

impl MetricsSnapshot {
    /// Mean completion latency, or `None` before the first success.
    pub fn mean_latency_ms(&self) -> Option<u64> {
        (self.succeeded > 0).then(|| self.cumulative_latency_ms / self.succeeded)
    }
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            total: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            cumulative_latency_ms: AtomicU64::new(0),
        })
    }

    /// Record one finished negotiation.
    pub fn record(&self, duration_ms: u64, success: bool) {
        self.total.fetch_add(1, Ordering::SeqCst);
        if success {
            self.cumulative_latency_ms
                .fetch_add(duration_ms, Ordering::SeqCst);
            self.succeeded.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let succeeded = self.succeeded.load(Ordering::SeqCst);
        let cumulative_latency_ms = self.cumulative_latency_ms.load(Ordering::SeqCst);
        let total = self.total.load(Ordering::SeqCst);
        MetricsSnapshot {
            total,
            succeeded,
            cumulative_latency_ms,
        }
    }

    /// Spawn the summary task: one log line per `period` until shutdown.
    pub fn spawn_reporter(
        self: &Arc<Self>,
        period: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let metrics = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        let snapshot = metrics.snapshot();
                        match snapshot.mean_latency_ms() {
                            Some(mean) => info!(
                                "negotiations: total {}, succeeded {}, mean latency {} ms",
                                snapshot.total, snapshot.succeeded, mean
                            ),
                            None => info!(
                                "negotiations: total {}, no successes yet",
                                snapshot.total
                            ),
                        }
                    }
                }
            }
        })
    }
}
