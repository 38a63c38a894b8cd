//! Queue-depth backpressure with a hysteresis band.
//!
//! Pauses dispatch at `max_depth` and only resumes once the queue has
//! drained below half of it, so a depth hovering at the threshold does
//! not flap the poller.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::services::task_queue::TaskQueue;

pub struct BackpressureMonitor {
    max_depth: u64,
    paused: AtomicBool,
}

impl BackpressureMonitor {
    pub const POLL_INTERVAL: Duration = Duration::from_secs(5);

    pub fn new(max_depth: u64) -> Self {
        Self {
            max_depth,
            paused: AtomicBool::new(false),
        }
    }

    /// Single atomic read, consulted by the poller every tick.
    pub fn should_pause(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Feeds one depth observation through the hysteresis band.
    pub fn observe(&self, depth: u64) {
        if self.paused.load(Ordering::Acquire) {
            if depth < self.max_depth / 2 {
                info!(depth, max_depth = self.max_depth, "queue drained, resuming dispatch");
                self.paused.store(false, Ordering::Release);
            }
        } else if depth >= self.max_depth {
            warn!(depth, max_depth = self.max_depth, "queue saturated, pausing dispatch");
            self.paused.store(true, Ordering::Release);
        }
    }

    pub async fn run(
        self: Arc<Self>,
        queue: Arc<dyn TaskQueue>,
        cancel: CancellationToken,
    ) {
        let mut ticker = interval(Self::POLL_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    match queue.depth().await {
                        Ok(depth) => self.observe(depth),
                        // Transient; keep the last decision.
                        Err(err) => warn!(error = %err, "queue depth probe failed"),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pauses_at_max_depth() {
        let monitor = BackpressureMonitor::new(100);
        monitor.observe(99);
        assert!(!monitor.should_pause());
        monitor.observe(100);
        assert!(monitor.should_pause());
    }

    #[test]
    fn stays_paused_inside_the_hysteresis_band() {
        let monitor = BackpressureMonitor::new(100);
        monitor.observe(150);
        assert!(monitor.should_pause());

        // Draining below max but not below half keeps it paused.
        monitor.observe(80);
        assert!(monitor.should_pause());
        monitor.observe(50);
        assert!(monitor.should_pause());

        monitor.observe(49);
        assert!(!monitor.should_pause());
    }

    #[test]
    fn resumed_monitor_can_pause_again() {
        let monitor = BackpressureMonitor::new(10);
        monitor.observe(10);
        monitor.observe(4);
        assert!(!monitor.should_pause());
        monitor.observe(11);
        assert!(monitor.should_pause());
    }
}
