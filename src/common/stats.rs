use metrics::counter;
use std::sync::atomic::{AtomicU64, Ordering};

/// Dispatch outcome counters shared by every dispatch loop of a process.
#[derive(Debug, Default)]
pub struct SpiderStats {
    success: AtomicU64,
    failed: AtomicU64,
    total: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub success: u64,
    pub failed: u64,
    pub total: u64,
}

impl StatsSnapshot {
    /// `None` until anything has finished.
    pub fn success_ratio(&self) -> Option<f64> {
        let finished = self.success + self.failed;
        if finished == 0 {
            None
        } else {
            Some(self.success as f64 / finished as f64)
        }
    }
}

impl SpiderStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, parser: &str) {
        self.success.fetch_add(1, Ordering::Relaxed);
        counter!("spider_request_success_total", "parser" => parser.to_string()).increment(1);
    }

    pub fn record_failed(&self, parser: &str) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        counter!("spider_request_failed_total", "parser" => parser.to_string()).increment(1);
    }

    pub fn record_attempt(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            success: self.success.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            total: self.total.load(Ordering::Relaxed),
        }
    }
}
