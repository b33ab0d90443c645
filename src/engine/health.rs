use log::{error, info};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::time::{Instant, interval};

use crate::backlog::{Backlog, JobStore};
use crate::common::config::HealthConfig;
use crate::common::interface::{AlertLevel, Notifier};
use crate::common::stats::{SpiderStats, StatsSnapshot};
use crate::errors::Result;
use crate::utils::timestamp;

const MIN_SUCCESS_RATIO: f64 = 0.5;

pub const STATUS_HEARTBEAT: &str = "spider_heartbeat";
pub const STATUS_START_TIME: &str = "spider_start_time";
pub const STATUS_END_TIME: &str = "spider_end_time";

#[derive(Debug, Clone, PartialEq)]
pub enum HealthAlert {
    FailedRequests(u64),
    LowSuccessRatio { ratio: f64, finished: u64 },
    Stalled { backlog: u64, secs: u64 },
}

impl fmt::Display for HealthAlert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthAlert::FailedRequests(n) => write!(f, "{n} failed requests parked"),
            HealthAlert::LowSuccessRatio { ratio, finished } => write!(
                f,
                "success ratio {:.1}% over the last {finished} requests",
                ratio * 100.0
            ),
            HealthAlert::Stalled { backlog, secs } => {
                write!(f, "backlog stuck at {backlog} requests for {secs}s")
            }
        }
    }
}

struct Observed {
    stats: StatsSnapshot,
    backlog: Option<u64>,
    changed_at: Instant,
}

/// Heartbeat stamping and periodic health checks for one job.
pub struct HealthMonitor {
    name: String,
    config: HealthConfig,
    backlog: Arc<dyn Backlog>,
    job_store: Arc<dyn JobStore>,
    stats: Arc<SpiderStats>,
    notifier: Arc<dyn Notifier>,
    observed: Mutex<Observed>,
}

impl HealthMonitor {
    pub fn new(
        name: impl Into<String>,
        config: HealthConfig,
        backlog: Arc<dyn Backlog>,
        job_store: Arc<dyn JobStore>,
        stats: Arc<SpiderStats>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            backlog,
            job_store,
            stats,
            notifier,
            observed: Mutex::new(Observed {
                stats: StatsSnapshot::default(),
                backlog: None,
                changed_at: Instant::now(),
            }),
        }
    }

    pub async fn heartbeat_once(&self) -> Result<()> {
        self.job_store
            .set_status(STATUS_HEARTBEAT, &timestamp().to_string())
            .await
    }

    /// Evaluates every check once and notifies about each finding.
    pub async fn check_once(&self) -> Result<Vec<HealthAlert>> {
        let mut alerts = Vec::new();

        let failed = self.job_store.failed_request_count().await?;
        if failed > self.config.failed_request_threshold {
            alerts.push(HealthAlert::FailedRequests(failed));
        }

        let backlog = self.backlog.total().await?;
        let now = Instant::now();
        let snapshot = self.stats.snapshot();
        {
            let mut observed = self.observed.lock().await;

            let window = StatsSnapshot {
                success: snapshot.success.saturating_sub(observed.stats.success),
                failed: snapshot.failed.saturating_sub(observed.stats.failed),
                total: snapshot.total.saturating_sub(observed.stats.total),
            };
            if let Some(ratio) = window.success_ratio() {
                if ratio < MIN_SUCCESS_RATIO {
                    alerts.push(HealthAlert::LowSuccessRatio {
                        ratio,
                        finished: window.success + window.failed,
                    });
                }
            }
            observed.stats = snapshot;

            if observed.backlog != Some(backlog) {
                observed.backlog = Some(backlog);
                observed.changed_at = now;
            } else if backlog > 0 {
                let stalled = now.duration_since(observed.changed_at);
                if stalled >= Duration::from_secs(self.config.stall_secs) {
                    alerts.push(HealthAlert::Stalled {
                        backlog,
                        secs: stalled.as_secs(),
                    });
                }
            }
        }

        for alert in &alerts {
            self.notifier
                .notify(&format!("[{}] {alert}", self.name), AlertLevel::Warning);
        }
        Ok(alerts)
    }

    pub async fn run_heartbeat(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(Duration::from_secs(self.config.heartbeat_interval_secs.max(1)));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.heartbeat_once().await {
                        error!("heartbeat failed: {e}");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }

    pub async fn run_checks(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(Duration::from_secs(self.config.check_interval_secs.max(1)));
        // the first tick fires immediately, before anything has run
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.check_once().await {
                        Ok(alerts) if alerts.is_empty() => info!("health check passed"),
                        Ok(_) => {}
                        Err(e) => error!("health check failed: {e}"),
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backlog::MemoryBacklog;
    use crate::common::interface::LogNotifier;

    fn monitor(backlog: Arc<MemoryBacklog>, stats: Arc<SpiderStats>, config: HealthConfig) -> HealthMonitor {
        HealthMonitor::new("h", config, backlog.clone(), backlog, stats, Arc::new(LogNotifier))
    }

    #[tokio::test]
    async fn test_heartbeat_stamps_status() {
        let backlog = Arc::new(MemoryBacklog::new());
        let monitor = monitor(backlog.clone(), Arc::new(SpiderStats::new()), HealthConfig::default());
        monitor.heartbeat_once().await.unwrap();
        assert!(backlog.get_status(STATUS_HEARTBEAT).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_failed_requests_and_success_ratio() {
        let backlog = Arc::new(MemoryBacklog::new());
        let stats = Arc::new(SpiderStats::new());
        let config = HealthConfig {
            failed_request_threshold: 1,
            ..HealthConfig::default()
        };
        let monitor = monitor(backlog.clone(), stats.clone(), config);
        backlog.park_failed_request("a", 1.0).await.unwrap();
        backlog.park_failed_request("b", 1.0).await.unwrap();
        stats.record_success("p");
        stats.record_failed("p");
        stats.record_failed("p");

        let alerts = monitor.check_once().await.unwrap();
        assert!(alerts.contains(&HealthAlert::FailedRequests(2)));
        assert!(alerts.iter().any(|a| matches!(a, HealthAlert::LowSuccessRatio { finished: 3, .. })));

        // the ratio is per window; nothing finished since
        let alerts = monitor.check_once().await.unwrap();
        assert!(!alerts.iter().any(|a| matches!(a, HealthAlert::LowSuccessRatio { .. })));
    }

    #[tokio::test]
    async fn test_stall_detected_when_backlog_does_not_move() {
        let backlog = Arc::new(MemoryBacklog::new());
        backlog.enqueue(&[("m".to_string(), 1.0)]).await.unwrap();
        let config = HealthConfig {
            stall_secs: 0,
            ..HealthConfig::default()
        };
        let monitor = monitor(backlog.clone(), Arc::new(SpiderStats::new()), config);
        assert!(monitor.check_once().await.unwrap().is_empty());
        assert_eq!(
            monitor.check_once().await.unwrap(),
            vec![HealthAlert::Stalled { backlog: 1, secs: 0 }]
        );
    }
}
