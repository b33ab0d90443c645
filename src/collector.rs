//! Leases due requests from the backlog into a bounded local queue.

use log::{debug, error, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify, mpsc};
use tokio::time::{sleep, timeout};

use crate::backlog::Backlog;
use crate::common::config::SpiderConfig;
use crate::common::model::Request;
use crate::errors::Result;
use crate::utils::timestamp;

pub struct Collector {
    backlog: Arc<dyn Backlog>,
    batch: usize,
    lease_timeout: Duration,
    interval: Duration,
    sender: mpsc::Sender<Request>,
    receiver: Mutex<mpsc::Receiver<Request>>,
    collecting: AtomicBool,
    stop: AtomicBool,
    wake: Notify,
}

impl Collector {
    pub fn new(backlog: Arc<dyn Backlog>, config: &SpiderConfig) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        Self {
            backlog,
            batch: config.collector_batch.max(1),
            lease_timeout: config.lease_timeout(),
            interval: config.collector_interval(),
            sender,
            receiver: Mutex::new(receiver),
            collecting: AtomicBool::new(false),
            stop: AtomicBool::new(false),
            wake: Notify::new(),
        }
    }

    /// One lease round. Returns how many requests were queued.
    pub async fn collect_once(&self) -> Result<usize> {
        let remaining = self.sender.capacity();
        let want = self.batch.min(self.sender.max_capacity());
        if remaining < want {
            return Ok(0);
        }

        self.collecting.store(true, Ordering::SeqCst);
        let result = self.lease_into_queue(want).await;
        self.collecting.store(false, Ordering::SeqCst);
        result
    }

    async fn lease_into_queue(&self, want: usize) -> Result<usize> {
        let now = timestamp();
        let members = self
            .backlog
            .lease(now, now + self.lease_timeout.as_secs_f64(), want)
            .await?;
        let mut queued = 0;
        for member in members {
            let request = match Request::from_member(&member) {
                Ok(request) => request,
                Err(e) => {
                    // stays leased; comes back when the lease lapses
                    warn!("skipping malformed backlog member: {e}");
                    continue;
                }
            };
            if self.sender.send(request).await.is_err() {
                // receiver gone, the lease expires and another node takes it
                break;
            }
            queued += 1;
        }
        if queued > 0 {
            debug!("collected {queued} requests");
        }
        Ok(queued)
    }

    /// Leases until stopped, backing off when nothing is due.
    pub async fn run(self: Arc<Self>) {
        while !self.stop.load(Ordering::SeqCst) {
            let collected = match self.collect_once().await {
                Ok(n) => n,
                Err(e) => {
                    error!("collect failed: {e}");
                    0
                }
            };
            if collected == 0 {
                tokio::select! {
                    _ = sleep(self.interval) => {}
                    _ = self.wake.notified() => {}
                }
            }
        }
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    /// Next queued request, or `None` after `wait` without one.
    pub async fn get_request(&self, wait: Duration) -> Option<Request> {
        timeout(wait, async { self.receiver.lock().await.recv().await })
            .await
            .ok()
            .flatten()
    }

    pub fn queue_len(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    pub fn is_collecting(&self) -> bool {
        self.collecting.load(Ordering::SeqCst)
    }

    /// Every member of the backlog, leased or not.
    pub async fn backlog_count(&self) -> Result<u64> {
        self.backlog.total().await
    }
}
