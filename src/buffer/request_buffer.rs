use log::{debug, error, warn};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::interval;

use crate::backlog::Backlog;
use crate::common::config::SpiderConfig;
use crate::common::model::{Callback, Request};
use crate::dedup::Dedup;
use crate::errors::Result;

#[derive(Debug, Clone)]
pub struct RequestBufferSettings {
    /// Pending requests that trigger an eager flush
    pub max_count: usize,
    /// Members per backlog write
    pub chunk_size: usize,
    pub flush_interval: Duration,
}

impl Default for RequestBufferSettings {
    fn default() -> Self {
        Self::from(&SpiderConfig::default())
    }
}

impl From<&SpiderConfig> for RequestBufferSettings {
    fn from(cfg: &SpiderConfig) -> Self {
        Self {
            max_count: cfg.request_buffer_max.max(1),
            chunk_size: cfg.backlog_chunk_size.max(1),
            flush_interval: cfg.request_flush_interval(),
        }
    }
}

struct Prepared {
    request: Request,
    member: String,
    fingerprint: Option<String>,
}

/// Accumulates follow-up requests and writes them to the backlog in chunks.
///
/// A failed write leaves the unsent requests queued for the next flush, so
/// enqueue is at-least-once.
pub struct RequestBuffer {
    backlog: Arc<dyn Backlog>,
    dedup: Option<Arc<Dedup>>,
    settings: RequestBufferSettings,
    pending: Mutex<VecDeque<Request>>,
    callbacks: Mutex<Vec<Callback>>,
    deletes: Mutex<Vec<String>>,
    flush_lock: Mutex<()>,
    flushing: AtomicBool,
    stop: AtomicBool,
    wake: Notify,
}

impl RequestBuffer {
    pub fn new(
        backlog: Arc<dyn Backlog>,
        dedup: Option<Arc<Dedup>>,
        settings: RequestBufferSettings,
    ) -> Self {
        Self {
            backlog,
            dedup,
            settings,
            pending: Mutex::new(VecDeque::new()),
            callbacks: Mutex::new(Vec::new()),
            deletes: Mutex::new(Vec::new()),
            flush_lock: Mutex::new(()),
            flushing: AtomicBool::new(false),
            stop: AtomicBool::new(false),
            wake: Notify::new(),
        }
    }

    pub async fn put_request(&self, request: Request) {
        let len = {
            let mut pending = self.pending.lock().await;
            pending.push_back(request);
            pending.len()
        };
        if len >= self.settings.max_count {
            if let Err(e) = self.flush().await {
                error!("eager request flush failed: {e}");
            }
        }
    }

    /// Runs after the next flush that writes everything queued before it.
    pub async fn put_callback(&self, callback: Callback) {
        self.callbacks.lock().await.push(callback);
    }

    /// Removes a finished request's backlog member on the next flush.
    pub async fn put_del_request(&self, member: String) {
        self.deletes.lock().await.push(member);
    }

    /// Queued requests, deletes and callbacks.
    pub async fn queued_count(&self) -> usize {
        self.pending.lock().await.len()
            + self.deletes.lock().await.len()
            + self.callbacks.lock().await.len()
    }

    pub fn is_flushing(&self) -> bool {
        self.flushing.load(Ordering::SeqCst)
    }

    /// Writes everything queued; returns the number of requests enqueued.
    pub async fn flush(&self) -> Result<usize> {
        let _guard = self.flush_lock.lock().await;
        self.flushing.store(true, Ordering::SeqCst);
        let result = self.flush_inner().await;
        self.flushing.store(false, Ordering::SeqCst);
        result
    }

    async fn flush_inner(&self) -> Result<usize> {
        let requests: Vec<Request> = self.pending.lock().await.drain(..).collect();
        let callbacks: Vec<Callback> = std::mem::take(&mut *self.callbacks.lock().await);

        let mut enqueued_members = HashSet::new();
        let mut sent = 0;
        if !requests.is_empty() {
            let keep = match self.dedup_mask(&requests).await {
                Ok(keep) => keep,
                Err(e) => {
                    self.restore(requests, callbacks).await;
                    return Err(e);
                }
            };

            let mut prepared = Vec::with_capacity(requests.len());
            let mut skipped = 0;
            for (mut request, keep) in requests.into_iter().zip(keep) {
                if !keep {
                    skipped += 1;
                    continue;
                }
                // a leased request re-enqueued as-is must not drag its old member along
                request.take_backlog_member();
                let fingerprint = (self.dedup.is_some() && request.filter_repeat)
                    .then(|| request.fingerprint());
                match request.to_member() {
                    Ok(member) => prepared.push(Prepared {
                        request,
                        member,
                        fingerprint,
                    }),
                    Err(e) => error!("dropping unserializable request {}: {e}", request.url),
                }
            }
            if skipped > 0 {
                debug!("{skipped} duplicate requests skipped");
            }

            for chunk in prepared.chunks(self.settings.chunk_size) {
                let entries: Vec<(String, f64)> = chunk
                    .iter()
                    .map(|p| (p.member.clone(), p.request.score()))
                    .collect();
                if let Err(e) = self.backlog.enqueue(&entries).await {
                    error!(
                        "backlog write failed, {} requests kept for retry: {e}",
                        prepared.len() - sent
                    );
                    let unsent: Vec<Request> =
                        prepared.split_off(sent).into_iter().map(|p| p.request).collect();
                    self.commit_fingerprints(&prepared).await;
                    self.restore(unsent, callbacks).await;
                    return Err(e);
                }
                sent += chunk.len();
            }

            self.commit_fingerprints(&prepared).await;
            enqueued_members.extend(prepared.into_iter().map(|p| p.member));
        }

        let deletes: Vec<String> = std::mem::take(&mut *self.deletes.lock().await)
            .into_iter()
            .filter(|m| !enqueued_members.contains(m))
            .collect();
        if !deletes.is_empty() {
            if let Err(e) = self.backlog.remove(&deletes).await {
                error!("backlog delete failed, {} kept for retry: {e}", deletes.len());
                self.deletes.lock().await.extend(deletes);
                self.callbacks.lock().await.extend(callbacks);
                return Err(e);
            }
        }

        for callback in callbacks {
            if let Err(e) = callback().await {
                error!("request buffer callback failed: {e}");
            }
        }
        Ok(sent)
    }

    /// Per request, whether it survives dedup (including in-batch repeats).
    async fn dedup_mask(&self, requests: &[Request]) -> Result<Vec<bool>> {
        let Some(dedup) = &self.dedup else {
            return Ok(vec![true; requests.len()]);
        };
        let checked: Vec<usize> = requests
            .iter()
            .enumerate()
            .filter(|(_, r)| r.filter_repeat)
            .map(|(i, _)| i)
            .collect();
        let mut keep = vec![true; requests.len()];
        if checked.is_empty() {
            return Ok(keep);
        }
        let fps: Vec<String> = checked.iter().map(|i| requests[*i].fingerprint()).collect();
        let fresh = dedup.filter_new(&fps).await?;
        for (i, fresh) in checked.into_iter().zip(fresh) {
            keep[i] = fresh;
        }
        Ok(keep)
    }

    async fn commit_fingerprints(&self, written: &[Prepared]) {
        let Some(dedup) = &self.dedup else {
            return;
        };
        let fps: Vec<String> = written.iter().filter_map(|p| p.fingerprint.clone()).collect();
        if fps.is_empty() {
            return;
        }
        if let Err(e) = dedup.add_many(&fps, true).await {
            warn!("recording {} request fingerprints failed: {e}", fps.len());
        }
    }

    async fn restore(&self, requests: Vec<Request>, callbacks: Vec<Callback>) {
        {
            let mut pending = self.pending.lock().await;
            for request in requests.into_iter().rev() {
                pending.push_front(request);
            }
        }
        let mut queued = self.callbacks.lock().await;
        let later = std::mem::take(&mut *queued);
        *queued = callbacks;
        queued.extend(later);
    }

    /// Flushes on an interval until stopped, then once more.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = interval(self.settings.flush_interval);
        while !self.stop.load(Ordering::SeqCst) {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.wake.notified() => {}
            }
            if let Err(e) = self.flush().await {
                error!("request buffer flush failed: {e}");
            }
        }
        if let Err(e) = self.flush().await {
            error!("final request buffer flush failed: {e}");
        }
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }
}
