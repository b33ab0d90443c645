use log::{debug, error, info, warn};
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::{Instant, interval};

use crate::backlog::{Backlog, JobStore};
use crate::common::config::SpiderConfig;
use crate::common::interface::{AlertLevel, LogNotifier, Notifier, StoragePipeline};
use crate::common::model::{Callback, Item, TaskState, boxed_callback};
use crate::dedup::Dedup;
use crate::engine::task_store::TaskStore;
use crate::errors::{PipelineError, Result};
use crate::utils::backoff_secs;

const MAX_BACKOFF_SECS: u64 = 60;

/// What a dispatch loop hands to the item buffer.
pub enum BufferEntry {
    /// A new row, or an update when the item carries `update_keys`
    Item(Item),
    /// Backlog member of a request whose output is in this buffer
    DeleteRequest(String),
    Callback(Callback),
}

impl fmt::Debug for BufferEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferEntry::Item(item) => f.debug_tuple("Item").field(item).finish(),
            BufferEntry::DeleteRequest(member) => f.debug_tuple("DeleteRequest").field(member).finish(),
            BufferEntry::Callback(_) => f.write_str("Callback(..)"),
        }
    }
}

impl From<Item> for BufferEntry {
    fn from(item: Item) -> Self {
        BufferEntry::Item(item)
    }
}

/// Rows of one table sharing the same update keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableBatch {
    pub table: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_keys: Option<Vec<String>>,
    pub rows: Vec<Map<String, Value>>,
}

/// Durable form of a batch that exhausted its export retries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FailedItems {
    #[serde(default)]
    pub add: Vec<TableBatch>,
    #[serde(default)]
    pub update: Vec<TableBatch>,
    /// Backlog members released together with the batch
    #[serde(default)]
    pub requests: Vec<String>,
}

impl FailedItems {
    fn into_entries(self) -> Vec<BufferEntry> {
        let mut entries = Vec::new();
        for batch in self.add {
            for row in batch.rows {
                entries.push(BufferEntry::Item(Item::from_fields(batch.table.clone(), row)));
            }
        }
        for batch in self.update {
            let keys = batch.update_keys.unwrap_or_default();
            for row in batch.rows {
                entries.push(BufferEntry::Item(Item::update(batch.table.clone(), row, keys.clone())));
            }
        }
        entries.extend(self.requests.into_iter().map(BufferEntry::DeleteRequest));
        entries
    }
}

#[derive(Debug, Clone)]
pub struct ItemBufferSettings {
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub max_retry_times: u32,
    pub max_failed_times: u32,
}

impl Default for ItemBufferSettings {
    fn default() -> Self {
        Self::from(&SpiderConfig::default())
    }
}

impl From<&SpiderConfig> for ItemBufferSettings {
    fn from(cfg: &SpiderConfig) -> Self {
        Self {
            batch_size: cfg.item_batch_size.max(1),
            flush_interval: cfg.item_flush_interval(),
            max_retry_times: cfg.export_max_retry_times,
            max_failed_times: cfg.export_max_failed_times,
        }
    }
}

#[derive(Default)]
struct ExportBatch {
    add: Vec<TableBatch>,
    update: Vec<TableBatch>,
    task_updates: Vec<(i64, TaskState)>,
    fingerprints: Vec<String>,
    deletes: Vec<String>,
    callbacks: Vec<Callback>,
}

impl ExportBatch {
    fn len(&self) -> usize {
        self.add.iter().chain(&self.update).map(|b| b.rows.len()).sum::<usize>()
            + self.task_updates.len()
            + self.deletes.len()
            + self.callbacks.len()
    }

    fn item_count(&self) -> usize {
        self.add.iter().chain(&self.update).map(|b| b.rows.len()).sum::<usize>()
            + self.task_updates.len()
    }

    fn to_failed_items(&self, task_table: Option<&str>) -> FailedItems {
        let mut update = self.update.clone();
        if let Some(table) = task_table {
            if !self.task_updates.is_empty() {
                update.push(TableBatch {
                    table: table.to_string(),
                    update_keys: Some(vec!["state".to_string()]),
                    rows: self
                        .task_updates
                        .iter()
                        .map(|(id, state)| {
                            let mut row = Map::new();
                            row.insert("id".into(), (*id).into());
                            row.insert("state".into(), state.as_i64().into());
                            row
                        })
                        .collect(),
                });
            }
        }
        FailedItems {
            add: self.add.clone(),
            update,
            requests: self.deletes.clone(),
        }
    }
}

#[derive(Default)]
struct RetryState {
    parked: Option<ExportBatch>,
    retry_times: u32,
    failed_times: u32,
    next_attempt: Option<Instant>,
}

/// Batches items into storage pipelines.
///
/// A batch that fails to export is parked and retried with exponential
/// backoff; while it is parked no new entries are taken. Once it has failed
/// `max_retry_times` times it is written to the job's failed-items set and
/// its requests are released anyway.
pub struct ItemBuffer {
    settings: ItemBufferSettings,
    backlog: Arc<dyn Backlog>,
    job_store: Arc<dyn JobStore>,
    pipelines: Vec<Arc<dyn StoragePipeline>>,
    dedup: Option<Arc<Dedup>>,
    notifier: Arc<dyn Notifier>,
    task_store: Option<(String, Arc<dyn TaskStore>)>,
    queue: Mutex<VecDeque<BufferEntry>>,
    retry: Mutex<RetryState>,
    flush_lock: Mutex<()>,
    flushing: AtomicBool,
    stop: AtomicBool,
    wake: Notify,
}

impl ItemBuffer {
    pub fn new(
        settings: ItemBufferSettings,
        backlog: Arc<dyn Backlog>,
        job_store: Arc<dyn JobStore>,
    ) -> Self {
        Self {
            settings,
            backlog,
            job_store,
            pipelines: Vec::new(),
            dedup: None,
            notifier: Arc::new(LogNotifier),
            task_store: None,
            queue: Mutex::new(VecDeque::new()),
            retry: Mutex::new(RetryState::default()),
            flush_lock: Mutex::new(()),
            flushing: AtomicBool::new(false),
            stop: AtomicBool::new(false),
            wake: Notify::new(),
        }
    }

    pub fn with_pipelines(mut self, pipelines: Vec<Arc<dyn StoragePipeline>>) -> Self {
        self.pipelines = pipelines;
        self
    }

    pub fn with_dedup(mut self, dedup: Option<Arc<Dedup>>) -> Self {
        self.dedup = dedup;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Routes state updates of `task_table` rows to `store` instead of the
    /// pipelines.
    pub fn with_task_store(mut self, task_table: impl Into<String>, store: Arc<dyn TaskStore>) -> Self {
        self.task_store = Some((task_table.into(), store));
        self
    }

    pub async fn put(&self, entry: impl Into<BufferEntry>) {
        let len = {
            let mut queue = self.queue.lock().await;
            queue.push_back(entry.into());
            queue.len()
        };
        if len >= self.settings.batch_size {
            self.wake.notify_one();
        }
    }

    /// Queued entries plus everything in a parked batch.
    pub async fn queued_count(&self) -> usize {
        let parked = self
            .retry
            .lock()
            .await
            .parked
            .as_ref()
            .map(ExportBatch::len)
            .unwrap_or(0);
        self.queue.lock().await.len() + parked
    }

    pub fn is_flushing(&self) -> bool {
        self.flushing.load(Ordering::SeqCst)
    }

    /// Exports queued entries in chunks of `batch_size`. Returns the number
    /// of items exported.
    pub async fn flush(&self) -> Result<usize> {
        let _guard = self.flush_lock.lock().await;
        self.flushing.store(true, Ordering::SeqCst);
        let result = self.flush_inner().await;
        self.flushing.store(false, Ordering::SeqCst);
        result
    }

    async fn flush_inner(&self) -> Result<usize> {
        let mut exported = 0;
        let mut retry = self.retry.lock().await;

        if let Some(parked) = retry.parked.take() {
            if retry.next_attempt.is_some_and(|at| Instant::now() < at) {
                retry.parked = Some(parked);
                return Ok(0);
            }
            match self.attempt(parked, &mut retry).await? {
                Some(n) => exported += n,
                None => return Ok(exported),
            }
        }

        loop {
            let chunk: Vec<BufferEntry> = {
                let mut queue = self.queue.lock().await;
                let n = queue.len().min(self.settings.batch_size);
                queue.drain(..n).collect()
            };
            if chunk.is_empty() {
                return Ok(exported);
            }
            let batch = self.prepare(chunk).await?;
            match self.attempt(batch, &mut retry).await? {
                Some(n) => exported += n,
                None => return Ok(exported),
            }
        }
    }

    /// Classifies a chunk, drops duplicate items and partitions by table.
    async fn prepare(&self, chunk: Vec<BufferEntry>) -> Result<ExportBatch> {
        let mut batch = ExportBatch::default();
        let mut items = Vec::new();
        for entry in chunk {
            match entry {
                BufferEntry::Item(item) => items.push(item),
                BufferEntry::DeleteRequest(member) => batch.deletes.push(member),
                BufferEntry::Callback(callback) => batch.callbacks.push(callback),
            }
        }

        let mut rows = Vec::with_capacity(items.len());
        for item in items {
            if let Some(update) = self.as_task_update(&item) {
                batch.task_updates.push(update);
            } else {
                rows.push(item);
            }
        }

        if let Some(dedup) = &self.dedup {
            let candidates: Vec<usize> = rows
                .iter()
                .enumerate()
                .filter(|(_, item)| !item.is_update())
                .map(|(i, _)| i)
                .collect();
            if !candidates.is_empty() {
                let fps: Vec<String> = candidates.iter().map(|i| rows[*i].fingerprint()).collect();
                let fresh = match dedup.filter_new(&fps).await {
                    Ok(fresh) => fresh,
                    Err(e) => {
                        warn!("item dedup unavailable, exporting unfiltered: {e}");
                        vec![true; fps.len()]
                    }
                };
                let mut keep = vec![true; rows.len()];
                for ((i, fp), fresh) in candidates.into_iter().zip(fps).zip(fresh) {
                    if fresh {
                        batch.fingerprints.push(fp);
                    } else {
                        keep[i] = false;
                    }
                }
                let before = rows.len();
                let mut keep = keep.into_iter();
                rows.retain(|_| keep.next().unwrap_or(true));
                if before > rows.len() {
                    debug!("{} duplicate items skipped", before - rows.len());
                }
            }
        }

        let mut partitions: BTreeMap<(String, Option<Vec<String>>), Vec<Map<String, Value>>> =
            BTreeMap::new();
        for item in rows {
            record_field_counts(&item);
            partitions
                .entry((item.table, item.update_keys))
                .or_default()
                .push(item.fields);
        }
        for ((table, update_keys), rows) in partitions {
            let table_batch = TableBatch {
                table,
                update_keys,
                rows,
            };
            if table_batch.update_keys.is_some() {
                batch.update.push(table_batch);
            } else {
                batch.add.push(table_batch);
            }
        }
        Ok(batch)
    }

    fn as_task_update(&self, item: &Item) -> Option<(i64, TaskState)> {
        let (table, _) = self.task_store.as_ref()?;
        if !item.is_update() || &item.table != table {
            return None;
        }
        let id = item.get("id").and_then(Value::as_i64)?;
        let state = item.get("state").and_then(Value::as_i64)?;
        match TaskState::try_from(state) {
            Ok(state) => Some((id, state)),
            Err(e) => {
                warn!("task {id}: {e}");
                None
            }
        }
    }

    /// One export attempt. `Some(n)` when the batch is done with (exported
    /// or persisted), `None` when it is parked for another try.
    async fn attempt(&self, batch: ExportBatch, retry: &mut RetryState) -> Result<Option<usize>> {
        match self.export(&batch).await {
            Ok(()) => {
                let n = batch.item_count();
                retry.retry_times = 0;
                retry.failed_times = 0;
                retry.next_attempt = None;
                self.finish(batch).await;
                return Ok(Some(n));
            }
            Err(e) => error!("item export failed: {e}"),
        }

        retry.retry_times += 1;
        retry.failed_times += 1;
        if retry.failed_times > self.settings.max_failed_times {
            self.notifier.notify(
                &format!(
                    "item export failed {} times in a row, {} entries pending",
                    retry.failed_times,
                    batch.len()
                ),
                AlertLevel::Error,
            );
        }

        if retry.retry_times > self.settings.max_retry_times {
            let failed = batch.to_failed_items(self.task_store.as_ref().map(|(t, _)| t.as_str()));
            let payload = serde_json::to_string(&failed)?;
            if let Err(e) = self.job_store.park_failed_items(&payload).await {
                // keep the batch rather than lose it
                error!("persisting failed items failed: {e}");
                retry.parked = Some(batch);
                retry.next_attempt = Some(Instant::now() + Duration::from_secs(MAX_BACKOFF_SECS));
                return Err(e);
            }
            warn!(
                "export retries exhausted, {} items moved to the failed-items set",
                batch.item_count()
            );
            retry.retry_times = 0;
            retry.next_attempt = None;
            // items are durable in the failed set; release their requests
            self.finish(ExportBatch {
                deletes: batch.deletes,
                callbacks: batch.callbacks,
                ..ExportBatch::default()
            })
            .await;
            return Ok(Some(0));
        }

        let wait = backoff_secs(retry.retry_times, MAX_BACKOFF_SECS);
        warn!(
            "item export failed, retry {} of {} in {wait}s",
            retry.retry_times, self.settings.max_retry_times
        );
        retry.next_attempt = Some(Instant::now() + Duration::from_secs(wait));
        retry.parked = Some(batch);
        Ok(None)
    }

    async fn export(&self, batch: &ExportBatch) -> Result<()> {
        for table_batch in &batch.add {
            for pipeline in &self.pipelines {
                if !pipeline.save_items(&table_batch.table, &table_batch.rows).await {
                    return Err(PipelineError::SaveRejected {
                        pipeline: pipeline.name().to_string(),
                        table: table_batch.table.clone(),
                        rows: table_batch.rows.len(),
                    }
                    .into());
                }
            }
        }
        for table_batch in &batch.update {
            let keys = table_batch.update_keys.as_deref().unwrap_or_default();
            for pipeline in &self.pipelines {
                if !pipeline.update_items(&table_batch.table, &table_batch.rows, keys).await {
                    return Err(PipelineError::UpdateRejected {
                        pipeline: pipeline.name().to_string(),
                        table: table_batch.table.clone(),
                        rows: table_batch.rows.len(),
                    }
                    .into());
                }
            }
        }
        if let (Some((_, store)), false) = (&self.task_store, batch.task_updates.is_empty()) {
            store.update_task_states(&batch.task_updates).await?;
        }
        Ok(())
    }

    /// Commits fingerprints, runs callbacks and releases backlog members.
    async fn finish(&self, batch: ExportBatch) {
        if let (Some(dedup), false) = (&self.dedup, batch.fingerprints.is_empty()) {
            if let Err(e) = dedup.add_many(&batch.fingerprints, true).await {
                warn!("recording {} item fingerprints failed: {e}", batch.fingerprints.len());
            }
        }
        for callback in batch.callbacks {
            if let Err(e) = callback().await {
                error!("item buffer callback failed: {e}");
            }
        }
        if !batch.deletes.is_empty() {
            // a member left behind is redelivered once its lease expires
            if let Err(e) = self.backlog.remove(&batch.deletes).await {
                error!("releasing {} requests failed: {e}", batch.deletes.len());
            }
        }
    }

    /// Resubmits up to `limit` batches from the failed-items set; each is
    /// removed from the set once it has been exported again.
    pub async fn recover_failed_items(&self, limit: usize) -> Result<usize> {
        let payloads = self.job_store.failed_items(limit).await?;
        let mut recovered = 0;
        for payload in payloads {
            let failed: FailedItems = match serde_json::from_str(&payload) {
                Ok(failed) => failed,
                Err(e) => {
                    warn!("dropping malformed failed-items entry: {e}");
                    self.job_store.remove_failed_items(&payload).await?;
                    continue;
                }
            };
            let entries = failed.into_entries();
            info!("recovering {} failed item entries", entries.len());
            for entry in entries {
                self.put(entry).await;
            }
            let job_store = self.job_store.clone();
            self.put(BufferEntry::Callback(boxed_callback(move || async move {
                job_store.remove_failed_items(&payload).await
            })))
            .await;
            recovered += 1;
        }
        Ok(recovered)
    }

    /// Flushes on the interval or when a full batch is queued, until stopped.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = interval(self.settings.flush_interval);
        while !self.stop.load(Ordering::SeqCst) {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.wake.notified() => {}
            }
            if let Err(e) = self.flush().await {
                error!("item buffer flush failed: {e}");
            }
        }
        if let Err(e) = self.flush().await {
            error!("final item buffer flush failed: {e}");
        }
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    pub async fn close_pipelines(&self) {
        for pipeline in &self.pipelines {
            pipeline.close().await;
        }
    }
}

fn record_field_counts(item: &Item) {
    for (field, value) in &item.fields {
        let filled = match value {
            Value::Null => false,
            Value::String(s) => !s.is_empty(),
            Value::Array(a) => !a.is_empty(),
            Value::Object(o) => !o.is_empty(),
            _ => true,
        };
        if filled {
            counter!(
                "item_field_non_empty_total",
                "table" => item.table.clone(),
                "field" => field.clone()
            )
            .increment(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backlog::MemoryBacklog;
    use crate::common::model::Request;
    use crate::common::model::TaskRow;
    use crate::dedup::MemoryFilter;
    use crate::engine::task_store::MemoryTaskStore;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct RecordingPipeline {
        saved: std::sync::Mutex<Vec<(String, usize)>>,
        updated: std::sync::Mutex<Vec<(String, Vec<String>)>>,
        fail_first: AtomicUsize,
    }

    #[async_trait]
    impl StoragePipeline for RecordingPipeline {
        fn name(&self) -> &str {
            "recording"
        }

        async fn save_items(&self, table: &str, items: &[Map<String, Value>]) -> bool {
            if self
                .fail_first
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return false;
            }
            self.saved.lock().unwrap().push((table.to_string(), items.len()));
            true
        }

        async fn update_items(&self, table: &str, _items: &[Map<String, Value>], keys: &[String]) -> bool {
            self.updated.lock().unwrap().push((table.to_string(), keys.to_vec()));
            true
        }
    }

    fn settings(batch_size: usize, max_retry_times: u32) -> ItemBufferSettings {
        ItemBufferSettings {
            batch_size,
            flush_interval: Duration::from_millis(50),
            max_retry_times,
            max_failed_times: 10,
        }
    }

    fn buffer(
        backlog: Arc<MemoryBacklog>,
        pipeline: Arc<RecordingPipeline>,
        settings: ItemBufferSettings,
    ) -> ItemBuffer {
        ItemBuffer::new(settings, backlog.clone(), backlog)
            .with_pipelines(vec![pipeline as Arc<dyn StoragePipeline>])
    }

    #[tokio::test]
    async fn test_spawned_loop_runs_callbacks_after_export() {
        let backlog = Arc::new(MemoryBacklog::new());
        let pipeline = Arc::new(RecordingPipeline::default());
        let buffer = Arc::new(buffer(backlog, pipeline.clone(), settings(10, 3)));
        let handle = tokio::spawn(buffer.clone().run());

        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        buffer.put(Item::new("news").with("id", 1)).await;
        buffer
            .put(BufferEntry::Callback(boxed_callback(move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })))
            .await;
        buffer.stop();
        handle.await.unwrap();

        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(*pipeline.saved.lock().unwrap(), vec![("news".to_string(), 1)]);
    }

    #[tokio::test]
    async fn test_batches_split_at_batch_size() {
        let backlog = Arc::new(MemoryBacklog::new());
        let pipeline = Arc::new(RecordingPipeline::default());
        let buffer = buffer(backlog, pipeline.clone(), settings(2, 3));
        for i in 0..3 {
            buffer.put(Item::new("news").with("id", i)).await;
        }
        assert_eq!(buffer.flush().await.unwrap(), 3);
        assert_eq!(
            *pipeline.saved.lock().unwrap(),
            vec![("news".to_string(), 2), ("news".to_string(), 1)]
        );
    }

    #[tokio::test]
    async fn test_partitions_by_table_and_update_keys() {
        let backlog = Arc::new(MemoryBacklog::new());
        let pipeline = Arc::new(RecordingPipeline::default());
        let buffer = buffer(backlog, pipeline.clone(), settings(10, 3));
        buffer.put(Item::new("a").with("x", 1)).await;
        buffer.put(Item::new("b").with("x", 1)).await;
        buffer.put(Item::new("a").with("x", 2)).await;
        buffer
            .put(Item::update("a", Map::new(), vec!["x".to_string()]))
            .await;
        buffer.flush().await.unwrap();
        assert_eq!(
            *pipeline.saved.lock().unwrap(),
            vec![("a".to_string(), 2), ("b".to_string(), 1)]
        );
        assert_eq!(
            *pipeline.updated.lock().unwrap(),
            vec![("a".to_string(), vec!["x".to_string()])]
        );
    }

    #[tokio::test]
    async fn test_duplicate_items_dropped() {
        let backlog = Arc::new(MemoryBacklog::new());
        let pipeline = Arc::new(RecordingPipeline::default());
        let dedup = Arc::new(Dedup::new("ib-test", Arc::new(MemoryFilter::new())));
        let buffer = buffer(backlog, pipeline.clone(), settings(10, 3)).with_dedup(Some(dedup));
        buffer.put(Item::new("news").with("id", 1)).await;
        buffer.put(Item::new("news").with("id", 1)).await;
        assert_eq!(buffer.flush().await.unwrap(), 1);
        buffer.put(Item::new("news").with("id", 1)).await;
        assert_eq!(buffer.flush().await.unwrap(), 0);
        assert_eq!(*pipeline.saved.lock().unwrap(), vec![("news".to_string(), 1)]);
    }

    #[tokio::test]
    async fn test_deletes_applied_after_export() {
        let backlog = Arc::new(MemoryBacklog::new());
        let member = Request::new("https://a.com").to_member().unwrap();
        backlog.enqueue(&[(member.clone(), 1.0)]).await.unwrap();
        let pipeline = Arc::new(RecordingPipeline::default());
        let buffer = buffer(backlog.clone(), pipeline, settings(10, 3));
        buffer.put(Item::new("news").with("id", 1)).await;
        buffer.put(BufferEntry::DeleteRequest(member)).await;
        buffer.flush().await.unwrap();
        assert_eq!(backlog.total().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_export_parked_and_retried_with_backoff() {
        let backlog = Arc::new(MemoryBacklog::new());
        let member = Request::new("https://a.com").to_member().unwrap();
        backlog.enqueue(&[(member.clone(), 1.0)]).await.unwrap();
        let pipeline = Arc::new(RecordingPipeline {
            fail_first: AtomicUsize::new(1),
            ..Default::default()
        });
        let buffer = buffer(backlog.clone(), pipeline.clone(), settings(10, 3));
        buffer.put(Item::new("news").with("id", 1)).await;
        buffer.put(BufferEntry::DeleteRequest(member)).await;

        assert_eq!(buffer.flush().await.unwrap(), 0);
        assert_eq!(buffer.queued_count().await, 2);
        assert_eq!(backlog.total().await.unwrap(), 1);

        // still backing off
        assert_eq!(buffer.flush().await.unwrap(), 0);
        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(buffer.flush().await.unwrap(), 1);
        assert_eq!(buffer.queued_count().await, 0);
        assert_eq!(backlog.total().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_persist_and_release() {
        let backlog = Arc::new(MemoryBacklog::new());
        let member = Request::new("https://a.com").to_member().unwrap();
        backlog.enqueue(&[(member.clone(), 1.0)]).await.unwrap();
        let pipeline = Arc::new(RecordingPipeline {
            fail_first: AtomicUsize::new(2),
            ..Default::default()
        });
        let buffer = buffer(backlog.clone(), pipeline.clone(), settings(10, 1));
        buffer.put(Item::new("news").with("id", 1)).await;
        buffer.put(BufferEntry::DeleteRequest(member.clone())).await;

        buffer.flush().await.unwrap();
        tokio::time::advance(Duration::from_secs(3)).await;
        buffer.flush().await.unwrap();

        // lossy: request released, items parked durably
        assert_eq!(backlog.total().await.unwrap(), 0);
        let parked = backlog.failed_items(10).await.unwrap();
        assert_eq!(parked.len(), 1);
        let failed: FailedItems = serde_json::from_str(&parked[0]).unwrap();
        assert_eq!(failed.add[0].rows.len(), 1);
        assert_eq!(failed.requests, vec![member]);

        // pipeline is healthy now: recovery exports and clears the set
        assert_eq!(buffer.recover_failed_items(10).await.unwrap(), 1);
        assert_eq!(buffer.flush().await.unwrap(), 1);
        assert!(backlog.failed_items(10).await.unwrap().is_empty());
        assert_eq!(pipeline.saved.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_task_updates_routed_to_task_store() {
        let backlog = Arc::new(MemoryBacklog::new());
        let pipeline = Arc::new(RecordingPipeline::default());
        let store = Arc::new(MemoryTaskStore::new());
        store.insert_tasks(vec![TaskRow::new(7)]).await;
        let buffer = buffer(backlog, pipeline.clone(), settings(10, 3))
            .with_task_store("tasks", store.clone());
        buffer
            .put(crate::engine::batch::update_task_state("tasks", 7, TaskState::Done))
            .await;
        buffer.flush().await.unwrap();
        assert_eq!(store.task(7).await.map(|t| t.state), Some(TaskState::Done));
        assert!(pipeline.updated.lock().unwrap().is_empty());
    }
}
