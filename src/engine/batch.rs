//! Batch task state machine over a SQL task table.
//!
//! ```text
//! NoBatch -> Open -> (Open | DonePendingDependency | Done) -> NextBatchOpened -> Open ...
//! ```
//!
//! A batch is a pass over every task row. It is done once every row is done
//! or failed and no dependency is still running; `interval_days` after it
//! opened, a new batch resets the rows to todo and starts over.

use chrono::{Local, NaiveDateTime};
use log::{error, info, warn};
use serde_json::Map;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::time::{Instant, interval};

use crate::backlog::Backlog;
use crate::common::config::BatchConfig;
use crate::common::interface::Parser;
use crate::common::model::{BatchRecord, Item, TaskCounts, TaskRow, TaskState};
use crate::engine::parser_control::DispatchContext;
use crate::engine::task_store::TaskStore;
use crate::errors::Result;
use crate::utils::redis_lock::LockManager;

const LOCK_TTL_SECS: u64 = 60;
const LOCK_WAIT: Duration = Duration::from_secs(5);

/// The item a parser yields to move a task row to `state`.
pub fn update_task_state(task_table: &str, id: i64, state: TaskState) -> Item {
    let mut fields = Map::new();
    fields.insert("id".into(), id.into());
    fields.insert("state".into(), state.as_i64().into());
    Item::update(task_table, fields, vec!["state".to_string()])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchPhase {
    /// The task table is empty; nothing to run
    NoBatch,
    Open,
    /// Every row finished but a related job is still running
    DonePendingDependency,
    /// Finished; waiting for the interval to elapse
    Done,
    NextBatchOpened,
}

impl BatchPhase {
    pub fn accepts_tasks(self) -> bool {
        matches!(self, BatchPhase::Open | BatchPhase::NextBatchOpened)
    }
}

pub struct BatchController {
    config: BatchConfig,
    store: Arc<dyn TaskStore>,
    backlog: Arc<dyn Backlog>,
    related_backlog: Option<Arc<dyn Backlog>>,
    locks: LockManager,
    ctx: Arc<DispatchContext>,
    lost_since: Mutex<Option<Instant>>,
}

impl BatchController {
    pub fn new(
        config: BatchConfig,
        store: Arc<dyn TaskStore>,
        backlog: Arc<dyn Backlog>,
        locks: LockManager,
        ctx: Arc<DispatchContext>,
    ) -> Self {
        Self {
            config,
            store,
            backlog,
            related_backlog: None,
            locks,
            ctx,
            lost_since: Mutex::new(None),
        }
    }

    /// Backlog of the job named by `related_job`; gates batch completion.
    pub fn with_related_backlog(mut self, backlog: Arc<dyn Backlog>) -> Self {
        self.related_backlog = Some(backlog);
        self
    }

    pub async fn check_batch(&self) -> Result<BatchPhase> {
        self.check_batch_at(Local::now().naive_local()).await
    }

    /// One transition of the state machine as of `now`.
    pub async fn check_batch_at(&self, now: NaiveDateTime) -> Result<BatchPhase> {
        let counts = self.store.count_states().await?;
        let Some(mut record) = self.store.latest_batch().await? else {
            if counts.total() == 0 {
                return Ok(BatchPhase::NoBatch);
            }
            self.open_batch(now).await?;
            return Ok(BatchPhase::NextBatchOpened);
        };

        if !record.is_done {
            record.total_count = counts.total();
            record.done_count = counts.finished();
            record.fail_count = counts.failed;
            let finished = counts.total() > 0 && counts.finished() == counts.total();
            if finished && self.backlog.total().await? == 0 {
                if !self.dependency_done().await? {
                    self.store.update_batch(&record).await?;
                    info!(
                        "batch {} finished, waiting for related job",
                        record.batch_date
                    );
                    return Ok(BatchPhase::DonePendingDependency);
                }
                record.is_done = true;
                info!(
                    "batch {} done: {} rows, {} failed",
                    record.batch_date, record.total_count, record.fail_count
                );
            }
            self.store.update_batch(&record).await?;
            if !record.is_done {
                return Ok(BatchPhase::Open);
            }
        }

        match record.next_batch_at() {
            Some(at) if now >= at => {
                self.open_batch(now).await?;
                return Ok(BatchPhase::NextBatchOpened);
            }
            Some(_) => {}
            None => warn!(
                "batch {} has unusable interval of {} days, no next batch",
                record.batch_date, record.interval_days
            ),
        }
        Ok(BatchPhase::Done)
    }

    async fn open_batch(&self, now: NaiveDateTime) -> Result<()> {
        let reset = self.store.reset_for_new_batch().await?;
        let counts = self.store.count_states().await?;
        let record = BatchRecord::open(now, counts.total(), self.config.interval_days);
        self.store.create_batch(&record).await?;
        info!(
            "batch {now} opened: {} rows ({reset} reset to todo)",
            counts.total()
        );
        Ok(())
    }

    /// Whether the related job has drained its backlog and closed its batch.
    pub async fn dependency_done(&self) -> Result<bool> {
        if let Some(related) = &self.related_backlog {
            let pending = related.total().await?;
            if pending > 0 {
                info!(
                    "related job {} still has {pending} requests",
                    self.config.related_job.as_deref().unwrap_or("?")
                );
                return Ok(false);
            }
        }
        match &self.config.related_batch_record {
            Some(table) => self.store.batch_is_done(table).await,
            None => Ok(true),
        }
    }

    /// Every row finished, nothing left in the backlog and no dependency
    /// running.
    pub async fn task_is_done(&self) -> Result<bool> {
        let counts = self.store.count_states().await?;
        Ok(counts.todo == 0
            && counts.in_progress == 0
            && self.backlog.total().await? == 0
            && self.dependency_done().await?)
    }

    /// Claims up to `task_limit` todo rows and seeds their requests. Returns
    /// the number of rows claimed.
    pub async fn lease_tasks(&self) -> Result<usize> {
        let claimed = self
            .locks
            .with_lock("lease_tasks", LOCK_TTL_SECS, LOCK_WAIT, self.claim_todo())
            .await?;
        let Some(rows) = claimed else {
            return Ok(0);
        };
        let rows = rows?;
        let n = rows.len();
        if n > 0 {
            info!("claimed {n} tasks");
            self.distribute_task(rows).await?;
        }
        Ok(n)
    }

    async fn claim_todo(&self) -> Result<Vec<TaskRow>> {
        let rows = self
            .store
            .fetch_tasks(TaskState::Todo, self.config.task_limit)
            .await?;
        if !rows.is_empty() {
            let ids: Vec<i64> = rows.iter().map(|r| r.id).collect();
            self.store.set_state(&ids, TaskState::InProgress).await?;
        }
        Ok(rows)
    }

    /// Turns task rows into requests through `start_requests`. With a parser
    /// column each row goes to its named parser; otherwise every parser sees
    /// every row.
    pub async fn distribute_task(&self, rows: Vec<TaskRow>) -> Result<usize> {
        let mut requests = 0;
        for row in &rows {
            let parsers: Vec<Arc<dyn Parser>> = if self.config.parser_name_column.is_some() {
                match self.ctx.parsers.resolve(row.parser_name.as_deref()) {
                    Ok(parser) if row.parser_name.is_some() => vec![parser],
                    Ok(_) => {
                        warn!("task {} names no parser, skipped", row.id);
                        continue;
                    }
                    Err(e) => {
                        warn!("task {}: {e}", row.id);
                        continue;
                    }
                }
            } else {
                self.ctx.parsers.all().to_vec()
            };
            for parser in parsers {
                let routed = self
                    .ctx
                    .route_seed(parser.start_requests(Some(row)), parser.as_ref())
                    .await?;
                requests += routed.requests;
            }
        }
        self.ctx.request_buffer.flush().await?;
        Ok(requests)
    }

    /// Re-runs in-progress rows whose owner is gone: nothing todo, nothing in
    /// the backlog, and that state held for `task_timeout_secs`. Few rows are
    /// re-leased directly, many are reset to todo. Returns the number of rows
    /// reclaimed.
    pub async fn reclaim_lost_tasks(&self) -> Result<u64> {
        let counts = self.store.count_states().await?;
        if !self.looks_lost(&counts).await? {
            *self.lost_since.lock().await = None;
            return Ok(0);
        }
        {
            let mut lost_since = self.lost_since.lock().await;
            let since = *lost_since.get_or_insert_with(Instant::now);
            if since.elapsed() < Duration::from_secs(self.config.task_timeout_secs) {
                return Ok(0);
            }
            *lost_since = None;
        }

        self.locks
            .with_lock("reclaim_tasks", LOCK_TTL_SECS, LOCK_WAIT, self.reclaim_locked())
            .await?
            .unwrap_or(Ok(0))
    }

    async fn reclaim_locked(&self) -> Result<u64> {
        // another node may have reclaimed while we waited for the lock
        let counts = self.store.count_states().await?;
        if !self.looks_lost(&counts).await? {
            return Ok(0);
        }
        if counts.in_progress > self.config.reclaim_threshold {
            let n = self
                .store
                .reset_state(TaskState::InProgress, TaskState::Todo)
                .await?;
            warn!("reset {n} lost tasks to todo");
            return Ok(n);
        }
        let rows = self
            .store
            .fetch_tasks(TaskState::InProgress, counts.in_progress as usize)
            .await?;
        let n = rows.len() as u64;
        warn!("re-leasing {n} lost tasks");
        self.distribute_task(rows).await?;
        Ok(n)
    }

    async fn looks_lost(&self, counts: &TaskCounts) -> Result<bool> {
        Ok(counts.todo == 0 && counts.in_progress > 0 && self.backlog.total().await? == 0)
    }

    /// No todo or in-progress rows.
    pub async fn is_idle(&self) -> Result<bool> {
        let counts = self.store.count_states().await?;
        Ok(counts.todo == 0 && counts.in_progress == 0)
    }

    async fn tick(&self) -> Result<()> {
        let phase = self.check_batch().await?;
        if phase.accepts_tasks() {
            // keep at most one lease window of requests queued
            if self.backlog.total().await? < self.config.task_limit as u64 {
                self.lease_tasks().await?;
            }
            self.reclaim_lost_tasks().await?;
        }
        Ok(())
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(Duration::from_secs(self.config.check_interval_secs.max(1)));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        error!("batch check failed: {e}");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }
}
