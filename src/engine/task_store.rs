//! Task table and batch-record table access for batch jobs.

pub mod sql;

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::Mutex;

use crate::common::model::{BatchRecord, TaskCounts, TaskRow, TaskState};
use crate::errors::Result;

pub use sql::SqlTaskStore;

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Up to `limit` rows in `state`, in the store's configured order.
    async fn fetch_tasks(&self, state: TaskState, limit: usize) -> Result<Vec<TaskRow>>;

    /// Sets `state` on rows `ids`; returns the number of rows changed.
    async fn set_state(&self, ids: &[i64], state: TaskState) -> Result<u64>;

    async fn update_task_states(&self, updates: &[(i64, TaskState)]) -> Result<()> {
        let mut grouped: HashMap<TaskState, Vec<i64>> = HashMap::new();
        for (id, state) in updates {
            grouped.entry(*state).or_default().push(*id);
        }
        for (state, ids) in grouped {
            self.set_state(&ids, state).await?;
        }
        Ok(())
    }

    async fn count_states(&self) -> Result<TaskCounts>;

    /// Moves every row in `from` to `to`.
    async fn reset_state(&self, from: TaskState, to: TaskState) -> Result<u64>;

    /// Puts every row that has not permanently failed back to todo.
    async fn reset_for_new_batch(&self) -> Result<u64>;

    async fn latest_batch(&self) -> Result<Option<BatchRecord>>;

    async fn create_batch(&self, record: &BatchRecord) -> Result<()>;

    /// Rewrites the counters of the record opened at `record.batch_date`.
    async fn update_batch(&self, record: &BatchRecord) -> Result<()>;

    /// Whether the newest record of another job's batch table is done. A
    /// table without records counts as done.
    async fn batch_is_done(&self, batch_record_table: &str) -> Result<bool>;
}

#[derive(Default)]
struct MemoryTables {
    tasks: BTreeMap<i64, TaskRow>,
    batches: Vec<BatchRecord>,
    related: HashMap<String, BatchRecord>,
}

/// Task and batch tables held in process memory, ordered by id.
#[derive(Default)]
pub struct MemoryTaskStore {
    tables: Mutex<MemoryTables>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_tasks(&self, rows: impl IntoIterator<Item = TaskRow>) {
        let mut tables = self.tables.lock().await;
        for row in rows {
            tables.tasks.insert(row.id, row);
        }
    }

    pub async fn task(&self, id: i64) -> Option<TaskRow> {
        self.tables.lock().await.tasks.get(&id).cloned()
    }

    pub async fn batches(&self) -> Vec<BatchRecord> {
        self.tables.lock().await.batches.clone()
    }

    /// Sets the newest record of another job's batch table.
    pub async fn set_related_batch(&self, table: impl Into<String>, record: BatchRecord) {
        self.tables.lock().await.related.insert(table.into(), record);
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn fetch_tasks(&self, state: TaskState, limit: usize) -> Result<Vec<TaskRow>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .tasks
            .values()
            .filter(|t| t.state == state)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn set_state(&self, ids: &[i64], state: TaskState) -> Result<u64> {
        let mut tables = self.tables.lock().await;
        let mut changed = 0;
        for id in ids {
            if let Some(task) = tables.tasks.get_mut(id) {
                task.state = state;
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn count_states(&self) -> Result<TaskCounts> {
        let tables = self.tables.lock().await;
        let mut counts = TaskCounts::default();
        for task in tables.tasks.values() {
            counts.add(task.state, 1);
        }
        Ok(counts)
    }

    async fn reset_state(&self, from: TaskState, to: TaskState) -> Result<u64> {
        let mut tables = self.tables.lock().await;
        let mut changed = 0;
        for task in tables.tasks.values_mut().filter(|t| t.state == from) {
            task.state = to;
            changed += 1;
        }
        Ok(changed)
    }

    async fn reset_for_new_batch(&self) -> Result<u64> {
        let mut tables = self.tables.lock().await;
        let mut changed = 0;
        for task in tables.tasks.values_mut().filter(|t| t.state != TaskState::Failed) {
            task.state = TaskState::Todo;
            changed += 1;
        }
        Ok(changed)
    }

    async fn latest_batch(&self) -> Result<Option<BatchRecord>> {
        Ok(self.tables.lock().await.batches.last().cloned())
    }

    async fn create_batch(&self, record: &BatchRecord) -> Result<()> {
        self.tables.lock().await.batches.push(record.clone());
        Ok(())
    }

    async fn update_batch(&self, record: &BatchRecord) -> Result<()> {
        let mut tables = self.tables.lock().await;
        if let Some(existing) = tables
            .batches
            .iter_mut()
            .rev()
            .find(|b| b.batch_date == record.batch_date)
        {
            *existing = record.clone();
        }
        Ok(())
    }

    async fn batch_is_done(&self, batch_record_table: &str) -> Result<bool> {
        Ok(self
            .tables
            .lock()
            .await
            .related
            .get(batch_record_table)
            .is_none_or(|r| r.is_done))
    }
}
