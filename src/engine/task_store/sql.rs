use async_trait::async_trait;
use chrono::NaiveDateTime;
use log::debug;
use sea_orm::{ConnectionTrait, DatabaseConnection, DbBackend, QueryResult, Statement, Value};
use serde_json::{Map, Value as JsonValue};

use super::TaskStore;
use crate::common::config::BatchConfig;
use crate::common::model::{BatchRecord, TaskCounts, TaskRow, TaskState};
use crate::errors::{Result, TaskError};

/// Task and batch-record tables in MySQL or Postgres, through raw statements.
///
/// The task table needs `id` and `state` columns; `task_keys` columns are
/// copied into each row's payload. The batch-record table needs
/// `batch_date`, `total_count`, `done_count`, `fail_count`, `interval` and
/// `is_done`.
pub struct SqlTaskStore {
    db: DatabaseConnection,
    backend: DbBackend,
    config: BatchConfig,
}

impl SqlTaskStore {
    pub fn new(db: DatabaseConnection, config: BatchConfig) -> Self {
        let backend = db.get_database_backend();
        Self {
            db,
            backend,
            config,
        }
    }

    fn stmt(&self, sql: String, values: Vec<Value>) -> Statement {
        debug!("{sql}");
        Statement::from_sql_and_values(self.backend, sql, values)
    }
}

fn quote(backend: DbBackend, ident: &str) -> String {
    match backend {
        DbBackend::MySql => format!("`{ident}`"),
        _ => format!("\"{ident}\""),
    }
}

/// The `n`th (1-based) bind placeholder.
fn placeholder(backend: DbBackend, n: usize) -> String {
    match backend {
        DbBackend::Postgres => format!("${n}"),
        _ => "?".to_string(),
    }
}

fn placeholders(backend: DbBackend, from: usize, count: usize) -> String {
    (from..from + count)
        .map(|n| placeholder(backend, n))
        .collect::<Vec<_>>()
        .join(", ")
}

fn select_tasks_sql(backend: DbBackend, config: &BatchConfig, limit: usize) -> String {
    let mut columns = vec![quote(backend, "id"), quote(backend, "state")];
    if let Some(column) = &config.parser_name_column {
        columns.push(quote(backend, column));
    }
    for key in config.task_keys.iter().filter(|k| k.as_str() != "id" && k.as_str() != "state") {
        columns.push(quote(backend, key));
    }
    format!(
        "SELECT {} FROM {} WHERE {} = {} ORDER BY {} LIMIT {}",
        columns.join(", "),
        config.task_table,
        quote(backend, "state"),
        placeholder(backend, 1),
        config.order_by,
        limit
    )
}

fn update_state_sql(backend: DbBackend, table: &str, ids: usize) -> String {
    format!(
        "UPDATE {table} SET {state} = {} WHERE {id} IN ({})",
        placeholder(backend, 1),
        placeholders(backend, 2, ids),
        state = quote(backend, "state"),
        id = quote(backend, "id"),
    )
}

fn batch_columns(backend: DbBackend) -> String {
    ["batch_date", "total_count", "done_count", "fail_count", "interval", "is_done"]
        .iter()
        .map(|c| quote(backend, c))
        .collect::<Vec<_>>()
        .join(", ")
}

fn get_int(row: &QueryResult, column: &str) -> Result<i64> {
    row.try_get::<i64>("", column)
        .or_else(|_| row.try_get::<i32>("", column).map(i64::from))
        .or_else(|_| row.try_get::<i16>("", column).map(i64::from))
        .or_else(|_| row.try_get::<i8>("", column).map(i64::from))
        .map_err(|_| TaskError::MissingColumn(column.to_string()).into())
}

fn get_flag(row: &QueryResult, column: &str) -> Result<bool> {
    match row.try_get::<bool>("", column) {
        Ok(flag) => Ok(flag),
        Err(_) => get_int(row, column).map(|v| v != 0),
    }
}

fn get_float(row: &QueryResult, column: &str) -> Result<f64> {
    match row.try_get::<f64>("", column) {
        Ok(v) => Ok(v),
        Err(_) => get_int(row, column).map(|v| v as f64),
    }
}

/// Best-effort conversion of an arbitrary column to JSON.
fn column_json(row: &QueryResult, column: &str) -> JsonValue {
    if let Ok(v) = row.try_get::<Option<String>>("", column) {
        return v.map(JsonValue::from).unwrap_or(JsonValue::Null);
    }
    if let Ok(v) = get_int(row, column) {
        return v.into();
    }
    if let Ok(v) = row.try_get::<f64>("", column) {
        return v.into();
    }
    if let Ok(v) = row.try_get::<bool>("", column) {
        return v.into();
    }
    if let Ok(v) = row.try_get::<NaiveDateTime>("", column) {
        return v.to_string().into();
    }
    JsonValue::Null
}

fn batch_from_row(row: &QueryResult) -> Result<BatchRecord> {
    let batch_date = row
        .try_get::<NaiveDateTime>("", "batch_date")
        .map_err(|_| TaskError::MissingColumn("batch_date".into()))?;
    Ok(BatchRecord {
        batch_date,
        total_count: get_int(row, "total_count")?.max(0) as u64,
        done_count: get_int(row, "done_count")?.max(0) as u64,
        fail_count: get_int(row, "fail_count")?.max(0) as u64,
        interval_days: get_float(row, "interval")?,
        is_done: get_flag(row, "is_done")?,
    })
}

#[async_trait]
impl TaskStore for SqlTaskStore {
    async fn fetch_tasks(&self, state: TaskState, limit: usize) -> Result<Vec<TaskRow>> {
        let sql = select_tasks_sql(self.backend, &self.config, limit);
        let rows = self
            .db
            .query_all(self.stmt(sql, vec![Value::from(state.as_i64())]))
            .await?;
        let mut tasks = Vec::with_capacity(rows.len());
        for row in rows {
            let id = get_int(&row, "id")?;
            let state = TaskState::try_from(get_int(&row, "state")?)?;
            let parser_name = match &self.config.parser_name_column {
                Some(column) => row.try_get::<Option<String>>("", column).ok().flatten(),
                None => None,
            };
            let mut payload = Map::new();
            for key in &self.config.task_keys {
                payload.insert(key.clone(), column_json(&row, key));
            }
            tasks.push(TaskRow {
                id,
                state,
                parser_name,
                payload,
            });
        }
        Ok(tasks)
    }

    async fn set_state(&self, ids: &[i64], state: TaskState) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let sql = update_state_sql(self.backend, &self.config.task_table, ids.len());
        let mut values = vec![Value::from(state.as_i64())];
        values.extend(ids.iter().map(|id| Value::from(*id)));
        let result = self.db.execute(self.stmt(sql, values)).await?;
        Ok(result.rows_affected())
    }

    async fn count_states(&self) -> Result<TaskCounts> {
        let state = quote(self.backend, "state");
        let sql = format!(
            "SELECT {state}, COUNT(*) AS cnt FROM {} GROUP BY {state}",
            self.config.task_table
        );
        let rows = self.db.query_all(self.stmt(sql, Vec::new())).await?;
        let mut counts = TaskCounts::default();
        for row in rows {
            let state = TaskState::try_from(get_int(&row, "state")?)?;
            counts.add(state, get_int(&row, "cnt")?.max(0) as u64);
        }
        Ok(counts)
    }

    async fn reset_state(&self, from: TaskState, to: TaskState) -> Result<u64> {
        let state = quote(self.backend, "state");
        let sql = format!(
            "UPDATE {} SET {state} = {} WHERE {state} = {}",
            self.config.task_table,
            placeholder(self.backend, 1),
            placeholder(self.backend, 2)
        );
        let values = vec![Value::from(to.as_i64()), Value::from(from.as_i64())];
        Ok(self.db.execute(self.stmt(sql, values)).await?.rows_affected())
    }

    async fn reset_for_new_batch(&self) -> Result<u64> {
        let state = quote(self.backend, "state");
        let sql = format!(
            "UPDATE {} SET {state} = {} WHERE {state} <> {}",
            self.config.task_table,
            placeholder(self.backend, 1),
            placeholder(self.backend, 2)
        );
        let values = vec![
            Value::from(TaskState::Todo.as_i64()),
            Value::from(TaskState::Failed.as_i64()),
        ];
        Ok(self.db.execute(self.stmt(sql, values)).await?.rows_affected())
    }

    async fn latest_batch(&self) -> Result<Option<BatchRecord>> {
        let sql = format!(
            "SELECT {} FROM {} ORDER BY {} DESC LIMIT 1",
            batch_columns(self.backend),
            self.config.batch_record_table,
            quote(self.backend, "batch_date")
        );
        match self.db.query_one(self.stmt(sql, Vec::new())).await? {
            Some(row) => Ok(Some(batch_from_row(&row)?)),
            None => Ok(None),
        }
    }

    async fn create_batch(&self, record: &BatchRecord) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.config.batch_record_table,
            batch_columns(self.backend),
            placeholders(self.backend, 1, 6)
        );
        let values = vec![
            Value::from(record.batch_date),
            Value::from(record.total_count as i64),
            Value::from(record.done_count as i64),
            Value::from(record.fail_count as i64),
            Value::from(record.interval_days),
            Value::from(record.is_done),
        ];
        self.db.execute(self.stmt(sql, values)).await?;
        Ok(())
    }

    async fn update_batch(&self, record: &BatchRecord) -> Result<()> {
        let b = self.backend;
        let sql = format!(
            "UPDATE {} SET {} = {}, {} = {}, {} = {}, {} = {} WHERE {} = {}",
            self.config.batch_record_table,
            quote(b, "total_count"),
            placeholder(b, 1),
            quote(b, "done_count"),
            placeholder(b, 2),
            quote(b, "fail_count"),
            placeholder(b, 3),
            quote(b, "is_done"),
            placeholder(b, 4),
            quote(b, "batch_date"),
            placeholder(b, 5),
        );
        let values = vec![
            Value::from(record.total_count as i64),
            Value::from(record.done_count as i64),
            Value::from(record.fail_count as i64),
            Value::from(record.is_done),
            Value::from(record.batch_date),
        ];
        self.db.execute(self.stmt(sql, values)).await?;
        Ok(())
    }

    async fn batch_is_done(&self, batch_record_table: &str) -> Result<bool> {
        let sql = format!(
            "SELECT {} FROM {} ORDER BY {} DESC LIMIT 1",
            quote(self.backend, "is_done"),
            batch_record_table,
            quote(self.backend, "batch_date")
        );
        match self.db.query_one(self.stmt(sql, Vec::new())).await? {
            Some(row) => get_flag(&row, "is_done"),
            None => Ok(true),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BatchConfig {
        BatchConfig {
            task_table: "news_task".into(),
            batch_record_table: "news_batch_record".into(),
            task_keys: vec!["id".into(), "url".into()],
            parser_name_column: Some("parser_name".into()),
            ..BatchConfig::default()
        }
    }

    #[test]
    fn test_select_tasks_sql() {
        assert_eq!(
            select_tasks_sql(DbBackend::MySql, &config(), 100),
            "SELECT `id`, `state`, `parser_name`, `url` FROM news_task WHERE `state` = ? ORDER BY id LIMIT 100"
        );
        assert_eq!(
            select_tasks_sql(DbBackend::Postgres, &config(), 5),
            "SELECT \"id\", \"state\", \"parser_name\", \"url\" FROM news_task WHERE \"state\" = $1 ORDER BY id LIMIT 5"
        );
    }

    #[test]
    fn test_update_state_sql_numbers_placeholders() {
        assert_eq!(
            update_state_sql(DbBackend::Postgres, "t", 3),
            "UPDATE t SET \"state\" = $1 WHERE \"id\" IN ($2, $3, $4)"
        );
        assert_eq!(
            update_state_sql(DbBackend::MySql, "t", 2),
            "UPDATE t SET `state` = ? WHERE `id` IN (?, ?)"
        );
    }

    #[test]
    fn test_interval_column_is_quoted() {
        assert!(batch_columns(DbBackend::MySql).contains("`interval`"));
        assert!(batch_columns(DbBackend::Postgres).contains("\"interval\""));
    }
}
