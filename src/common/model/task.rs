use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::errors::{Error, TaskError};

/// State column of a task row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i64", try_from = "i64")]
pub enum TaskState {
    Todo,
    InProgress,
    Done,
    Failed,
}

impl TaskState {
    pub fn as_i64(self) -> i64 {
        match self {
            TaskState::Todo => 0,
            TaskState::Done => 1,
            TaskState::InProgress => 2,
            TaskState::Failed => -1,
        }
    }

    /// Done and failed rows count towards a finished batch.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Done | TaskState::Failed)
    }
}

impl From<TaskState> for i64 {
    fn from(state: TaskState) -> Self {
        state.as_i64()
    }
}

impl TryFrom<i64> for TaskState {
    type Error = Error;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(TaskState::Todo),
            1 => Ok(TaskState::Done),
            2 => Ok(TaskState::InProgress),
            -1 => Ok(TaskState::Failed),
            other => Err(TaskError::InvalidState(other).into()),
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskState::Todo => write!(f, "todo"),
            TaskState::InProgress => write!(f, "in_progress"),
            TaskState::Done => write!(f, "done"),
            TaskState::Failed => write!(f, "failed"),
        }
    }
}

/// A row of the task table handed to `start_requests`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRow {
    pub id: i64,
    pub state: TaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parser_name: Option<String>,
    /// Configured payload columns
    #[serde(default)]
    pub payload: Map<String, Value>,
}

impl TaskRow {
    pub fn new(id: i64) -> Self {
        Self {
            id,
            state: TaskState::Todo,
            parser_name: None,
            payload: Map::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    pub fn with_parser(mut self, parser_name: impl Into<String>) -> Self {
        self.parser_name = Some(parser_name.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }
}

/// Row counts of the task table grouped by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskCounts {
    pub todo: u64,
    pub in_progress: u64,
    pub done: u64,
    pub failed: u64,
}

impl TaskCounts {
    pub fn total(&self) -> u64 {
        self.todo + self.in_progress + self.done + self.failed
    }

    /// Done plus failed.
    pub fn finished(&self) -> u64 {
        self.done + self.failed
    }

    pub fn add(&mut self, state: TaskState, n: u64) {
        match state {
            TaskState::Todo => self.todo += n,
            TaskState::InProgress => self.in_progress += n,
            TaskState::Done => self.done += n,
            TaskState::Failed => self.failed += n,
        }
    }
}

/// Longest batch interval accepted, in days.
pub const MAX_INTERVAL_DAYS: f64 = 36_500.0;

/// `days` as a duration; `None` when it is negative, not finite or above
/// [`MAX_INTERVAL_DAYS`].
pub fn interval_from_days(days: f64) -> Option<chrono::Duration> {
    if !days.is_finite() || !(0.0..=MAX_INTERVAL_DAYS).contains(&days) {
        return None;
    }
    chrono::Duration::try_seconds((days * 86_400.0) as i64)
}

/// One row of the batch-record table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRecord {
    pub batch_date: NaiveDateTime,
    pub total_count: u64,
    /// Finished rows (done plus failed)
    pub done_count: u64,
    pub fail_count: u64,
    pub interval_days: f64,
    pub is_done: bool,
}

impl BatchRecord {
    pub fn open(batch_date: NaiveDateTime, total_count: u64, interval_days: f64) -> Self {
        Self {
            batch_date,
            total_count,
            done_count: 0,
            fail_count: 0,
            interval_days,
            is_done: false,
        }
    }

    /// When the next batch may open. `None` (never) for an unusable interval,
    /// which can come from a hand-edited record row.
    pub fn next_batch_at(&self) -> Option<NaiveDateTime> {
        interval_from_days(self.interval_days).and_then(|interval| self.batch_date.checked_add_signed(interval))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_codes() {
        for state in [TaskState::Todo, TaskState::InProgress, TaskState::Done, TaskState::Failed] {
            assert_eq!(TaskState::try_from(state.as_i64()).unwrap(), state);
        }
        assert!(TaskState::try_from(7).is_err());
        assert_eq!(serde_json::to_string(&TaskState::Failed).unwrap(), "-1");
    }

    #[test]
    fn test_counts() {
        let mut counts = TaskCounts::default();
        counts.add(TaskState::Done, 3);
        counts.add(TaskState::Failed, 1);
        counts.add(TaskState::InProgress, 2);
        assert_eq!(counts.total(), 6);
        assert_eq!(counts.finished(), 4);
    }

    #[test]
    fn test_next_batch_at() {
        let date = chrono::NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let record = BatchRecord::open(date, 10, 0.5);
        assert_eq!(record.next_batch_at(), Some(date + chrono::Duration::hours(12)));
    }

    #[test]
    fn test_unusable_interval_is_never_due() {
        let date = chrono::NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        for days in [1e12, -1.0, f64::NAN, f64::INFINITY] {
            assert_eq!(BatchRecord::open(date, 1, days).next_batch_at(), None);
        }
        assert!(BatchRecord::open(date, 1, MAX_INTERVAL_DAYS).next_batch_at().is_some());
    }
}
