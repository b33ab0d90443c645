//! The shared request backlog and per-job side structures.
//!
//! Members are serialized requests; a member's score is its priority while
//! fresh and its lease deadline once leased. Leasing rewrites the score, so a
//! leased member stays in the backlog (invisible until the deadline passes)
//! until its dispatch attempt removes it.

pub mod memory;
pub mod redis;

use async_trait::async_trait;

use crate::errors::Result;

pub use memory::MemoryBacklog;
pub use redis::RedisBacklog;

#[async_trait]
pub trait Backlog: Send + Sync {
    /// Adds members or overwrites their scores.
    async fn enqueue(&self, entries: &[(String, f64)]) -> Result<()>;

    /// Atomically takes up to `max_count` members scored in
    /// `[ready_after, ready_before]`, lowest first, and rescores each to
    /// `new_ready_at`.
    async fn lease_range(
        &self,
        ready_after: f64,
        ready_before: f64,
        new_ready_at: f64,
        max_count: usize,
    ) -> Result<Vec<String>>;

    /// [`Backlog::lease_range`] without a lower bound.
    async fn lease(&self, ready_before: f64, new_ready_at: f64, max_count: usize) -> Result<Vec<String>> {
        self.lease_range(f64::NEG_INFINITY, ready_before, new_ready_at, max_count)
            .await
    }

    async fn remove(&self, members: &[String]) -> Result<()>;

    /// Members scored in `[ready_after, ready_before]`.
    async fn count(&self, ready_after: f64, ready_before: f64) -> Result<u64>;

    async fn total(&self) -> Result<u64> {
        self.count(f64::NEG_INFINITY, f64::INFINITY).await
    }
}

/// Per-job durable side structures living next to the backlog.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Parks a request whose retries are exhausted.
    async fn park_failed_request(&self, member: &str, score: f64) -> Result<()>;

    async fn failed_request_count(&self) -> Result<u64>;

    /// Removes and returns up to `limit` parked failed requests, oldest first.
    async fn take_failed_requests(&self, limit: usize) -> Result<Vec<String>>;

    /// Persists a serialized item batch that could not be exported.
    async fn park_failed_items(&self, payload: &str) -> Result<()>;

    async fn failed_items(&self, limit: usize) -> Result<Vec<String>>;

    async fn remove_failed_items(&self, payload: &str) -> Result<()>;

    async fn set_status(&self, field: &str, value: &str) -> Result<()>;

    async fn get_status(&self, field: &str) -> Result<Option<String>>;
}

/// Formats a score bound the way sorted-set range commands expect it.
pub(crate) fn score_arg(score: f64) -> String {
    if score == f64::NEG_INFINITY {
        "-inf".to_string()
    } else if score == f64::INFINITY {
        "+inf".to_string()
    } else {
        score.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_score_arg() {
        assert_eq!(score_arg(f64::NEG_INFINITY), "-inf");
        assert_eq!(score_arg(f64::INFINITY), "+inf");
        assert_eq!(score_arg(5.0), "5");
        assert_eq!(score_arg(1700000000.25), "1700000000.25");
    }
}
