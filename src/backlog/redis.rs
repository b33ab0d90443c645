use async_trait::async_trait;
use deadpool_redis::Pool;
use deadpool_redis::redis::{AsyncCommands, Script};
use log::debug;

use super::{Backlog, JobStore, score_arg};
use crate::errors::{BacklogError, Result};

/// Reads members below a cutoff and rescores them in one step, so concurrent
/// collectors never lease the same member.
const LEASE_SCRIPT: &str = r#"
local members = redis.call('ZRANGEBYSCORE', KEYS[1], ARGV[1], ARGV[2], 'LIMIT', 0, tonumber(ARGV[4]))
for i = 1, #members do
    redis.call('ZADD', KEYS[1], ARGV[3], members[i])
end
return members
"#;

const TAKE_SCRIPT: &str = r#"
local members = redis.call('ZRANGE', KEYS[1], 0, tonumber(ARGV[1]) - 1)
if #members > 0 then
    redis.call('ZREM', KEYS[1], unpack(members))
end
return members
"#;

/// Backlog and job side structures in redis, all under the job namespace.
#[derive(Clone)]
pub struct RedisBacklog {
    pool: Pool,
    requests_key: String,
    failed_requests_key: String,
    failed_items_key: String,
    status_key: String,
}

impl RedisBacklog {
    pub fn new(pool: Pool, name: &str) -> Self {
        Self {
            pool,
            requests_key: format!("{name}:z_requests"),
            failed_requests_key: format!("{name}:z_failed_requests"),
            failed_items_key: format!("{name}:s_failed_items"),
            status_key: format!("{name}:h_spider_status"),
        }
    }

    pub fn requests_key(&self) -> &str {
        &self.requests_key
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| BacklogError::ConnectionFailed(e.into()).into())
    }
}

fn write_err(e: deadpool_redis::redis::RedisError) -> BacklogError {
    BacklogError::WriteFailed(e.into())
}

fn read_err(e: deadpool_redis::redis::RedisError) -> BacklogError {
    BacklogError::ReadFailed(e.into())
}

#[async_trait]
impl Backlog for RedisBacklog {
    async fn enqueue(&self, entries: &[(String, f64)]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn().await?;
        let items: Vec<(f64, &str)> = entries.iter().map(|(m, s)| (*s, m.as_str())).collect();
        let _: i64 = conn
            .zadd_multiple(&self.requests_key, &items)
            .await
            .map_err(write_err)?;
        debug!("enqueued {} members into {}", entries.len(), self.requests_key);
        Ok(())
    }

    async fn lease_range(
        &self,
        ready_after: f64,
        ready_before: f64,
        new_ready_at: f64,
        max_count: usize,
    ) -> Result<Vec<String>> {
        if max_count == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn().await?;
        let members: Vec<String> = Script::new(LEASE_SCRIPT)
            .key(&self.requests_key)
            .arg(score_arg(ready_after))
            .arg(score_arg(ready_before))
            .arg(score_arg(new_ready_at))
            .arg(max_count)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| BacklogError::LeaseFailed(e.into()))?;
        Ok(members)
    }

    async fn remove(&self, members: &[String]) -> Result<()> {
        if members.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn().await?;
        let _: i64 = conn
            .zrem(&self.requests_key, members)
            .await
            .map_err(write_err)?;
        Ok(())
    }

    async fn count(&self, ready_after: f64, ready_before: f64) -> Result<u64> {
        let mut conn = self.conn().await?;
        let n: u64 = conn
            .zcount(&self.requests_key, score_arg(ready_after), score_arg(ready_before))
            .await
            .map_err(read_err)?;
        Ok(n)
    }
}

#[async_trait]
impl JobStore for RedisBacklog {
    async fn park_failed_request(&self, member: &str, score: f64) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: i64 = conn
            .zadd(&self.failed_requests_key, member, score)
            .await
            .map_err(write_err)?;
        Ok(())
    }

    async fn failed_request_count(&self) -> Result<u64> {
        let mut conn = self.conn().await?;
        let n: u64 = conn.zcard(&self.failed_requests_key).await.map_err(read_err)?;
        Ok(n)
    }

    async fn take_failed_requests(&self, limit: usize) -> Result<Vec<String>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn().await?;
        let members: Vec<String> = Script::new(TAKE_SCRIPT)
            .key(&self.failed_requests_key)
            .arg(limit)
            .invoke_async(&mut conn)
            .await
            .map_err(read_err)?;
        Ok(members)
    }

    async fn park_failed_items(&self, payload: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: i64 = conn
            .sadd(&self.failed_items_key, payload)
            .await
            .map_err(write_err)?;
        Ok(())
    }

    async fn failed_items(&self, limit: usize) -> Result<Vec<String>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn().await?;
        let items: Vec<String> = conn
            .srandmember_multiple(&self.failed_items_key, limit)
            .await
            .map_err(read_err)?;
        Ok(items)
    }

    async fn remove_failed_items(&self, payload: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: i64 = conn
            .srem(&self.failed_items_key, payload)
            .await
            .map_err(write_err)?;
        Ok(())
    }

    async fn set_status(&self, field: &str, value: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: i64 = conn
            .hset(&self.status_key, field, value)
            .await
            .map_err(write_err)?;
        Ok(())
    }

    async fn get_status(&self, field: &str) -> Result<Option<String>> {
        let mut conn = self.conn().await?;
        let value: Option<String> = conn.hget(&self.status_key, field).await.map_err(read_err)?;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::config::RedisConfig;
    use crate::utils::connector::create_redis_pool;

    #[test]
    fn test_keys_live_under_job_namespace() {
        let pool = create_redis_pool(&RedisConfig::default()).unwrap();
        let backlog = RedisBacklog::new(pool, "news");
        assert_eq!(backlog.requests_key(), "news:z_requests");
        assert_eq!(backlog.failed_requests_key, "news:z_failed_requests");
        assert_eq!(backlog.failed_items_key, "news:s_failed_items");
        assert_eq!(backlog.status_key, "news:h_spider_status");
    }
}
