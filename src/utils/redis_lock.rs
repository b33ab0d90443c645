use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use deadpool_redis::redis::{AsyncCommands, Script};
use log::{debug, trace, warn};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use uuid::Uuid;

use crate::errors::{LockError, Result};

const ACQUIRE_SCRIPT: &str = r#"
    return redis.call("SET", KEYS[1], ARGV[1], "NX", "EX", ARGV[2])
"#;

const RENEW_SCRIPT: &str = r#"
    if redis.call("GET", KEYS[1]) == ARGV[1] then
        return redis.call("EXPIRE", KEYS[1], ARGV[2])
    else
        return 0
    end
"#;

const RELEASE_SCRIPT: &str = r#"
    if redis.call("GET", KEYS[1]) == ARGV[1] then
        return redis.call("DEL", KEYS[1])
    else
        return 0
    end
"#;

type LocalLocks = Arc<DashMap<String, (String, Instant)>>;

/// Where lock ownership is recorded: the shared store, or an in-process map
/// for single-node runs without redis.
#[derive(Clone)]
pub enum LockBackend {
    Redis(deadpool_redis::Pool),
    Local(LocalLocks),
}

impl std::fmt::Debug for LockBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockBackend::Redis(_) => write!(f, "LockBackend::Redis"),
            LockBackend::Local(map) => write!(f, "LockBackend::Local({})", map.len()),
        }
    }
}

fn redis_err<E: Into<crate::errors::BoxError>>(e: E) -> LockError {
    LockError::Redis(e.into())
}

impl LockBackend {
    async fn try_acquire(&self, key: &str, token: &str, ttl: u64) -> Result<bool> {
        match self {
            LockBackend::Redis(pool) => {
                let mut conn = pool.get().await.map_err(redis_err)?;
                let result: Option<String> = Script::new(ACQUIRE_SCRIPT)
                    .key(key)
                    .arg(token)
                    .arg(ttl)
                    .invoke_async(&mut conn)
                    .await
                    .map_err(redis_err)?;
                Ok(result.is_some())
            }
            LockBackend::Local(map) => {
                let now = Instant::now();
                let expires_at = now + Duration::from_secs(ttl);
                match map.entry(key.to_string()) {
                    Entry::Occupied(mut entry) => {
                        if entry.get().1 <= now {
                            entry.insert((token.to_string(), expires_at));
                            Ok(true)
                        } else {
                            Ok(false)
                        }
                    }
                    Entry::Vacant(entry) => {
                        entry.insert((token.to_string(), expires_at));
                        Ok(true)
                    }
                }
            }
        }
    }

    /// Extends the lease if `token` still owns it.
    async fn renew(&self, key: &str, token: &str, ttl: u64) -> Result<bool> {
        match self {
            LockBackend::Redis(pool) => {
                let mut conn = pool.get().await.map_err(redis_err)?;
                let result: i64 = Script::new(RENEW_SCRIPT)
                    .key(key)
                    .arg(token)
                    .arg(ttl)
                    .invoke_async(&mut conn)
                    .await
                    .map_err(redis_err)?;
                Ok(result == 1)
            }
            LockBackend::Local(map) => match map.get_mut(key) {
                Some(mut entry) if entry.0 == token => {
                    entry.1 = Instant::now() + Duration::from_secs(ttl);
                    Ok(true)
                }
                _ => Ok(false),
            },
        }
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool> {
        match self {
            LockBackend::Redis(pool) => {
                let mut conn = pool.get().await.map_err(redis_err)?;
                let result: i64 = Script::new(RELEASE_SCRIPT)
                    .key(key)
                    .arg(token)
                    .invoke_async(&mut conn)
                    .await
                    .map_err(redis_err)?;
                Ok(result == 1)
            }
            LockBackend::Local(map) => match map.entry(key.to_string()) {
                Entry::Occupied(entry) if entry.get().0 == token => {
                    entry.remove();
                    Ok(true)
                }
                _ => Ok(false),
            },
        }
    }

    async fn owner(&self, key: &str) -> Result<Option<String>> {
        match self {
            LockBackend::Redis(pool) => {
                let mut conn = pool.get().await.map_err(redis_err)?;
                let value: Option<String> = conn.get(key).await.map_err(redis_err)?;
                Ok(value)
            }
            LockBackend::Local(map) => Ok(map
                .get(key)
                .filter(|entry| entry.1 > Instant::now())
                .map(|entry| entry.0.clone())),
        }
    }
}

/// A held lease on a named lock. A background task extends the lease every
/// third of its ttl until the guard is released or dropped.
pub struct DistributedLock {
    backend: LockBackend,
    key: String,
    token: String,
    renewal: Option<JoinHandle<()>>,
}

impl DistributedLock {
    /// Polls for the lock until `max_wait` elapses. A zero `max_wait` makes a
    /// single attempt.
    pub async fn acquire(
        backend: LockBackend,
        key: String,
        ttl_secs: u64,
        max_wait: Duration,
    ) -> Result<Option<Self>> {
        let token = Uuid::now_v7().to_string();
        let ttl_secs = ttl_secs.max(1);
        let retry_interval = match backend {
            LockBackend::Redis(_) => Duration::from_millis(50),
            LockBackend::Local(_) => Duration::from_millis(1),
        };
        let start = Instant::now();

        loop {
            if backend.try_acquire(&key, &token, ttl_secs).await? {
                let mut lock = Self {
                    backend,
                    key,
                    token,
                    renewal: None,
                };
                lock.start_renewal(ttl_secs);
                return Ok(Some(lock));
            }
            if start.elapsed() >= max_wait {
                return Ok(None);
            }
            sleep(retry_interval).await;
        }
    }

    fn start_renewal(&mut self, ttl_secs: u64) {
        let backend = self.backend.clone();
        let key = self.key.clone();
        let token = self.token.clone();
        let every = Duration::from_millis(ttl_secs * 1000 / 3);

        self.renewal = Some(tokio::spawn(async move {
            loop {
                sleep(every).await;
                match backend.renew(&key, &token, ttl_secs).await {
                    Ok(true) => trace!("lock renewed: {key}"),
                    Ok(false) => {
                        warn!("lock {key} lost ownership, stopping renewal");
                        break;
                    }
                    Err(e) => {
                        warn!("lock {key} renewal failed: {e}");
                        break;
                    }
                }
            }
        }));
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn is_valid(&self) -> Result<bool> {
        Ok(self.backend.owner(&self.key).await?.as_deref() == Some(self.token.as_str()))
    }

    pub async fn release(mut self) -> Result<bool> {
        if let Some(handle) = self.renewal.take() {
            handle.abort();
        }
        self.backend.release(&self.key, &self.token).await
    }
}

impl std::fmt::Debug for DistributedLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedLock")
            .field("key", &self.key)
            .field("renewing", &self.renewal.is_some())
            .finish()
    }
}

impl Drop for DistributedLock {
    fn drop(&mut self) {
        if let Some(handle) = self.renewal.take() {
            handle.abort();
        }
    }
}

/// Named locks under a job namespace (`{prefix}:lock:{name}`).
#[derive(Debug)]
pub struct LockManager {
    backend: LockBackend,
    held: DashMap<String, DistributedLock>,
    prefix: String,
}

impl LockManager {
    pub fn new(pool: Option<deadpool_redis::Pool>, prefix: &str) -> Self {
        let backend = match pool {
            Some(pool) => LockBackend::Redis(pool),
            None => LockBackend::Local(Arc::new(DashMap::new())),
        };
        Self {
            backend,
            held: DashMap::new(),
            prefix: prefix.to_string(),
        }
    }

    fn format_key(&self, name: &str) -> String {
        if self.prefix.is_empty() {
            format!("lock:{name}")
        } else {
            format!("{}:lock:{}", self.prefix, name)
        }
    }

    pub async fn acquire_lock(&self, name: &str, ttl_secs: u64, max_wait: Duration) -> Result<bool> {
        if self.held.contains_key(name) {
            return Err(LockError::AlreadyHeld(name.to_string()).into());
        }
        let lock =
            DistributedLock::acquire(self.backend.clone(), self.format_key(name), ttl_secs, max_wait)
                .await?;
        match lock {
            Some(lock) => {
                debug!("lock acquired: {}", lock.key());
                self.held.insert(name.to_string(), lock);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn release_lock(&self, name: &str) -> Result<bool> {
        match self.held.remove(name) {
            Some((_, lock)) => lock.release().await,
            None => Ok(false),
        }
    }

    /// Runs `f` while holding `name`. `Ok(None)` when the lock is busy.
    pub async fn with_lock<F, R>(
        &self,
        name: &str,
        ttl_secs: u64,
        max_wait: Duration,
        f: F,
    ) -> Result<Option<R>>
    where
        F: Future<Output = R>,
    {
        if !self.acquire_lock(name, ttl_secs, max_wait).await? {
            return Ok(None);
        }
        let result = f.await;
        if let Err(e) = self.release_lock(name).await {
            warn!("release lock {name} failed: {e}");
        }
        Ok(Some(result))
    }

    pub async fn is_lock_valid(&self, name: &str) -> Result<bool> {
        match self.held.get(name) {
            Some(lock) => lock.is_valid().await,
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_lock_is_exclusive() {
        let first = LockManager::new(None, "job");
        assert!(first.acquire_lock("reclaim", 5, Duration::ZERO).await.unwrap());
        assert!(first.is_lock_valid("reclaim").await.unwrap());

        // same backend, second holder
        let backend = first.backend.clone();
        let other = DistributedLock::acquire(backend.clone(), "job:lock:reclaim".into(), 5, Duration::ZERO)
            .await
            .unwrap();
        assert!(other.is_none());

        assert!(first.release_lock("reclaim").await.unwrap());
        let other = DistributedLock::acquire(backend, "job:lock:reclaim".into(), 5, Duration::ZERO)
            .await
            .unwrap();
        assert!(other.is_some());
    }

    #[tokio::test]
    async fn test_with_lock_runs_closure() {
        let manager = LockManager::new(None, "job");
        let out = manager
            .with_lock("seed", 5, Duration::ZERO, async { 42 })
            .await
            .unwrap();
        assert_eq!(out, Some(42));
        // released afterwards
        assert!(!manager.is_lock_valid("seed").await.unwrap());
        assert!(manager.acquire_lock("seed", 5, Duration::ZERO).await.unwrap());
    }

    #[tokio::test]
    async fn test_double_acquire_in_same_manager_fails() {
        let manager = LockManager::new(None, "");
        assert!(manager.acquire_lock("a", 5, Duration::ZERO).await.unwrap());
        let err = manager.acquire_lock("a", 5, Duration::ZERO).await.unwrap_err();
        assert!(err.is_lock());
    }
}
