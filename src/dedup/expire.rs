use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use deadpool_redis::Pool;
use deadpool_redis::redis::{self, AsyncCommands};

use super::DedupFilter;
use crate::errors::{DedupError, Result};
use crate::utils::timestamp;

enum Backend {
    // zset of fingerprint -> first-seen timestamp
    Redis { pool: Pool, key: String },
    // fingerprint -> expires at
    Local(DashMap<String, f64>),
}

/// Set whose entries age out after `expire_secs`, allowing a re-crawl.
pub struct ExpireFilter {
    backend: Backend,
    expire_secs: u64,
}

fn store_err(e: impl Into<crate::errors::BoxError>) -> DedupError {
    DedupError::Store(e.into())
}

impl ExpireFilter {
    pub fn new(pool: Option<Pool>, namespace: &str, expire_secs: u64) -> Self {
        let backend = match pool {
            Some(pool) => Backend::Redis {
                pool,
                key: format!("{namespace}:expire_filter"),
            },
            None => Backend::Local(DashMap::new()),
        };
        Self {
            backend,
            expire_secs,
        }
    }

    fn window_start(&self, now: f64) -> f64 {
        now - self.expire_secs as f64
    }
}

#[async_trait]
impl DedupFilter for ExpireFilter {
    async fn contains_many(&self, fingerprints: &[String]) -> Result<Vec<bool>> {
        let now = timestamp();
        match &self.backend {
            Backend::Redis { pool, key } => {
                if fingerprints.is_empty() {
                    return Ok(Vec::new());
                }
                let mut conn = pool.get().await.map_err(store_err)?;
                let mut pipe = redis::pipe();
                for fp in fingerprints {
                    pipe.zscore(key, fp);
                }
                let scores: Vec<Option<f64>> = pipe.query_async(&mut conn).await.map_err(store_err)?;
                let start = self.window_start(now);
                Ok(scores
                    .into_iter()
                    .map(|s| s.is_some_and(|added_at| added_at > start))
                    .collect())
            }
            Backend::Local(map) => Ok(fingerprints
                .iter()
                .map(|fp| map.get(fp).is_some_and(|expires_at| *expires_at > now))
                .collect()),
        }
    }

    async fn add_many(&self, fingerprints: &[String]) -> Result<Vec<bool>> {
        let now = timestamp();
        match &self.backend {
            Backend::Redis { pool, key } => {
                if fingerprints.is_empty() {
                    return Ok(Vec::new());
                }
                let mut conn = pool.get().await.map_err(store_err)?;
                let _: i64 = conn
                    .zrembyscore(key, "-inf", self.window_start(now))
                    .await
                    .map_err(store_err)?;
                let mut pipe = redis::pipe();
                for fp in fingerprints {
                    pipe.cmd("ZADD").arg(key).arg("NX").arg(now).arg(fp);
                }
                let added: Vec<i64> = pipe.query_async(&mut conn).await.map_err(store_err)?;
                Ok(added.into_iter().map(|n| n == 1).collect())
            }
            Backend::Local(map) => {
                // trimmed on write, like the zset above
                map.retain(|_, expires_at| *expires_at > now);
                let expires_at = now + self.expire_secs as f64;
                Ok(fingerprints
                    .iter()
                    .map(|fp| match map.entry(fp.clone()) {
                        Entry::Occupied(mut entry) => {
                            if *entry.get() > now {
                                false
                            } else {
                                entry.insert(expires_at);
                                true
                            }
                        }
                        Entry::Vacant(entry) => {
                            entry.insert(expires_at);
                            true
                        }
                    })
                    .collect())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_entries_expire() {
        let filter = ExpireFilter::new(None, "t", 0);
        let batch = vec!["a".to_string()];
        assert_eq!(filter.add_many(&batch).await.unwrap(), vec![true]);
        // zero window: already aged out
        assert_eq!(filter.contains_many(&batch).await.unwrap(), vec![false]);
        assert_eq!(filter.add_many(&batch).await.unwrap(), vec![true]);
    }

    #[tokio::test]
    async fn test_aged_out_entries_trimmed_on_write() {
        let filter = ExpireFilter::new(None, "t", 0);
        let first: Vec<String> = (0..1000).map(|i| format!("fp{i}")).collect();
        filter.add_many(&first).await.unwrap();
        filter.add_many(&["next".to_string()]).await.unwrap();
        let Backend::Local(map) = &filter.backend else {
            unreachable!()
        };
        assert_eq!(map.len(), 1);
        assert!(map.contains_key("next"));
    }

    #[tokio::test]
    async fn test_entries_within_window() {
        let filter = ExpireFilter::new(None, "t", 3600);
        let batch = vec!["a".to_string(), "b".to_string()];
        assert_eq!(filter.add_many(&batch).await.unwrap(), vec![true, true]);
        assert_eq!(filter.contains_many(&batch).await.unwrap(), vec![true, true]);
        assert_eq!(filter.add_many(&batch[..1]).await.unwrap(), vec![false]);
    }
}
