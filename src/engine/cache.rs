use dashmap::DashMap;
use deadpool_redis::Pool;
use deadpool_redis::redis::AsyncCommands;
use log::warn;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crate::common::model::Response;
use crate::errors::Result;

/// Local writes between sweeps of expired entries.
const SWEEP_EVERY: usize = 256;

enum Backend {
    Redis { pool: Pool, prefix: String },
    Local(DashMap<String, (Instant, Response)>),
}

/// Fetched responses keyed by request fingerprint, for `ttl` each.
pub struct ResponseCache {
    backend: Backend,
    ttl: Duration,
    puts: AtomicUsize,
}

impl ResponseCache {
    pub fn new(pool: Option<Pool>, namespace: &str, ttl: Duration) -> Self {
        let backend = match pool {
            Some(pool) => Backend::Redis {
                pool,
                prefix: format!("{namespace}:response_cache"),
            },
            None => Backend::Local(DashMap::new()),
        };
        Self {
            backend,
            ttl,
            puts: AtomicUsize::new(0),
        }
    }

    pub async fn get(&self, fingerprint: &str) -> Result<Option<Response>> {
        match &self.backend {
            Backend::Redis { pool, prefix } => {
                let mut conn = pool.get().await?;
                let raw: Option<String> = conn.get(format!("{prefix}:{fingerprint}")).await?;
                let Some(raw) = raw else {
                    return Ok(None);
                };
                match serde_json::from_str::<Response>(&raw) {
                    Ok(mut response) => {
                        response.from_cache = true;
                        Ok(Some(response))
                    }
                    Err(e) => {
                        warn!("ignoring unreadable cached response {fingerprint}: {e}");
                        Ok(None)
                    }
                }
            }
            Backend::Local(map) => {
                let hit = map
                    .get(fingerprint)
                    .filter(|entry| entry.0 > Instant::now())
                    .map(|entry| entry.1.clone());
                if hit.is_none() {
                    map.remove_if(fingerprint, |_, (expires_at, _)| *expires_at <= Instant::now());
                }
                Ok(hit.map(|mut response| {
                    response.from_cache = true;
                    response
                }))
            }
        }
    }

    pub async fn put(&self, fingerprint: &str, response: &Response) -> Result<()> {
        match &self.backend {
            Backend::Redis { pool, prefix } => {
                let raw = serde_json::to_string(response)?;
                let mut conn = pool.get().await?;
                let _: () = conn
                    .set_ex(format!("{prefix}:{fingerprint}"), raw, self.ttl.as_secs().max(1))
                    .await?;
            }
            Backend::Local(map) => {
                map.insert(
                    fingerprint.to_string(),
                    (Instant::now() + self.ttl, response.clone()),
                );
                if (self.puts.fetch_add(1, Ordering::Relaxed) + 1) % SWEEP_EVERY == 0 {
                    let now = Instant::now();
                    map.retain(|_, (expires_at, _)| *expires_at > now);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_cache_marks_hits() {
        let cache = ResponseCache::new(None, "t", Duration::from_secs(60));
        assert!(cache.get("fp").await.unwrap().is_none());
        cache
            .put("fp", &Response::new("https://a.com", 200, "ok"))
            .await
            .unwrap();
        let hit = cache.get("fp").await.unwrap().unwrap();
        assert!(hit.from_cache);
        assert_eq!(hit.text(), "ok");
    }

    #[tokio::test]
    async fn test_local_cache_expires() {
        let cache = ResponseCache::new(None, "t", Duration::ZERO);
        cache
            .put("fp", &Response::new("https://a.com", 200, "ok"))
            .await
            .unwrap();
        assert!(cache.get("fp").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_entries_swept_on_put() {
        let cache = ResponseCache::new(None, "t", Duration::ZERO);
        let response = Response::new("https://a.com", 200, "ok");
        for i in 0..SWEEP_EVERY {
            cache.put(&format!("fp{i}"), &response).await.unwrap();
        }
        let Backend::Local(map) = &cache.backend else {
            unreachable!()
        };
        assert!(map.is_empty());
    }
}
