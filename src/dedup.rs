//! Fingerprint deduplication.
//!
//! A [`Dedup`] wraps one [`DedupFilter`] strategy under a namespace. Handles
//! are process-wide: [`Dedup::get_or_init`] builds the filter the first time a
//! namespace is asked for and hands out the same `Arc` afterwards.

pub mod bloom;
pub mod expire;
pub mod memory;

use async_trait::async_trait;
use dashmap::DashMap;
use log::info;
use metrics::counter;
use once_cell::sync::Lazy;
use std::collections::HashSet;
use std::sync::Arc;

use crate::common::config::Config;
use crate::common::registry::FilterRegistry;
use crate::errors::{DedupError, Result};

pub use bloom::BloomFilter;
pub use expire::ExpireFilter;
pub use memory::MemoryFilter;

#[async_trait]
pub trait DedupFilter: Send + Sync {
    async fn contains_many(&self, fingerprints: &[String]) -> Result<Vec<bool>>;

    /// Records `fingerprints`; per entry, whether it was not seen before.
    async fn add_many(&self, fingerprints: &[String]) -> Result<Vec<bool>>;
}

static INSTANCES: Lazy<DashMap<String, Arc<Dedup>>> = Lazy::new(DashMap::new);

pub struct Dedup {
    namespace: String,
    filter: Arc<dyn DedupFilter>,
}

impl Dedup {
    pub fn new(namespace: impl Into<String>, filter: Arc<dyn DedupFilter>) -> Self {
        Self {
            namespace: namespace.into(),
            filter,
        }
    }

    /// Builds the configured strategy. Custom strategy names resolve through
    /// `registry`.
    pub fn from_config(
        namespace: &str,
        config: &Config,
        pool: Option<deadpool_redis::Pool>,
        registry: Option<&FilterRegistry>,
    ) -> Result<Self> {
        let dedup = &config.dedup;
        let filter: Arc<dyn DedupFilter> = match dedup.strategy.as_str() {
            "bloom" => Arc::new(BloomFilter::new(
                pool,
                namespace,
                dedup.bloom_capacity,
                dedup.bloom_error_rate,
            )),
            "memory" => Arc::new(MemoryFilter::new()),
            "expire" => Arc::new(ExpireFilter::new(pool, namespace, dedup.expire_secs)),
            other => match registry {
                Some(registry) if registry.contains(other) => registry.build(other, config)?,
                _ => return Err(DedupError::UnknownStrategy(other.to_string()).into()),
            },
        };
        info!("dedup '{}' using {} strategy", namespace, dedup.strategy);
        Ok(Self::new(namespace, filter))
    }

    /// Process-wide handle for `namespace`; `init` runs only on first use.
    pub fn get_or_init<F>(namespace: &str, init: F) -> Result<Arc<Dedup>>
    where
        F: FnOnce() -> Result<Dedup>,
    {
        if let Some(existing) = INSTANCES.get(namespace) {
            return Ok(existing.value().clone());
        }
        let entry = INSTANCES
            .entry(namespace.to_string())
            .or_try_insert_with(|| init().map(Arc::new))?;
        Ok(entry.value().clone())
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub async fn contains_many(&self, fingerprints: &[String]) -> Result<Vec<bool>> {
        if fingerprints.is_empty() {
            return Ok(Vec::new());
        }
        let seen = self.filter.contains_many(fingerprints).await?;
        let hits = seen.iter().filter(|s| **s).count() as u64;
        if hits > 0 {
            counter!("dedup_hits_total", "namespace" => self.namespace.clone()).increment(hits);
        }
        Ok(seen)
    }

    /// Records fingerprints. With `skip_check` the filter is written blindly;
    /// otherwise only entries not already present are written. Returns, per
    /// entry, whether it was new.
    pub async fn add_many(&self, fingerprints: &[String], skip_check: bool) -> Result<Vec<bool>> {
        if fingerprints.is_empty() {
            return Ok(Vec::new());
        }
        if skip_check {
            return self.filter.add_many(fingerprints).await;
        }
        let seen = self.filter.contains_many(fingerprints).await?;
        let fresh: Vec<String> = fingerprints
            .iter()
            .zip(&seen)
            .filter(|(_, s)| !**s)
            .map(|(f, _)| f.clone())
            .collect();
        let added = self.filter.add_many(&fresh).await?;
        let mut added = added.into_iter();
        Ok(seen
            .into_iter()
            .map(|s| if s { false } else { added.next().unwrap_or(false) })
            .collect())
    }

    /// Per entry, whether it is neither recorded nor repeated earlier in the
    /// same slice. Does not record anything.
    pub async fn filter_new(&self, fingerprints: &[String]) -> Result<Vec<bool>> {
        let seen = self.contains_many(fingerprints).await?;
        let mut in_batch = HashSet::with_capacity(fingerprints.len());
        Ok(fingerprints
            .iter()
            .zip(seen)
            .map(|(fp, s)| !s && in_batch.insert(fp.as_str()))
            .collect())
    }
}

impl std::fmt::Debug for Dedup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dedup").field("namespace", &self.namespace).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fps(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_contains_after_add() {
        let dedup = Dedup::new("t", Arc::new(MemoryFilter::new()));
        let batch = fps(&["a", "b"]);
        assert_eq!(dedup.contains_many(&batch).await.unwrap(), vec![false, false]);
        assert_eq!(dedup.add_many(&batch, false).await.unwrap(), vec![true, true]);
        assert_eq!(dedup.contains_many(&batch).await.unwrap(), vec![true, true]);
        assert_eq!(
            dedup.add_many(&fps(&["a", "c"]), false).await.unwrap(),
            vec![false, true]
        );
    }

    #[tokio::test]
    async fn test_filter_new_drops_in_batch_duplicates() {
        let dedup = Dedup::new("t", Arc::new(MemoryFilter::new()));
        dedup.add_many(&fps(&["old"]), true).await.unwrap();
        let fresh = dedup.filter_new(&fps(&["x", "old", "x", "y"])).await.unwrap();
        assert_eq!(fresh, vec![true, false, false, true]);
        // nothing recorded
        assert_eq!(dedup.contains_many(&fps(&["x"])).await.unwrap(), vec![false]);
    }

    #[tokio::test]
    async fn test_get_or_init_is_process_wide() {
        let first = Dedup::get_or_init("dedup-test-singleton", || {
            Ok(Dedup::new("dedup-test-singleton", Arc::new(MemoryFilter::new())))
        })
        .unwrap();
        first.add_many(&fps(&["k"]), true).await.unwrap();

        let second = Dedup::get_or_init("dedup-test-singleton", || {
            panic!("init must not run twice");
        })
        .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.contains_many(&fps(&["k"])).await.unwrap(), vec![true]);
    }

    #[test]
    fn test_from_config_strategies() {
        let mut config = Config::new("job");
        config.dedup.strategy = "memory".into();
        assert!(Dedup::from_config("job", &config, None, None).is_ok());

        config.dedup.strategy = "nope".into();
        let err = Dedup::from_config("job", &config, None, None).unwrap_err();
        assert!(err.to_string().contains("unknown dedup strategy"));

        let registry = FilterRegistry::new("filter");
        registry.register("nope", |_| Ok(Arc::new(MemoryFilter::new()) as Arc<dyn DedupFilter>));
        assert!(Dedup::from_config("job", &config, None, Some(&registry)).is_ok());
    }
}
