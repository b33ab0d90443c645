use async_trait::async_trait;
use bloomfilter::Bloom;
use deadpool_redis::Pool;
use deadpool_redis::redis;
use log::info;
use tokio::sync::RwLock;

use super::DedupFilter;
use crate::errors::{DedupError, Result};
use crate::utils::encrypt::md5_pair;

// a single redis string tops out at 2^32 bits
const MAX_BITS: u64 = 1 << 32;
const MIN_BITS: u64 = 1 << 10;

/// Bit count and hash count for `capacity` entries at `error_rate`.
pub fn bloom_params(capacity: usize, error_rate: f64) -> (u64, u32) {
    let n = capacity.max(1) as f64;
    let p = error_rate.clamp(1e-9, 0.5);
    let ln2 = std::f64::consts::LN_2;
    let bits = (-(n * p.ln()) / (ln2 * ln2)).ceil() as u64;
    let bits = bits.clamp(MIN_BITS, MAX_BITS);
    let hashes = ((bits as f64 / n) * ln2).round() as u32;
    (bits, hashes.clamp(1, 16))
}

enum Backend {
    Redis { pool: Pool, key: String },
    Local(RwLock<Bloom<String>>),
}

/// Probabilistic set: false positives possible, no false negatives.
///
/// Persistent as a redis bitmap when a pool is given, otherwise an
/// in-process filter lost on restart.
pub struct BloomFilter {
    backend: Backend,
    bits: u64,
    hashes: u32,
}

impl BloomFilter {
    pub fn new(pool: Option<Pool>, namespace: &str, capacity: usize, error_rate: f64) -> Self {
        let (bits, hashes) = bloom_params(capacity, error_rate);
        let backend = match pool {
            Some(pool) => Backend::Redis {
                pool,
                key: format!("{namespace}:bloomfilter"),
            },
            None => Backend::Local(RwLock::new(Bloom::new_for_fp_rate(
                capacity.max(1),
                error_rate.clamp(1e-9, 0.5),
            ))),
        };
        info!(
            "bloom filter '{}': bits={} hashes={} (~{} MB)",
            namespace,
            bits,
            hashes,
            bits / 8 / 1024 / 1024
        );
        Self {
            backend,
            bits,
            hashes,
        }
    }

    fn offsets(&self, fingerprint: &str) -> impl Iterator<Item = u64> + '_ {
        let (h1, h2) = md5_pair(fingerprint);
        (0..self.hashes as u64).map(move |i| h1.wrapping_add(i.wrapping_mul(h2)) % self.bits)
    }

    async fn redis_bits(&self, pool: &Pool, key: &str, fingerprints: &[String], set: bool) -> Result<Vec<i64>> {
        if fingerprints.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = pool
            .get()
            .await
            .map_err(|e| DedupError::Store(e.into()))?;
        let mut pipe = redis::pipe();
        for fp in fingerprints {
            for offset in self.offsets(fp) {
                if set {
                    pipe.setbit(key, offset as usize, true);
                } else {
                    pipe.getbit(key, offset as usize);
                }
            }
        }
        let bits: Vec<i64> = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| DedupError::Store(e.into()))?;
        Ok(bits)
    }
}

#[async_trait]
impl DedupFilter for BloomFilter {
    async fn contains_many(&self, fingerprints: &[String]) -> Result<Vec<bool>> {
        match &self.backend {
            Backend::Redis { pool, key } => {
                let bits = self.redis_bits(pool, key, fingerprints, false).await?;
                Ok(bits
                    .chunks(self.hashes as usize)
                    .map(|chunk| chunk.iter().all(|b| *b == 1))
                    .collect())
            }
            Backend::Local(bloom) => {
                let bloom = bloom.read().await;
                Ok(fingerprints.iter().map(|fp| bloom.check(fp)).collect())
            }
        }
    }

    async fn add_many(&self, fingerprints: &[String]) -> Result<Vec<bool>> {
        match &self.backend {
            Backend::Redis { pool, key } => {
                // SETBIT returns the previous bit; any 0 means the entry was new
                let previous = self.redis_bits(pool, key, fingerprints, true).await?;
                Ok(previous
                    .chunks(self.hashes as usize)
                    .map(|chunk| chunk.iter().any(|b| *b == 0))
                    .collect())
            }
            Backend::Local(bloom) => {
                let mut bloom = bloom.write().await;
                Ok(fingerprints
                    .iter()
                    .map(|fp| !bloom.check_and_set(fp))
                    .collect())
            }
        }
    }
}
