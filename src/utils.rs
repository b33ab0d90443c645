pub mod connector;
pub mod encrypt;
pub mod logger;
pub mod redis_lock;

use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock seconds since the unix epoch, with sub-second precision.
///
/// Backlog scores that encode lease deadlines are compared against this.
pub fn timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

/// `min(2^n, cap)` seconds.
pub fn backoff_secs(n: u32, cap: u64) -> u64 {
    if n >= 63 {
        return cap;
    }
    (1u64 << n).min(cap)
}
