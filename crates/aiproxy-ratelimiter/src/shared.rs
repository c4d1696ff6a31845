//! Shared-cache backend: a sorted index of request timestamps per key,
//! trimmed, conditionally inserted on admit, and counted in one round trip
//! as if executed as a single atomic script.
//! [`aiproxy_core::store::SharedCache::zadd_trim_count`] is the
//! trait-level stand-in for that script.

use std::sync::Arc;
use std::time::Duration;

use aiproxy_core::store::SharedCache;
use aiproxy_core::ProxyError;

const WINDOW: Duration = Duration::from_secs(60);

/// Thin wrapper presenting the rate limiter's contract directly over a
/// [`SharedCache`], with the same method shapes as
/// [`crate::InProcessLimiter`] so `FallbackCache` can swap between them.
pub struct SharedCacheLimiter {
    cache: Arc<dyn SharedCache>,
}

impl SharedCacheLimiter {
    pub fn new(cache: Arc<dyn SharedCache>) -> Self {
        Self { cache }
    }

    pub async fn push_and_count(
        &self,
        key: &str,
        member: &str,
        now_ms: i64,
        cutoff_ms: i64,
        limit: u64,
    ) -> Result<u64, ProxyError> {
        self.cache
            .zadd_trim_count(key, member, now_ms, cutoff_ms, WINDOW.as_millis() as i64, limit)
            .await
    }

    pub async fn observe_tokens(&self, key: &str, n: u32) -> Result<i64, ProxyError> {
        self.cache.incr_by(key, n as i64, WINDOW.as_millis() as i64).await
    }

    pub async fn tokens_in_window(&self, key: &str) -> Result<i64, ProxyError> {
        self.cache.incr_by(key, 0, 0).await
    }
}
