//! Sliding-window RPM/TPM rate limiting.
//!
//! Exposes `push_request_if_under_limit`, `observe_tokens`, and
//! `current_rpm`, matching the documented contract exactly. Two backends share
//! one contract: a shared-cache implementation (sorted-index-per-key,
//! trimmed on read) and an in-process fallback (mutex-guarded ring of
//! timestamps, sharded by key hash), composed through
//! `aiproxy_cache::FallbackCache` so a shared-cache outage degrades
//! silently rather than failing requests.

mod inprocess;
mod shared;

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use aiproxy_cache::FallbackCache;
use aiproxy_core::store::SharedCache;

pub use inprocess::InProcessLimiter;
pub use shared::SharedCacheLimiter;

const WINDOW: Duration = Duration::from_secs(60);
const SHARD_COUNT: usize = 32;

fn shard_of(key: &str) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() as usize) % SHARD_COUNT
}

/// A rate-limit key: `(tenant_or_group, model)`.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct RateKey {
    pub group: String,
    pub model: String,
}

impl RateKey {
    pub fn new(group: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            model: model.into(),
        }
    }

    fn cache_key(&self, suffix: &str) -> String {
        format!("ratelimit:{}:{}:{}", self.group, self.model, suffix)
    }
}

/// The result of an admission check, carrying the data needed for the
/// `X-RateLimit-*` response headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmitResult {
    pub admitted: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_after: Duration,
}

/// Combined RPM + TPM limiter, cache-first with in-process fallback.
pub struct RateLimiter {
    fallback: FallbackCache,
    in_process: InProcessLimiter,
}

impl RateLimiter {
    pub fn new(remote: Option<Arc<dyn SharedCache>>) -> Self {
        Self {
            fallback: FallbackCache::new(remote),
            in_process: InProcessLimiter::new(SHARD_COUNT),
        }
    }

    pub fn disabled_cache() -> Self {
        Self {
            fallback: FallbackCache::disabled(),
            in_process: InProcessLimiter::new(SHARD_COUNT),
        }
    }

    /// Admits a request if the sliding 60s window for `key` has not yet
    /// reached `limit`. Returns false (never panics, never errors) when the
    /// limit is exceeded.
    pub async fn push_request_if_under_limit(&self, key: &RateKey, limit: u32) -> AdmitResult {
        if limit == 0 {
            return AdmitResult {
                admitted: true,
                limit,
                remaining: u32::MAX,
                reset_after: Duration::ZERO,
            };
        }
        let now_ms = now_ms();
        let cutoff_ms = now_ms - WINDOW.as_millis() as i64;
        let cache_key = key.cache_key("rpm");
        let member = format!("{now_ms}-{}", fastrand_suffix());
        let shard = shard_of(&cache_key);
        let in_process = &self.in_process;

        let count = self
            .fallback
            .with_fallback(
                {
                    let cache_key = cache_key.clone();
                    let member = member.clone();
                    move |remote| {
                        Box::pin(async move {
                            shared::SharedCacheLimiter::new(remote)
                                .push_and_count(&cache_key, &member, now_ms, cutoff_ms, limit as u64)
                                .await
                        })
                    }
                },
                || in_process.push_and_count(shard, &cache_key, now_ms, cutoff_ms, limit as usize) as u64,
            )
            .await;

        let admitted = count <= limit as u64;
        #[cfg(feature = "metrics")]
        {
            if !admitted {
                metrics::counter!("ratelimiter_rejected_total").increment(1);
            }
        }
        #[cfg(feature = "tracing")]
        if !admitted {
            tracing::warn!(group = %key.group, model = %key.model, count, limit, "rpm limit exceeded");
        }
        AdmitResult {
            admitted,
            limit,
            remaining: limit.saturating_sub(count.min(limit as u64) as u32),
            reset_after: WINDOW,
        }
    }

    /// Records `n` tokens observed for `key`'s TPM counter, checked against
    /// `limit` on the *next* admission. TPM is evaluated lazily, not
    /// pre-admitted, since token counts aren't known until the response
    /// completes.
    pub async fn observe_tokens(&self, key: &RateKey, n: u32) {
        if n == 0 {
            return;
        }
        let now_ms = now_ms();
        let cutoff_ms = now_ms - WINDOW.as_millis() as i64;
        let cache_key = key.cache_key("tpm");
        let shard = shard_of(&cache_key);
        let in_process = &self.in_process;
        self.fallback
            .with_fallback(
                {
                    let cache_key = cache_key.clone();
                    move |remote| {
                        Box::pin(async move {
                            shared::SharedCacheLimiter::new(remote)
                                .observe_tokens(&cache_key, n)
                                .await
                        })
                    }
                },
                move || {
                    in_process.observe_tokens(shard, &cache_key, now_ms, cutoff_ms, n);
                    0
                },
            )
            .await;
    }

    /// Whether the TPM counter for `key` has crossed `limit`.
    pub async fn tpm_exceeded(&self, key: &RateKey, limit: u32) -> bool {
        if limit == 0 {
            return false;
        }
        let now_ms = now_ms();
        let cutoff_ms = now_ms - WINDOW.as_millis() as i64;
        let cache_key = key.cache_key("tpm");
        let shard = shard_of(&cache_key);
        let in_process = &self.in_process;
        let total = self
            .fallback
            .with_fallback(
                {
                    let cache_key = cache_key.clone();
                    move |remote| {
                        Box::pin(async move {
                            shared::SharedCacheLimiter::new(remote)
                                .tokens_in_window(&cache_key)
                                .await
                        })
                    }
                },
                move || in_process.tokens_in_window(shard, &cache_key, cutoff_ms) as i64,
            )
            .await;
        total as u64 >= limit as u64
    }

    /// Current RPM observed for `(group, model)`, for diagnostics.
    pub fn current_rpm(&self, key: &RateKey) -> u32 {
        let cache_key = key.cache_key("rpm");
        let shard = shard_of(&cache_key);
        let cutoff_ms = now_ms() - WINDOW.as_millis() as i64;
        self.in_process.tokens_in_window(shard, &cache_key, cutoff_ms)
    }

    /// Tokens observed for `(group, model)` within the current window, used
    /// to populate the `X-RateLimit-Remaining-Tokens` response header. Reads
    /// only the in-process view; the shared-cache path is authoritative for
    /// admission but this diagnostic doesn't warrant a second round trip.
    pub fn current_tpm(&self, key: &RateKey) -> u32 {
        let cache_key = key.cache_key("tpm");
        let shard = shard_of(&cache_key);
        let cutoff_ms = now_ms() - WINDOW.as_millis() as i64;
        self.in_process.tokens_in_window(shard, &cache_key, cutoff_ms)
    }
}

fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

fn fastrand_suffix() -> u32 {
    use std::sync::atomic::{AtomicU32, Ordering};
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn admits_up_to_limit_then_rejects() {
        let limiter = RateLimiter::disabled_cache();
        let key = RateKey::new("tenant-1", "gpt-test");
        for _ in 0..2 {
            let result = limiter.push_request_if_under_limit(&key, 2).await;
            assert!(result.admitted);
        }
        let result = limiter.push_request_if_under_limit(&key, 2).await;
        assert!(!result.admitted);
        assert_eq!(result.remaining, 0);
    }

    #[tokio::test]
    async fn zero_limit_means_unlimited() {
        let limiter = RateLimiter::disabled_cache();
        let key = RateKey::new("tenant-1", "gpt-test");
        for _ in 0..50 {
            assert!(limiter.push_request_if_under_limit(&key, 0).await.admitted);
        }
    }

    #[tokio::test]
    async fn falls_back_when_shared_cache_unreachable() {
        use aiproxy_core::store::test_support::UnreachableCache;
        let limiter = RateLimiter::new(Some(Arc::new(UnreachableCache)));
        let key = RateKey::new("tenant-2", "gpt-test");
        let result = limiter.push_request_if_under_limit(&key, 1).await;
        assert!(result.admitted);
        let result = limiter.push_request_if_under_limit(&key, 1).await;
        assert!(!result.admitted);
    }
}
