//! The "cache-first-with-local-fallback" decorator: one interface, two
//! implementations (shared cache, in-process), and a decorator that tries
//! the remote first and silently falls back on error.
//!
//! This crate defines [`FallbackCache`], used by `aiproxy-ratelimiter` and
//! `aiproxy-ipblock` so both share one fallback policy instead of
//! re-implementing it twice. `aiproxy-monitor` stays in-process only — see
//! its module doc for why its windowing contract doesn't fit the same
//! remote primitives.

use std::sync::Arc;

use aiproxy_core::store::SharedCache;
use aiproxy_core::ProxyError;

/// Wraps a [`SharedCache`] and transparently falls back to a caller-supplied
/// closure when the remote call errors, logging at error level and never
/// failing the request outright.
#[derive(Clone)]
pub struct FallbackCache {
    remote: Option<Arc<dyn SharedCache>>,
}

impl FallbackCache {
    pub fn new(remote: Option<Arc<dyn SharedCache>>) -> Self {
        Self { remote }
    }

    pub fn disabled() -> Self {
        Self { remote: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.remote.is_some()
    }

    /// Runs `remote_op` against the shared cache if configured; on any
    /// error (or if no shared cache is configured) runs `local_op` instead.
    /// `remote_op` and `local_op` must have identical observable contracts
    /// so callers can't tell which path executed except for latency.
    pub async fn with_fallback<T, R, L>(&self, remote_op: R, local_op: L) -> T
    where
        R: FnOnce(Arc<dyn SharedCache>) -> futures::future::BoxFuture<'static, Result<T, ProxyError>>,
        L: FnOnce() -> T,
    {
        if let Some(remote) = self.remote.clone() {
            match remote_op(remote).await {
                Ok(value) => return value,
                Err(_err) => {
                    #[cfg(feature = "tracing")]
                    tracing::error!(error = %_err, "shared cache call failed, falling back to in-process state");
                }
            }
        }
        local_op()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aiproxy_core::store::test_support::{InMemoryCache, UnreachableCache};

    #[tokio::test]
    async fn uses_remote_when_available() {
        let cache = FallbackCache::new(Some(Arc::new(InMemoryCache::default())));
        let result = cache
            .with_fallback(
                |remote| {
                    Box::pin(async move {
                        remote.set_ex("k", "v", 1000).await?;
                        remote.get("k").await
                    })
                },
                || None,
            )
            .await;
        assert_eq!(result, Some("v".to_string()));
    }

    #[tokio::test]
    async fn falls_back_on_remote_error() {
        let cache = FallbackCache::new(Some(Arc::new(UnreachableCache)));
        let result = cache
            .with_fallback(
                |remote| Box::pin(async move { remote.get("k").await }),
                || Some("local".to_string()),
            )
            .await;
        assert_eq!(result, Some("local".to_string()));
    }

    #[tokio::test]
    async fn falls_back_when_disabled() {
        let cache = FallbackCache::disabled();
        let result = cache
            .with_fallback(
                |remote: Arc<dyn SharedCache>| Box::pin(async move { remote.get("k").await }),
                || 42,
            )
            .await;
        assert_eq!(result, 42);
    }
}
