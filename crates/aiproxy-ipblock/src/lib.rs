//! Two-tier IP block list: shared cache preferred, an
//! in-process map-with-TTL as fallback. `set` is idempotent and extends the
//! ban; `is_blocked` is O(1); expiry is lazy, swept opportunistically on
//! read.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use aiproxy_cache::FallbackCache;
use aiproxy_core::store::SharedCache;

pub struct IpBlockList {
    fallback: FallbackCache,
    local: Mutex<HashMap<String, i64>>,
}

impl IpBlockList {
    pub fn new(remote: Option<Arc<dyn SharedCache>>) -> Self {
        Self {
            fallback: FallbackCache::new(remote),
            local: Mutex::new(HashMap::new()),
        }
    }

    pub fn disabled_cache() -> Self {
        Self::new(None)
    }

    /// Bans `ip` until `ttl` from now. Idempotent: calling again extends
    /// (or shortens, if the new ttl is later) the expiry to the new value —
    /// the latest call always wins, matching a plain TTL-set semantics.
    pub async fn set(&self, ip: &str, ttl: Duration) {
        let expires_at = now_ms() + ttl.as_millis() as i64;
        let key = cache_key(ip);
        self.local.lock().unwrap().insert(ip.to_string(), expires_at);
        let value = expires_at.to_string();
        self.fallback
            .with_fallback(
                {
                    let key = key.clone();
                    let value = value.clone();
                    move |remote| {
                        Box::pin(async move { remote.set_ex(&key, &value, ttl.as_millis() as i64).await })
                    }
                },
                || (),
            )
            .await;
        #[cfg(feature = "tracing")]
        tracing::info!(ip, ttl_ms = ttl.as_millis() as u64, "ip blocked");
    }

    /// Whether `ip` is currently blocked. Checks the shared cache first
    /// (when enabled); falls back to the in-process map on any error, so a
    /// cache outage degrades to per-replica blocking rather than letting
    /// every request through.
    pub async fn is_blocked(&self, ip: &str) -> bool {
        let key = cache_key(ip);
        let local = &self.local;
        self.fallback
            .with_fallback(
                move |remote| {
                    Box::pin(async move {
                        let stored = remote.get(&key).await?;
                        Ok(stored
                            .and_then(|s| s.parse::<i64>().ok())
                            .is_some_and(|expires_at| expires_at > now_ms()))
                    })
                },
                || {
                    let mut map = local.lock().unwrap();
                    match map.get(ip) {
                        Some(&expires_at) if expires_at > now_ms() => true,
                        Some(_) => {
                            map.remove(ip);
                            false
                        }
                        None => false,
                    }
                },
            )
            .await
    }
}

fn cache_key(ip: &str) -> String {
    format!("ipblock:{ip}")
}

fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
