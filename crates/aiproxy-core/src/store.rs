//! Traits for the two external collaborators the proxy depends on but does
//! not implement: the relational store (tenants/tokens/channels/logs) and
//! the optional shared cache. Only in-memory test doubles live here; a real
//! Postgres/Redis backend is an integration the embedding application
//! provides.

use async_trait::async_trait;

use crate::error::ProxyError;
use crate::model::{Channel, ModelConfig, Tenant, Token};

/// Read access to tenants/tokens/channels/models, and a sink for consume
/// rows and balance debits. Token/tenant/channel caches live in the crates
/// that use them; this trait is the eventually-consistent source of truth
/// underneath.
#[async_trait]
pub trait TenantStore: Send + Sync {
    async fn find_token(&self, token_name: &str) -> Result<Option<Token>, ProxyError>;
    async fn find_tenant(&self, tenant_id: i64) -> Result<Option<Tenant>, ProxyError>;
    async fn channels_for_model(&self, model: &str) -> Result<Vec<Channel>, ProxyError>;
    async fn model_config(&self, model: &str) -> Result<Option<ModelConfig>, ProxyError>;
    /// All configured channels, regardless of which models they serve —
    /// used by the balance control loop, which sweeps every channel with
    /// `auto_balance_check` set rather than ones tied to a single model.
    async fn all_channels(&self) -> Result<Vec<Channel>, ProxyError>;
    /// Every logical model the proxy serves, for the read-only `GET
    /// /v1/models` listing.
    async fn all_models(&self) -> Result<Vec<ModelConfig>, ProxyError>;
    /// Debits `amount` from the tenant's balance, returning the amount
    /// actually debited (may be less than requested if the balance was
    /// insufficient).
    async fn post_consume(&self, token_name: &str, amount: f64) -> Result<f64, ProxyError>;
    async fn write_consume_record(
        &self,
        record: &crate::model::ConsumeRecord,
    ) -> Result<(), ProxyError>;
    async fn update_channel_balance(&self, channel_id: i64, balance: f64) -> Result<(), ProxyError>;
}

/// The optional shared cache used as an accelerator by the rate limiter and
/// IP block list. Every operation can fail (the network is down, Redis is
/// unreachable) and callers must fall back to an in-process implementation
/// rather than failing the request.
#[async_trait]
pub trait SharedCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, ProxyError>;
    async fn set_ex(&self, key: &str, value: &str, ttl_ms: i64) -> Result<(), ProxyError>;
    /// Trims entries in the sorted set at `key` older than `cutoff_ms`,
    /// then appends `member` only if the pre-trim-then-count size is still
    /// under `limit` — insert on admit, so a rejected request never
    /// extends the window against itself. Always returns
    /// `pre_insert_count + 1`, the count this member would have if
    /// admitted, expressed as one round trip (an atomic script upstream).
    async fn zadd_trim_count(
        &self,
        key: &str,
        member: &str,
        score_ms: i64,
        cutoff_ms: i64,
        ttl_ms: i64,
        limit: u64,
    ) -> Result<u64, ProxyError>;
    async fn incr_by(&self, key: &str, delta: i64, ttl_ms: i64) -> Result<i64, ProxyError>;
    async fn delete(&self, key: &str) -> Result<(), ProxyError>;
}

#[cfg(any(test, feature = "test-support"))]
pub mod test_support {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    /// A trivially simple in-memory `TenantStore`, usable directly in
    /// unit tests for every crate downstream of `aiproxy-core`.
    #[derive(Default)]
    pub struct InMemoryStore {
        pub tokens: Mutex<HashMap<String, Token>>,
        pub tenants: Mutex<HashMap<i64, Tenant>>,
        pub channels: Mutex<Vec<Channel>>,
        pub models: Mutex<HashMap<String, ModelConfig>>,
        pub consume_records: Mutex<Vec<crate::model::ConsumeRecord>>,
    }

    #[async_trait]
    impl TenantStore for InMemoryStore {
        async fn find_token(&self, token_name: &str) -> Result<Option<Token>, ProxyError> {
            Ok(self.tokens.lock().unwrap().get(token_name).cloned())
        }

        async fn find_tenant(&self, tenant_id: i64) -> Result<Option<Tenant>, ProxyError> {
            Ok(self.tenants.lock().unwrap().get(&tenant_id).cloned())
        }

        async fn channels_for_model(&self, model: &str) -> Result<Vec<Channel>, ProxyError> {
            let models = self.models.lock().unwrap();
            if !models.contains_key(model) {
                return Ok(Vec::new());
            }
            drop(models);
            // Every enabled channel that serves this model, unfiltered by
            // tenant. Tenant/channel model-tag binding is the distributor's
            // job — it's the one with tenant context in hand.
            Ok(self
                .channels
                .lock()
                .unwrap()
                .iter()
                .filter(|c| c.enabled)
                .cloned()
                .collect())
        }

        async fn model_config(&self, model: &str) -> Result<Option<ModelConfig>, ProxyError> {
            Ok(self.models.lock().unwrap().get(model).cloned())
        }

        async fn all_channels(&self) -> Result<Vec<Channel>, ProxyError> {
            Ok(self.channels.lock().unwrap().clone())
        }

        async fn all_models(&self) -> Result<Vec<ModelConfig>, ProxyError> {
            Ok(self.models.lock().unwrap().values().cloned().collect())
        }

        async fn post_consume(&self, token_name: &str, amount: f64) -> Result<f64, ProxyError> {
            let tenant_id = self
                .tokens
                .lock()
                .unwrap()
                .get(token_name)
                .map(|t| t.tenant_id);
            let Some(tenant_id) = tenant_id else {
                return Err(ProxyError::Internal("unknown token".into()));
            };
            let mut tenants = self.tenants.lock().unwrap();
            let Some(tenant) = tenants.get_mut(&tenant_id) else {
                return Err(ProxyError::Internal("unknown tenant".into()));
            };
            let debited = amount.min(tenant.balance.max(0.0));
            tenant.balance -= debited;
            Ok(debited)
        }

        async fn write_consume_record(
            &self,
            record: &crate::model::ConsumeRecord,
        ) -> Result<(), ProxyError> {
            self.consume_records.lock().unwrap().push(record.clone());
            Ok(())
        }

        async fn update_channel_balance(
            &self,
            channel_id: i64,
            balance: f64,
        ) -> Result<(), ProxyError> {
            let mut channels = self.channels.lock().unwrap();
            if let Some(c) = channels.iter_mut().find(|c| c.id == channel_id) {
                c.balance = balance;
            }
            Ok(())
        }
    }

    /// An in-memory `SharedCache` double, and a cache that always errors —
    /// for exercising the "shared cache unreachable" fallback paths the
    /// IP-block-expiry test needs.
    #[derive(Default)]
    pub struct InMemoryCache {
        data: Mutex<HashMap<String, (String, i64)>>,
        zsets: Mutex<HashMap<String, Vec<(String, i64)>>>,
        counters: Mutex<HashMap<String, i64>>,
    }

    #[async_trait]
    impl SharedCache for InMemoryCache {
        async fn get(&self, key: &str) -> Result<Option<String>, ProxyError> {
            Ok(self.data.lock().unwrap().get(key).map(|(v, _)| v.clone()))
        }

        async fn set_ex(&self, key: &str, value: &str, ttl_ms: i64) -> Result<(), ProxyError> {
            self.data
                .lock()
                .unwrap()
                .insert(key.to_string(), (value.to_string(), ttl_ms));
            Ok(())
        }

        async fn zadd_trim_count(
            &self,
            key: &str,
            member: &str,
            score_ms: i64,
            cutoff_ms: i64,
            _ttl_ms: i64,
            limit: u64,
        ) -> Result<u64, ProxyError> {
            let mut zsets = self.zsets.lock().unwrap();
            let set = zsets.entry(key.to_string()).or_default();
            set.retain(|(_, score)| *score >= cutoff_ms);
            let pre_insert_count = set.len() as u64;
            if pre_insert_count < limit {
                set.push((member.to_string(), score_ms));
            }
            Ok(pre_insert_count + 1)
        }

        async fn incr_by(&self, key: &str, delta: i64, _ttl_ms: i64) -> Result<i64, ProxyError> {
            let mut counters = self.counters.lock().unwrap();
            let entry = counters.entry(key.to_string()).or_insert(0);
            *entry += delta;
            Ok(*entry)
        }

        async fn delete(&self, key: &str) -> Result<(), ProxyError> {
            self.data.lock().unwrap().remove(key);
            self.zsets.lock().unwrap().remove(key);
            self.counters.lock().unwrap().remove(key);
            Ok(())
        }
    }

    /// A `SharedCache` that always fails, used to exercise cache-first
    /// fallback-to-local-state behavior.
    #[derive(Default)]
    pub struct UnreachableCache;

    #[async_trait]
    impl SharedCache for UnreachableCache {
        async fn get(&self, _key: &str) -> Result<Option<String>, ProxyError> {
            Err(ProxyError::Internal("cache unreachable".into()))
        }

        async fn set_ex(&self, _key: &str, _value: &str, _ttl_ms: i64) -> Result<(), ProxyError> {
            Err(ProxyError::Internal("cache unreachable".into()))
        }

        async fn zadd_trim_count(
            &self,
            _key: &str,
            _member: &str,
            _score_ms: i64,
            _cutoff_ms: i64,
            _ttl_ms: i64,
            _limit: u64,
        ) -> Result<u64, ProxyError> {
            Err(ProxyError::Internal("cache unreachable".into()))
        }

        async fn incr_by(&self, _key: &str, _delta: i64, _ttl_ms: i64) -> Result<i64, ProxyError> {
            Err(ProxyError::Internal("cache unreachable".into()))
        }

        async fn delete(&self, _key: &str) -> Result<(), ProxyError> {
            Err(ProxyError::Internal("cache unreachable".into()))
        }
    }
}
