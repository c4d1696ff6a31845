//! The channel balance control loop: periodically probes
//! every `auto_balance_check` channel's upstream balance, bounded to 10
//! concurrent probes, and raises a throttled alert when a channel's
//! balance drops below its own threshold.
//!
//! A fixed-width `tokio::sync::Semaphore` bulkhead gates how many probes
//! run at once, the same mechanism used elsewhere in this workspace to cap
//! concurrent calls into an inner service.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use aiproxy_adaptor::AdaptorRegistry;
use aiproxy_core::events::{EventListeners, ProxyEvent};
use aiproxy_core::model::Channel;
use aiproxy_core::store::TenantStore;
use aiproxy_core::ProxyError;
use tokio::sync::Semaphore;

const DEFAULT_CONCURRENCY: usize = 10;

/// Tallies what one sweep accomplished, useful for tests and for an admin
/// endpoint reporting the loop's last run.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct SweepSummary {
    pub probed: usize,
    pub updated: usize,
    pub skipped_unimplemented: usize,
    pub alerts_raised: usize,
}

/// Owns the throttle state across sweeps; a single instance is expected to
/// live for the process lifetime and be driven by a periodic timer.
pub struct BalanceLoop {
    store: Arc<dyn TenantStore>,
    registry: Arc<AdaptorRegistry>,
    concurrency: usize,
    alert_throttle: Duration,
    listeners: EventListeners,
    last_alert: Mutex<HashMap<i64, Instant>>,
}

impl BalanceLoop {
    pub fn new(store: Arc<dyn TenantStore>, registry: Arc<AdaptorRegistry>) -> Self {
        Self {
            store,
            registry,
            concurrency: DEFAULT_CONCURRENCY,
            alert_throttle: Duration::from_secs(300),
            listeners: EventListeners::new(),
            last_alert: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_alert_throttle(mut self, throttle: Duration) -> Self {
        self.alert_throttle = throttle;
        self
    }

    pub fn add_listener<L: aiproxy_core::events::EventListener + 'static>(&mut self, listener: L) {
        self.listeners.add(listener);
    }

    /// Runs one sweep to completion: fetches every channel, probes the
    /// ones with `auto_balance_check` set, updates the store, and raises
    /// throttled alerts for channels under threshold.
    pub async fn run_once(&self) -> Result<SweepSummary, ProxyError> {
        let channels: Vec<Channel> = self
            .store
            .all_channels()
            .await?
            .into_iter()
            .filter(|c| c.enabled && c.auto_balance_check)
            .collect();

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut handles = Vec::with_capacity(channels.len());

        for channel in channels {
            let semaphore = Arc::clone(&semaphore);
            let registry = Arc::clone(&self.registry);
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore not closed");
                let adaptor = registry.get(channel.channel_type);
                let balance = match adaptor {
                    Some(adaptor) => adaptor.balance(channel.id).await,
                    None => Err(ProxyError::Internal("no adaptor for channel type".into())),
                };
                (channel, balance)
            }));
        }

        let mut summary = SweepSummary::default();
        for handle in handles {
            summary.probed += 1;
            let Ok((channel, result)) = handle.await else {
                continue; // a probe task panicked; recovered and skipped, counted as probed
            };

            match result {
                Ok(balance) => {
                    if self.store.update_channel_balance(channel.id, balance).await.is_ok() {
                        summary.updated += 1;
                    }
                    if balance < channel.balance_threshold && self.should_alert(channel.id) {
                        self.listeners.emit(&ProxyEvent::ChannelBalanceLow {
                            channel_id: channel.id,
                            balance,
                            threshold: channel.balance_threshold,
                        });
                        summary.alerts_raised += 1;
                    }
                }
                Err(err) if is_not_implemented(&err) => {
                    summary.skipped_unimplemented += 1;
                }
                Err(_err) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(channel_id = channel.id, error = %_err, "balance probe failed");
                }
            }
        }

        Ok(summary)
    }

    fn should_alert(&self, channel_id: i64) -> bool {
        let mut last_alert = self.last_alert.lock().unwrap();
        let now = Instant::now();
        match last_alert.get(&channel_id) {
            Some(at) if now.duration_since(*at) < self.alert_throttle => false,
            _ => {
                last_alert.insert(channel_id, now);
                true
            }
        }
    }
}

fn is_not_implemented(err: &ProxyError) -> bool {
    matches!(err, ProxyError::Internal(msg) if msg.contains("not implemented"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use aiproxy_adaptor::{Adaptor, ClientWriter};
    use aiproxy_core::model::{ChannelType, RequestMeta, Usage};
    use aiproxy_core::store::test_support::InMemoryStore;
    use bytes::Bytes;
    use std::collections::HashMap as Map;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedBalanceAdaptor {
        balance: f64,
    }

    #[async_trait]
    impl Adaptor for FixedBalanceAdaptor {
        fn base_url(&self) -> &str {
            "https://example.invalid"
        }
        fn request_url(&self, _meta: &RequestMeta) -> String {
            String::new()
        }
        fn setup_headers(
            &self,
            _meta: &RequestMeta,
            builder: reqwest::RequestBuilder,
        ) -> reqwest::RequestBuilder {
            builder
        }
        fn convert_request(
            &self,
            _meta: &RequestMeta,
            _inbound: &serde_json::Value,
        ) -> Result<(reqwest::Method, Bytes), ProxyError> {
            unreachable!()
        }
        async fn do_response(
            &self,
            _meta: &RequestMeta,
            _writer: &mut dyn ClientWriter,
            _response: reqwest::Response,
        ) -> Result<Usage, ProxyError> {
            unreachable!()
        }
        fn channel_name(&self) -> &'static str {
            "fixed"
        }
        async fn balance(&self, _channel_id: i64) -> Result<f64, ProxyError> {
            Ok(self.balance)
        }
    }

    fn channel(id: i64, channel_type: ChannelType, threshold: f64, auto: bool) -> Channel {
        Channel {
            id,
            channel_type,
            name: format!("ch-{id}"),
            base_url: None,
            credential: "secret".into(),
            weight: 1,
            priority: 0,
            enabled: true,
            auto_balance_check: auto,
            balance_threshold: threshold,
            balance: 100.0,
            model_tag: "default".into(),
            model_mapping: Map::new(),
        }
    }

    #[tokio::test]
    async fn updates_balance_for_checked_channels_and_skips_others() {
        let store = Arc::new(InMemoryStore::default());
        store.channels.lock().unwrap().push(channel(1, ChannelType::OPENAI, 10.0, true));
        store.channels.lock().unwrap().push(channel(2, ChannelType::ANTHROPIC, 10.0, false));

        let mut registry = AdaptorRegistry::with_defaults();
        registry.register(ChannelType::OPENAI, Arc::new(FixedBalanceAdaptor { balance: 42.0 }));
        let registry = Arc::new(registry);

        let sweep = BalanceLoop::new(store.clone(), registry);
        let summary = sweep.run_once().await.unwrap();

        assert_eq!(summary.probed, 1, "only the auto-checked channel is probed");
        assert_eq!(summary.updated, 1);
        let channels = store.channels.lock().unwrap();
        assert_eq!(channels.iter().find(|c| c.id == 1).unwrap().balance, 42.0);
        assert_eq!(channels.iter().find(|c| c.id == 2).unwrap().balance, 100.0);
    }

    #[tokio::test]
    async fn raises_a_throttled_alert_below_threshold() {
        let store = Arc::new(InMemoryStore::default());
        store.channels.lock().unwrap().push(channel(1, ChannelType::OPENAI, 50.0, true));

        let mut registry = AdaptorRegistry::with_defaults();
        registry.register(ChannelType::OPENAI, Arc::new(FixedBalanceAdaptor { balance: 5.0 }));
        let registry = Arc::new(registry);

        let alerts = Arc::new(AtomicUsize::new(0));
        let mut sweep = BalanceLoop::new(store, registry).with_alert_throttle(Duration::from_secs(3600));
        let counter = Arc::clone(&alerts);
        sweep.add_listener(move |event: &ProxyEvent| {
            if matches!(event, ProxyEvent::ChannelBalanceLow { .. }) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        sweep.run_once().await.unwrap();
        sweep.run_once().await.unwrap();

        assert_eq!(
            alerts.load(Ordering::SeqCst),
            1,
            "second sweep within the throttle window must not re-alert"
        );
    }

    #[tokio::test]
    async fn silently_skips_channels_whose_adaptor_has_no_balance_support() {
        let store = Arc::new(InMemoryStore::default());
        store.channels.lock().unwrap().push(channel(1, ChannelType::ANTHROPIC, 10.0, true));
        let registry = Arc::new(AdaptorRegistry::with_defaults());

        let sweep = BalanceLoop::new(store, registry);
        let summary = sweep.run_once().await.unwrap();

        assert_eq!(summary.skipped_unimplemented, 1);
        assert_eq!(summary.updated, 0);
    }
}
