//! Process-wide shared state: one task per inbound request, with
//! cache/config state behind `Arc`, assembled once in `main` and cloned
//! cheaply into every handler via axum's `State` extractor.

use std::sync::Arc;

use aiproxy_adaptor::AdaptorRegistry;
use aiproxy_balance::BalanceLoop;
use aiproxy_consumer::Consumer;
use aiproxy_core::store::TenantStore;
use aiproxy_core::ProxyConfig;
use aiproxy_ipblock::IpBlockList;
use aiproxy_monitor::Monitor;
use aiproxy_ratelimiter::RateLimiter;
use aiproxy_relay::RelayController;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn TenantStore>,
    pub rate_limiter: Arc<RateLimiter>,
    pub ip_block: Arc<IpBlockList>,
    pub monitor: Arc<Monitor>,
    pub relay: Arc<RelayController>,
    pub consumer: Arc<Consumer>,
    pub config: Arc<ProxyConfig>,
    pub adaptors: Arc<AdaptorRegistry>,
}

impl AppState {
    pub fn new(store: Arc<dyn TenantStore>, config: ProxyConfig, cache: Option<Arc<dyn aiproxy_core::store::SharedCache>>) -> Self {
        let config = Arc::new(config);
        let adaptors = Arc::new(AdaptorRegistry::with_defaults());
        let monitor = Arc::new(Monitor::new(config.monitor_window_size, config.monitor_ban_threshold));
        let client = reqwest::Client::new();
        let relay = Arc::new(RelayController::new(
            AdaptorRegistry::with_defaults(),
            client,
            config.max_retries,
        ));
        let consumer = Arc::new(Consumer::spawn(
            Arc::clone(&store),
            config.consumer_workers,
            config.consumer_queue_capacity,
        ));

        Self {
            store,
            rate_limiter: Arc::new(RateLimiter::new(cache.clone())),
            ip_block: Arc::new(IpBlockList::new(cache)),
            monitor,
            relay,
            consumer,
            config,
            adaptors,
        }
    }

    pub fn balance_loop(&self) -> BalanceLoop {
        BalanceLoop::new(Arc::clone(&self.store), Arc::clone(&self.adaptors))
            .with_concurrency(self.config.balance_loop_concurrency)
            .with_alert_throttle(self.config.notification_throttle)
    }
}
