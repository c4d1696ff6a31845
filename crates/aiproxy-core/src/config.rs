//! Process-wide configuration, injected at startup rather than read from
//! global mutable state on the hot path.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub listen_addr: String,
    pub billing_enabled: bool,
    pub redis_enabled: bool,
    pub redis_url: Option<String>,
    pub max_retries: u32,
    pub rpm_default: u32,
    pub tpm_default: u32,
    pub monitor_window_size: usize,
    pub monitor_ban_threshold: f64,
    #[serde(with = "duration_secs")]
    pub balance_loop_interval: Duration,
    pub balance_loop_concurrency: usize,
    pub notification_webhook: Option<String>,
    #[serde(with = "duration_secs")]
    pub notification_throttle: Duration,
    pub consumer_workers: usize,
    pub consumer_queue_capacity: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:3000".to_string(),
            billing_enabled: true,
            redis_enabled: false,
            redis_url: None,
            max_retries: 2,
            rpm_default: 60,
            tpm_default: 100_000,
            monitor_window_size: 20,
            monitor_ban_threshold: 0.5,
            balance_loop_interval: Duration::from_secs(300),
            balance_loop_concurrency: 10,
            notification_webhook: None,
            notification_throttle: Duration::from_secs(60),
            consumer_workers: 8,
            consumer_queue_capacity: 1024,
        }
    }
}

impl ProxyConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = ProxyConfig::default();
        assert!(cfg.billing_enabled);
        assert_eq!(cfg.balance_loop_concurrency, 10);
    }

    #[test]
    fn round_trips_through_toml() {
        let cfg = ProxyConfig::default();
        let s = toml::to_string(&cfg).unwrap();
        let back = ProxyConfig::from_toml_str(&s).unwrap();
        assert_eq!(cfg.listen_addr, back.listen_addr);
    }
}
