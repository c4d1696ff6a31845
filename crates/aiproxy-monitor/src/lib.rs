//! Sliding-window channel health tracker, generalising a single-service
//! circuit breaker to a map keyed by `(channel_id, model)`.
//!
//! `add`, `error_rate`, `banned`, and `clear` are the whole contract. Unlike
//! `aiproxy-ratelimiter` and `aiproxy-ipblock`, this window is deliberately
//! in-process only rather than `aiproxy_cache::FallbackCache`-backed: the
//! window here is the exact boolean outcome of the last N calls, and
//! `aiproxy_core::store::SharedCache`'s primitives (`get`/`set_ex`,
//! `zadd_trim_count`, `incr_by`) can trim by timestamp or increment a
//! counter, but can't retrieve a bounded list of the most recent individual
//! outcomes — there's no remote operation that reproduces "evict the
//! oldest of exactly N entries" the way the in-process `VecDeque` does.
//! A replica-shared view would have to change the contract itself (a
//! time-windowed error rate rather than a count-windowed one, the same
//! trade the rate limiter already makes), which changes what `banned`
//! means rather than just where its state lives, so it's left in-process
//! until that tradeoff is made deliberately rather than as a side effect
//! of wiring in a cache client.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

/// One (channel, model) pair's fixed-length outcome window.
struct Window {
    outcomes: VecDeque<bool>,
    capacity: usize,
}

impl Window {
    fn new(capacity: usize) -> Self {
        Self {
            outcomes: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, ok: bool) {
        if self.outcomes.len() == self.capacity {
            self.outcomes.pop_front();
        }
        self.outcomes.push_back(ok);
    }

    fn is_full(&self) -> bool {
        self.outcomes.len() == self.capacity
    }

    fn error_rate(&self) -> f64 {
        if !self.is_full() || self.outcomes.is_empty() {
            return 0.0;
        }
        let failures = self.outcomes.iter().filter(|ok| !**ok).count();
        failures as f64 / self.outcomes.len() as f64
    }
}

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct Key {
    channel_id: i64,
    model: String,
}

/// Sliding-window error tracker with an auto-disable threshold.
pub struct Monitor {
    windows: Mutex<HashMap<Key, Window>>,
    window_size: usize,
    ban_threshold: f64,
}

impl Monitor {
    pub fn new(window_size: usize, ban_threshold: f64) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            window_size,
            ban_threshold,
        }
    }

    /// Records one outcome for `(channel_id, model)`.
    pub fn add(&self, channel_id: i64, model: &str, ok: bool) {
        let key = Key {
            channel_id,
            model: model.to_string(),
        };
        let mut windows = self.windows.lock().unwrap();
        let window = windows
            .entry(key)
            .or_insert_with(|| Window::new(self.window_size));
        window.push(ok);

        #[cfg(feature = "metrics")]
        {
            let label = if ok { "success" } else { "failure" };
            metrics::counter!("monitor_outcomes_total", "result" => label).increment(1);
        }
        #[cfg(feature = "tracing")]
        if !ok {
            tracing::debug!(channel_id, model, "monitor recorded failure");
        }
    }

    /// Failure rate over the window: failures divided by window size once
    /// the window is full, `0.0` otherwise.
    pub fn error_rate(&self, channel_id: i64, model: &str) -> f64 {
        let key = Key {
            channel_id,
            model: model.to_string(),
        };
        self.windows
            .lock()
            .unwrap()
            .get(&key)
            .map(Window::error_rate)
            .unwrap_or(0.0)
    }

    /// Channels whose error rate for `model` has crossed the ban threshold.
    pub fn banned(&self, model: &str) -> HashSet<i64> {
        self.windows
            .lock()
            .unwrap()
            .iter()
            .filter(|(key, window)| key.model == model && window.error_rate() >= self.ban_threshold)
            .map(|(key, _)| key.channel_id)
            .collect()
    }

    pub fn is_banned(&self, channel_id: i64, model: &str) -> bool {
        self.error_rate(channel_id, model) >= self.ban_threshold
    }

    /// Administratively resets a channel's window, optionally scoped to one
    /// model; clearing re-enables it immediately rather than waiting for
    /// the window to decay.
    pub fn clear(&self, channel_id: i64, model: Option<&str>) {
        let mut windows = self.windows.lock().unwrap();
        match model {
            Some(model) => {
                windows.remove(&Key {
                    channel_id,
                    model: model.to_string(),
                });
            }
            None => windows.retain(|key, _| key.channel_id != channel_id),
        }
    }
}

impl Default for Monitor {
    fn default() -> Self {
        Self::new(20, 0.5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_before_window_fills() {
        let monitor = Monitor::new(5, 0.5);
        monitor.add(1, "gpt-test", false);
        monitor.add(1, "gpt-test", false);
        assert_eq!(monitor.error_rate(1, "gpt-test"), 0.0);
    }

    #[test]
    fn bans_after_threshold_crossed_and_recovers() {
        let monitor = Monitor::new(4, 0.5);
        for _ in 0..4 {
            monitor.add(1, "gpt-test", false);
        }
        assert!(monitor.banned("gpt-test").contains(&1));

        for _ in 0..4 {
            monitor.add(1, "gpt-test", true);
        }
        assert!(!monitor.banned("gpt-test").contains(&1));
    }

    #[test]
    fn ban_is_scoped_per_model() {
        let monitor = Monitor::new(2, 0.5);
        monitor.add(1, "gpt-test", false);
        monitor.add(1, "gpt-test", false);
        assert!(monitor.banned("gpt-test").contains(&1));
        assert!(!monitor.banned("other-model").contains(&1));
    }

    #[test]
    fn clear_resets_window() {
        let monitor = Monitor::new(2, 0.5);
        monitor.add(1, "gpt-test", false);
        monitor.add(1, "gpt-test", false);
        assert!(monitor.is_banned(1, "gpt-test"));
        monitor.clear(1, Some("gpt-test"));
        assert!(!monitor.is_banned(1, "gpt-test"));
    }

    #[test]
    fn consecutive_failures_then_successes_w_window() {
        // "after W consecutive failures in a window of W,
        // banned(model) includes the channel; after W successes it is
        // absent."
        let w = 6;
        let monitor = Monitor::new(w, 0.5);
        for _ in 0..w {
            monitor.add(7, "m", false);
        }
        assert!(monitor.banned("m").contains(&7));
        for _ in 0..w {
            monitor.add(7, "m", true);
        }
        assert!(!monitor.banned("m").contains(&7));
    }
}
