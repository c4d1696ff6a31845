//! Mutex-guarded in-process fallback, sharded by key hash so the hot path
//! never contends on a single global lock.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

struct Shard {
    requests: HashMap<String, VecDeque<i64>>,
    tokens: HashMap<String, VecDeque<(i64, u32)>>,
}

impl Shard {
    fn new() -> Self {
        Self {
            requests: HashMap::new(),
            tokens: HashMap::new(),
        }
    }
}

pub struct InProcessLimiter {
    shards: Vec<Mutex<Shard>>,
}

impl InProcessLimiter {
    pub fn new(shard_count: usize) -> Self {
        Self {
            shards: (0..shard_count).map(|_| Mutex::new(Shard::new())).collect(),
        }
    }

    fn shard(&self, idx: usize) -> &Mutex<Shard> {
        &self.shards[idx % self.shards.len()]
    }

    /// Trims entries older than `cutoff_ms`, then inserts `now_ms` into the
    /// key's ring only if the pre-insert count is under `limit` — a
    /// rejected request never occupies a slot, so it can't extend the
    /// window against itself. Always returns `pre_insert_count + 1`, the
    /// count this request would have if admitted, so the caller's
    /// `count <= limit` admission check stays correct whether or not the
    /// insert actually happened.
    pub fn push_and_count(&self, shard_idx: usize, key: &str, now_ms: i64, cutoff_ms: i64, limit: usize) -> usize {
        let mut shard = self.shard(shard_idx).lock().unwrap();
        let ring = shard.requests.entry(key.to_string()).or_default();
        while let Some(&front) = ring.front() {
            if front < cutoff_ms {
                ring.pop_front();
            } else {
                break;
            }
        }
        let pre_insert_count = ring.len();
        if pre_insert_count < limit {
            ring.push_back(now_ms);
        }
        pre_insert_count + 1
    }

    /// Number of entries currently in the window, without pushing a new one.
    pub fn tokens_in_window(&self, shard_idx: usize, key: &str, cutoff_ms: i64) -> u32 {
        let mut shard = self.shard(shard_idx).lock().unwrap();
        if let Some(ring) = shard.requests.get_mut(key) {
            while let Some(&front) = ring.front() {
                if front < cutoff_ms {
                    ring.pop_front();
                } else {
                    break;
                }
            }
            return ring.len() as u32;
        }
        if let Some(ring) = shard.tokens.get_mut(key) {
            while let Some(&(ts, _)) = ring.front() {
                if ts < cutoff_ms {
                    ring.pop_front();
                } else {
                    break;
                }
            }
            return ring.iter().map(|(_, n)| *n).sum();
        }
        0
    }

    pub fn observe_tokens(&self, shard_idx: usize, key: &str, now_ms: i64, cutoff_ms: i64, n: u32) {
        let mut shard = self.shard(shard_idx).lock().unwrap();
        let ring = shard.tokens.entry(key.to_string()).or_default();
        ring.push_back((now_ms, n));
        while let Some(&(ts, _)) = ring.front() {
            if ts < cutoff_ms {
                ring.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trims_entries_outside_window() {
        let limiter = InProcessLimiter::new(4);
        let key = "k";
        assert_eq!(limiter.push_and_count(0, key, 1000, 0, 10), 1);
        assert_eq!(limiter.push_and_count(0, key, 2000, 0, 10), 2);
        // cutoff excludes the first entry now
        assert_eq!(limiter.push_and_count(0, key, 3000, 1500, 10), 2);
    }

    #[test]
    fn rejected_push_does_not_occupy_a_slot() {
        let limiter = InProcessLimiter::new(4);
        let key = "k";
        assert_eq!(limiter.push_and_count(0, key, 1000, 0, 1), 1); // admitted, fills the only slot
        assert_eq!(limiter.push_and_count(0, key, 1100, 0, 1), 2); // rejected, not inserted
        assert_eq!(limiter.tokens_in_window(0, key, 0), 1);
        // a later admitted attempt still sees just the one real entry
        assert_eq!(limiter.push_and_count(0, key, 1200, 0, 2), 2);
        assert_eq!(limiter.tokens_in_window(0, key, 0), 2);
    }

    #[test]
    fn token_window_sums_observed_amounts() {
        let limiter = InProcessLimiter::new(4);
        let key = "tok";
        limiter.observe_tokens(0, key, 1000, 0, 100);
        limiter.observe_tokens(0, key, 2000, 0, 50);
        assert_eq!(limiter.tokens_in_window(0, key, 0), 150);
        assert_eq!(limiter.tokens_in_window(0, key, 1500), 50);
    }
}
