use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;

/// Exponential backoff parameters for retried provider calls.
#[derive(Clone, Copy, Debug)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub factor: u32,
    pub cap: Duration,
    pub idle_reset: Duration,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            factor: 2,
            cap: Duration::from_secs(5 * 60),
            idle_reset: Duration::from_secs(60),
            max_attempts: 3,
        }
    }
}

struct BackoffEntry {
    consecutive_failures: u32,
    last_failure: Instant,
}

/// Failure history keyed by (method, canonical params). One table lives in
/// front of each provider's transport; this is the only place retries are
/// decided.
pub struct BackoffTable {
    policy: BackoffPolicy,
    entries: Mutex<HashMap<String, BackoffEntry>>,
}

impl Default for BackoffTable {
    fn default() -> Self {
        Self::new(BackoffPolicy::default())
    }
}

impl BackoffTable {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    pub fn key(method: &str, params: Option<&Value>) -> String {
        match params {
            // serde_json maps serialize with sorted keys, so this is
            // canonical for identical payloads
            Some(params) => format!("{method}:{params}"),
            None => format!("{method}:"),
        }
    }

    /// Record a failure for the key and return how long to wait before the
    /// next attempt. Entries idle past the reset window start over at the
    /// base delay.
    pub fn record_failure(&self, key: &str) -> Duration {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let entry = entries.entry(key.to_owned()).or_insert(BackoffEntry {
            consecutive_failures: 0,
            last_failure: now,
        });
        if now.duration_since(entry.last_failure) > self.policy.idle_reset {
            entry.consecutive_failures = 0;
        }
        entry.consecutive_failures += 1;
        entry.last_failure = now;
        let exponent = entry.consecutive_failures.saturating_sub(1);
        delay_for(&self.policy, exponent)
    }

    pub fn record_success(&self, key: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(key);
    }

    pub fn consecutive_failures(&self, key: &str) -> u32 {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .get(key)
            .map(|entry| entry.consecutive_failures)
            .unwrap_or(0)
    }
}

fn delay_for(policy: &BackoffPolicy, exponent: u32) -> Duration {
    let multiplier = policy.factor.checked_pow(exponent).unwrap_or(u32::MAX);
    policy
        .base
        .checked_mul(multiplier)
        .map_or(policy.cap, |delay| delay.min(policy.cap))
}
