use serde::{Deserialize, Serialize};
use std::time::Duration;

fn backoff_base_default() -> u64 { return 1000 }
fn backoff_multiplier_default() -> f64 { return 2.0 }
fn backoff_cap_default() -> u64 { return 60000 }
fn backoff_max_attempts_default() -> u32 { return 0 }

/// Reconnect delays: `base * multiplier^(attempt - 1)`, capped.
/// `max_attempts == 0` retries forever.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct BackoffPolicy {
    #[serde(default="backoff_base_default")]
    pub base_ms: u64,
    #[serde(default="backoff_multiplier_default")]
    pub multiplier: f64,
    #[serde(default="backoff_cap_default")]
    pub cap_ms: u64,
    #[serde(default="backoff_max_attempts_default")]
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        return BackoffPolicy {
            base_ms: backoff_base_default(),
            multiplier: backoff_multiplier_default(),
            cap_ms: backoff_cap_default(),
            max_attempts: backoff_max_attempts_default(),
        };
    }
}

impl BackoffPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = self.multiplier.max(1.0).powi(exponent);
        let delay = (self.base_ms as f64 * factor).min(self.cap_ms as f64);
        Duration::from_millis(delay as u64)
    }
}

/// Attempt counter driven by a policy.
#[derive(Debug)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        return Backoff { policy, attempt: 0 };
    }

    /// Delay before the next attempt, `None` once the attempts are used up.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.policy.max_attempts != 0 && self.attempt >= self.policy.max_attempts {
            return None;
        }
        self.attempt += 1;
        Some(self.policy.delay_for(self.attempt))
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
