//! Reconnect policy: capped exponential backoff with jitter, an attempt
//! ceiling, and a cooldown after which the cycle starts over.

#![forbid(unsafe_code)]

use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub max_delay: Duration,
    /// Exponent cap: delay grows as `base * 2^min(attempt, max_exponent)`.
    pub max_exponent: u32,
    pub max_attempts: u32,
    pub cooldown: Duration,
    pub jitter_max: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_exponent: 6,
            max_attempts: 10,
            cooldown: Duration::from_secs(300),
            jitter_max: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStep {
    /// Wait `delay` then try again; `attempt` is 1-based.
    Retry { attempt: u32, delay: Duration },
    /// Attempts exhausted: wait out the cooldown, counter already reset.
    Cooldown(Duration),
}

#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: ReconnectPolicy) -> Self { Self { policy, attempt: 0 } }

    pub fn policy(&self) -> &ReconnectPolicy { &self.policy }

    pub fn attempt(&self) -> u32 { self.attempt }

    /// Called after a successful connect.
    pub fn reset(&mut self) { self.attempt = 0; }

    /// Pure delay for a given attempt index and jitter.
    pub fn delay_for(&self, attempt: u32, jitter: Duration) -> Duration {
        let exp = attempt.min(self.policy.max_exponent).min(30);
        let raw = self.policy.base.saturating_mul(1u32 << exp).saturating_add(jitter);
        raw.min(self.policy.max_delay)
    }

    /// Next step after a failed connection; `jitter` should be in `0..=jitter_max`.
    pub fn next_step(&mut self, jitter: Duration) -> BackoffStep {
        if self.attempt >= self.policy.max_attempts {
            self.attempt = 0;
            return BackoffStep::Cooldown(self.policy.cooldown);
        }
        let delay = self.delay_for(self.attempt, jitter.min(self.policy.jitter_max));
        self.attempt += 1;
        BackoffStep::Retry { attempt: self.attempt, delay }
    }
}
