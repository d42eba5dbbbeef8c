//! Exponential backoff with jitter
//!
//! Every failed attempt doubles the base delay and adds random jitter to
//! prevent thundering herd when many connections drop together. The result
//! is capped at the configured maximum. One success resets the sequence.

use std::time::Duration;

/// Configuration for reconnection attempts
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay of the first attempt in milliseconds (doubles each attempt)
    pub base_delay_ms: u64,
    /// Maximum delay cap in milliseconds (jitter included)
    pub max_delay_ms: u64,
    /// Random jitter upper bound in milliseconds (exclusive, 0 disables)
    pub jitter_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            jitter_ms: 200,
        }
    }
}

/// Backoff state owned by one reconnecting task
#[derive(Debug, Clone)]
pub struct Backoff {
    config: ReconnectConfig,
    attempts: u32,
}

impl Backoff {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            attempts: 0,
        }
    }

    /// Delay before the next attempt; advances the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let jitter = if self.config.jitter_ms > 0 {
            rand::random::<u64>() % self.config.jitter_ms
        } else {
            0
        };
        let exp = self
            .config
            .base_delay_ms
            .saturating_mul(1u64 << self.attempts.min(32));
        let delay_ms = std::cmp::min(exp.saturating_add(jitter), self.config.max_delay_ms);

        self.attempts = self.attempts.saturating_add(1);
        Duration::from_millis(delay_ms)
    }

    /// Back to the base delay after a successful attempt
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Failed attempts since the last reset
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}
