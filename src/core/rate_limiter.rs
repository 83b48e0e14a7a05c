//! Per-key token bucket admission control

use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use std::num::NonZeroU32;
use std::time::Duration;
use tracing::debug;

use crate::core::errors::{GatewayError, Result};

/// Keyed token bucket limiter
///
/// One bucket per key, created lazily on first use with the fixed
/// `(rate, burst)` given at construction. Buckets live in a sharded map, so
/// calls for different keys never contend on the same lock.
pub struct KeyedRateLimiter {
    limiter: DefaultKeyedRateLimiter<String>,
    rate: f64,
    burst: u32,
}

impl KeyedRateLimiter {
    /// Create a limiter refilling `rate` tokens per second up to `burst`
    pub fn new(rate: f64, burst: u32) -> Result<Self> {
        if rate <= 0.0 || !rate.is_finite() {
            return Err(GatewayError::Config {
                message: format!("rate must be positive, got {}", rate),
            });
        }
        let burst_size = NonZeroU32::new(burst).ok_or_else(|| GatewayError::Config {
            message: "burst must be greater than 0".to_string(),
        })?;

        let period = Duration::from_secs_f64(1.0 / rate);
        let quota = Quota::with_period(period)
            .ok_or_else(|| GatewayError::Config {
                message: format!("rate {} is too high", rate),
            })?
            .allow_burst(burst_size);

        Ok(Self {
            limiter: RateLimiter::keyed(quota),
            rate,
            burst,
        })
    }

    /// Try to take one token for `key` without waiting
    pub fn allow(&self, key: &str) -> bool {
        match self.limiter.check_key(&key.to_string()) {
            Ok(()) => true,
            Err(_) => {
                debug!(key = key, "Rate limit exceeded");
                false
            }
        }
    }

    /// Number of keys seen so far
    pub fn tracked_keys(&self) -> usize {
        self.limiter.len()
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn burst(&self) -> u32 {
        self.burst
    }
}

impl std::fmt::Debug for KeyedRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyedRateLimiter")
            .field("rate", &self.rate)
            .field("burst", &self.burst)
            .finish()
    }
}
