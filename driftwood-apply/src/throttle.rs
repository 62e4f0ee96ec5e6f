//! Client-side throttling towards the target API.
//!
//! [`ThrottledTarget`] wraps any [`TargetApi`]: every call first takes a
//! token from a shared bucket (`qps` refill, `burst` capacity), and
//! target-side `Throttled` answers are retried with doubling backoff up to
//! [`MAX_THROTTLE_RETRIES`] times before being surfaced.

use std::num::NonZeroU32;
use std::thread::sleep;
use std::time::Duration;

use governor::clock::{Clock, DefaultClock};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use serde_json::Value;

use driftwood_core::{ObjectId, ThrottleConfig};

use crate::error::TargetError;
use crate::target::{ListSelector, TargetApi};

pub const MAX_THROTTLE_RETRIES: u32 = 3;

const DEFAULT_RETRY_BASE: Duration = Duration::from_millis(200);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Token bucket over a direct (unkeyed) governor limiter. A non-positive
/// `qps` disables limiting.
pub struct TokenBucket {
    limiter: Option<DefaultDirectRateLimiter>,
    clock: DefaultClock,
}

impl TokenBucket {
    pub fn new(config: &ThrottleConfig) -> Self {
        let burst = NonZeroU32::new(config.burst).unwrap_or(NonZeroU32::MIN);
        let limiter = (config.qps.is_finite() && config.qps > 0.0)
            .then(|| Duration::from_secs_f64(1.0 / config.qps))
            .and_then(Quota::with_period)
            .map(|quota| RateLimiter::direct(quota.allow_burst(burst)));
        Self {
            limiter,
            clock: DefaultClock::default(),
        }
    }

    /// Take a token if one is available; otherwise return how long until
    /// the next one is.
    pub fn try_take(&self) -> Result<(), Duration> {
        let Some(limiter) = &self.limiter else {
            return Ok(());
        };
        limiter
            .check()
            .map_err(|not_until| not_until.wait_time_from(self.clock.now()))
    }

    pub fn acquire(&self) {
        while let Err(wait) = self.try_take() {
            tracing::trace!("throttle: waiting {:?}", wait);
            sleep(wait);
        }
    }
}

/// A target behind a client-side rate limit.
pub struct ThrottledTarget<T: TargetApi> {
    inner: T,
    bucket: TokenBucket,
    retry_base: Duration,
}

impl<T: TargetApi> ThrottledTarget<T> {
    pub fn new(inner: T, config: &ThrottleConfig) -> Self {
        Self {
            inner,
            bucket: TokenBucket::new(config),
            retry_base: DEFAULT_RETRY_BASE,
        }
    }

    /// Override the first retry delay after a target-side `Throttled`.
    pub fn with_retry_base(mut self, base: Duration) -> Self {
        self.retry_base = base;
        self
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }

    fn call<R>(&self, mut op: impl FnMut(&T) -> Result<R, TargetError>) -> Result<R, TargetError> {
        let mut attempt = 0;
        loop {
            self.bucket.acquire();
            match op(&self.inner) {
                Err(TargetError::Throttled(id)) if attempt < MAX_THROTTLE_RETRIES => {
                    let delay = self
                        .retry_base
                        .saturating_mul(1 << attempt)
                        .min(MAX_RETRY_DELAY);
                    attempt += 1;
                    tracing::debug!("target throttled {id}; retry {attempt} in {delay:?}");
                    sleep(delay);
                }
                other => return other,
            }
        }
    }
}

impl<T: TargetApi> TargetApi for ThrottledTarget<T> {
    fn get(&self, id: &ObjectId) -> Result<Option<Value>, TargetError> {
        self.call(|t| t.get(id))
    }

    fn create(&self, id: &ObjectId, payload: &Value) -> Result<(), TargetError> {
        self.call(|t| t.create(id, payload))
    }

    fn update(&self, id: &ObjectId, payload: &Value) -> Result<(), TargetError> {
        self.call(|t| t.update(id, payload))
    }

    fn delete(&self, id: &ObjectId) -> Result<(), TargetError> {
        self.call(|t| t.delete(id))
    }

    fn list(&self, selector: &ListSelector) -> Result<Vec<(ObjectId, Value)>, TargetError> {
        self.call(|t| t.list(selector))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::MemoryTarget;
    use driftwood_core::Gvk;
    use serde_json::json;
    use std::time::Instant;

    fn id() -> ObjectId {
        ObjectId::new(Gvk::from_api_version("v1", "ConfigMap"), Some("a".into()), "x")
    }

    #[test]
    fn burst_is_free_then_callers_wait() {
        let bucket = TokenBucket::new(&ThrottleConfig { qps: 10.0, burst: 2 });
        assert_eq!(bucket.try_take(), Ok(()));
        assert_eq!(bucket.try_take(), Ok(()));
        let wait = bucket.try_take().expect_err("burst exhausted");
        assert!(wait > Duration::from_millis(20), "{wait:?}");
        assert!(wait <= Duration::from_millis(100), "{wait:?}");
    }

    #[test]
    fn acquire_blocks_until_the_next_token() {
        let bucket = TokenBucket::new(&ThrottleConfig { qps: 20.0, burst: 1 });
        let started = Instant::now();
        bucket.acquire();
        bucket.acquire();
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn zero_qps_is_unlimited() {
        let bucket = TokenBucket::new(&ThrottleConfig { qps: 0.0, burst: 1 });
        for _ in 0..100 {
            assert_eq!(bucket.try_take(), Ok(()));
        }
    }

    #[test]
    fn target_throttling_is_retried() {
        let target = ThrottledTarget::new(MemoryTarget::new(), &ThrottleConfig::default())
            .with_retry_base(Duration::from_millis(1));
        target.inner().throttle_next(MAX_THROTTLE_RETRIES as usize);
        target.create(&id(), &json!({})).expect("retries absorb throttling");
        assert_eq!(target.inner().ops().creates, 1);
    }

    #[test]
    fn persistent_throttling_surfaces() {
        let target = ThrottledTarget::new(MemoryTarget::new(), &ThrottleConfig::default())
            .with_retry_base(Duration::from_millis(1));
        target.inner().throttle_next(MAX_THROTTLE_RETRIES as usize + 1);
        assert!(matches!(
            target.create(&id(), &json!({})),
            Err(TargetError::Throttled(_))
        ));
    }
}
