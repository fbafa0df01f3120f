use std::sync::Arc;
use std::time::Duration;

use crate::clock::{Clock, MonotonicClock};
use crate::identity::ClientIdentity;
use crate::policy::PolicyResolver;
use crate::rate_limit::registry::BucketRegistry;
use crate::rate_limit::{Decision, RateLimiter};

/// A token bucket per client identity.
///
/// Looks up (or lazily creates) the caller's bucket in a [`BucketRegistry`]
/// and spends one token at the current clock reading.
#[derive(Debug)]
pub struct KeyedTokenBucket<R> {
    registry: BucketRegistry<R>,
    clock: Arc<dyn Clock>,
}

impl<R> KeyedTokenBucket<R>
where
    R: PolicyResolver,
{
    /// Create a limiter resolving per-client policies through `resolver`.
    pub fn new(resolver: R) -> Self {
        Self { registry: BucketRegistry::new(resolver), clock: Arc::new(MonotonicClock::default()) }
    }

    /// Override the clock (useful for deterministic tests).
    ///
    /// # Example
    /// ```
    /// use std::time::Duration;
    /// use turnstile::{ClientIdentity, KeyedTokenBucket, ManualClock, PolicyTable, RateLimiter};
    ///
    /// let clock = ManualClock::new();
    /// let limiter = KeyedTokenBucket::new(PolicyTable::default()).with_clock(clock.clone());
    /// let client = ClientIdentity::new("2").unwrap();
    /// for _ in 0..5 {
    ///     assert!(limiter.check(&client).is_allowed());
    /// }
    /// assert!(!limiter.check(&client).is_allowed());
    /// clock.advance(Duration::from_secs(1));
    /// assert!(limiter.check(&client).is_allowed());
    /// ```
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// The underlying registry, for inspection and eviction.
    pub fn registry(&self) -> &BucketRegistry<R> {
        &self.registry
    }

    /// Current clock reading in nanoseconds.
    pub fn now_nanos(&self) -> u64 {
        self.clock.now_nanos()
    }

    /// Evict idle, already-full buckets at the current clock reading.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        self.registry.evict_idle(self.now_nanos(), max_idle)
    }
}

impl<R> RateLimiter for KeyedTokenBucket<R>
where
    R: PolicyResolver,
{
    fn check(&self, identity: &ClientIdentity) -> Decision {
        let now = self.now_nanos();
        let bucket = self.registry.get_or_create(identity, now);
        bucket.try_consume(now)
    }
}
