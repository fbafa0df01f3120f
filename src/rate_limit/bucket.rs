use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::policy::Policy;
use crate::rate_limit::Decision;

const NANOS_PER_SEC: f64 = 1_000_000_000.0;

/// A single client's token bucket.
///
/// Refill is lazy: tokens accrue continuously from the elapsed time whenever
/// the bucket is touched, so no background timer is needed and fractional
/// rates are honoured exactly. Each bucket serializes its own
/// refill-then-consume sequence behind a private mutex.
#[derive(Debug)]
pub struct TokenBucket {
    policy: Policy,
    state: Mutex<BucketState>,
}

#[derive(Debug, Clone, Copy)]
struct BucketState {
    tokens: f64,
    last_refill_nanos: u64,
}

impl BucketState {
    /// Credit tokens for the time since the last refill. A clock reading
    /// earlier than the last refill credits nothing and does not move the
    /// refill mark backwards.
    fn refill(&mut self, policy: &Policy, now_nanos: u64) {
        let elapsed_secs = now_nanos.saturating_sub(self.last_refill_nanos) as f64 / NANOS_PER_SEC;
        let capacity = f64::from(policy.capacity());
        self.tokens = (self.tokens + elapsed_secs * policy.refill_rate()).min(capacity);
        self.last_refill_nanos = self.last_refill_nanos.max(now_nanos);
    }
}

impl TokenBucket {
    /// A full bucket whose refill clock starts at `now_nanos`.
    pub fn new(policy: Policy, now_nanos: u64) -> Self {
        Self {
            policy,
            state: Mutex::new(BucketState {
                tokens: f64::from(policy.capacity()),
                last_refill_nanos: now_nanos,
            }),
        }
    }

    /// Refill, then take one token if at least one whole token is available.
    ///
    /// On denial the wait is the time until the bucket reaches one token.
    pub fn try_consume(&self, now_nanos: u64) -> Decision {
        let mut state = self.lock();
        state.refill(&self.policy, now_nanos);

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Decision::Allowed { remaining: state.tokens.floor() as u32 }
        } else {
            let missing = 1.0 - state.tokens;
            // Tiny rates can put the next token beyond what `Duration` holds.
            let wait = Duration::try_from_secs_f64(missing / self.policy.refill_rate())
                .unwrap_or(Duration::MAX);
            Decision::Denied { wait }
        }
    }

    /// Tokens that would be available at `now_nanos`, without mutating.
    pub fn available(&self, now_nanos: u64) -> f64 {
        let mut state = *self.lock();
        state.refill(&self.policy, now_nanos);
        state.tokens
    }

    /// How long the bucket has gone without being touched.
    pub fn idle_for(&self, now_nanos: u64) -> Duration {
        let last = self.lock().last_refill_nanos;
        Duration::from_nanos(now_nanos.saturating_sub(last))
    }

    /// Policy the bucket was created with.
    pub fn policy(&self) -> Policy {
        self.policy
    }

    /// Maximum burst size.
    pub fn capacity(&self) -> u32 {
        self.policy.capacity()
    }

    /// Tokens restored per second.
    pub fn refill_rate(&self) -> f64 {
        self.policy.refill_rate()
    }

    // The state is two plain numbers that are always consistent between
    // statements, so a panic elsewhere cannot leave it half-written.
    fn lock(&self) -> MutexGuard<'_, BucketState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
