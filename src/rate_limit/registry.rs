//! Registry of per-client token buckets.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::debug;

use crate::identity::ClientIdentity;
use crate::policy::PolicyResolver;
use crate::rate_limit::bucket::TokenBucket;

/// Concurrency-safe map from client identity to its bucket.
///
/// Buckets are created lazily, full, from the resolver's policy for that
/// identity. The map lock only guards lookup and insertion; callers mutate a
/// bucket through the returned `Arc` after the map lock is released, so one
/// client's traffic never waits on another client's bucket.
#[derive(Debug)]
pub struct BucketRegistry<R> {
    resolver: R,
    buckets: RwLock<HashMap<ClientIdentity, Arc<TokenBucket>>>,
}

impl<R> BucketRegistry<R>
where
    R: PolicyResolver,
{
    /// Empty registry resolving new buckets through `resolver`.
    pub fn new(resolver: R) -> Self {
        Self { resolver, buckets: RwLock::new(HashMap::new()) }
    }

    /// The resolver consulted for new buckets.
    pub fn resolver(&self) -> &R {
        &self.resolver
    }

    /// Return the bucket for `identity`, creating it on first use.
    ///
    /// Concurrent first calls for the same identity all receive the same
    /// bucket: insertion re-checks the map under the write lock. The policy
    /// is resolved before the lock is taken, so a failing resolver cannot
    /// poison the map.
    pub fn get_or_create(&self, identity: &ClientIdentity, now_nanos: u64) -> Arc<TokenBucket> {
        if let Some(bucket) = self.get(identity) {
            return bucket;
        }

        let policy = self.resolver.resolve(identity);
        let mut map = self.buckets.write().expect("bucket registry poisoned");
        map.entry(identity.clone())
            .or_insert_with(|| {
                debug!(
                    target: "turnstile::registry",
                    client = %identity,
                    capacity = policy.capacity(),
                    refill_rate = policy.refill_rate(),
                    "bucket created"
                );
                Arc::new(TokenBucket::new(policy, now_nanos))
            })
            .clone()
    }

    /// Existing bucket for `identity`, if any. Never creates.
    pub fn get(&self, identity: &ClientIdentity) -> Option<Arc<TokenBucket>> {
        let map = self.buckets.read().expect("bucket registry poisoned");
        map.get(identity).cloned()
    }

    /// Number of tracked clients.
    pub fn len(&self) -> usize {
        self.buckets.read().expect("bucket registry poisoned").len()
    }

    /// True when no client has been seen yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Available tokens per client at `now_nanos`, sorted by identity.
    pub fn snapshot(&self, now_nanos: u64) -> Vec<(ClientIdentity, f64)> {
        let map = self.buckets.read().expect("bucket registry poisoned");
        let mut entries: Vec<(ClientIdentity, f64)> =
            map.iter().map(|(id, bucket)| (id.clone(), bucket.available(now_nanos))).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Remove buckets idle for at least `max_idle` that have already refilled
    /// to capacity. A dropped bucket would be recreated full on the next
    /// request, which is exactly the state it was in, so eviction is not
    /// observable by clients. Returns the number removed.
    pub fn evict_idle(&self, now_nanos: u64, max_idle: Duration) -> usize {
        let mut map = self.buckets.write().expect("bucket registry poisoned");
        let before = map.len();
        map.retain(|_, bucket| {
            let idle = bucket.idle_for(now_nanos);
            let full = bucket.available(now_nanos) >= f64::from(bucket.capacity());
            // Another request may still hold this bucket; leave it alone.
            let in_use = Arc::strong_count(bucket) > 1;
            in_use || idle < max_idle || !full
        });
        before - map.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{Policy, PolicyTable};

    const SEC: u64 = 1_000_000_000;

    fn id(raw: &str) -> ClientIdentity {
        ClientIdentity::new(raw).unwrap()
    }

    fn registry() -> BucketRegistry<PolicyTable> {
        let table = PolicyTable::new(Policy::new(5, 1.0).unwrap())
            .with_override(id("1"), Policy::new(5, 0.5).unwrap());
        BucketRegistry::new(table)
    }

    #[test]
    fn creates_full_bucket_from_resolved_policy() {
        let reg = registry();
        assert!(reg.is_empty());

        let bucket = reg.get_or_create(&id("1"), 0);
        assert_eq!(bucket.refill_rate(), 0.5);
        assert_eq!(bucket.available(0), 5.0);

        let other = reg.get_or_create(&id("brand-new"), 0);
        assert_eq!(other.refill_rate(), 1.0);
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn returns_same_bucket_on_repeat_lookups() {
        let reg = registry();
        let a = reg.get_or_create(&id("2"), 0);
        let b = reg.get_or_create(&id("2"), 5 * SEC);
        assert!(Arc::ptr_eq(&a, &b));
        assert!(reg.get(&id("missing")).is_none());
    }

    #[test]
    fn policy_changes_only_affect_new_buckets() {
        let reg = registry();
        let before = reg.get_or_create(&id("9"), 0);
        reg.resolver().set_override(id("9"), Policy::new(1, 9.0).unwrap());
        let after = reg.get_or_create(&id("9"), 0);
        assert!(Arc::ptr_eq(&before, &after));
        assert_eq!(after.policy(), Policy::new(5, 1.0).unwrap());

        let newcomer = reg.get_or_create(&id("10"), 0);
        reg.resolver().set_override(id("10"), Policy::new(1, 9.0).unwrap());
        assert_eq!(newcomer.policy(), Policy::default());
        reg.resolver().set_override(id("11"), Policy::new(1, 9.0).unwrap());
        assert_eq!(reg.get_or_create(&id("11"), 0).policy(), Policy::new(1, 9.0).unwrap());
    }

    #[derive(Debug)]
    struct FlakyResolver;

    impl PolicyResolver for FlakyResolver {
        fn resolve(&self, identity: &ClientIdentity) -> Policy {
            if identity.as_str() == "boom" {
                panic!("resolver backend unavailable");
            }
            Policy::default()
        }
    }

    #[test]
    fn panicking_resolver_leaves_registry_usable() {
        let reg = BucketRegistry::new(FlakyResolver);
        reg.get_or_create(&id("steady"), 0);

        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            reg.get_or_create(&id("boom"), 0)
        }));
        assert!(outcome.is_err());

        assert!(reg.get(&id("boom")).is_none());
        assert!(reg.get_or_create(&id("late"), 0).try_consume(0).is_allowed());
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn snapshot_is_sorted_by_identity() {
        let reg = registry();
        for raw in ["b", "a", "c"] {
            reg.get_or_create(&id(raw), 0).try_consume(0);
        }
        let snap = reg.snapshot(0);
        let ids: Vec<&str> = snap.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, ["a", "b", "c"]);
        assert!(snap.iter().all(|(_, tokens)| *tokens == 4.0));
    }

    #[test]
    fn eviction_skips_buckets_that_are_not_yet_full() {
        let reg = registry();
        let slow = reg.get_or_create(&id("1"), 0);
        while slow.try_consume(0).is_allowed() {}
        drop(slow);
        reg.get_or_create(&id("2"), 0).try_consume(0);

        // Client "2" refilled after 1s; client "1" needs 10s.
        assert_eq!(reg.evict_idle(5 * SEC, Duration::from_secs(2)), 1);
        assert!(reg.get(&id("2")).is_none());
        assert!(reg.get(&id("1")).is_some());

        assert_eq!(reg.evict_idle(10 * SEC, Duration::from_secs(2)), 1);
        assert!(reg.is_empty());
    }

    #[test]
    fn eviction_respects_idle_threshold_and_live_handles() {
        let reg = registry();
        let held = reg.get_or_create(&id("held"), 0);
        reg.get_or_create(&id("fresh"), 0);

        assert_eq!(reg.evict_idle(SEC, Duration::from_secs(60)), 0);
        assert_eq!(reg.evict_idle(120 * SEC, Duration::from_secs(60)), 1);
        assert!(reg.get(&id("held")).is_some());
        drop(held);
    }
}
