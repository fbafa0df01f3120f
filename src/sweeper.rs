//! Background eviction of idle buckets.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::EvictionConfig;
use crate::policy::PolicyResolver;
use crate::rate_limit::KeyedTokenBucket;

/// Periodically drop idle, already-full buckets from `limiter`.
///
/// The task runs until aborted. Dropping the handle does not stop it.
pub fn spawn_idle_sweeper<R>(
    limiter: Arc<KeyedTokenBucket<R>>,
    eviction: EvictionConfig,
) -> JoinHandle<()>
where
    R: PolicyResolver + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(eviction.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; nothing can be idle yet.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let evicted = limiter.evict_idle(eviction.idle_timeout);
            if evicted > 0 {
                tracing::info!(
                    target: "turnstile::sweeper",
                    evicted,
                    remaining = limiter.registry().len(),
                    "evicted idle buckets"
                );
            }
        }
    })
}
