//! Per-client bucket policies and their resolution.
//!
//! A [`Policy`] fixes a bucket's burst size and sustained rate. A
//! [`PolicyResolver`] maps identities to policies; [`PolicyTable`] is the
//! in-memory resolver with a default and per-client overrides that can be
//! swapped at runtime.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::identity::ClientIdentity;

/// Validated bucket configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Policy {
    capacity: u32,
    refill_rate: f64,
}

/// Errors produced when validating a policy.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PolicyError {
    /// Capacity must be > 0.
    #[error("capacity must be > 0 (got {provided})")]
    InvalidCapacity {
        /// Value provided by caller.
        provided: u32,
    },
    /// Refill rate must be finite and > 0.
    #[error("refill_rate must be a finite number > 0 (got {provided})")]
    InvalidRefillRate {
        /// Value provided by caller.
        provided: f64,
    },
}

impl Policy {
    /// Create a policy with validation.
    ///
    /// # Examples
    /// ```
    /// use turnstile::Policy;
    /// let policy = Policy::new(5, 0.5).unwrap();
    /// assert_eq!(policy.capacity(), 5);
    /// assert!(Policy::new(0, 1.0).is_err());
    /// ```
    pub fn new(capacity: u32, refill_rate: f64) -> Result<Self, PolicyError> {
        if capacity == 0 {
            return Err(PolicyError::InvalidCapacity { provided: capacity });
        }
        if !refill_rate.is_finite() || refill_rate <= 0.0 {
            return Err(PolicyError::InvalidRefillRate { provided: refill_rate });
        }
        Ok(Self { capacity, refill_rate })
    }

    /// Maximum burst size.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Tokens restored per second.
    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }
}

impl Default for Policy {
    /// Five-request burst, one request per second sustained.
    fn default() -> Self {
        Self { capacity: 5, refill_rate: 1.0 }
    }
}

/// Maps a client identity to its policy.
pub trait PolicyResolver: Send + Sync + std::fmt::Debug {
    /// Never fails: identities without an override get the default.
    fn resolve(&self, identity: &ClientIdentity) -> Policy;
}

impl<R: PolicyResolver + ?Sized> PolicyResolver for Arc<R> {
    fn resolve(&self, identity: &ClientIdentity) -> Policy {
        (**self).resolve(identity)
    }
}

type Overrides = HashMap<ClientIdentity, Policy>;

/// Default policy plus per-client overrides.
///
/// Reads take a lock-free snapshot of the override map. Updates copy the map
/// and swap it in, so they only affect buckets created afterwards. Clones
/// share the same override map.
#[derive(Debug, Clone)]
pub struct PolicyTable {
    default: Policy,
    overrides: Arc<ArcSwap<Overrides>>,
}

impl PolicyTable {
    /// Table with no overrides.
    pub fn new(default: Policy) -> Self {
        Self { default, overrides: Arc::new(ArcSwap::from_pointee(HashMap::new())) }
    }

    /// Builder-style override, for wiring at startup.
    pub fn with_override(self, identity: ClientIdentity, policy: Policy) -> Self {
        self.set_override(identity, policy);
        self
    }

    /// Insert or replace the override for `identity`.
    pub fn set_override(&self, identity: ClientIdentity, policy: Policy) {
        self.overrides.rcu(|current| {
            let mut next = Overrides::clone(current);
            next.insert(identity.clone(), policy);
            next
        });
        tracing::debug!(
            target: "turnstile::policy",
            client = %identity,
            capacity = policy.capacity(),
            refill_rate = policy.refill_rate(),
            "policy override set"
        );
    }

    /// Drop the override for `identity`; returns the removed policy.
    pub fn remove_override(&self, identity: &ClientIdentity) -> Option<Policy> {
        let mut removed = None;
        self.overrides.rcu(|current| {
            let mut next = Overrides::clone(current);
            removed = next.remove(identity);
            next
        });
        removed
    }

    /// The fallback policy.
    pub fn default_policy(&self) -> Policy {
        self.default
    }

    /// Number of configured overrides.
    pub fn override_count(&self) -> usize {
        self.overrides.load().len()
    }
}

impl Default for PolicyTable {
    fn default() -> Self {
        Self::new(Policy::default())
    }
}

impl PolicyResolver for PolicyTable {
    fn resolve(&self, identity: &ClientIdentity) -> Policy {
        self.overrides.load().get(identity).copied().unwrap_or(self.default)
    }
}
