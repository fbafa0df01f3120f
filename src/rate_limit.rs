//! Rate limiting primitives.
//!
//! This module provides the building blocks for per-client admission control:
//! - [`RateLimiter`]: The core trait for admission decisions.
//! - [`RateLimitLayer`]: Tower middleware that enforces the limit on HTTP requests.
//! - [`Decision`]: The result of a rate limit check (Allowed/Denied).
//!
//! # Architecture
//!
//! The system is designed to be modular:
//! - **Middleware**: `RateLimitLayer` wraps your service. It doesn't know *how* limiting works,
//!   only that it should ask a `RateLimiter` about the caller's identity.
//! - **Logic**: `TokenBucket` (in `bucket`) handles the math for one client.
//! - **State**: `BucketRegistry` (in `registry`) owns one bucket per client, and
//!   `KeyedTokenBucket` (in `strategies`) ties registry, policies and clock together.

use std::sync::Arc;
use std::time::Duration;

use crate::identity::ClientIdentity;

pub mod bucket;
pub mod middleware;
pub mod registry;
pub mod strategies;
pub use bucket::TokenBucket;
pub use middleware::{RateLimitLayer, RateLimitService};
pub use registry::BucketRegistry;
pub use strategies::KeyedTokenBucket;

/// The decision returned by a rate limiter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    /// The request is allowed to proceed.
    Allowed {
        /// Whole tokens left after this acquisition.
        remaining: u32,
    },
    /// The request is denied.
    Denied {
        /// How long until the next token is available.
        /// Used for the `Retry-After` header.
        wait: Duration,
    },
}

impl Decision {
    /// Helper to check if allowed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }
}

/// Core interface for admission decisions.
///
/// Implementations must decide synchronously: a denied request is never
/// queued for later admission.
pub trait RateLimiter: Send + Sync {
    /// Spend one token from `identity`'s budget, if one is available.
    fn check(&self, identity: &ClientIdentity) -> Decision;
}

impl<L: RateLimiter + ?Sized> RateLimiter for Arc<L> {
    fn check(&self, identity: &ClientIdentity) -> Decision {
        (**self).check(identity)
    }
}
