#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # Turnstile
//!
//! Per-client token-bucket admission control for HTTP services.
//!
//! ## Features
//!
//! - **Token buckets** with continuous, lazy refill and fractional rates
//! - **Per-client policies** with a default and runtime-swappable overrides
//! - **Bucket registry** creating exactly one bucket per client, on first use
//! - **Tower middleware** answering 429 (or 401 without a bearer identity)
//!   before the protected service is reached
//! - **Injectable clock** for deterministic tests
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use turnstile::{ClientIdentity, KeyedTokenBucket, Policy, PolicyTable, RateLimiter};
//!
//! let policies = PolicyTable::new(Policy::new(5, 1.0).unwrap())
//!     .with_override(ClientIdentity::new("1").unwrap(), Policy::new(5, 0.5).unwrap());
//! let limiter = Arc::new(KeyedTokenBucket::new(policies));
//!
//! let client = ClientIdentity::new("1").unwrap();
//! assert!(limiter.check(&client).is_allowed());
//!
//! // Serve `GET /foo` behind the limiter.
//! let app = turnstile::server::router(limiter);
//! # let _ = app;
//! ```

pub mod clock;
pub mod config;
pub mod identity;
pub mod policy;
pub mod rate_limit;
pub mod server;
pub mod sweeper;

// Re-exports
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{Config, ConfigError};
pub use identity::{ClientIdentity, IdentityError};
pub use policy::{Policy, PolicyError, PolicyResolver, PolicyTable};
pub use rate_limit::{
    BucketRegistry, Decision, KeyedTokenBucket, RateLimitLayer, RateLimitService, RateLimiter,
    TokenBucket,
};
pub use server::{Server, ServerError};
