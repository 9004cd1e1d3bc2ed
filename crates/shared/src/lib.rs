// Test code patterns:
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Chatgate Shared Types
//!
//! Types and primitives shared by the billing and api crates:
//!
//! - **Principal**: resolved caller identity
//! - **SubscriptionStatus**: the ledger's status vocabulary
//! - **RequestGate**: per-key token bucket rate limiter
//! - **Database**: Postgres pool and migration helpers

pub mod db;
pub mod rate_limit;
pub mod types;

pub use db::{create_pool, run_migrations};
pub use rate_limit::{RateLimitResult, RequestGate};
pub use types::{Principal, SubscriptionStatus, UnknownStatus};
