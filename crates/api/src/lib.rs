// API crate clippy configuration
#![allow(clippy::single_match)] // Clearer in some cases
#![allow(clippy::needless_borrows_for_generic_args)] // Sometimes needed for clarity
// Test code patterns:
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Chatgate API Library
//!
//! HTTP surface for the subscription-gated chat feature: identity resolution,
//! the admission gate, billing routes and the webhook receiver.

pub mod auth;
pub mod chat;
pub mod config;
pub mod error;
pub mod gate;
pub mod routes;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use gate::{FeatureGate, GateOutcome};
pub use routes::create_router;
pub use state::AppState;
