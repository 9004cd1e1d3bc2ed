//! Authentication for Chatgate
//!
//! Credentials are never required at this layer; handlers decide what an
//! absent principal means.

pub mod identity;
pub mod resolver;

#[cfg(test)]
pub use identity::StaticIdentityProvider;
pub use identity::{HttpIdentityProvider, IdentityError, IdentityProvider};
pub use resolver::IdentityResolver;
