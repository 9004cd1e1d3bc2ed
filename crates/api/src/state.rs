//! Application state

use std::sync::Arc;

use chatgate_billing::BillingService;
use chatgate_shared::RequestGate;

use crate::{
    auth::{IdentityProvider, IdentityResolver},
    chat::ChatBackend,
    config::Config,
    gate::FeatureGate,
};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub billing: Arc<BillingService>,
    pub identity: IdentityResolver,
    /// Admission pipeline for the chat endpoint
    pub gate: FeatureGate,
    /// Shared with the gate; kept here for periodic cleanup
    pub rate_limiter: RequestGate,
    pub chat: Arc<dyn ChatBackend>,
}

impl AppState {
    pub fn new(
        config: Config,
        billing: Arc<BillingService>,
        identity_provider: Arc<dyn IdentityProvider>,
        chat: Arc<dyn ChatBackend>,
    ) -> Self {
        let identity = IdentityResolver::new(identity_provider, config.session_cookie_name.clone());

        let rate_limiter = RequestGate::new_in_memory();
        tracing::info!(
            limit = config.chat_rate_limit,
            window_secs = config.chat_rate_window.as_secs(),
            "Rate limiter initialized"
        );

        let gate = FeatureGate::new(rate_limiter.clone(), identity.clone(), billing.clone())
            .with_rate_limit(config.chat_rate_limit, config.chat_rate_window)
            .with_upstream_timeout(config.upstream_timeout);

        Self {
            config: Arc::new(config),
            billing,
            identity,
            gate,
            rate_limiter,
            chat,
        }
    }
}
