//! Admission pipeline for the paid feature
//!
//! Rate limit by client IP, then identity, then email presence, then a live
//! entitlement check. Each stage short-circuits with its own outcome.

use std::sync::Arc;
use std::time::Duration;

use axum::http::HeaderMap;
use chatgate_billing::{BillingError, BillingService};
use chatgate_shared::{Principal, RequestGate};

use crate::auth::IdentityResolver;
use crate::error::{ApiError, ApiResult};

const DEFAULT_LIMIT: u32 = 60;
const DEFAULT_WINDOW: Duration = Duration::from_secs(60);
const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq)]
pub enum GateOutcome {
    Allowed(Principal),
    RateLimited { retry_after_secs: u64 },
    LoginRequired,
    EmailRequired,
    SubscriptionRequired,
}

impl GateOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            GateOutcome::Allowed(_) => "allowed",
            GateOutcome::RateLimited { .. } => "rate_limited",
            GateOutcome::LoginRequired => "login_required",
            GateOutcome::EmailRequired => "email_required",
            GateOutcome::SubscriptionRequired => "subscription_required",
        }
    }

    /// The admitted principal, or the refusal as an error response
    pub fn into_principal(self) -> ApiResult<Principal> {
        match self {
            GateOutcome::Allowed(principal) => Ok(principal),
            GateOutcome::RateLimited { retry_after_secs } => {
                Err(ApiError::RateLimited { retry_after_secs })
            }
            GateOutcome::LoginRequired => Err(ApiError::LoginRequired),
            GateOutcome::EmailRequired => Err(ApiError::EmailRequired),
            GateOutcome::SubscriptionRequired => Err(ApiError::SubscriptionRequired),
        }
    }
}

#[derive(Clone)]
pub struct FeatureGate {
    limiter: RequestGate,
    limit: u32,
    window: Duration,
    identity: IdentityResolver,
    billing: Arc<BillingService>,
    upstream_timeout: Duration,
}

impl FeatureGate {
    pub fn new(limiter: RequestGate, identity: IdentityResolver, billing: Arc<BillingService>) -> Self {
        Self {
            limiter,
            limit: DEFAULT_LIMIT,
            window: DEFAULT_WINDOW,
            identity,
            billing,
            upstream_timeout: DEFAULT_UPSTREAM_TIMEOUT,
        }
    }

    pub fn with_rate_limit(mut self, limit: u32, window: Duration) -> Self {
        self.limit = limit;
        self.window = window;
        self
    }

    pub fn with_upstream_timeout(mut self, timeout: Duration) -> Self {
        self.upstream_timeout = timeout;
        self
    }

    /// Decide whether a request may use the feature.
    ///
    /// Refusals are `Ok` outcomes; `Err` means the entitlement check itself
    /// failed or timed out.
    pub async fn check(&self, client_ip: &str, headers: &HeaderMap) -> ApiResult<GateOutcome> {
        let rate = self.limiter.check(client_ip, self.limit, self.window).await;
        if !rate.allowed {
            tracing::info!(client_ip = %client_ip, "Feature request rate limited");
            return Ok(GateOutcome::RateLimited {
                retry_after_secs: rate.retry_after_seconds().unwrap_or(1),
            });
        }

        let Some(principal) = self.identity.resolve(headers).await else {
            return Ok(GateOutcome::LoginRequired);
        };

        if principal.email().is_none() {
            return Ok(GateOutcome::EmailRequired);
        }

        let check = self.billing.entitlement.has_active_subscription(&principal);
        let active = match tokio::time::timeout(self.upstream_timeout, check).await? {
            Ok(active) => active,
            Err(BillingError::EmailRequired) => return Ok(GateOutcome::EmailRequired),
            Err(e) => {
                tracing::warn!(user_id = %principal.id, error = %e, "Entitlement check failed");
                return Err(e.into());
            }
        };

        if !active {
            tracing::debug!(user_id = %principal.id, "No active subscription");
            return Ok(GateOutcome::SubscriptionRequired);
        }

        Ok(GateOutcome::Allowed(principal))
    }
}
