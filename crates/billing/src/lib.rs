// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Chatgate Billing Module
//!
//! Everything that talks to the billing provider or owns subscription state.
//!
//! ## Features
//!
//! - **Subscription Creation**: customer + subscription, resolved into a payment
//!   confirmation flow the client can act on
//! - **Coupons**: existence, expiry and redemption-cap checks
//! - **Entitlement**: live active-subscription lookup by email
//! - **Ledger**: local projection of subscription state
//! - **Webhooks**: signed, idempotent, order-safe event reconciliation

pub mod client;
pub mod coupons;
pub mod entitlement;
pub mod error;
pub mod events;
pub mod ledger;
pub mod outbox;
pub mod provider;
pub mod signature;
pub mod subscriptions;
pub mod webhooks;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;


// Client
pub use client::{StripeClient, StripeConfig};

// Coupons
pub use coupons::{CouponTerms, CouponValidation, CouponValidator};

// Entitlement
pub use entitlement::EntitlementChecker;

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use events::{BillingEvent, BillingEventType};

// Ledger
pub use ledger::{
    InMemoryLedgerStore, LedgerChange, LedgerEntry, LedgerStore, PgLedgerStore,
    SubscriptionRecord, WriteOutcome,
};

// Outbox
pub use outbox::{LedgerOutbox, OutboxWrite, RetryPolicy};

// Provider
pub use provider::{BillingProvider, ProviderCoupon, ProviderCustomer, ProviderSubscription};

// Signature
pub use signature::SignatureVerifier;

// Subscriptions
pub use subscriptions::{CreateSubscriptionRequest, PaymentResolution, SubscriptionOrchestrator};

// Webhooks
pub use webhooks::{ReconcileOutcome, WebhookReconciler};

use std::sync::Arc;

/// Tunables that are not provider credentials
#[derive(Debug, Clone, Default)]
pub struct BillingOptions {
    /// Let the ledger confirm entitlement before the live provider check
    pub ledger_fast_path: bool,
    pub retry_policy: RetryPolicy,
}

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub coupons: CouponValidator,
    pub entitlement: EntitlementChecker,
    pub subscriptions: SubscriptionOrchestrator,
    pub webhooks: WebhookReconciler,
    pub ledger: Arc<dyn LedgerStore>,
}

impl BillingService {
    /// Create a new billing service backed by Stripe, configured from environment variables
    pub fn from_env(ledger: Arc<dyn LedgerStore>, options: BillingOptions) -> BillingResult<Self> {
        let stripe = StripeClient::from_env()?;
        let webhook_secret = stripe.config().webhook_secret.clone();
        Ok(Self::new(Arc::new(stripe), ledger, &webhook_secret, options))
    }

    /// Create a new billing service over any provider
    pub fn new(
        provider: Arc<dyn BillingProvider>,
        ledger: Arc<dyn LedgerStore>,
        webhook_secret: &str,
        options: BillingOptions,
    ) -> Self {
        let mut entitlement = EntitlementChecker::new(provider.clone());
        if options.ledger_fast_path {
            entitlement = entitlement.with_ledger_fast_path(ledger.clone());
        }

        let outbox = LedgerOutbox::new(ledger.clone()).with_policy(options.retry_policy);

        Self {
            coupons: CouponValidator::new(provider.clone()),
            entitlement,
            subscriptions: SubscriptionOrchestrator::new(provider, outbox),
            webhooks: WebhookReconciler::new(SignatureVerifier::new(webhook_secret), ledger.clone()),
            ledger,
        }
    }
}
