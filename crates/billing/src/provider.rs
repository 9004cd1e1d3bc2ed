//! Billing provider port
//!
//! The orchestrator, coupon validator and entitlement checker talk to the
//! payment provider only through [`BillingProvider`]. The production adapter
//! lives in [`crate::client`]; tests use the in-memory fake from
//! [`crate::testing`].

use async_trait::async_trait;
use chatgate_shared::SubscriptionStatus;

use crate::error::BillingResult;

/// Metadata value used when a customer is created before the caller is known
pub const PENDING_USER_LINK: &str = "pending";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderCustomer {
    pub id: String,
    pub email: Option<String>,
}

/// Parameters for a new subscription in "default incomplete" mode
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionParams {
    pub customer_id: String,
    pub price_id: String,
    pub coupon: Option<String>,
    /// Written to subscription metadata so webhooks can link the row
    pub user_id: Option<String>,
}

/// The parts of the first invoice the orchestrator branches on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvoiceSnapshot {
    pub id: Option<String>,
    pub paid: bool,
    pub amount_due: i64,
    pub payment_intent_client_secret: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSubscription {
    pub id: String,
    pub customer_id: String,
    pub status: SubscriptionStatus,
    pub price_id: Option<String>,
    /// Unix seconds
    pub current_period_end: Option<i64>,
    pub latest_invoice: Option<InvoiceSnapshot>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProviderCoupon {
    pub id: String,
    pub percent_off: Option<f64>,
    pub amount_off: Option<i64>,
    pub currency: Option<String>,
    /// Unix seconds after which the coupon can no longer be redeemed
    pub redeem_by: Option<i64>,
    pub max_redemptions: Option<i64>,
    pub times_redeemed: i64,
    pub valid: bool,
}

#[async_trait]
pub trait BillingProvider: Send + Sync {
    /// Customers whose email matches exactly, at most `limit`
    async fn list_customers_by_email(
        &self,
        email: &str,
        limit: u64,
    ) -> BillingResult<Vec<ProviderCustomer>>;

    /// Whether the customer has at least one subscription in `active` status
    async fn has_active_subscription(&self, customer_id: &str) -> BillingResult<bool>;

    /// Create a customer; `user_link` goes into metadata
    async fn create_customer(&self, email: &str, user_link: &str)
        -> BillingResult<ProviderCustomer>;

    /// Create a subscription with the latest invoice's payment intent expanded
    async fn create_subscription(
        &self,
        params: &SubscriptionParams,
    ) -> BillingResult<ProviderSubscription>;

    /// Create an off-session setup intent, returning its client secret
    async fn create_setup_intent(&self, customer_id: &str) -> BillingResult<Option<String>>;

    /// `Ok(None)` when no coupon with this code exists
    async fn retrieve_coupon(&self, code: &str) -> BillingResult<Option<ProviderCoupon>>;
}
