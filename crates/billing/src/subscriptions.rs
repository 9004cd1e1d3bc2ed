//! Subscription creation
//!
//! Creates a customer and a "default incomplete" subscription with the billing
//! provider, then works out which confirmation flow the client has to run:
//! confirm the first invoice's payment intent, or collect a card for future
//! charges through a setup intent when nothing is due now.

use std::sync::{Arc, LazyLock};

use chatgate_shared::{Principal, SubscriptionStatus};
use regex::Regex;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::coupons::{CouponValidation, CouponValidator};
use crate::error::{BillingError, BillingResult};
use crate::ledger::LedgerEntry;
use crate::outbox::LedgerOutbox;
use crate::provider::{BillingProvider, ProviderSubscription, SubscriptionParams, PENDING_USER_LINK};

static EMAIL_SHAPE: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$"));

static PRICE_SHAPE: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"^price_[A-Za-z0-9]+$"));

#[derive(Debug, Clone, Deserialize)]
pub struct CreateSubscriptionRequest {
    pub price_id: String,
    pub email: String,
    #[serde(default)]
    pub coupon: Option<String>,
    /// Account the subscription is for; must be the caller's own
    #[serde(default)]
    pub user_id: Option<String>,
}

/// The confirmation flow the client must follow
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind")]
pub enum PaymentResolution {
    ClientSecret {
        secret: String,
        subscription_id: String,
        status: SubscriptionStatus,
    },
    SetupIntent {
        secret: String,
        subscription_id: String,
        status: SubscriptionStatus,
    },
    /// Provider state that fits neither flow
    Unconfirmable,
}

/// Which flow a freshly created subscription calls for
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PaymentBranch {
    ConfirmPayment(String),
    CollectForFuture,
    Unconfirmable,
}

/// Classify a new subscription.
///
/// A payment intent only counts as confirmable when the invoice still has an
/// amount outstanding, so a zero-amount invoice always goes to setup.
pub(crate) fn payment_branch(subscription: &ProviderSubscription) -> PaymentBranch {
    let invoice = subscription.latest_invoice.as_ref();

    let nothing_due = invoice.is_some_and(|i| i.paid || i.amount_due == 0);

    if !nothing_due {
        if let Some(secret) = invoice
            .and_then(|i| i.payment_intent_client_secret.as_deref())
            .filter(|s| !s.is_empty())
        {
            return PaymentBranch::ConfirmPayment(secret.to_string());
        }
    }

    if nothing_due || subscription.status.is_entitled() {
        return PaymentBranch::CollectForFuture;
    }

    PaymentBranch::Unconfirmable
}

fn matches_shape(shape: &LazyLock<Result<Regex, regex::Error>>, value: &str) -> BillingResult<bool> {
    match LazyLock::force(shape) {
        Ok(re) => Ok(re.is_match(value)),
        Err(e) => Err(BillingError::Config(format!("Invalid validation pattern: {e}"))),
    }
}

pub struct SubscriptionOrchestrator {
    provider: Arc<dyn BillingProvider>,
    coupons: CouponValidator,
    outbox: LedgerOutbox,
}

impl SubscriptionOrchestrator {
    pub fn new(provider: Arc<dyn BillingProvider>, outbox: LedgerOutbox) -> Self {
        Self {
            coupons: CouponValidator::new(provider.clone()),
            provider,
            outbox,
        }
    }

    /// Resolve an optional coupon code to the provider's coupon id.
    ///
    /// Runs before any provider object is created so a bad code leaves nothing
    /// behind.
    async fn redeemable_coupon(&self, code: Option<&str>) -> BillingResult<Option<String>> {
        let Some(code) = code.map(str::trim).filter(|c| !c.is_empty()) else {
            return Ok(None);
        };

        match self.coupons.validate(code).await? {
            CouponValidation::Valid(terms) => Ok(Some(terms.id)),
            CouponValidation::NotFound => {
                Err(BillingError::NotFound(format!("Coupon {code} not found")))
            }
            CouponValidation::Expired => {
                Err(BillingError::Validation(format!("Coupon {code} has expired")))
            }
            CouponValidation::ExhaustedRedemptions => Err(BillingError::Validation(format!(
                "Coupon {code} has no redemptions left"
            ))),
            CouponValidation::Invalid => {
                Err(BillingError::Validation(format!("Coupon {code} is not valid")))
            }
        }
    }

    pub async fn create_subscription(
        &self,
        request: &CreateSubscriptionRequest,
        principal: Option<&Principal>,
    ) -> BillingResult<PaymentResolution> {
        let email = request.email.trim();
        let price_id = request.price_id.trim();

        if !matches_shape(&EMAIL_SHAPE, email)? {
            return Err(BillingError::Validation("Invalid email address".to_string()));
        }
        if !matches_shape(&PRICE_SHAPE, price_id)? {
            return Err(BillingError::Validation("Invalid price id".to_string()));
        }

        if let Some(requested) = request.user_id.as_deref() {
            match principal {
                Some(p) if p.id == requested => {}
                Some(p) => {
                    tracing::warn!(
                        principal_id = %p.id,
                        requested_user_id = %requested,
                        "Subscription requested for another user"
                    );
                    return Err(BillingError::Unauthorized(
                        "Cannot create a subscription for another user".to_string(),
                    ));
                }
                None => {
                    return Err(BillingError::Unauthorized(
                        "Sign in to create a subscription for an account".to_string(),
                    ));
                }
            }
        }

        let user_id = principal.map(|p| p.id.clone());
        let user_link = user_id.as_deref().unwrap_or(PENDING_USER_LINK);

        let coupon = self.redeemable_coupon(request.coupon.as_deref()).await?;

        let customer = self.provider.create_customer(email, user_link).await?;

        let subscription = self
            .provider
            .create_subscription(&SubscriptionParams {
                customer_id: customer.id.clone(),
                price_id: price_id.to_string(),
                coupon,
                user_id: user_id.clone(),
            })
            .await?;

        let resolution = match payment_branch(&subscription) {
            PaymentBranch::ConfirmPayment(secret) => PaymentResolution::ClientSecret {
                secret,
                subscription_id: subscription.id.clone(),
                status: subscription.status,
            },
            PaymentBranch::CollectForFuture => {
                match self.provider.create_setup_intent(&customer.id).await? {
                    Some(secret) => PaymentResolution::SetupIntent {
                        secret,
                        subscription_id: subscription.id.clone(),
                        status: subscription.status,
                    },
                    None => {
                        tracing::error!(
                            subscription_id = %subscription.id,
                            customer_id = %customer.id,
                            "Setup intent returned without a client secret"
                        );
                        PaymentResolution::Unconfirmable
                    }
                }
            }
            PaymentBranch::Unconfirmable => {
                tracing::error!(
                    subscription_id = %subscription.id,
                    customer_id = %customer.id,
                    status = %subscription.status,
                    invoice = ?subscription.latest_invoice,
                    "Subscription has no confirmable payment and is not active"
                );
                PaymentResolution::Unconfirmable
            }
        };

        // The row is written even for unconfirmable subscriptions so webhooks
        // have something to reconcile against
        self.outbox.write(pending_entry(&subscription, user_id)).await;

        tracing::info!(
            subscription_id = %subscription.id,
            customer_id = %customer.id,
            status = %subscription.status,
            resolution = resolution.kind(),
            "Subscription created"
        );

        Ok(resolution)
    }
}

impl PaymentResolution {
    pub fn kind(&self) -> &'static str {
        match self {
            PaymentResolution::ClientSecret { .. } => "ClientSecret",
            PaymentResolution::SetupIntent { .. } => "SetupIntent",
            PaymentResolution::Unconfirmable => "Unconfirmable",
        }
    }

    /// Keep a resolution the client can act on; `Unconfirmable` becomes an error
    pub fn confirmable(self) -> BillingResult<Self> {
        match self {
            PaymentResolution::Unconfirmable => Err(BillingError::InvariantViolation(
                "Subscription has no confirmable payment flow".to_string(),
            )),
            resolution => Ok(resolution),
        }
    }
}

fn pending_entry(subscription: &ProviderSubscription, user_id: Option<String>) -> LedgerEntry {
    LedgerEntry {
        billing_subscription_id: subscription.id.clone(),
        billing_customer_id: subscription.customer_id.clone(),
        user_id,
        status: subscription.status,
        price_id: subscription.price_id.clone(),
        current_period_end: subscription
            .current_period_end
            .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok()),
        source_event_time: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::InvoiceSnapshot;

    fn subscription(
        status: SubscriptionStatus,
        invoice: Option<InvoiceSnapshot>,
    ) -> ProviderSubscription {
        ProviderSubscription {
            id: "sub_1".to_string(),
            customer_id: "cus_1".to_string(),
            status,
            price_id: Some("price_123".to_string()),
            current_period_end: None,
            latest_invoice: invoice,
        }
    }

    fn invoice(paid: bool, amount_due: i64, secret: Option<&str>) -> Option<InvoiceSnapshot> {
        Some(InvoiceSnapshot {
            id: Some("in_1".to_string()),
            paid,
            amount_due,
            payment_intent_client_secret: secret.map(str::to_string),
        })
    }

    #[test]
    fn test_outstanding_invoice_confirms_payment() {
        let sub = subscription(
            SubscriptionStatus::Incomplete,
            invoice(false, 1000, Some("pi_secret")),
        );
        assert_eq!(
            payment_branch(&sub),
            PaymentBranch::ConfirmPayment("pi_secret".to_string())
        );
    }

    #[test]
    fn test_zero_amount_never_confirms_payment() {
        for status in [SubscriptionStatus::Incomplete, SubscriptionStatus::Active] {
            let sub = subscription(status, invoice(false, 0, Some("pi_secret")));
            assert_eq!(payment_branch(&sub), PaymentBranch::CollectForFuture);
        }
    }

    #[test]
    fn test_paid_invoice_collects_for_future() {
        let sub = subscription(SubscriptionStatus::Active, invoice(true, 1000, None));
        assert_eq!(payment_branch(&sub), PaymentBranch::CollectForFuture);
    }

    #[test]
    fn test_trialing_without_invoice_collects_for_future() {
        let sub = subscription(SubscriptionStatus::Trialing, None);
        assert_eq!(payment_branch(&sub), PaymentBranch::CollectForFuture);
    }

    #[test]
    fn test_incomplete_without_secret_is_unconfirmable() {
        let sub = subscription(SubscriptionStatus::Incomplete, invoice(false, 1000, None));
        assert_eq!(payment_branch(&sub), PaymentBranch::Unconfirmable);

        let sub = subscription(SubscriptionStatus::Incomplete, None);
        assert_eq!(payment_branch(&sub), PaymentBranch::Unconfirmable);
    }

    #[test]
    fn test_resolution_serializes_with_kind_tag() {
        let resolution = PaymentResolution::SetupIntent {
            secret: "seti_secret".to_string(),
            subscription_id: "sub_1".to_string(),
            status: SubscriptionStatus::Active,
        };
        let json = serde_json::to_value(&resolution).unwrap();
        assert_eq!(json["kind"], "SetupIntent");
        assert_eq!(json["status"], "active");
        assert_eq!(json["subscription_id"], "sub_1");
    }

    #[test]
    fn test_unconfirmable_is_never_a_success() {
        let err = PaymentResolution::Unconfirmable.confirmable().unwrap_err();
        assert!(matches!(err, BillingError::InvariantViolation(_)));

        let resolution = PaymentResolution::ClientSecret {
            secret: "pi_secret".to_string(),
            subscription_id: "sub_1".to_string(),
            status: SubscriptionStatus::Incomplete,
        };
        assert_eq!(resolution.clone().confirmable().unwrap(), resolution);
    }

    #[test]
    fn test_shapes() {
        assert!(matches_shape(&EMAIL_SHAPE, "a@x.com").unwrap());
        assert!(!matches_shape(&EMAIL_SHAPE, "a@x").unwrap());
        assert!(!matches_shape(&EMAIL_SHAPE, "a b@x.com").unwrap());
        assert!(matches_shape(&PRICE_SHAPE, "price_123").unwrap());
        assert!(!matches_shape(&PRICE_SHAPE, "prod_123").unwrap());
        assert!(!matches_shape(&PRICE_SHAPE, "price_").unwrap());
    }
}
