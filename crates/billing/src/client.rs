//! Stripe client wrapper and the production [`BillingProvider`] adapter

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chatgate_shared::SubscriptionStatus;
use stripe::{
    Coupon, CouponId, CreateCustomer, CreateSetupIntent,
    CreateSubscription, CreateSubscriptionItems, CreateSubscriptionPaymentSettings,
    CreateSubscriptionPaymentSettingsPaymentMethodTypes,
    CreateSubscriptionPaymentSettingsSaveDefaultPaymentMethod, Customer, CustomerId, Expandable,
    Invoice, ListCustomers, ListSubscriptions, SetupIntent, StripeError, Subscription,
    SubscriptionPaymentBehavior, SubscriptionStatus as StripeSubStatus, SubscriptionStatusFilter,
};

use crate::error::{BillingError, BillingResult};
use crate::provider::{
    BillingProvider, InvoiceSnapshot, ProviderCoupon, ProviderCustomer, ProviderSubscription,
    SubscriptionParams,
};

/// Stripe credentials and request settings
#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    /// Upper bound on a single provider call
    pub request_timeout: Duration,
}

impl StripeConfig {
    /// Load from `STRIPE_SECRET_KEY`, `STRIPE_WEBHOOK_SECRET` and
    /// `UPSTREAM_TIMEOUT_SECS` (default 30)
    pub fn from_env() -> BillingResult<Self> {
        let secret_key = std::env::var("STRIPE_SECRET_KEY")
            .map_err(|_| BillingError::Config("STRIPE_SECRET_KEY not set".to_string()))?;
        let webhook_secret = std::env::var("STRIPE_WEBHOOK_SECRET")
            .map_err(|_| BillingError::Config("STRIPE_WEBHOOK_SECRET not set".to_string()))?;
        let timeout_secs = match std::env::var("UPSTREAM_TIMEOUT_SECS") {
            Ok(raw) => raw.parse::<u64>().map_err(|_| {
                BillingError::Config(format!("UPSTREAM_TIMEOUT_SECS is not a number: {raw}"))
            })?,
            Err(_) => 30,
        };

        Ok(Self {
            secret_key,
            webhook_secret,
            request_timeout: Duration::from_secs(timeout_secs),
        })
    }
}

#[derive(Clone)]
pub struct StripeClient {
    inner: stripe::Client,
    config: Arc<StripeConfig>,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        let inner = stripe::Client::new(config.secret_key.clone());
        Self {
            inner,
            config: Arc::new(config),
        }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?))
    }

    pub fn inner(&self) -> &stripe::Client {
        &self.inner
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }

    async fn bounded<T, F>(&self, call: F) -> BillingResult<T>
    where
        F: Future<Output = Result<T, StripeError>>,
    {
        match tokio::time::timeout(self.config.request_timeout, call).await {
            Ok(result) => result.map_err(BillingError::from),
            Err(_) => Err(BillingError::UpstreamTimeout),
        }
    }
}

impl std::fmt::Debug for StripeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripeClient")
            .field("request_timeout", &self.config.request_timeout)
            .finish_non_exhaustive()
    }
}

fn parse_customer_id(raw: &str) -> BillingResult<CustomerId> {
    raw.parse::<CustomerId>()
        .map_err(|e| BillingError::Validation(format!("Invalid customer id {raw}: {e}")))
}

fn map_status(status: StripeSubStatus) -> SubscriptionStatus {
    match status {
        StripeSubStatus::Active => SubscriptionStatus::Active,
        StripeSubStatus::Trialing => SubscriptionStatus::Trialing,
        StripeSubStatus::Incomplete => SubscriptionStatus::Incomplete,
        StripeSubStatus::PastDue | StripeSubStatus::Unpaid | StripeSubStatus::Paused => {
            SubscriptionStatus::PastDue
        }
        StripeSubStatus::Canceled | StripeSubStatus::IncompleteExpired => {
            SubscriptionStatus::Canceled
        }
    }
}

fn invoice_snapshot(invoice: &Invoice) -> InvoiceSnapshot {
    let payment_intent_client_secret = match invoice.payment_intent.as_ref() {
        Some(Expandable::Object(intent)) => intent.client_secret.clone(),
        _ => None,
    };

    InvoiceSnapshot {
        id: Some(invoice.id.to_string()),
        paid: invoice.paid.unwrap_or(false),
        amount_due: invoice.amount_due.unwrap_or(0),
        payment_intent_client_secret,
    }
}

fn subscription_snapshot(subscription: &Subscription) -> ProviderSubscription {
    let latest_invoice = match subscription.latest_invoice.as_ref() {
        Some(Expandable::Object(invoice)) => Some(invoice_snapshot(invoice)),
        Some(Expandable::Id(id)) => {
            tracing::warn!(
                subscription_id = %subscription.id,
                invoice_id = %id,
                "Latest invoice was not expanded"
            );
            None
        }
        None => None,
    };

    let price_id = subscription
        .items
        .data
        .first()
        .and_then(|item| item.price.as_ref())
        .map(|price| price.id.to_string());

    ProviderSubscription {
        id: subscription.id.to_string(),
        customer_id: subscription.customer.id().to_string(),
        status: map_status(subscription.status),
        price_id,
        current_period_end: Some(subscription.current_period_end),
        latest_invoice,
    }
}

fn coupon_snapshot(coupon: &Coupon) -> ProviderCoupon {
    ProviderCoupon {
        id: coupon.id.to_string(),
        percent_off: coupon.percent_off,
        amount_off: coupon.amount_off,
        currency: coupon.currency.map(|c| c.to_string()),
        redeem_by: coupon.redeem_by,
        max_redemptions: coupon.max_redemptions,
        times_redeemed: coupon.times_redeemed.unwrap_or(0),
        valid: coupon.valid.unwrap_or(false) && !coupon.deleted,
    }
}

#[async_trait]
impl BillingProvider for StripeClient {
    async fn list_customers_by_email(
        &self,
        email: &str,
        limit: u64,
    ) -> BillingResult<Vec<ProviderCustomer>> {
        let mut params = ListCustomers::new();
        params.email = Some(email);
        params.limit = Some(limit);

        let customers = self.bounded(Customer::list(&self.inner, &params)).await?;

        Ok(customers
            .data
            .into_iter()
            .map(|customer| ProviderCustomer {
                id: customer.id.to_string(),
                email: customer.email,
            })
            .collect())
    }

    async fn has_active_subscription(&self, customer_id: &str) -> BillingResult<bool> {
        let params = ListSubscriptions {
            customer: Some(parse_customer_id(customer_id)?),
            status: Some(SubscriptionStatusFilter::Active),
            limit: Some(1),
            ..Default::default()
        };

        let subscriptions = self.bounded(Subscription::list(&self.inner, &params)).await?;
        Ok(!subscriptions.data.is_empty())
    }

    async fn create_customer(
        &self,
        email: &str,
        user_link: &str,
    ) -> BillingResult<ProviderCustomer> {
        let mut metadata = HashMap::new();
        metadata.insert("user_id".to_string(), user_link.to_string());

        let params = CreateCustomer {
            email: Some(email),
            metadata: Some(metadata),
            ..Default::default()
        };

        let customer = self.bounded(Customer::create(&self.inner, params)).await?;

        tracing::info!(customer_id = %customer.id, "Created billing customer");

        Ok(ProviderCustomer {
            id: customer.id.to_string(),
            email: customer.email,
        })
    }

    async fn create_subscription(
        &self,
        params: &SubscriptionParams,
    ) -> BillingResult<ProviderSubscription> {
        let customer_id = parse_customer_id(&params.customer_id)?;

        let mut create = CreateSubscription::new(customer_id);
        create.items = Some(vec![CreateSubscriptionItems {
            price: Some(params.price_id.clone()),
            ..Default::default()
        }]);
        create.payment_behavior = Some(SubscriptionPaymentBehavior::DefaultIncomplete);
        create.payment_settings = Some(CreateSubscriptionPaymentSettings {
            payment_method_types: Some(vec![
                CreateSubscriptionPaymentSettingsPaymentMethodTypes::Card,
            ]),
            save_default_payment_method: Some(
                CreateSubscriptionPaymentSettingsSaveDefaultPaymentMethod::OnSubscription,
            ),
            ..Default::default()
        });
        create.expand = &["latest_invoice.payment_intent"];

        if let Some(code) = params.coupon.as_deref() {
            let coupon_id = code
                .parse::<CouponId>()
                .map_err(|e| BillingError::Validation(format!("Invalid coupon code: {e}")))?;
            create.coupon = Some(coupon_id);
        }

        if let Some(user_id) = params.user_id.as_deref() {
            let mut metadata = HashMap::new();
            metadata.insert("user_id".to_string(), user_id.to_string());
            create.metadata = Some(metadata);
        }

        let subscription = self.bounded(Subscription::create(&self.inner, create)).await?;
        let snapshot = subscription_snapshot(&subscription);

        tracing::info!(
            subscription_id = %snapshot.id,
            customer_id = %snapshot.customer_id,
            status = %snapshot.status,
            "Created subscription"
        );

        Ok(snapshot)
    }

    async fn create_setup_intent(&self, customer_id: &str) -> BillingResult<Option<String>> {
        let mut params = CreateSetupIntent::new();
        params.customer = Some(parse_customer_id(customer_id)?);
        params.payment_method_types = Some(vec!["card".to_string()]);

        let intent = self.bounded(SetupIntent::create(&self.inner, params)).await?;

        tracing::info!(
            customer_id = %customer_id,
            setup_intent_id = %intent.id,
            "Created setup intent"
        );

        Ok(intent.client_secret)
    }

    async fn retrieve_coupon(&self, code: &str) -> BillingResult<Option<ProviderCoupon>> {
        let coupon_id = code
            .parse::<CouponId>()
            .map_err(|e| BillingError::Validation(format!("Invalid coupon code: {e}")))?;

        match tokio::time::timeout(
            self.config.request_timeout,
            Coupon::retrieve(&self.inner, &coupon_id, &[]),
        )
        .await
        {
            Ok(Ok(coupon)) => Ok(Some(coupon_snapshot(&coupon))),
            Ok(Err(StripeError::Stripe(request))) if request.http_status == 404 => Ok(None),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(BillingError::UpstreamTimeout),
        }
    }
}
