//! In-memory billing provider for tests

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chatgate_shared::SubscriptionStatus;

use crate::error::{BillingError, BillingResult};
use crate::provider::{
    BillingProvider, InvoiceSnapshot, ProviderCoupon, ProviderCustomer, ProviderSubscription,
    SubscriptionParams,
};

/// Amount charged for the first invoice unless a coupon covers it
pub const DEFAULT_PRICE_AMOUNT: i64 = 1_000;

#[derive(Debug, Default)]
struct FakeState {
    customers_by_email: HashMap<String, Vec<String>>,
    active_customers: HashSet<String>,
    coupons: HashMap<String, ProviderCoupon>,
    created_customers: Vec<(String, String)>,
    created_subscriptions: Vec<SubscriptionParams>,
    subscription_override: Option<(SubscriptionStatus, Option<InvoiceSnapshot>)>,
    setup_intent_secret: Option<Option<String>>,
    failure: Option<BillingError>,
}

/// Scriptable [`BillingProvider`]
///
/// Without overrides a new subscription is `incomplete` with an open invoice
/// carrying a payment intent secret; a 100%-off coupon makes it `active` with
/// a paid zero-amount invoice, the way the provider behaves.
#[derive(Debug, Default)]
pub struct FakeBillingProvider {
    state: Mutex<FakeState>,
    ids: AtomicUsize,
    subscription_lookups: AtomicUsize,
    setup_intents: AtomicUsize,
}

fn lock(state: &Mutex<FakeState>) -> MutexGuard<'_, FakeState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl FakeBillingProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_customer(self, email: &str, customer_id: &str) -> Self {
        lock(&self.state)
            .customers_by_email
            .entry(email.to_string())
            .or_default()
            .push(customer_id.to_string());
        self
    }

    pub fn with_active_subscription(self, customer_id: &str) -> Self {
        lock(&self.state)
            .active_customers
            .insert(customer_id.to_string());
        self
    }

    pub fn with_coupon(self, coupon: ProviderCoupon) -> Self {
        lock(&self.state).coupons.insert(coupon.id.clone(), coupon);
        self
    }

    /// Force the status and invoice of every subscription created from now on
    pub fn with_subscription_outcome(
        self,
        status: SubscriptionStatus,
        invoice: Option<InvoiceSnapshot>,
    ) -> Self {
        lock(&self.state).subscription_override = Some((status, invoice));
        self
    }

    /// Setup intents come back with this secret (or none)
    pub fn with_setup_intent_secret(self, secret: Option<&str>) -> Self {
        lock(&self.state).setup_intent_secret = Some(secret.map(str::to_string));
        self
    }

    /// Every call fails with `error`
    pub fn failing(self, error: BillingError) -> Self {
        lock(&self.state).failure = Some(error);
        self
    }

    /// `(email, user_link)` for each created customer
    pub fn created_customers(&self) -> Vec<(String, String)> {
        lock(&self.state).created_customers.clone()
    }

    pub fn created_subscriptions(&self) -> Vec<SubscriptionParams> {
        lock(&self.state).created_subscriptions.clone()
    }

    /// Number of `has_active_subscription` calls
    pub fn subscription_lookups(&self) -> usize {
        self.subscription_lookups.load(Ordering::SeqCst)
    }

    pub fn setup_intents_created(&self) -> usize {
        self.setup_intents.load(Ordering::SeqCst)
    }

    fn next_id(&self, prefix: &str) -> String {
        format!("{}_fake_{}", prefix, self.ids.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn check_failure(&self) -> BillingResult<()> {
        match lock(&self.state).failure.clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl BillingProvider for FakeBillingProvider {
    async fn list_customers_by_email(
        &self,
        email: &str,
        limit: u64,
    ) -> BillingResult<Vec<ProviderCustomer>> {
        self.check_failure()?;
        let state = lock(&self.state);
        Ok(state
            .customers_by_email
            .get(email)
            .map(|ids| {
                ids.iter()
                    .take(limit as usize)
                    .map(|id| ProviderCustomer {
                        id: id.clone(),
                        email: Some(email.to_string()),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn has_active_subscription(&self, customer_id: &str) -> BillingResult<bool> {
        self.check_failure()?;
        self.subscription_lookups.fetch_add(1, Ordering::SeqCst);
        Ok(lock(&self.state).active_customers.contains(customer_id))
    }

    async fn create_customer(
        &self,
        email: &str,
        user_link: &str,
    ) -> BillingResult<ProviderCustomer> {
        self.check_failure()?;
        let id = self.next_id("cus");
        let mut state = lock(&self.state);
        state
            .created_customers
            .push((email.to_string(), user_link.to_string()));
        state
            .customers_by_email
            .entry(email.to_string())
            .or_default()
            .push(id.clone());
        Ok(ProviderCustomer {
            id,
            email: Some(email.to_string()),
        })
    }

    async fn create_subscription(
        &self,
        params: &SubscriptionParams,
    ) -> BillingResult<ProviderSubscription> {
        self.check_failure()?;
        let id = self.next_id("sub");
        let mut state = lock(&self.state);
        state.created_subscriptions.push(params.clone());

        let (status, latest_invoice) = match state.subscription_override.clone() {
            Some(outcome) => outcome,
            None => {
                let fully_discounted = params
                    .coupon
                    .as_ref()
                    .and_then(|code| state.coupons.get(code))
                    .is_some_and(|c| c.percent_off.is_some_and(|p| p >= 100.0));

                if fully_discounted {
                    (
                        SubscriptionStatus::Active,
                        Some(InvoiceSnapshot {
                            id: Some(format!("in_for_{id}")),
                            paid: true,
                            amount_due: 0,
                            payment_intent_client_secret: None,
                        }),
                    )
                } else {
                    (
                        SubscriptionStatus::Incomplete,
                        Some(InvoiceSnapshot {
                            id: Some(format!("in_for_{id}")),
                            paid: false,
                            amount_due: DEFAULT_PRICE_AMOUNT,
                            payment_intent_client_secret: Some(format!("pi_{id}_secret")),
                        }),
                    )
                }
            }
        };

        if status == SubscriptionStatus::Active {
            state.active_customers.insert(params.customer_id.clone());
        }

        Ok(ProviderSubscription {
            id,
            customer_id: params.customer_id.clone(),
            status,
            price_id: Some(params.price_id.clone()),
            current_period_end: None,
            latest_invoice,
        })
    }

    async fn create_setup_intent(&self, customer_id: &str) -> BillingResult<Option<String>> {
        self.check_failure()?;
        self.setup_intents.fetch_add(1, Ordering::SeqCst);
        match lock(&self.state).setup_intent_secret.clone() {
            Some(secret) => Ok(secret),
            None => Ok(Some(format!("seti_{customer_id}_secret"))),
        }
    }

    async fn retrieve_coupon(&self, code: &str) -> BillingResult<Option<ProviderCoupon>> {
        self.check_failure()?;
        Ok(lock(&self.state).coupons.get(code).cloned())
    }
}
