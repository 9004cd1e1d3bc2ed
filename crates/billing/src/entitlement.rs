//! Entitlement checks
//!
//! The admission decision is made against the billing provider live: customers
//! matching the principal's email are listed and each is asked for an active
//! subscription, stopping at the first hit. An optional ledger fast path can
//! answer "yes" early, but anything it cannot confirm falls through to the
//! live check.

use std::sync::Arc;

use chatgate_shared::Principal;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::ledger::LedgerStore;
use crate::provider::BillingProvider;

/// Upper bound on customers inspected per email
pub const CUSTOMER_PAGE_SIZE: u64 = 10;

pub struct EntitlementChecker {
    provider: Arc<dyn BillingProvider>,
    fast_path: Option<Arc<dyn LedgerStore>>,
}

impl EntitlementChecker {
    pub fn new(provider: Arc<dyn BillingProvider>) -> Self {
        Self {
            provider,
            fast_path: None,
        }
    }

    /// Consult the ledger before calling the provider
    pub fn with_ledger_fast_path(mut self, ledger: Arc<dyn LedgerStore>) -> Self {
        self.fast_path = Some(ledger);
        self
    }

    pub async fn has_active_subscription(&self, principal: &Principal) -> BillingResult<bool> {
        let email = principal.email().ok_or(BillingError::EmailRequired)?;

        if self.ledger_confirms(principal).await {
            tracing::debug!(user_id = %principal.id, "Entitlement confirmed by ledger");
            return Ok(true);
        }

        let customers = self
            .provider
            .list_customers_by_email(email, CUSTOMER_PAGE_SIZE)
            .await?;

        for customer in &customers {
            if self.provider.has_active_subscription(&customer.id).await? {
                tracing::debug!(
                    user_id = %principal.id,
                    customer_id = %customer.id,
                    "Active subscription found"
                );
                return Ok(true);
            }
        }

        tracing::debug!(
            user_id = %principal.id,
            customers = customers.len(),
            "No active subscription"
        );
        Ok(false)
    }

    /// Only a definite positive counts; absence, staleness and errors do not
    async fn ledger_confirms(&self, principal: &Principal) -> bool {
        let Some(ledger) = self.fast_path.as_ref() else {
            return false;
        };

        match ledger.find_by_user(&principal.id).await {
            Ok(records) => {
                let now = OffsetDateTime::now_utc();
                records.iter().any(|record| record.grants_access_at(now))
            }
            Err(e) => {
                tracing::warn!(
                    user_id = %principal.id,
                    error = %e,
                    "Ledger lookup failed, using live check"
                );
                false
            }
        }
    }
}
