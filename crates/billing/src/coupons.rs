//! Coupon validation
//!
//! Looks a code up with the billing provider and classifies it. Each failure
//! reason gets its own outcome so callers can tell a user why a code was
//! refused.

use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::provider::{BillingProvider, ProviderCoupon};

/// Discount terms of a redeemable coupon
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CouponTerms {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percent_off: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount_off: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CouponValidation {
    Valid(CouponTerms),
    NotFound,
    Expired,
    ExhaustedRedemptions,
    /// The provider reports the coupon as unusable for another reason
    Invalid,
}

impl CouponValidation {
    pub fn is_valid(&self) -> bool {
        matches!(self, CouponValidation::Valid(_))
    }
}

pub struct CouponValidator {
    provider: Arc<dyn BillingProvider>,
}

impl CouponValidator {
    pub fn new(provider: Arc<dyn BillingProvider>) -> Self {
        Self { provider }
    }

    pub async fn validate(&self, code: &str) -> BillingResult<CouponValidation> {
        self.validate_at(code, OffsetDateTime::now_utc()).await
    }

    pub async fn validate_at(
        &self,
        code: &str,
        now: OffsetDateTime,
    ) -> BillingResult<CouponValidation> {
        let code = code.trim();
        if code.is_empty() {
            return Err(BillingError::Validation("Coupon code is empty".to_string()));
        }

        let Some(coupon) = self.provider.retrieve_coupon(code).await? else {
            tracing::debug!(code = %code, "Coupon not found");
            return Ok(CouponValidation::NotFound);
        };

        let outcome = classify(coupon, now.unix_timestamp());
        tracing::debug!(code = %code, valid = outcome.is_valid(), "Coupon validated");
        Ok(outcome)
    }
}

/// Expiry is checked before redemption count; provider validity last
fn classify(coupon: ProviderCoupon, now: i64) -> CouponValidation {
    if coupon.redeem_by.is_some_and(|redeem_by| redeem_by < now) {
        return CouponValidation::Expired;
    }

    if coupon
        .max_redemptions
        .is_some_and(|max| coupon.times_redeemed >= max)
    {
        return CouponValidation::ExhaustedRedemptions;
    }

    if !coupon.valid {
        return CouponValidation::Invalid;
    }

    CouponValidation::Valid(CouponTerms {
        id: coupon.id,
        percent_off: coupon.percent_off,
        amount_off: coupon.amount_off,
        currency: coupon.currency,
    })
}
