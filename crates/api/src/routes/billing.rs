//! Subscription, coupon and entitlement routes

use axum::{
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use chatgate_billing::{CouponValidation, CreateSubscriptionRequest, PaymentResolution};
use serde::Serialize;
use tokio::time::timeout;

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

/// Create a subscription and tell the client how to confirm it.
///
/// Authentication is optional; when present the subscription is linked to
/// the caller.
pub async fn create_subscription(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateSubscriptionRequest>,
) -> ApiResult<Json<PaymentResolution>> {
    let principal = state.identity.resolve(&headers).await;

    let resolution = timeout(
        state.config.upstream_timeout,
        state
            .billing
            .subscriptions
            .create_subscription(&request, principal.as_ref()),
    )
    .await??;

    Ok(Json(resolution.confirmable()?))
}

/// Classify a coupon code. Every classification is a 200; clients read `outcome`.
pub async fn validate_coupon(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> ApiResult<Json<CouponValidation>> {
    let validation = timeout(
        state.config.upstream_timeout,
        state.billing.coupons.validate(&code),
    )
    .await??;

    Ok(Json(validation))
}

#[derive(Debug, Serialize)]
pub struct EntitlementResponse {
    pub active: bool,
}

pub async fn check_entitlement(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<EntitlementResponse>> {
    let principal = state
        .identity
        .resolve(&headers)
        .await
        .ok_or(ApiError::LoginRequired)?;

    let active = timeout(
        state.config.upstream_timeout,
        state.billing.entitlement.has_active_subscription(&principal),
    )
    .await??;

    Ok(Json(EntitlementResponse { active }))
}
