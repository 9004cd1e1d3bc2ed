//! Billing provider webhook receiver
//!
//! The transport is unauthenticated: trust comes only from the
//! signature header. Any non-2xx response makes the provider redeliver.

use axum::{body::Bytes, extract::State, http::HeaderMap, Json};
use serde_json::{json, Value};

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

const SIGNATURE_HEADER: &str = "stripe-signature";

pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!("Webhook delivered without a signature header");
            ApiError::InvalidSignature
        })?;

    let outcome = state.billing.webhooks.receive(&body, signature).await?;

    Ok(Json(json!({
        "received": true,
        "outcome": outcome.as_str(),
    })))
}
