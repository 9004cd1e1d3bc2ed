//! API error type and its HTTP mapping
//!
//! Every failure leaves the server as `{"error": <message>, "code": <CODE>}`
//! with a stable machine-readable code.

use axum::{
    http::{header::RETRY_AFTER, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chatgate_billing::BillingError;
use serde_json::json;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),
    #[error("Sign in to use this feature")]
    LoginRequired,
    #[error("Your account has no email address")]
    EmailRequired,
    #[error("An active subscription is required")]
    SubscriptionRequired,
    #[error("{0}")]
    Unauthorized(String),
    #[error("Too many requests")]
    RateLimited { retry_after_secs: u64 },
    #[error("{0}")]
    NotFound(String),
    #[error("Upstream request timed out")]
    UpstreamTimeout,
    #[error("Upstream request failed: {message}")]
    Upstream { status: Option<u16>, message: String },
    #[error("Payment could not be confirmed")]
    PaymentUnconfirmable,
    #[error("Invalid webhook signature")]
    InvalidSignature,
    #[error("Invalid webhook payload: {0}")]
    InvalidPayload(String),
    #[error("Persistence error: {0}")]
    Persistence(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) | ApiError::InvalidSignature | ApiError::InvalidPayload(_) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::LoginRequired => StatusCode::UNAUTHORIZED,
            ApiError::SubscriptionRequired => StatusCode::PAYMENT_REQUIRED,
            ApiError::EmailRequired | ApiError::Unauthorized(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Upstream { .. } => StatusCode::BAD_GATEWAY,
            ApiError::PaymentUnconfirmable | ApiError::Persistence(_) | ApiError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Validation(_) => "VALIDATION_ERROR",
            ApiError::LoginRequired => "LOGIN_REQUIRED",
            ApiError::EmailRequired => "EMAIL_REQUIRED",
            ApiError::SubscriptionRequired => "SUBSCRIPTION_REQUIRED",
            ApiError::Unauthorized(_) => "UNAUTHORIZED",
            ApiError::RateLimited { .. } => "RATE_LIMITED",
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::UpstreamTimeout => "UPSTREAM_TIMEOUT",
            ApiError::Upstream { .. } => "UPSTREAM_ERROR",
            ApiError::PaymentUnconfirmable => "PAYMENT_UNCONFIRMABLE",
            ApiError::InvalidSignature => "INVALID_SIGNATURE",
            ApiError::InvalidPayload(_) => "INVALID_PAYLOAD",
            ApiError::Persistence(_) => "PERSISTENCE_ERROR",
            ApiError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::Validation(msg) => ApiError::Validation(msg),
            BillingError::Unauthorized(msg) => ApiError::Unauthorized(msg),
            BillingError::EmailRequired => ApiError::EmailRequired,
            BillingError::NotFound(msg) => ApiError::NotFound(msg),
            BillingError::UpstreamTimeout => ApiError::UpstreamTimeout,
            BillingError::Upstream { status, message } => ApiError::Upstream { status, message },
            BillingError::Persistence(msg) => ApiError::Persistence(msg),
            BillingError::InvariantViolation(_) => ApiError::PaymentUnconfirmable,
            BillingError::WebhookSignatureInvalid => ApiError::InvalidSignature,
            BillingError::WebhookPayload(msg) => ApiError::InvalidPayload(msg),
            BillingError::Config(msg) => ApiError::Internal(msg),
        }
    }
}

impl From<tokio::time::error::Elapsed> for ApiError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        ApiError::UpstreamTimeout
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        // Server-side details stay in the logs
        let message = match &self {
            ApiError::Persistence(detail) | ApiError::Internal(detail) => {
                tracing::error!(code = self.code(), error = %detail, "Request failed");
                "Internal server error".to_string()
            }
            ApiError::PaymentUnconfirmable => {
                tracing::error!(code = self.code(), "Payment resolution unavailable");
                self.to_string()
            }
            other => other.to_string(),
        };

        let mut body = json!({
            "error": message,
            "code": self.code(),
        });

        if let ApiError::Upstream {
            status: Some(upstream_status),
            ..
        } = &self
        {
            body["upstream_status"] = json!(upstream_status);
        }

        let mut response = (status, Json(body)).into_response();

        if let ApiError::RateLimited { retry_after_secs } = self {
            if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                response.headers_mut().insert(RETRY_AFTER, value);
            }
        }

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_rate_limited_sets_retry_after() {
        let response = ApiError::RateLimited {
            retry_after_secs: 7,
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[RETRY_AFTER], "7");
        assert_eq!(body_json(response).await["code"], "RATE_LIMITED");
    }

    #[tokio::test]
    async fn test_internal_details_are_hidden() {
        let response = ApiError::Persistence("connection refused".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        assert_eq!(body["code"], "PERSISTENCE_ERROR");
        assert_eq!(body["error"], "Internal server error");
    }

    #[tokio::test]
    async fn test_upstream_status_is_attached() {
        let response = ApiError::from(BillingError::upstream(Some(402), "card declined"))
            .into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = body_json(response).await;
        assert_eq!(body["code"], "UPSTREAM_ERROR");
        assert_eq!(body["upstream_status"], 402);
        assert!(body["error"].as_str().unwrap().contains("card declined"));
    }

    #[test]
    fn test_gate_outcomes_have_distinct_codes() {
        let codes = [
            ApiError::LoginRequired.code(),
            ApiError::EmailRequired.code(),
            ApiError::SubscriptionRequired.code(),
            ApiError::RateLimited { retry_after_secs: 1 }.code(),
            ApiError::UpstreamTimeout.code(),
            ApiError::Internal(String::new()).code(),
        ];
        let unique: std::collections::HashSet<_> = codes.iter().collect();
        assert_eq!(unique.len(), codes.len());
    }

    #[test]
    fn test_billing_error_mapping() {
        assert_eq!(
            ApiError::from(BillingError::WebhookSignatureInvalid).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(BillingError::Persistence("x".into())).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ApiError::from(BillingError::InvariantViolation("x".into())).code(),
            "PAYMENT_UNCONFIRMABLE"
        );
    }
}
