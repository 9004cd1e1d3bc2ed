//! Billing error types

use stripe::StripeError;
use thiserror::Error;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Clone, Error)]
pub enum BillingError {
    /// Malformed caller input
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Principal does not match the requested resource
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Entitlement needs an email and the principal has none
    #[error("Email required")]
    EmailRequired,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Billing provider timed out")]
    UpstreamTimeout,

    /// Provider failure; status and body are kept for diagnostics
    #[error("Billing provider error (status {status:?}): {message}")]
    Upstream { status: Option<u16>, message: String },

    /// Ledger read or write failed
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Provider state the orchestrator cannot classify
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Invalid webhook signature")]
    WebhookSignatureInvalid,

    #[error("Invalid webhook payload: {0}")]
    WebhookPayload(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl BillingError {
    pub fn upstream(status: Option<u16>, message: impl Into<String>) -> Self {
        BillingError::Upstream {
            status,
            message: message.into(),
        }
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            BillingError::Validation(_) => "VALIDATION_ERROR",
            BillingError::Unauthorized(_) => "UNAUTHORIZED",
            BillingError::EmailRequired => "EMAIL_REQUIRED",
            BillingError::NotFound(_) => "NOT_FOUND",
            BillingError::UpstreamTimeout => "UPSTREAM_TIMEOUT",
            BillingError::Upstream { .. } => "UPSTREAM_ERROR",
            BillingError::Persistence(_) => "PERSISTENCE_ERROR",
            BillingError::InvariantViolation(_) => "INVARIANT_VIOLATION",
            BillingError::WebhookSignatureInvalid => "INVALID_SIGNATURE",
            BillingError::WebhookPayload(_) => "INVALID_PAYLOAD",
            BillingError::Config(_) => "CONFIG_ERROR",
        }
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Persistence(e.to_string())
    }
}

impl From<StripeError> for BillingError {
    fn from(e: StripeError) -> Self {
        match e {
            StripeError::Stripe(request) => BillingError::Upstream {
                status: Some(request.http_status),
                message: request
                    .message
                    .unwrap_or_else(|| format!("{:?}", request.error_type)),
            },
            StripeError::Timeout => BillingError::UpstreamTimeout,
            other => BillingError::Upstream {
                status: None,
                message: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_distinct_for_gate_relevant_errors() {
        assert_eq!(BillingError::EmailRequired.code(), "EMAIL_REQUIRED");
        assert_eq!(BillingError::UpstreamTimeout.code(), "UPSTREAM_TIMEOUT");
        assert_eq!(
            BillingError::upstream(Some(502), "bad gateway").code(),
            "UPSTREAM_ERROR"
        );
    }

    #[test]
    fn test_upstream_display_keeps_status_and_body() {
        let err = BillingError::upstream(Some(402), "card_declined");
        let rendered = err.to_string();
        assert!(rendered.contains("402"));
        assert!(rendered.contains("card_declined"));
    }
}
