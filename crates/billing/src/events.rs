//! Billing provider webhook event types
//!
//! Only the fields the reconciler reads are modelled. Everything else in the
//! payload is ignored, which keeps deliveries rendered with newer API versions
//! parseable.

use std::collections::HashMap;

use serde::Deserialize;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};

/// Event types the reconciler dispatches on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BillingEventType {
    CheckoutSessionCompleted,
    SubscriptionCreated,
    SubscriptionUpdated,
    SubscriptionDeleted,
    InvoicePaymentSucceeded,
    InvoicePaymentFailed,
    Unknown,
}

impl BillingEventType {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "checkout.session.completed" => Self::CheckoutSessionCompleted,
            "customer.subscription.created" => Self::SubscriptionCreated,
            "customer.subscription.updated" => Self::SubscriptionUpdated,
            "customer.subscription.deleted" => Self::SubscriptionDeleted,
            "invoice.payment_succeeded" => Self::InvoicePaymentSucceeded,
            "invoice.payment_failed" => Self::InvoicePaymentFailed,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CheckoutSessionCompleted => "checkout.session.completed",
            Self::SubscriptionCreated => "customer.subscription.created",
            Self::SubscriptionUpdated => "customer.subscription.updated",
            Self::SubscriptionDeleted => "customer.subscription.deleted",
            Self::InvoicePaymentSucceeded => "invoice.payment_succeeded",
            Self::InvoicePaymentFailed => "invoice.payment_failed",
            Self::Unknown => "unknown",
        }
    }
}

/// Event envelope
#[derive(Debug, Clone, Deserialize)]
pub struct BillingEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    /// Unix seconds, assigned by the provider
    pub created: i64,
    pub data: EventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventData {
    pub object: serde_json::Value,
}

impl BillingEvent {
    pub fn from_slice(payload: &[u8]) -> BillingResult<Self> {
        serde_json::from_slice(payload).map_err(|e| BillingError::WebhookPayload(e.to_string()))
    }

    pub fn kind(&self) -> BillingEventType {
        BillingEventType::parse(&self.event_type)
    }

    pub fn occurred_at(&self) -> BillingResult<OffsetDateTime> {
        OffsetDateTime::from_unix_timestamp(self.created).map_err(|e| {
            BillingError::WebhookPayload(format!("bad event timestamp {}: {}", self.created, e))
        })
    }

    /// Deserialize `data.object` into one of the object types below
    pub fn object<T: serde::de::DeserializeOwned>(&self) -> BillingResult<T> {
        serde_json::from_value(self.data.object.clone()).map_err(|e| {
            BillingError::WebhookPayload(format!("{} object: {}", self.event_type, e))
        })
    }
}

/// A reference that is either a bare id or an expanded object
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ObjectRef {
    Id(String),
    Object { id: String },
}

impl ObjectRef {
    pub fn id(&self) -> &str {
        match self {
            ObjectRef::Id(id) => id,
            ObjectRef::Object { id } => id,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutSessionObject {
    pub id: String,
    #[serde(default)]
    pub customer: Option<ObjectRef>,
    #[serde(default)]
    pub subscription: Option<ObjectRef>,
    #[serde(default)]
    pub client_reference_id: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionObject {
    pub id: String,
    pub customer: ObjectRef,
    pub status: String,
    #[serde(default)]
    pub current_period_end: Option<i64>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub items: Option<ItemList>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ItemList {
    #[serde(default)]
    pub data: Vec<SubscriptionItemObject>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionItemObject {
    #[serde(default)]
    pub price: Option<ObjectRef>,
    /// Newer API versions report the period per item
    #[serde(default)]
    pub current_period_end: Option<i64>,
}

impl SubscriptionObject {
    pub fn price_id(&self) -> Option<String> {
        self.items
            .as_ref()
            .and_then(|items| items.data.first())
            .and_then(|item| item.price.as_ref())
            .map(|price| price.id().to_string())
    }

    /// Period end from the subscription, falling back to its first item
    pub fn period_end(&self) -> Option<OffsetDateTime> {
        self.current_period_end
            .or_else(|| {
                self.items
                    .as_ref()
                    .and_then(|items| items.data.first())
                    .and_then(|item| item.current_period_end)
            })
            .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok())
    }

    pub fn user_id(&self) -> Option<String> {
        linked_user(&self.metadata)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct InvoiceObject {
    pub id: String,
    #[serde(default)]
    pub customer: Option<ObjectRef>,
    #[serde(default)]
    pub subscription: Option<ObjectRef>,
    #[serde(default)]
    pub amount_due: Option<i64>,
    #[serde(default)]
    pub amount_paid: Option<i64>,
    #[serde(default)]
    pub attempt_count: Option<i64>,
}

/// `user_id` metadata, ignoring the placeholder written before sign-in
pub(crate) fn linked_user(metadata: &HashMap<String, String>) -> Option<String> {
    metadata
        .get("user_id")
        .map(|v| v.trim())
        .filter(|v| !v.is_empty() && *v != crate::provider::PENDING_USER_LINK)
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_unknown_type_parses() {
        assert_eq!(
            BillingEventType::parse("customer.tax_id.created"),
            BillingEventType::Unknown
        );
        assert_eq!(
            BillingEventType::parse("customer.subscription.deleted"),
            BillingEventType::SubscriptionDeleted
        );
    }

    #[test]
    fn test_subscription_object_accepts_expanded_customer() {
        let event: BillingEvent = serde_json::from_value(json!({
            "id": "evt_1",
            "type": "customer.subscription.updated",
            "created": 1760000000,
            "data": { "object": {
                "id": "sub_1",
                "customer": { "id": "cus_1", "email": "a@x.com" },
                "status": "active",
                "metadata": { "user_id": "user_1" },
                "items": { "data": [ { "price": { "id": "price_1" }, "current_period_end": 1762592000 } ] }
            }}
        }))
        .unwrap();

        let sub: SubscriptionObject = event.object().unwrap();
        assert_eq!(sub.customer.id(), "cus_1");
        assert_eq!(sub.price_id().as_deref(), Some("price_1"));
        assert_eq!(sub.period_end().unwrap().unix_timestamp(), 1_762_592_000);
        assert_eq!(sub.user_id().as_deref(), Some("user_1"));
    }

    #[test]
    fn test_pending_user_link_is_ignored() {
        let mut metadata = HashMap::new();
        metadata.insert("user_id".to_string(), "pending".to_string());
        assert!(linked_user(&metadata).is_none());
    }

    #[test]
    fn test_garbage_payload_is_payload_error() {
        assert!(matches!(
            BillingEvent::from_slice(b"not json"),
            Err(BillingError::WebhookPayload(_))
        ));
    }
}
