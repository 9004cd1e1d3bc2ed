//! Webhook reconciliation
//!
//! Verifies provider deliveries and projects subscription lifecycle events into
//! the ledger. Deliveries may arrive duplicated and out of order; the ledger's
//! event-time guard makes every handler safe to re-run.

use std::sync::Arc;

use chatgate_shared::SubscriptionStatus;
use serde::Serialize;

use crate::error::BillingResult;
use crate::events::{
    linked_user, BillingEvent, BillingEventType, CheckoutSessionObject, InvoiceObject,
    SubscriptionObject,
};
use crate::ledger::{LedgerChange, LedgerStore, WriteOutcome};
use crate::signature::SignatureVerifier;

/// What handling a delivery did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "write", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    /// A ledger write was attempted
    Ledger(WriteOutcome),
    /// The event id was already fully processed
    Duplicate,
    /// Recognised event that only produces a log line
    Logged,
    /// Unrecognised or irrelevant event
    Ignored,
}

impl ReconcileOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconcileOutcome::Ledger(write) => write.as_str(),
            ReconcileOutcome::Duplicate => "duplicate",
            ReconcileOutcome::Logged => "logged",
            ReconcileOutcome::Ignored => "ignored",
        }
    }
}

pub struct WebhookReconciler {
    verifier: SignatureVerifier,
    ledger: Arc<dyn LedgerStore>,
}

impl WebhookReconciler {
    pub fn new(verifier: SignatureVerifier, ledger: Arc<dyn LedgerStore>) -> Self {
        Self { verifier, ledger }
    }

    /// Verify the signature header and parse the body
    pub fn verify_event(&self, payload: &[u8], signature: &str) -> BillingResult<BillingEvent> {
        self.verifier.verify(payload, signature)?;
        let event = BillingEvent::from_slice(payload)?;

        tracing::debug!(
            event_id = %event.id,
            event_type = %event.event_type,
            "Webhook signature verified"
        );

        Ok(event)
    }

    /// Verify then handle a raw delivery
    pub async fn receive(&self, payload: &[u8], signature: &str) -> BillingResult<ReconcileOutcome> {
        let event = self.verify_event(payload, signature)?;
        self.handle_event(&event).await
    }

    /// Handle a verified event.
    ///
    /// Returns an error only when the delivery must be retried by the provider
    /// (ledger failure) or can never be applied (unparseable object).
    pub async fn handle_event(&self, event: &BillingEvent) -> BillingResult<ReconcileOutcome> {
        match self.ledger.is_event_processed(&event.id).await {
            Ok(true) => {
                tracing::info!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    "Webhook event already processed, skipping"
                );
                return Ok(ReconcileOutcome::Duplicate);
            }
            Ok(false) => {}
            Err(e) => {
                // Handlers are idempotent, so carry on without the shortcut
                tracing::warn!(event_id = %event.id, error = %e, "Processed-event lookup failed");
            }
        }

        let outcome = self.process_event_internal(event).await.map_err(|e| {
            tracing::error!(
                event_id = %event.id,
                event_type = %event.event_type,
                error = %e,
                "Failed to process webhook event"
            );
            e
        })?;

        let event_time = event.occurred_at()?;
        if let Err(e) = self
            .ledger
            .mark_event_processed(&event.id, &event.event_type, event_time, outcome.as_str())
            .await
        {
            tracing::warn!(event_id = %event.id, error = %e, "Failed to record processed event");
        }

        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            outcome = outcome.as_str(),
            "Webhook event processed"
        );

        Ok(outcome)
    }

    async fn process_event_internal(&self, event: &BillingEvent) -> BillingResult<ReconcileOutcome> {
        match event.kind() {
            BillingEventType::CheckoutSessionCompleted => self.handle_checkout_completed(event).await,
            BillingEventType::SubscriptionCreated => self.handle_subscription_created(event).await,
            BillingEventType::SubscriptionUpdated => self.handle_subscription_updated(event).await,
            BillingEventType::SubscriptionDeleted => self.handle_subscription_deleted(event).await,
            BillingEventType::InvoicePaymentSucceeded | BillingEventType::InvoicePaymentFailed => {
                self.handle_invoice(event)
            }
            BillingEventType::Unknown => {
                tracing::info!(event_type = %event.event_type, "Unhandled webhook event type");
                Ok(ReconcileOutcome::Ignored)
            }
        }
    }

    async fn handle_checkout_completed(
        &self,
        event: &BillingEvent,
    ) -> BillingResult<ReconcileOutcome> {
        let session: CheckoutSessionObject = event.object()?;

        let (Some(subscription), Some(customer)) = (&session.subscription, &session.customer)
        else {
            tracing::info!(
                session_id = %session.id,
                "Checkout session has no subscription, ignoring"
            );
            return Ok(ReconcileOutcome::Ignored);
        };

        let user_id = linked_user(&session.metadata).or_else(|| {
            session
                .client_reference_id
                .clone()
                .filter(|id| !id.trim().is_empty())
        });

        let change = LedgerChange {
            billing_subscription_id: subscription.id().to_string(),
            billing_customer_id: customer.id().to_string(),
            user_id,
            status: SubscriptionStatus::Active,
            price_id: None,
            current_period_end: None,
            event_time: event.occurred_at()?,
        };

        self.apply(event, &change).await
    }

    async fn handle_subscription_created(
        &self,
        event: &BillingEvent,
    ) -> BillingResult<ReconcileOutcome> {
        let Some(change) = self.subscription_change(event, None)? else {
            return Ok(ReconcileOutcome::Ignored);
        };

        // Informational: an orchestration or later event row wins
        let outcome = self.ledger.insert_if_absent(&change.to_entry()).await?;

        tracing::info!(
            subscription_id = %change.billing_subscription_id,
            status = %change.status,
            write = outcome.as_str(),
            "Subscription created"
        );

        Ok(ReconcileOutcome::Ledger(outcome))
    }

    async fn handle_subscription_updated(
        &self,
        event: &BillingEvent,
    ) -> BillingResult<ReconcileOutcome> {
        let Some(change) = self.subscription_change(event, None)? else {
            return Ok(ReconcileOutcome::Ignored);
        };
        self.apply(event, &change).await
    }

    async fn handle_subscription_deleted(
        &self,
        event: &BillingEvent,
    ) -> BillingResult<ReconcileOutcome> {
        let Some(change) = self.subscription_change(event, Some(SubscriptionStatus::Canceled))?
        else {
            return Ok(ReconcileOutcome::Ignored);
        };
        self.apply(event, &change).await
    }

    fn handle_invoice(&self, event: &BillingEvent) -> BillingResult<ReconcileOutcome> {
        let invoice: InvoiceObject = event.object()?;
        let subscription_id = invoice.subscription.as_ref().map(|s| s.id().to_string());
        let customer_id = invoice.customer.as_ref().map(|c| c.id().to_string());

        match event.kind() {
            BillingEventType::InvoicePaymentFailed => tracing::warn!(
                invoice_id = %invoice.id,
                subscription_id = ?subscription_id,
                customer_id = ?customer_id,
                amount_due = ?invoice.amount_due,
                attempt_count = ?invoice.attempt_count,
                "Invoice payment failed"
            ),
            _ => tracing::info!(
                invoice_id = %invoice.id,
                subscription_id = ?subscription_id,
                customer_id = ?customer_id,
                amount_paid = ?invoice.amount_paid,
                "Invoice payment succeeded"
            ),
        }

        Ok(ReconcileOutcome::Logged)
    }

    /// Build a ledger change from a subscription event, `None` when the status
    /// is outside the provider vocabulary we know
    fn subscription_change(
        &self,
        event: &BillingEvent,
        status_override: Option<SubscriptionStatus>,
    ) -> BillingResult<Option<LedgerChange>> {
        let subscription: SubscriptionObject = event.object()?;

        let status = match status_override {
            Some(status) => status,
            None => match SubscriptionStatus::from_provider(&subscription.status) {
                Ok(status) => status,
                Err(e) => {
                    tracing::warn!(
                        event_id = %event.id,
                        subscription_id = %subscription.id,
                        error = %e,
                        "Ignoring subscription event with unknown status"
                    );
                    return Ok(None);
                }
            },
        };

        Ok(Some(LedgerChange {
            billing_subscription_id: subscription.id.clone(),
            billing_customer_id: subscription.customer.id().to_string(),
            user_id: subscription.user_id(),
            status,
            price_id: subscription.price_id(),
            current_period_end: subscription.period_end(),
            event_time: event.occurred_at()?,
        }))
    }

    async fn apply(
        &self,
        event: &BillingEvent,
        change: &LedgerChange,
    ) -> BillingResult<ReconcileOutcome> {
        let outcome = self.ledger.apply_change(change).await?;

        match outcome {
            WriteOutcome::Stale => tracing::info!(
                event_id = %event.id,
                subscription_id = %change.billing_subscription_id,
                "Stale webhook event, ledger holds newer state"
            ),
            _ => tracing::info!(
                event_id = %event.id,
                subscription_id = %change.billing_subscription_id,
                status = %change.status,
                write = outcome.as_str(),
                "Ledger updated from webhook"
            ),
        }

        Ok(ReconcileOutcome::Ledger(outcome))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BillingError;
    use crate::ledger::InMemoryLedgerStore;
    use serde_json::json;

    fn reconciler() -> (WebhookReconciler, Arc<InMemoryLedgerStore>) {
        let ledger = Arc::new(InMemoryLedgerStore::new());
        let reconciler =
            WebhookReconciler::new(SignatureVerifier::new("whsec_test"), ledger.clone());
        (reconciler, ledger)
    }

    fn event(id: &str, kind: &str, created: i64, object: serde_json::Value) -> BillingEvent {
        serde_json::from_value(json!({
            "id": id,
            "type": kind,
            "created": created,
            "data": { "object": object }
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_unknown_event_is_ignored() {
        let (reconciler, ledger) = reconciler();
        let outcome = reconciler
            .handle_event(&event("evt_1", "customer.tax_id.created", 1, json!({})))
            .await
            .unwrap();

        assert_eq!(outcome, ReconcileOutcome::Ignored);
        assert!(ledger.is_empty().await);
    }

    #[tokio::test]
    async fn test_checkout_without_subscription_is_ignored() {
        let (reconciler, ledger) = reconciler();
        let outcome = reconciler
            .handle_event(&event(
                "evt_1",
                "checkout.session.completed",
                1_760_000_000,
                json!({ "id": "cs_1", "customer": "cus_1", "subscription": null }),
            ))
            .await
            .unwrap();

        assert_eq!(outcome, ReconcileOutcome::Ignored);
        assert!(ledger.is_empty().await);
    }

    #[tokio::test]
    async fn test_invoice_events_only_log() {
        let (reconciler, ledger) = reconciler();
        let outcome = reconciler
            .handle_event(&event(
                "evt_1",
                "invoice.payment_failed",
                1_760_000_000,
                json!({ "id": "in_1", "subscription": "sub_1", "amount_due": 1000 }),
            ))
            .await
            .unwrap();

        assert_eq!(outcome, ReconcileOutcome::Logged);
        assert!(ledger.is_empty().await);
    }

    #[tokio::test]
    async fn test_unknown_subscription_status_is_ignored() {
        let (reconciler, ledger) = reconciler();
        let outcome = reconciler
            .handle_event(&event(
                "evt_1",
                "customer.subscription.updated",
                1_760_000_000,
                json!({ "id": "sub_1", "customer": "cus_1", "status": "hibernating" }),
            ))
            .await
            .unwrap();

        assert_eq!(outcome, ReconcileOutcome::Ignored);
        assert!(ledger.is_empty().await);
    }

    #[tokio::test]
    async fn test_malformed_object_is_payload_error() {
        let (reconciler, _) = reconciler();
        let result = reconciler
            .handle_event(&event(
                "evt_1",
                "customer.subscription.updated",
                1_760_000_000,
                json!({ "status": "active" }),
            ))
            .await;

        assert!(matches!(result, Err(BillingError::WebhookPayload(_))));
    }

    #[tokio::test]
    async fn test_persistence_failure_propagates() {
        let (reconciler, ledger) = reconciler();
        ledger.fail_next_writes(1);

        let result = reconciler
            .handle_event(&event(
                "evt_1",
                "customer.subscription.updated",
                1_760_000_000,
                json!({ "id": "sub_1", "customer": "cus_1", "status": "active" }),
            ))
            .await;

        assert!(matches!(result, Err(BillingError::Persistence(_))));
        // Not recorded as processed, so a redelivery is applied
        assert!(!ledger.is_event_processed("evt_1").await.unwrap());
    }

    #[tokio::test]
    async fn test_receive_rejects_bad_signature() {
        let (reconciler, _) = reconciler();
        let result = reconciler.receive(b"{}", "t=1,v1=00").await;
        assert!(matches!(result, Err(BillingError::WebhookSignatureInvalid)));
    }
}
