//! Deferred ledger writes
//!
//! The orchestrator's ledger write must not fail the caller's request. It is
//! attempted inline first; on failure the entry is handed to a background task
//! that retries with exponential backoff. The write is insert-if-absent, so a
//! retry that lands after the reconciler has already written the row is a
//! no-op.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;

use crate::ledger::{LedgerEntry, LedgerStore, WriteOutcome};

/// Backoff settings for deferred writes
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: usize,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(30),
            max_attempts: 8,
        }
    }
}

impl RetryPolicy {
    fn strategy(&self) -> impl Iterator<Item = Duration> {
        // from_millis(2).factor(base) yields base*2, base*4, ...
        let base_ms = (self.base_delay.as_millis() as u64 / 2).max(1);
        ExponentialBackoff::from_millis(2)
            .factor(base_ms)
            .max_delay(self.max_delay)
            .map(jitter)
            .take(self.max_attempts)
    }
}

/// Result of handing an entry to the outbox
#[derive(Debug)]
pub enum OutboxWrite {
    /// The inline attempt succeeded
    Written(WriteOutcome),
    /// The inline attempt failed; a background task is retrying
    Deferred(JoinHandle<()>),
}

#[derive(Clone)]
pub struct LedgerOutbox {
    ledger: Arc<dyn LedgerStore>,
    policy: RetryPolicy,
}

impl LedgerOutbox {
    pub fn new(ledger: Arc<dyn LedgerStore>) -> Self {
        Self {
            ledger,
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Insert `entry` if absent, deferring to a background retry on failure
    pub async fn write(&self, entry: LedgerEntry) -> OutboxWrite {
        match self.ledger.insert_if_absent(&entry).await {
            Ok(outcome) => {
                tracing::debug!(
                    subscription_id = %entry.billing_subscription_id,
                    write = outcome.as_str(),
                    "Recorded pending subscription"
                );
                OutboxWrite::Written(outcome)
            }
            Err(e) => {
                tracing::warn!(
                    subscription_id = %entry.billing_subscription_id,
                    error = %e,
                    "Ledger write failed, deferring to background retry"
                );
                OutboxWrite::Deferred(self.spawn_retry(entry))
            }
        }
    }

    fn spawn_retry(&self, entry: LedgerEntry) -> JoinHandle<()> {
        let ledger = self.ledger.clone();
        let strategy = self.policy.strategy();

        tokio::spawn(async move {
            let result = Retry::spawn(strategy, || {
                let ledger = ledger.clone();
                let entry = entry.clone();
                async move { ledger.insert_if_absent(&entry).await }
            })
            .await;

            match result {
                Ok(outcome) => tracing::info!(
                    subscription_id = %entry.billing_subscription_id,
                    write = outcome.as_str(),
                    "Deferred ledger write succeeded"
                ),
                Err(e) => tracing::error!(
                    subscription_id = %entry.billing_subscription_id,
                    customer_id = %entry.billing_customer_id,
                    error = %e,
                    "Deferred ledger write abandoned; webhooks will reconcile the row"
                ),
            }
        })
    }
}
