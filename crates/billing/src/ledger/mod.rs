//! Subscription ledger
//!
//! A local projection of provider subscription state, keyed by the provider's
//! subscription id. Two writers touch it: the orchestrator records a pending
//! row right after creating a subscription, and the webhook reconciler applies
//! provider events. Orchestration writes only ever insert. Event writes are
//! ordered by the provider's event timestamp, so a late delivery of an older
//! event never overwrites newer state. Within one timestamp a cancellation
//! is final.

mod memory;
mod postgres;

pub use memory::InMemoryLedgerStore;
pub use postgres::PgLedgerStore;

use async_trait::async_trait;
use chatgate_shared::SubscriptionStatus;
use serde::Serialize;
use time::OffsetDateTime;

use crate::error::BillingResult;

/// A persisted ledger row
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionRecord {
    pub billing_subscription_id: String,
    pub billing_customer_id: String,
    pub user_id: Option<String>,
    pub status: SubscriptionStatus,
    pub price_id: Option<String>,
    pub current_period_end: Option<OffsetDateTime>,
    /// `None` until the first provider event is applied
    pub source_event_time: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl SubscriptionRecord {
    /// Entitlement according to the ledger alone at `now`
    pub fn grants_access_at(&self, now: OffsetDateTime) -> bool {
        self.status == SubscriptionStatus::Active
            && self.current_period_end.is_some_and(|end| end > now)
    }
}

/// Row contents for an insert-if-absent write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub billing_subscription_id: String,
    pub billing_customer_id: String,
    pub user_id: Option<String>,
    pub status: SubscriptionStatus,
    pub price_id: Option<String>,
    pub current_period_end: Option<OffsetDateTime>,
    pub source_event_time: Option<OffsetDateTime>,
}

/// A state change carried by a provider event
///
/// `None` fields leave the stored value untouched. A stored `user_id` is never
/// replaced once set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerChange {
    pub billing_subscription_id: String,
    pub billing_customer_id: String,
    pub user_id: Option<String>,
    pub status: SubscriptionStatus,
    pub price_id: Option<String>,
    pub current_period_end: Option<OffsetDateTime>,
    pub event_time: OffsetDateTime,
}

impl LedgerChange {
    pub fn to_entry(&self) -> LedgerEntry {
        LedgerEntry {
            billing_subscription_id: self.billing_subscription_id.clone(),
            billing_customer_id: self.billing_customer_id.clone(),
            user_id: self.user_id.clone(),
            status: self.status,
            price_id: self.price_id.clone(),
            current_period_end: self.current_period_end,
            source_event_time: Some(self.event_time),
        }
    }

    /// Whether a row last written at `stored_time` with `stored_status` may be
    /// overwritten by this change.
    ///
    /// Equal timestamps apply, except that a `canceled` row only yields to
    /// another cancellation from the same second.
    pub fn supersedes(
        &self,
        stored_time: Option<OffsetDateTime>,
        stored_status: SubscriptionStatus,
    ) -> bool {
        let Some(stored_time) = stored_time else {
            return true;
        };

        if stored_time == self.event_time {
            return stored_status != SubscriptionStatus::Canceled
                || self.status == SubscriptionStatus::Canceled;
        }

        stored_time < self.event_time
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteOutcome {
    Inserted,
    Updated,
    /// The change matched what was stored; nothing was written
    Unchanged,
    /// The stored row came from a newer event
    Stale,
    /// Insert-if-absent found an existing row
    AlreadyExists,
}

impl WriteOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteOutcome::Inserted => "inserted",
            WriteOutcome::Updated => "updated",
            WriteOutcome::Unchanged => "unchanged",
            WriteOutcome::Stale => "stale",
            WriteOutcome::AlreadyExists => "already_exists",
        }
    }
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Insert a row unless one already exists for the subscription id
    async fn insert_if_absent(&self, entry: &LedgerEntry) -> BillingResult<WriteOutcome>;

    /// Upsert guarded by event time
    async fn apply_change(&self, change: &LedgerChange) -> BillingResult<WriteOutcome>;

    async fn get(&self, billing_subscription_id: &str) -> BillingResult<Option<SubscriptionRecord>>;

    async fn find_by_user(&self, user_id: &str) -> BillingResult<Vec<SubscriptionRecord>>;

    async fn is_event_processed(&self, event_id: &str) -> BillingResult<bool>;

    async fn mark_event_processed(
        &self,
        event_id: &str,
        event_type: &str,
        event_time: OffsetDateTime,
        outcome: &str,
    ) -> BillingResult<()>;
}

/// Merge a change into a stored row, returning the new row if anything differs
pub(crate) fn merge_change(
    stored: &SubscriptionRecord,
    change: &LedgerChange,
    now: OffsetDateTime,
) -> Option<SubscriptionRecord> {
    let merged = SubscriptionRecord {
        billing_subscription_id: stored.billing_subscription_id.clone(),
        billing_customer_id: change.billing_customer_id.clone(),
        user_id: stored.user_id.clone().or_else(|| change.user_id.clone()),
        status: change.status,
        price_id: change.price_id.clone().or_else(|| stored.price_id.clone()),
        current_period_end: change.current_period_end.or(stored.current_period_end),
        source_event_time: Some(change.event_time),
        created_at: stored.created_at,
        updated_at: stored.updated_at,
    };

    if merged == *stored {
        None
    } else {
        Some(SubscriptionRecord {
            updated_at: now,
            ..merged
        })
    }
}
