use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use super::{merge_change, LedgerChange, LedgerEntry, LedgerStore, SubscriptionRecord, WriteOutcome};
use crate::error::{BillingError, BillingResult};

/// Process-local ledger, used when no database is configured and in tests
#[derive(Debug, Default)]
pub struct InMemoryLedgerStore {
    rows: RwLock<HashMap<String, SubscriptionRecord>>,
    processed_events: RwLock<HashMap<String, String>>,
    /// Number of upcoming writes to reject
    failing_writes: AtomicUsize,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` row writes fail with a persistence error
    pub fn fail_next_writes(&self, count: usize) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }

    fn check_write(&self) -> BillingResult<()> {
        let injected = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match injected {
            Ok(_) => Err(BillingError::Persistence(
                "ledger write rejected".to_string(),
            )),
            Err(_) => Ok(()),
        }
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn insert_if_absent(&self, entry: &LedgerEntry) -> BillingResult<WriteOutcome> {
        self.check_write()?;

        let mut rows = self.rows.write().await;
        if rows.contains_key(&entry.billing_subscription_id) {
            return Ok(WriteOutcome::AlreadyExists);
        }

        let now = OffsetDateTime::now_utc();
        rows.insert(
            entry.billing_subscription_id.clone(),
            SubscriptionRecord {
                billing_subscription_id: entry.billing_subscription_id.clone(),
                billing_customer_id: entry.billing_customer_id.clone(),
                user_id: entry.user_id.clone(),
                status: entry.status,
                price_id: entry.price_id.clone(),
                current_period_end: entry.current_period_end,
                source_event_time: entry.source_event_time,
                created_at: now,
                updated_at: now,
            },
        );
        Ok(WriteOutcome::Inserted)
    }

    async fn apply_change(&self, change: &LedgerChange) -> BillingResult<WriteOutcome> {
        self.check_write()?;

        let mut rows = self.rows.write().await;
        let now = OffsetDateTime::now_utc();

        if !rows.contains_key(&change.billing_subscription_id) {
            let entry = change.to_entry();
            rows.insert(
                entry.billing_subscription_id.clone(),
                SubscriptionRecord {
                    billing_subscription_id: entry.billing_subscription_id,
                    billing_customer_id: entry.billing_customer_id,
                    user_id: entry.user_id,
                    status: entry.status,
                    price_id: entry.price_id,
                    current_period_end: entry.current_period_end,
                    source_event_time: entry.source_event_time,
                    created_at: now,
                    updated_at: now,
                },
            );
            return Ok(WriteOutcome::Inserted);
        }

        let Some(stored) = rows.get_mut(&change.billing_subscription_id) else {
            return Err(BillingError::Persistence(
                "ledger row vanished during write".to_string(),
            ));
        };

        if !change.supersedes(stored.source_event_time, stored.status) {
            return Ok(WriteOutcome::Stale);
        }

        match merge_change(stored, change, now) {
            Some(merged) => {
                *stored = merged;
                Ok(WriteOutcome::Updated)
            }
            None => Ok(WriteOutcome::Unchanged),
        }
    }

    async fn get(&self, billing_subscription_id: &str) -> BillingResult<Option<SubscriptionRecord>> {
        Ok(self.rows.read().await.get(billing_subscription_id).cloned())
    }

    async fn find_by_user(&self, user_id: &str) -> BillingResult<Vec<SubscriptionRecord>> {
        let rows = self.rows.read().await;
        let mut records: Vec<SubscriptionRecord> = rows
            .values()
            .filter(|r| r.user_id.as_deref() == Some(user_id))
            .cloned()
            .collect();
        records.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(records)
    }

    async fn is_event_processed(&self, event_id: &str) -> BillingResult<bool> {
        Ok(self.processed_events.read().await.contains_key(event_id))
    }

    async fn mark_event_processed(
        &self,
        event_id: &str,
        _event_type: &str,
        _event_time: OffsetDateTime,
        outcome: &str,
    ) -> BillingResult<()> {
        self.processed_events
            .write()
            .await
            .entry(event_id.to_string())
            .or_insert_with(|| outcome.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatgate_shared::SubscriptionStatus;
    use time::macros::datetime;

    fn pending() -> LedgerEntry {
        LedgerEntry {
            billing_subscription_id: "sub_1".to_string(),
            billing_customer_id: "cus_1".to_string(),
            user_id: Some("user_1".to_string()),
            status: SubscriptionStatus::Incomplete,
            price_id: Some("price_1".to_string()),
            current_period_end: None,
            source_event_time: None,
        }
    }

    fn change(status: SubscriptionStatus, at: OffsetDateTime) -> LedgerChange {
        LedgerChange {
            billing_subscription_id: "sub_1".to_string(),
            billing_customer_id: "cus_1".to_string(),
            user_id: None,
            status,
            price_id: None,
            current_period_end: None,
            event_time: at,
        }
    }

    #[tokio::test]
    async fn test_insert_if_absent_never_overwrites() {
        let store = InMemoryLedgerStore::new();
        let t1 = datetime!(2026-03-01 10:00 UTC);

        store
            .apply_change(&change(SubscriptionStatus::Active, t1))
            .await
            .unwrap();

        let outcome = store.insert_if_absent(&pending()).await.unwrap();
        assert_eq!(outcome, WriteOutcome::AlreadyExists);

        let row = store.get("sub_1").await.unwrap().unwrap();
        assert_eq!(row.status, SubscriptionStatus::Active);
        assert_eq!(row.source_event_time, Some(t1));
    }

    #[tokio::test]
    async fn test_older_event_is_stale() {
        let store = InMemoryLedgerStore::new();
        let t1 = datetime!(2026-03-01 10:00 UTC);
        let t2 = datetime!(2026-03-01 11:00 UTC);

        store
            .apply_change(&change(SubscriptionStatus::Canceled, t2))
            .await
            .unwrap();
        let outcome = store
            .apply_change(&change(SubscriptionStatus::Active, t1))
            .await
            .unwrap();

        assert_eq!(outcome, WriteOutcome::Stale);
        let row = store.get("sub_1").await.unwrap().unwrap();
        assert_eq!(row.status, SubscriptionStatus::Canceled);
    }

    #[tokio::test]
    async fn test_same_second_update_cannot_revive_canceled() {
        let store = InMemoryLedgerStore::new();
        let t1 = datetime!(2026-03-01 10:00 UTC);

        store
            .apply_change(&change(SubscriptionStatus::Canceled, t1))
            .await
            .unwrap();
        let outcome = store
            .apply_change(&change(SubscriptionStatus::Active, t1))
            .await
            .unwrap();

        assert_eq!(outcome, WriteOutcome::Stale);
        let row = store.get("sub_1").await.unwrap().unwrap();
        assert_eq!(row.status, SubscriptionStatus::Canceled);
    }

    #[tokio::test]
    async fn test_repeated_change_is_unchanged() {
        let store = InMemoryLedgerStore::new();
        let t1 = datetime!(2026-03-01 10:00 UTC);

        store.insert_if_absent(&pending()).await.unwrap();
        let first = store
            .apply_change(&change(SubscriptionStatus::Active, t1))
            .await
            .unwrap();
        let after_first = store.get("sub_1").await.unwrap();

        let second = store
            .apply_change(&change(SubscriptionStatus::Active, t1))
            .await
            .unwrap();

        assert_eq!(first, WriteOutcome::Updated);
        assert_eq!(second, WriteOutcome::Unchanged);
        assert_eq!(store.get("sub_1").await.unwrap(), after_first);
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let store = InMemoryLedgerStore::new();
        store.fail_next_writes(1);

        assert!(matches!(
            store.insert_if_absent(&pending()).await,
            Err(BillingError::Persistence(_))
        ));
        assert_eq!(
            store.insert_if_absent(&pending()).await.unwrap(),
            WriteOutcome::Inserted
        );
    }

    #[tokio::test]
    async fn test_find_by_user() {
        let store = InMemoryLedgerStore::new();
        store.insert_if_absent(&pending()).await.unwrap();

        assert_eq!(store.find_by_user("user_1").await.unwrap().len(), 1);
        assert!(store.find_by_user("user_2").await.unwrap().is_empty());
    }
}
