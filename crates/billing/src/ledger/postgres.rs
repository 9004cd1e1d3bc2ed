use async_trait::async_trait;
use chatgate_shared::SubscriptionStatus;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use super::{LedgerChange, LedgerEntry, LedgerStore, SubscriptionRecord, WriteOutcome};
use crate::error::{BillingError, BillingResult};

/// Postgres-backed ledger
#[derive(Debug, Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

#[derive(Debug, sqlx::FromRow)]
struct LedgerRow {
    billing_subscription_id: String,
    billing_customer_id: String,
    user_id: Option<String>,
    status: String,
    price_id: Option<String>,
    current_period_end: Option<OffsetDateTime>,
    source_event_time: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<LedgerRow> for SubscriptionRecord {
    type Error = BillingError;

    fn try_from(row: LedgerRow) -> Result<Self, Self::Error> {
        let status = row.status.parse::<SubscriptionStatus>().map_err(|e| {
            BillingError::Persistence(format!(
                "ledger row {} has {}",
                row.billing_subscription_id, e
            ))
        })?;

        Ok(SubscriptionRecord {
            billing_subscription_id: row.billing_subscription_id,
            billing_customer_id: row.billing_customer_id,
            user_id: row.user_id,
            status,
            price_id: row.price_id,
            current_period_end: row.current_period_end,
            source_event_time: row.source_event_time,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const SELECT_COLUMNS: &str = "billing_subscription_id, billing_customer_id, user_id, status, \
     price_id, current_period_end, source_event_time, created_at, updated_at";

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn insert_if_absent(&self, entry: &LedgerEntry) -> BillingResult<WriteOutcome> {
        let result = sqlx::query(
            r#"
            INSERT INTO subscription_ledger
                (billing_subscription_id, billing_customer_id, user_id, status, price_id,
                 current_period_end, source_event_time, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, NOW(), NOW())
            ON CONFLICT (billing_subscription_id) DO NOTHING
            "#,
        )
        .bind(&entry.billing_subscription_id)
        .bind(&entry.billing_customer_id)
        .bind(&entry.user_id)
        .bind(entry.status.as_str())
        .bind(&entry.price_id)
        .bind(entry.current_period_end)
        .bind(entry.source_event_time)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            Ok(WriteOutcome::Inserted)
        } else {
            Ok(WriteOutcome::AlreadyExists)
        }
    }

    async fn apply_change(&self, change: &LedgerChange) -> BillingResult<WriteOutcome> {
        // The WHERE clause carries both the ordering rule and the no-op check,
        // so concurrent deliveries cannot interleave between read and write.
        let written: Option<(bool,)> = sqlx::query_as(
            r#"
            INSERT INTO subscription_ledger AS l
                (billing_subscription_id, billing_customer_id, user_id, status, price_id,
                 current_period_end, source_event_time, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, NOW(), NOW())
            ON CONFLICT (billing_subscription_id) DO UPDATE SET
                billing_customer_id = EXCLUDED.billing_customer_id,
                user_id = COALESCE(l.user_id, EXCLUDED.user_id),
                status = EXCLUDED.status,
                price_id = COALESCE(EXCLUDED.price_id, l.price_id),
                current_period_end = COALESCE(EXCLUDED.current_period_end, l.current_period_end),
                source_event_time = EXCLUDED.source_event_time,
                updated_at = NOW()
            WHERE (l.source_event_time IS NULL
                   OR l.source_event_time < EXCLUDED.source_event_time
                   OR (l.source_event_time = EXCLUDED.source_event_time
                       AND (l.status <> 'canceled' OR EXCLUDED.status = 'canceled')))
              AND (l.billing_customer_id, l.user_id, l.status, l.price_id,
                   l.current_period_end, l.source_event_time)
                  IS DISTINCT FROM
                  (EXCLUDED.billing_customer_id, COALESCE(l.user_id, EXCLUDED.user_id),
                   EXCLUDED.status, COALESCE(EXCLUDED.price_id, l.price_id),
                   COALESCE(EXCLUDED.current_period_end, l.current_period_end),
                   EXCLUDED.source_event_time)
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(&change.billing_subscription_id)
        .bind(&change.billing_customer_id)
        .bind(&change.user_id)
        .bind(change.status.as_str())
        .bind(&change.price_id)
        .bind(change.current_period_end)
        .bind(change.event_time)
        .fetch_optional(&self.pool)
        .await?;

        match written {
            Some((true,)) => return Ok(WriteOutcome::Inserted),
            Some((false,)) => return Ok(WriteOutcome::Updated),
            None => {}
        }

        // Nothing written: tell a stale delivery apart from a repeat
        let stored: Option<(Option<OffsetDateTime>, String)> = sqlx::query_as(
            "SELECT source_event_time, status FROM subscription_ledger WHERE billing_subscription_id = $1",
        )
        .bind(&change.billing_subscription_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some((stored_time, stored_status)) = stored else {
            return Ok(WriteOutcome::Unchanged);
        };
        let stored_status = stored_status
            .parse::<SubscriptionStatus>()
            .map_err(|e| BillingError::Persistence(format!("ledger row has {e}")))?;

        if change.supersedes(stored_time, stored_status) {
            Ok(WriteOutcome::Unchanged)
        } else {
            Ok(WriteOutcome::Stale)
        }
    }

    async fn get(&self, billing_subscription_id: &str) -> BillingResult<Option<SubscriptionRecord>> {
        let row: Option<LedgerRow> = sqlx::query_as(&format!(
            "SELECT {SELECT_COLUMNS} FROM subscription_ledger WHERE billing_subscription_id = $1"
        ))
        .bind(billing_subscription_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(SubscriptionRecord::try_from).transpose()
    }

    async fn find_by_user(&self, user_id: &str) -> BillingResult<Vec<SubscriptionRecord>> {
        let rows: Vec<LedgerRow> = sqlx::query_as(&format!(
            "SELECT {SELECT_COLUMNS} FROM subscription_ledger WHERE user_id = $1 ORDER BY updated_at DESC"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(SubscriptionRecord::try_from).collect()
    }

    async fn is_event_processed(&self, event_id: &str) -> BillingResult<bool> {
        let exists: Option<(i32,)> =
            sqlx::query_as("SELECT 1 FROM billing_webhook_events WHERE event_id = $1")
                .bind(event_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(exists.is_some())
    }

    async fn mark_event_processed(
        &self,
        event_id: &str,
        event_type: &str,
        event_time: OffsetDateTime,
        outcome: &str,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO billing_webhook_events (id, event_id, event_type, event_timestamp, outcome, processed_at)
            VALUES ($1, $2, $3, $4, $5, NOW())
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(event_id)
        .bind(event_type)
        .bind(event_time)
        .bind(outcome)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Run with `DATABASE_URL` pointing at a scratch database:
/// `cargo test -p chatgate-billing -- --ignored`
#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> PgLedgerStore {
        let database_url =
            std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for ledger tests");
        let pool = chatgate_shared::create_pool(&database_url)
            .await
            .expect("Failed to connect to test database");
        chatgate_shared::run_migrations(&pool)
            .await
            .expect("Failed to run migrations");
        PgLedgerStore::new(pool)
    }

    fn change(id: &str, status: SubscriptionStatus, at: i64) -> LedgerChange {
        LedgerChange {
            billing_subscription_id: id.to_string(),
            billing_customer_id: "cus_pg".to_string(),
            user_id: Some("user_pg".to_string()),
            status,
            price_id: Some("price_123".to_string()),
            current_period_end: OffsetDateTime::from_unix_timestamp(at + 2_592_000).ok(),
            event_time: OffsetDateTime::from_unix_timestamp(at).expect("valid timestamp"),
        }
    }

    fn subscription_id() -> String {
        format!("sub_pg_{}", Uuid::new_v4().simple())
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn test_newer_event_overwrites() {
        let store = store().await;
        let id = subscription_id();

        let first = store
            .apply_change(&change(&id, SubscriptionStatus::Active, 90))
            .await
            .unwrap();
        let second = store
            .apply_change(&change(&id, SubscriptionStatus::Canceled, 100))
            .await
            .unwrap();

        assert_eq!(first, WriteOutcome::Inserted);
        assert_eq!(second, WriteOutcome::Updated);
        let row = store.get(&id).await.unwrap().unwrap();
        assert_eq!(row.status, SubscriptionStatus::Canceled);
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn test_older_event_is_stale() {
        let store = store().await;
        let id = subscription_id();

        store
            .apply_change(&change(&id, SubscriptionStatus::Canceled, 100))
            .await
            .unwrap();
        let outcome = store
            .apply_change(&change(&id, SubscriptionStatus::Active, 90))
            .await
            .unwrap();

        assert_eq!(outcome, WriteOutcome::Stale);
        let row = store.get(&id).await.unwrap().unwrap();
        assert_eq!(row.status, SubscriptionStatus::Canceled);
        assert_eq!(row.source_event_time, OffsetDateTime::from_unix_timestamp(100).ok());
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn test_arrival_orders_converge() {
        let store = store().await;
        let (forward, reverse) = (subscription_id(), subscription_id());

        for (id, order) in [(&forward, [90, 100]), (&reverse, [100, 90])] {
            for at in order {
                let status = if at == 100 {
                    SubscriptionStatus::Canceled
                } else {
                    SubscriptionStatus::Active
                };
                store.apply_change(&change(id, status, at)).await.unwrap();
            }
        }

        let forward = store.get(&forward).await.unwrap().unwrap();
        let reverse = store.get(&reverse).await.unwrap().unwrap();
        assert_eq!(forward.status, reverse.status);
        assert_eq!(forward.source_event_time, reverse.source_event_time);
        assert_eq!(forward.current_period_end, reverse.current_period_end);
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn test_repeated_event_is_unchanged() {
        let store = store().await;
        let id = subscription_id();
        let active = change(&id, SubscriptionStatus::Active, 90);

        store.apply_change(&active).await.unwrap();
        let before = store.get(&id).await.unwrap();
        let outcome = store.apply_change(&active).await.unwrap();

        assert_eq!(outcome, WriteOutcome::Unchanged);
        assert_eq!(store.get(&id).await.unwrap(), before);
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn test_same_second_update_cannot_revive_canceled() {
        let store = store().await;
        let id = subscription_id();

        store
            .apply_change(&change(&id, SubscriptionStatus::Canceled, 100))
            .await
            .unwrap();
        let outcome = store
            .apply_change(&change(&id, SubscriptionStatus::Active, 100))
            .await
            .unwrap();

        assert_eq!(outcome, WriteOutcome::Stale);
        let row = store.get(&id).await.unwrap().unwrap();
        assert_eq!(row.status, SubscriptionStatus::Canceled);
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn test_insert_if_absent_keeps_event_row() {
        let store = store().await;
        let id = subscription_id();

        store
            .apply_change(&change(&id, SubscriptionStatus::Active, 90))
            .await
            .unwrap();
        let outcome = store
            .insert_if_absent(&LedgerEntry {
                billing_subscription_id: id.clone(),
                billing_customer_id: "cus_pg".to_string(),
                user_id: None,
                status: SubscriptionStatus::Incomplete,
                price_id: None,
                current_period_end: None,
                source_event_time: None,
            })
            .await
            .unwrap();

        assert_eq!(outcome, WriteOutcome::AlreadyExists);
        let row = store.get(&id).await.unwrap().unwrap();
        assert_eq!(row.status, SubscriptionStatus::Active);
    }
}
