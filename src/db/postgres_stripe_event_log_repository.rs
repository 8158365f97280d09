use crate::db::stripe_event_log_repository::StripeEventLogRepository;
use async_trait::async_trait;
use sqlx::{PgPool, Postgres};
use time::OffsetDateTime;

pub struct PostgresStripeEventLogRepository {
    pub pool: PgPool,
}

#[async_trait]
impl StripeEventLogRepository for PostgresStripeEventLogRepository {
    async fn has_processed_event(&self, event_id: &str) -> Result<bool, sqlx::Error> {
        let exists = sqlx::query_scalar::<Postgres, i32>(
            "SELECT 1 FROM stripe_event_log WHERE event_id = $1",
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?
        .is_some();

        Ok(exists)
    }

    async fn record_event(&self, event_id: &str, event_type: &str) -> Result<(), sqlx::Error> {
        sqlx::query::<Postgres>(
            r#"
            INSERT INTO stripe_event_log (event_id, event_type)
            VALUES ($1, $2)
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn purge_events_before(&self, cutoff: OffsetDateTime) -> Result<u64, sqlx::Error> {
        let result =
            sqlx::query::<Postgres>("DELETE FROM stripe_event_log WHERE processed_at < $1")
                .bind(cutoff)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }
}
