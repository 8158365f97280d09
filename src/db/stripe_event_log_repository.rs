use async_trait::async_trait;
use time::OffsetDateTime;

/// Ids of gateway events that were already handled, so redelivery is a no-op.
#[async_trait]
pub trait StripeEventLogRepository: Send + Sync {
    async fn has_processed_event(&self, event_id: &str) -> Result<bool, sqlx::Error>;

    async fn record_event(&self, event_id: &str, event_type: &str) -> Result<(), sqlx::Error>;

    /// Deletes entries processed before `cutoff`; returns how many were removed.
    async fn purge_events_before(&self, cutoff: OffsetDateTime) -> Result<u64, sqlx::Error>;
}
