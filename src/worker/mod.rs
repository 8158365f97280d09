use std::time::Duration;

use time::OffsetDateTime;
use tokio::time::sleep;
use tracing::{debug, error, info};

use crate::state::AppState;

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// What one maintenance pass cleaned up.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub purged_events: u64,
    pub pruned_locks: usize,
}

/// Drops processed-event ids older than the retention window and idle user locks.
pub async fn run_maintenance(state: &AppState) -> Result<MaintenanceReport, sqlx::Error> {
    let cutoff = OffsetDateTime::now_utc() - state.config.stripe_event_retention;
    let purged_events = state.stripe_events.purge_events_before(cutoff).await?;
    let pruned_locks = state.provisioner.locks().prune();
    Ok(MaintenanceReport {
        purged_events,
        pruned_locks,
    })
}

pub async fn start_background_workers(state: AppState) {
    tokio::spawn(async move {
        loop {
            match run_maintenance(&state).await {
                Ok(report) if report.purged_events > 0 => {
                    info!(
                        purged_events = report.purged_events,
                        pruned_locks = report.pruned_locks,
                        "maintenance pass finished"
                    );
                }
                Ok(report) => {
                    debug!(pruned_locks = report.pruned_locks, "maintenance pass finished")
                }
                Err(err) => error!(?err, "maintenance pass failed"),
            }
            sleep(MAINTENANCE_INTERVAL).await;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::mock_db::MockDb;
    use crate::services::openrouter::InMemoryKeyProvisioner;
    use crate::state::test_support::harness;
    use time::Duration as TimeDuration;

    #[tokio::test]
    async fn purges_only_events_past_retention() {
        let h = harness(MockDb::default(), InMemoryKeyProvisioner::new());
        let now = OffsetDateTime::now_utc();
        h.events.insert_at("evt_old", now - TimeDuration::days(31));
        h.events.insert_at("evt_recent", now - TimeDuration::days(2));

        let report = run_maintenance(&h.state).await.unwrap();

        assert_eq!(report.purged_events, 1);
        assert_eq!(h.events.recorded_events(), vec!["evt_recent".to_string()]);
    }

    #[tokio::test]
    async fn prunes_idle_user_locks() {
        let h = harness(MockDb::default(), InMemoryKeyProvisioner::new());
        let locks = h.state.provisioner.locks().clone();
        drop(locks.lock("user-1").await);
        let held = locks.lock("user-2").await;

        let report = run_maintenance(&h.state).await.unwrap();

        assert_eq!(report.pruned_locks, 1);
        assert_eq!(locks.len(), 1);
        drop(held);
    }
}
