//! Purges hybrid redemption sessions that were never completed.

use chrono::Utc;
use persistence::PgInvitationStore;

use super::scheduler::{Job, JobFrequency};

pub struct SessionCleanupJob {
    store: PgInvitationStore,
    interval_secs: u64,
}

impl SessionCleanupJob {
    pub fn new(store: PgInvitationStore, interval_secs: u64) -> Self {
        Self {
            store,
            interval_secs,
        }
    }
}

#[async_trait::async_trait]
impl Job for SessionCleanupJob {
    fn name(&self) -> &'static str {
        "session_cleanup"
    }

    fn frequency(&self) -> JobFrequency {
        JobFrequency::Seconds(self.interval_secs)
    }

    async fn execute(&self) -> Result<(), String> {
        let purged = self
            .store
            .purge_expired_sessions(Utc::now())
            .await
            .map_err(|e| e.to_string())?;
        if purged > 0 {
            tracing::info!(purged = purged, "Purged expired delegated sessions");
            metrics::counter!("delegated_sessions_expired_total").increment(purged);
        }
        Ok(())
    }
}
