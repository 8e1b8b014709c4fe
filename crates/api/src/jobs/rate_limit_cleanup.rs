//! Drops rate limiter state for clients that have gone quiet.

use std::sync::Arc;

use super::scheduler::{Job, JobFrequency};
use crate::middleware::RateLimiterState;

pub struct RateLimitCleanupJob {
    limiter: Arc<RateLimiterState>,
}

impl RateLimitCleanupJob {
    pub fn new(limiter: Arc<RateLimiterState>) -> Self {
        Self { limiter }
    }
}

#[async_trait::async_trait]
impl Job for RateLimitCleanupJob {
    fn name(&self) -> &'static str {
        "rate_limit_cleanup"
    }

    fn frequency(&self) -> JobFrequency {
        JobFrequency::Minutes(5)
    }

    async fn execute(&self) -> Result<(), String> {
        self.limiter.retain_recent();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cleanup_keeps_limiter_usable() {
        let limiter = Arc::new(RateLimiterState::new(10).unwrap());
        limiter.check("10.0.0.1").unwrap();

        let job = RateLimitCleanupJob::new(Arc::clone(&limiter));
        assert_eq!(job.frequency(), JobFrequency::Minutes(5));
        job.execute().await.unwrap();

        assert!(limiter.check("10.0.0.1").is_ok());
    }
}
