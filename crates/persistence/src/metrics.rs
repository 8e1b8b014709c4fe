//! Database metrics.

use metrics::{counter, gauge, histogram};
use sqlx::PgPool;
use std::time::Instant;

/// Record how long a named query took.
pub fn record_query_duration(query: &'static str, duration_secs: f64) {
    histogram!("database_query_duration_seconds", "query" => query).record(duration_secs);
}

/// Count a query that returned an error.
pub fn record_query_error(query: &'static str) {
    counter!("database_query_errors_total", "query" => query).increment(1);
}

/// Publish pool occupancy gauges. Called periodically by the pool metrics job.
pub fn record_pool_metrics(pool: &PgPool) {
    let size = pool.size() as usize;
    let idle = pool.num_idle();
    let active = size.saturating_sub(idle);

    gauge!("database_connections_active").set(active as f64);
    gauge!("database_connections_idle").set(idle as f64);
    gauge!("database_connections_total").set(size as f64);
}

/// Times a query and records it under a fixed name.
///
/// ```ignore
/// let timer = QueryTimer::new("find_invitation_by_code");
/// let result = sqlx::query_as::<_, InvitationEntity>(...).fetch_optional(&pool).await;
/// timer.record();
/// ```
pub struct QueryTimer {
    query: &'static str,
    start: Instant,
}

impl QueryTimer {
    pub fn new(query: &'static str) -> Self {
        Self {
            query,
            start: Instant::now(),
        }
    }

    pub fn record(self) {
        record_query_duration(self.query, self.start.elapsed().as_secs_f64());
    }

    /// Record the duration and, for an error result, bump the error counter.
    pub fn record_result<T, E>(self, result: &Result<T, E>) {
        if result.is_err() {
            record_query_error(self.query);
        }
        self.record();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_timer_keeps_name() {
        let timer = QueryTimer::new("find_invitation_by_code");
        assert_eq!(timer.query, "find_invitation_by_code");
    }

    #[test]
    fn test_record_result_without_recorder() {
        // No global recorder is installed in unit tests; recording is a no-op.
        let ok: Result<(), ()> = Ok(());
        QueryTimer::new("ok_query").record_result(&ok);
        let err: Result<(), ()> = Err(());
        QueryTimer::new("failing_query").record_result(&err);
    }
}
