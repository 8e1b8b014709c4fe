//! Folding per-server results into one redemption outcome.

use crate::models::{PerServerResult, RedemptionStatus, RedirectHint, SubmissionResult};

/// Aggregate status of a set of per-server results.
pub fn aggregate(results: &[PerServerResult]) -> RedemptionStatus {
    let succeeded = results.iter().filter(|r| r.success).count();
    match succeeded {
        0 => RedemptionStatus::Failure,
        n if n == results.len() => RedemptionStatus::Success,
        _ => RedemptionStatus::PartialSuccess,
    }
}

/// Redirect hint for a finished redemption.
pub fn redirect_for(status: RedemptionStatus) -> RedirectHint {
    match status {
        RedemptionStatus::Success | RedemptionStatus::PartialSuccess => RedirectHint::Completed,
        RedemptionStatus::Failure => RedirectHint::Retry,
    }
}

/// Build the submission result, keeping per-server messages as they are.
pub fn summarize(results: Vec<PerServerResult>) -> SubmissionResult {
    let status = aggregate(&results);
    let (successful, failed) = results.into_iter().partition(|r| r.success);
    SubmissionResult {
        status,
        successful,
        failed,
        redirect_hint: redirect_for(status),
        message: None,
    }
}
