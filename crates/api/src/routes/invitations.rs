//! Invitation lookup and redemption endpoints.

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    Json,
};
use std::collections::HashMap;

use domain::models::{
    fields, DisplayResult, DisplayStatus, InvalidReason, RedemptionStatus, RedirectHint,
    SubmissionResult, Validation,
};

use crate::app::AppState;
use crate::error::ApiError;
use crate::middleware::record_submission;

/// Describe an invitation before redemption.
///
/// GET /api/v1/invitations/:code
///
/// The body is always a `DisplayResult`; the status code mirrors it.
pub async fn display_invitation(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Result<(StatusCode, Json<DisplayResult>), ApiError> {
    let result = state.engine.display(&code).await?;
    Ok((display_status(&result), Json(result)))
}

/// Check whether a code is redeemable without resolving its servers.
///
/// GET /api/v1/invitations/:code/validate
pub async fn validate_invitation(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Result<Json<Validation>, ApiError> {
    Ok(Json(state.engine.validate(&code).await?))
}

/// Redeem an invitation.
///
/// POST /api/v1/invitations/:code/redeem
///
/// The body is a flat JSON object of string fields (`username`, `password`,
/// `confirm_password`, `email`, `token`, `session`). The code in the path
/// wins over any `code` field in the body.
pub async fn redeem_invitation(
    State(state): State<AppState>,
    Path(code): Path<String>,
    payload: Result<Json<HashMap<String, String>>, JsonRejection>,
) -> Result<(StatusCode, Json<SubmissionResult>), ApiError> {
    let Json(mut form_fields) = payload.map_err(|rejection| {
        ApiError::Validation(format!(
            "Request body must be a JSON object of string fields: {}",
            rejection.body_text()
        ))
    })?;
    form_fields.insert(fields::CODE.to_string(), code);

    let result = state.engine.submit(&form_fields).await?;
    record_submission(&result);

    Ok((submission_status(&result), Json(result)))
}

fn display_status(result: &DisplayResult) -> StatusCode {
    match (result.status, result.reason) {
        (DisplayStatus::Valid, _) => StatusCode::OK,
        (DisplayStatus::Unavailable, _) => StatusCode::SERVICE_UNAVAILABLE,
        (DisplayStatus::Invalid, Some(InvalidReason::NotFound)) => StatusCode::NOT_FOUND,
        (DisplayStatus::Invalid, Some(InvalidReason::Expired | InvalidReason::AlreadyUsed)) => {
            StatusCode::GONE
        }
        (DisplayStatus::Invalid, Some(InvalidReason::InvalidLength) | None) => {
            StatusCode::BAD_REQUEST
        }
    }
}

fn submission_status(result: &SubmissionResult) -> StatusCode {
    if matches!(result.redirect_hint, RedirectHint::ContinueWithForm { .. }) {
        return StatusCode::ACCEPTED;
    }
    match result.status {
        RedemptionStatus::Success => StatusCode::CREATED,
        RedemptionStatus::PartialSuccess => StatusCode::MULTI_STATUS,
        RedemptionStatus::Failure => StatusCode::UNPROCESSABLE_ENTITY,
    }
}
