//! Redemption request and result models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;
use validator::{Validate, ValidationErrors};

use super::account::non_blank;
use super::media_server::{ServerSummary, ServerType};

/// Form field names understood by [`crate::services::RedemptionEngine::submit`].
pub mod fields {
    pub const CODE: &str = "code";
    pub const USERNAME: &str = "username";
    pub const PASSWORD: &str = "password";
    pub const CONFIRM_PASSWORD: &str = "confirm_password";
    pub const EMAIL: &str = "email";
    pub const TOKEN: &str = "token";
    pub const SESSION: &str = "session";
}

/// Why an invitation code cannot be redeemed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidReason {
    InvalidLength,
    NotFound,
    Expired,
    AlreadyUsed,
}

impl InvalidReason {
    pub fn message(&self) -> &'static str {
        match self {
            InvalidReason::InvalidLength => "Invitation code has an invalid length",
            InvalidReason::NotFound => "Invitation code not found",
            InvalidReason::Expired => "Invitation code has expired",
            InvalidReason::AlreadyUsed => "Invitation code has already been used",
        }
    }
}

impl fmt::Display for InvalidReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message())
    }
}

/// Outcome of validating a code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct Validation {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<InvalidReason>,
}

impl Validation {
    pub fn valid() -> Self {
        Self {
            valid: true,
            reason: None,
        }
    }

    pub fn invalid(reason: InvalidReason) -> Self {
        Self {
            valid: false,
            reason: Some(reason),
        }
    }
}

/// Outcome of provisioning on a single server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PerServerResult {
    pub server_id: Uuid,
    pub server_name: String,
    pub server_type: Option<ServerType>,
    pub success: bool,
    pub message: String,
}

/// Aggregate outcome of a redemption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RedemptionStatus {
    Success,
    PartialSuccess,
    Failure,
}

impl RedemptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RedemptionStatus::Success => "success",
            RedemptionStatus::PartialSuccess => "partial_success",
            RedemptionStatus::Failure => "failure",
        }
    }
}

impl fmt::Display for RedemptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Which page the caller should render for a code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateHint {
    CredentialForm,
    DelegatedLogin,
    DelegatedThenForm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayStatus {
    Valid,
    Invalid,
    /// The code is valid but its servers cannot be resolved.
    Unavailable,
}

/// Result of looking up a code before redemption.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct DisplayResult {
    pub status: DisplayStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<InvalidReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub template_hint: TemplateHint,
    pub servers: Vec<ServerSummary>,
}

impl DisplayResult {
    pub fn invalid(reason: InvalidReason) -> Self {
        Self {
            status: DisplayStatus::Invalid,
            reason: Some(reason),
            message: Some(reason.message().to_string()),
            template_hint: TemplateHint::CredentialForm,
            servers: Vec::new(),
        }
    }
}

/// Where the caller should send the user next.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RedirectHint {
    Completed,
    Retry,
    ContinueWithForm { session: String },
}

/// Result of a redemption submission.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct SubmissionResult {
    pub status: RedemptionStatus,
    pub successful: Vec<PerServerResult>,
    pub failed: Vec<PerServerResult>,
    pub redirect_hint: RedirectHint,
    /// Set when the attempt failed as a whole before reaching any server.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl SubmissionResult {
    /// A failure that happened before any server was attempted.
    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            status: RedemptionStatus::Failure,
            successful: Vec::new(),
            failed: Vec::new(),
            redirect_hint: RedirectHint::Retry,
            message: Some(message.into()),
        }
    }

    /// Number of servers the attempt touched.
    pub fn attempted(&self) -> usize {
        self.successful.len() + self.failed.len()
    }
}

/// Credentials submitted for form-based backends.
#[derive(Clone, Default, Deserialize, Validate)]
#[serde(rename_all = "snake_case")]
pub struct CredentialForm {
    #[validate(custom(function = "shared::validation::validate_username"))]
    pub username: String,

    #[validate(length(
        min = 8,
        max = 256,
        message = "password must be between 8 and 256 characters"
    ))]
    pub password: String,

    #[validate(must_match(other = "password", message = "passwords do not match"))]
    pub confirm_password: String,

    #[validate(email(message = "email address is not valid"))]
    pub email: Option<String>,
}

impl CredentialForm {
    /// Build a form from raw submitted fields. Blank emails are dropped.
    pub fn from_fields(raw: &HashMap<String, String>) -> Self {
        let get = |name: &str| raw.get(name).cloned().unwrap_or_default();
        Self {
            username: get(fields::USERNAME).trim().to_string(),
            password: get(fields::PASSWORD),
            confirm_password: get(fields::CONFIRM_PASSWORD),
            email: non_blank(raw.get(fields::EMAIL).map(String::as_str)).map(str::to_string),
        }
    }

    /// Returns true if the raw fields carry any credential input.
    pub fn present_in(raw: &HashMap<String, String>) -> bool {
        [fields::USERNAME, fields::PASSWORD]
            .iter()
            .any(|name| raw.get(*name).is_some_and(|v| !v.trim().is_empty()))
    }
}

impl fmt::Debug for CredentialForm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialForm")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("email", &self.email)
            .finish()
    }
}

/// Flatten validator errors into a single human readable message.
pub fn describe_validation_errors(errors: &ValidationErrors) -> String {
    let mut messages: Vec<String> = errors
        .field_errors()
        .iter()
        .flat_map(|(field, errors)| {
            errors.iter().map(move |err| match &err.message {
                Some(message) => format!("{}: {}", field, message),
                None => format!("{}: invalid value", field),
            })
        })
        .collect();
    messages.sort();
    messages.join(", ")
}

/// An account produced earlier in the same redemption attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct AttemptAccount {
    pub account_id: Uuid,
    pub server_id: Uuid,
    pub username: String,
    pub email: Option<String>,
    pub identity_id: Option<Uuid>,
}

/// State shared by every server within one redemption attempt.
///
/// `verified_email` is only ever set from a delegated-token provisioning
/// result, never from user input.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RedemptionAttempt {
    pub verified_email: Option<String>,
    pub accounts: Vec<AttemptAccount>,
}

impl RedemptionAttempt {
    /// Record the identity now shared by the given accounts.
    pub fn assign_identity(&mut self, account_ids: &[Uuid], identity_id: Uuid) {
        for account in self
            .accounts
            .iter_mut()
            .filter(|a| account_ids.contains(&a.account_id))
        {
            account.identity_id = Some(identity_id);
        }
    }
}

/// Server-side state carried between the two phases of a hybrid redemption.
///
/// The invitee's delegated token is spent in the first phase and never kept.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DelegatedSession {
    /// SHA-256 of the correlation id handed to the client.
    pub key_hash: String,
    pub invitation_id: Uuid,
    pub code: String,
    pub attempt: RedemptionAttempt,
    pub results: Vec<PerServerResult>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl DelegatedSession {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}
