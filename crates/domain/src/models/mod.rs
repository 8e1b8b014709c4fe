//! Domain models for the invitation engine.

pub mod account;
pub mod invitation;
pub mod media_server;
pub mod redemption;

pub use account::{non_blank, Account, Identity, NewAccount, NewIdentity, ServerUsage};
pub use invitation::{generate_invitation_code, normalize_code, CodeBounds, Invitation};
pub use media_server::{
    AuthModality, Library, MediaServer, ServerSummary, ServerType, UnknownServerType,
};
pub use redemption::{
    describe_validation_errors, fields, AttemptAccount, CredentialForm, DelegatedSession,
    DisplayResult, DisplayStatus, InvalidReason, PerServerResult, RedemptionAttempt,
    RedemptionStatus, RedirectHint, SubmissionResult, TemplateHint, Validation,
};

#[cfg(test)]
mod tests {
    use super::{fields, CredentialForm};
    use std::collections::HashMap;

    #[test]
    fn test_form_reads_fields_by_exported_names() {
        let raw: HashMap<String, String> = [
            (fields::USERNAME, " alice "),
            (fields::PASSWORD, "correct-horse"),
            (fields::CONFIRM_PASSWORD, "correct-horse"),
            (fields::EMAIL, "   "),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let form = CredentialForm::from_fields(&raw);
        assert_eq!(form.username, "alice");
        assert!(form.email.is_none());
    }
}
