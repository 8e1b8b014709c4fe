//! Invitation code validation.
//!
//! Validation is split in two so the engine can reject malformed input before
//! touching the store: [`validate_shape`] checks the code itself and
//! [`validate_state`] checks the stored invitation.

use chrono::{DateTime, Utc};

use crate::models::{normalize_code, CodeBounds, InvalidReason, Invitation};

/// Check the length and alphabet of a submitted code.
///
/// Returns the normalized code on success. Codes containing anything other
/// than ASCII letters and digits cannot exist in the store and are reported
/// as [`InvalidReason::NotFound`].
pub fn validate_shape(code: &str, bounds: &CodeBounds) -> Result<String, InvalidReason> {
    let code = normalize_code(code);
    if !bounds.contains(code.chars().count()) {
        return Err(InvalidReason::InvalidLength);
    }
    if !shared::validation::is_alphanumeric_code(&code) {
        return Err(InvalidReason::NotFound);
    }
    Ok(code)
}

/// Check whether a looked-up invitation may be redeemed at `now`.
///
/// A used unlimited invitation is still redeemable.
pub fn validate_state(
    invitation: Option<&Invitation>,
    now: DateTime<Utc>,
) -> Result<&Invitation, InvalidReason> {
    let invitation = invitation.ok_or(InvalidReason::NotFound)?;
    if invitation.is_expired_at(now) {
        return Err(InvalidReason::Expired);
    }
    if invitation.used && !invitation.unlimited {
        return Err(InvalidReason::AlreadyUsed);
    }
    Ok(invitation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_shape_normalizes() {
        let bounds = CodeBounds::default();
        assert_eq!(validate_shape(" abc123 ", &bounds), Ok("ABC123".to_string()));
    }

    #[test]
    fn test_shape_length_bounds() {
        let bounds = CodeBounds::default();
        assert_eq!(
            validate_shape("ABC12", &bounds),
            Err(InvalidReason::InvalidLength)
        );
        assert_eq!(
            validate_shape("ABCDEFGHIJK", &bounds),
            Err(InvalidReason::InvalidLength)
        );
        assert!(validate_shape("ABCDEFGHIJ", &bounds).is_ok());
        assert_eq!(validate_shape("", &bounds), Err(InvalidReason::InvalidLength));
    }

    #[test]
    fn test_shape_rejects_symbols_as_not_found() {
        let bounds = CodeBounds::default();
        assert_eq!(
            validate_shape("ABC-123", &bounds),
            Err(InvalidReason::NotFound)
        );
        assert_eq!(
            validate_shape("ABC'; --", &bounds),
            Err(InvalidReason::NotFound)
        );
    }

    #[test]
    fn test_state_missing() {
        assert_eq!(
            validate_state(None, Utc::now()).err(),
            Some(InvalidReason::NotFound)
        );
    }

    #[test]
    fn test_state_expired() {
        let now = Utc::now();
        let mut invitation = Invitation::new("ABC123");
        invitation.expires = Some(now - Duration::hours(1));
        assert_eq!(
            validate_state(Some(&invitation), now).err(),
            Some(InvalidReason::Expired)
        );
    }

    #[test]
    fn test_state_future_expiry_is_valid() {
        let now = Utc::now();
        let mut invitation = Invitation::new("ABC123");
        invitation.expires = Some(now + Duration::hours(1));
        assert!(validate_state(Some(&invitation), now).is_ok());
    }

    #[test]
    fn test_state_used_limited() {
        let mut invitation = Invitation::new("ABC123");
        invitation.used = true;
        assert_eq!(
            validate_state(Some(&invitation), Utc::now()).err(),
            Some(InvalidReason::AlreadyUsed)
        );
    }

    #[test]
    fn test_state_used_unlimited_stays_valid() {
        let mut invitation = Invitation::new("ABC123");
        invitation.unlimited = true;
        invitation.used = true;
        assert!(validate_state(Some(&invitation), Utc::now()).is_ok());
    }

    #[test]
    fn test_expiry_checked_before_usage() {
        let now = Utc::now();
        let mut invitation = Invitation::new("ABC123");
        invitation.used = true;
        invitation.expires = Some(now - Duration::minutes(5));
        assert_eq!(
            validate_state(Some(&invitation), now).err(),
            Some(InvalidReason::Expired)
        );
    }
}
