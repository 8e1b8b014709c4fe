//! Common validation utilities.

use validator::ValidationError;

/// Maximum username length accepted by the credential form.
pub const MAX_USERNAME_LENGTH: usize = 64;

/// Minimum password length accepted by the credential form.
pub const MIN_PASSWORD_LENGTH: usize = 8;

/// Returns true if the code only contains ASCII letters and digits.
///
/// Case is not significant; codes are compared case-insensitively.
pub fn is_alphanumeric_code(code: &str) -> bool {
    !code.is_empty() && code.chars().all(|c| c.is_ascii_alphanumeric())
}

/// Validates a username for remote account creation.
///
/// Backends disagree on allowed characters; this accepts the common subset:
/// letters, digits, `.`, `_`, `-` and `@`, starting with a letter or digit.
pub fn validate_username(username: &str) -> Result<(), ValidationError> {
    let trimmed = username.trim();
    if trimmed.is_empty() || trimmed.len() > MAX_USERNAME_LENGTH {
        let mut err = ValidationError::new("username_length");
        err.message = Some(
            format!("Username must be between 1 and {} characters", MAX_USERNAME_LENGTH).into(),
        );
        return Err(err);
    }

    let mut chars = trimmed.chars();
    let starts_ok = chars.next().is_some_and(|c| c.is_ascii_alphanumeric());
    let rest_ok = trimmed
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '@'));

    if starts_ok && rest_ok {
        Ok(())
    } else {
        let mut err = ValidationError::new("username_format");
        err.message = Some("Username may only contain letters, digits, '.', '_', '-' and '@'".into());
        Err(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_alphanumeric_code() {
        assert!(is_alphanumeric_code("ABC123"));
        assert!(is_alphanumeric_code("abc123"));
        assert!(!is_alphanumeric_code("ABC-123"));
        assert!(!is_alphanumeric_code("ABC 12"));
        assert!(!is_alphanumeric_code(""));
        assert!(!is_alphanumeric_code("ÄBC123"));
    }

    #[test]
    fn test_validate_username() {
        assert!(validate_username("alice").is_ok());
        assert!(validate_username("alice.smith_99").is_ok());
        assert!(validate_username("bob@example.com").is_ok());
        assert!(validate_username("").is_err());
        assert!(validate_username("   ").is_err());
        assert!(validate_username("_alice").is_err());
        assert!(validate_username("ali ce").is_err());
        assert!(validate_username(&"a".repeat(65)).is_err());
        assert!(validate_username(&"a".repeat(64)).is_ok());
    }

    #[test]
    fn test_validate_username_error_message() {
        let err = validate_username("bad name").unwrap_err();
        assert_eq!(err.code, "username_format");
        assert!(err.message.is_some());
    }
}
