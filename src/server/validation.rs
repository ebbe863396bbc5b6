use chrono::{DateTime, Duration, Utc};

use crate::server::response::ApiError;

const MAX_KEY_NAME_LEN: usize = 100;
const MAX_KEY_EXPIRY_DAYS: i64 = 365;
const MIN_PASSWORD_LEN: usize = 8;

pub fn validate_key_name(name: &str) -> Result<(), ApiError> {
    let len = name.trim().chars().count();
    if len == 0 {
        return Err(ApiError::validation("Key name cannot be empty"));
    }
    if name.chars().count() > MAX_KEY_NAME_LEN {
        return Err(ApiError::validation(format!(
            "Key name cannot exceed {MAX_KEY_NAME_LEN} characters"
        )));
    }
    Ok(())
}

/// Converts an expiry in days to an absolute timestamp. `None` never expires.
pub fn key_expiry(
    expires_in_days: Option<i64>,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, ApiError> {
    match expires_in_days {
        None => Ok(None),
        Some(days) if days <= 0 => Err(ApiError::validation(
            "Expiry must be a positive number of days",
        )),
        Some(days) if days > MAX_KEY_EXPIRY_DAYS => Err(ApiError::validation(format!(
            "Expiry cannot exceed {MAX_KEY_EXPIRY_DAYS} days"
        ))),
        Some(days) => Ok(Some(now + Duration::days(days))),
    }
}

pub fn validate_email(email: &str) -> Result<(), ApiError> {
    // `:` would break the account label of TOTP provisioning URIs.
    let valid = !email.contains(':')
        && email
            .split_once('@')
            .is_some_and(|(local, domain)| !local.is_empty() && !domain.is_empty());
    if !valid {
        return Err(ApiError::validation("Invalid email address"));
    }
    Ok(())
}

pub fn validate_password(password: &str) -> Result<(), ApiError> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(ApiError::validation(format!(
            "Password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_name() {
        assert!(validate_key_name("ci").is_ok());
        assert!(validate_key_name("").is_err());
        assert!(validate_key_name("   ").is_err());
        assert!(validate_key_name(&"x".repeat(100)).is_ok());
        assert!(validate_key_name(&"x".repeat(101)).is_err());
    }

    #[test]
    fn test_key_expiry_bounds() {
        let now = Utc::now();
        assert_eq!(key_expiry(None, now).unwrap(), None);
        assert_eq!(
            key_expiry(Some(30), now).unwrap(),
            Some(now + Duration::days(30))
        );
        assert!(key_expiry(Some(365), now).is_ok());

        for bad in [0, -1, 366] {
            let err = key_expiry(Some(bad), now).unwrap_err();
            assert_eq!(err.code, "validation_error");
        }
    }

    #[test]
    fn test_email() {
        assert!(validate_email("a@example.com").is_ok());
        assert!(validate_email("example.com").is_err());
        assert!(validate_email("@example.com").is_err());
        assert!(validate_email("a@").is_err());
        assert!(validate_email("a:b@example.com").is_err());
    }

    #[test]
    fn test_password_length() {
        assert!(validate_password("12345678").is_ok());
        assert!(validate_password("1234567").is_err());
    }
}
