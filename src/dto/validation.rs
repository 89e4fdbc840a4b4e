//! Validation helpers for DTOs.

use validator::ValidationError;

const MAX_DISPLAY_NAME_CHARS: usize = 64;

/// Validates a player display name: 1 to 64 characters, no control characters, not blank.
///
/// # Examples
///
/// ```ignore
/// validate_display_name("Ada")      // Ok
/// validate_display_name("   ")      // Err - blank
/// validate_display_name("a\u{7}b")  // Err - control character
/// ```
pub fn validate_display_name(name: &str) -> Result<(), ValidationError> {
    let length = name.chars().count();
    if name.trim().is_empty() || length > MAX_DISPLAY_NAME_CHARS {
        let mut err = ValidationError::new("display_name_length");
        err.message = Some(
            format!("Display name must be 1 to {MAX_DISPLAY_NAME_CHARS} visible characters (got {length})")
                .into(),
        );
        return Err(err);
    }

    if name.chars().any(char::is_control) {
        let mut err = ValidationError::new("display_name_format");
        err.message = Some("Display name must not contain control characters".into());
        return Err(err);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_display_name_valid() {
        assert!(validate_display_name("Ada").is_ok());
        assert!(validate_display_name("Zoë Ø").is_ok());
        assert!(validate_display_name(&"x".repeat(64)).is_ok());
    }

    #[test]
    fn test_validate_display_name_invalid_length() {
        assert!(validate_display_name("").is_err());
        assert!(validate_display_name("   ").is_err());
        assert!(validate_display_name(&"x".repeat(65)).is_err());
    }

    #[test]
    fn test_validate_display_name_invalid_format() {
        assert!(validate_display_name("a\nb").is_err());
        assert!(validate_display_name("tab\there").is_err());
    }
}
