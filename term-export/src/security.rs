//! Security utilities for term-export.
//!
//! Identifiers supplied by callers (table names, configured fingerprint
//! columns) are validated against a strict pattern before they are quoted.
//! Identifiers read back from a table schema are trusted as names but are
//! still quoted and escaped, so no identifier ever reaches SQL unquoted.

use crate::error::{ExportError, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use zeroize::ZeroizeOnDrop;

/// Maximum identifier length accepted from callers.
const MAX_IDENTIFIER_LENGTH: usize = 128;

/// A secure string that automatically clears its contents when dropped.
#[derive(Clone, ZeroizeOnDrop)]
pub struct SecureString(String);

impl std::fmt::Debug for SecureString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecureString(***)")
    }
}

impl SecureString {
    /// Create a new secure string.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Get the string value. Use carefully and avoid storing the result.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl From<String> for SecureString {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for SecureString {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// SQL identifier and literal escaping utilities.
pub struct SqlSecurity;

impl SqlSecurity {
    /// Validates and quotes a caller-supplied SQL identifier.
    ///
    /// # Examples
    /// ```rust
    /// use term_export::security::SqlSecurity;
    ///
    /// assert_eq!(SqlSecurity::escape_identifier("customer_id").unwrap(), "\"customer_id\"");
    /// assert!(SqlSecurity::escape_identifier("id; DROP TABLE users--").is_err());
    /// assert!(SqlSecurity::escape_identifier(&"very_long_name_".repeat(100)).is_err());
    /// ```
    pub fn escape_identifier(identifier: &str) -> Result<String> {
        Self::validate_identifier(identifier)?;
        Ok(Self::quote_identifier(identifier))
    }

    /// Quotes an identifier that came from a table schema.
    ///
    /// Schema-derived names may legitimately contain spaces or punctuation,
    /// so only embedded double quotes are escaped.
    pub fn quote_identifier(identifier: &str) -> String {
        format!("\"{}\"", identifier.replace('"', "\"\""))
    }

    /// Validates a caller-supplied SQL identifier without quoting it.
    pub fn validate_identifier(identifier: &str) -> Result<()> {
        if identifier.trim().is_empty() {
            return Err(ExportError::SecurityError(
                "SQL identifier cannot be empty or whitespace-only".to_string(),
            ));
        }

        if identifier.len() > MAX_IDENTIFIER_LENGTH {
            return Err(ExportError::SecurityError(format!(
                "SQL identifier too long (max {MAX_IDENTIFIER_LENGTH} characters)"
            )));
        }

        static IDENTIFIER_REGEX: Lazy<Regex> = Lazy::new(|| {
            // This regex is compile-time constant and known to be valid
            #[allow(clippy::expect_used)]
            Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_$]*$")
                .expect("Hard-coded regex pattern should be valid")
        });

        if !IDENTIFIER_REGEX.is_match(identifier) {
            return Err(ExportError::SecurityError(format!(
                "Invalid SQL identifier format: '{identifier}'. Identifiers must start with a letter or underscore and contain only letters, numbers, underscores, and '$'"
            )));
        }

        Ok(())
    }

    /// Renders a string as a single-quoted SQL literal.
    pub fn quote_literal(value: &str) -> Result<String> {
        InputValidator::validate_no_null_bytes(value, "SQL literal")?;
        Ok(format!("'{}'", value.replace('\'', "''")))
    }
}

/// Input validation utilities for various data types.
pub struct InputValidator;

impl InputValidator {
    /// Validates a numeric threshold value.
    pub fn validate_threshold(value: f64, name: &str) -> Result<()> {
        if !value.is_finite() {
            return Err(ExportError::SecurityError(format!(
                "Invalid {name} value: must be finite (not NaN or infinite)"
            )));
        }
        Ok(())
    }

    /// Validates a fraction in the half-open range (0.0, 1.0].
    pub fn validate_fraction(value: f64, name: &str) -> Result<()> {
        Self::validate_threshold(value, name)?;

        if value <= 0.0 || value > 1.0 {
            return Err(ExportError::Configuration(format!(
                "Invalid {name} value: must be in (0.0, 1.0], got {value}"
            )));
        }
        Ok(())
    }

    /// Validates that a string doesn't contain null bytes.
    pub fn validate_no_null_bytes(value: &str, name: &str) -> Result<()> {
        if value.contains('\0') {
            return Err(ExportError::SecurityError(format!(
                "{name} cannot contain null bytes"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secure_string_debug_is_redacted() {
        let secure = SecureString::new("secret123");
        assert_eq!(format!("{secure:?}"), "SecureString(***)");
        assert_eq!(secure.expose(), "secret123");
    }

    #[test]
    fn test_valid_identifiers() {
        assert!(SqlSecurity::escape_identifier("orders").is_ok());
        assert!(SqlSecurity::escape_identifier("_private").is_ok());
        assert!(SqlSecurity::escape_identifier("created_at").is_ok());
        assert!(SqlSecurity::escape_identifier("ORDER_LINE$2").is_ok());
    }

    #[test]
    fn test_invalid_identifiers() {
        assert!(SqlSecurity::escape_identifier("").is_err());
        assert!(SqlSecurity::escape_identifier("   ").is_err());
        assert!(SqlSecurity::escape_identifier("1table").is_err());
        assert!(SqlSecurity::escape_identifier("a.b").is_err());
        assert!(SqlSecurity::escape_identifier("t; DROP TABLE t").is_err());
        assert!(SqlSecurity::escape_identifier("name--").is_err());
    }

    #[test]
    fn test_quote_schema_identifier() {
        assert_eq!(SqlSecurity::quote_identifier("first name"), "\"first name\"");
        assert_eq!(SqlSecurity::quote_identifier("a\"b"), "\"a\"\"b\"");
    }

    #[test]
    fn test_quote_literal() {
        assert_eq!(SqlSecurity::quote_literal("o'brien").unwrap(), "'o''brien'");
        assert!(SqlSecurity::quote_literal("a\0b").is_err());
    }

    #[test]
    fn test_validate_fraction() {
        assert!(InputValidator::validate_fraction(0.02, "sample_fraction").is_ok());
        assert!(InputValidator::validate_fraction(1.0, "sample_fraction").is_ok());
        assert!(InputValidator::validate_fraction(0.0, "sample_fraction").is_err());
        assert!(InputValidator::validate_fraction(1.5, "sample_fraction").is_err());
        assert!(InputValidator::validate_fraction(f64::NAN, "sample_fraction").is_err());
    }
}
