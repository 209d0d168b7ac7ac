//! Credential handling.

use zeroize::{Zeroize, ZeroizeOnDrop};

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

    /// Returns a masked form suitable for display, keeping the last four characters.
    pub fn masked(&self) -> String {
        let chars: Vec<char> = self.0.chars().collect();
        if chars.len() <= 4 {
            return "****".to_string();
        }
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("****{tail}")
    }

    /// Convert to a regular string. The SecureString will be zeroized.
    pub fn into_string(mut self) -> String {
        let value = std::mem::take(&mut self.0);
        self.0.zeroize();
        value
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secure_string_expose() {
        let secure = SecureString::new("token-123");
        assert_eq!(secure.expose(), "token-123");
        assert_eq!(secure.into_string(), "token-123");
    }

    #[test]
    fn test_secure_string_debug_is_masked() {
        let secure = SecureString::from("super-secret");
        let debug = format!("{secure:?}");
        assert!(!debug.contains("super-secret"));
        assert_eq!(debug, "SecureString(***)");
    }

    #[test]
    fn test_masked() {
        assert_eq!(SecureString::new("abcdefgh").masked(), "****efgh");
        assert_eq!(SecureString::new("abc").masked(), "****");
    }
}
