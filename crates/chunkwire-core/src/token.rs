//! Session tokens.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Number of random bytes in a session token
pub const TOKEN_BYTES: usize = 16;

/// Error type for parsing hex-encoded session tokens
#[derive(Debug, Error, PartialEq)]
pub enum TokenError {
    /// Invalid hexadecimal encoding
    #[error("Invalid hex encoding: {0}")]
    InvalidHex(#[from] hex::FromHexError),

    /// Wrong number of bytes
    #[error("Invalid token length: expected {expected} bytes, got {actual}")]
    InvalidLength {
        /// Expected number of bytes
        expected: usize,
        /// Actual number of bytes
        actual: usize,
    },

    /// The system random source failed
    #[error("Random source unavailable: {0}")]
    Random(String),
}

/// Opaque identifier binding a client to the server's single active session.
///
/// Rendered on the wire as 32 lowercase hex characters.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct SessionToken([u8; TOKEN_BYTES]);

impl SessionToken {
    /// Generate a fresh random token
    ///
    /// # Errors
    ///
    /// Returns `TokenError::Random` if the operating system RNG fails.
    pub fn generate() -> Result<Self, TokenError> {
        let mut bytes = [0u8; TOKEN_BYTES];
        getrandom::getrandom(&mut bytes).map_err(|e| TokenError::Random(e.to_string()))?;
        Ok(Self(bytes))
    }

    /// Raw token bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; TOKEN_BYTES] {
        &self.0
    }
}

impl FromStr for SessionToken {
    type Err = TokenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim())?;
        let actual = bytes.len();
        let array: [u8; TOKEN_BYTES] =
            bytes.try_into().map_err(|_| TokenError::InvalidLength {
                expected: TOKEN_BYTES,
                actual,
            })?;
        Ok(Self(array))
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Only a prefix, enough to correlate log lines.
        write!(f, "SessionToken({}..)", &hex::encode(&self.0[..4]))
    }
}
