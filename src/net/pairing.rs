//! Session code generation and parsing
//!
//! The host of a drop session generates a short code that the other side
//! types in to find the host's connection offer. Codes are six characters
//! from an upper-case alphanumeric alphabet, e.g. `"K7Q2XD"`.
//!
//! # Example
//!
//! ```rust
//! use peerdrop::net::SessionCode;
//!
//! let code = SessionCode::generate();
//! assert_eq!(code.as_str().len(), SessionCode::LEN);
//!
//! let typed = SessionCode::parse(&code.as_str().to_lowercase()).unwrap();
//! assert_eq!(typed, code);
//! ```

use std::fmt;
use std::str::FromStr;

use rand::Rng;
use thiserror::Error;

/// Characters a session code is drawn from
const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Errors produced when parsing a session code typed by a user
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodeError {
    /// The code does not have exactly [`SessionCode::LEN`] characters
    #[error("session code must be {expected} characters, got {actual}")]
    WrongLength { expected: usize, actual: usize },

    /// The code contains a character outside the alphanumeric alphabet
    #[error("session code contains invalid character {0:?}")]
    InvalidCharacter(char),
}

/// A short, human-relayable session code
///
/// Codes are stored upper-case, so comparing two parsed codes is
/// case-insensitive with respect to what the user typed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionCode(String);

impl SessionCode {
    /// Number of characters in every code
    pub const LEN: usize = 6;

    /// Generates a new random session code
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let code = (0..Self::LEN)
            .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
            .collect();
        Self(code)
    }

    /// Parses a code entered by a user
    ///
    /// Surrounding whitespace is ignored and letters are normalized to
    /// upper case.
    ///
    /// # Errors
    ///
    /// Returns an error if the code has the wrong length or contains
    /// characters outside the alphabet.
    pub fn parse(s: &str) -> Result<Self, CodeError> {
        let s = s.trim().to_ascii_uppercase();
        let actual = s.chars().count();
        if actual != Self::LEN {
            return Err(CodeError::WrongLength {
                expected: Self::LEN,
                actual,
            });
        }
        if let Some(bad) = s.chars().find(|c| !c.is_ascii_alphanumeric()) {
            return Err(CodeError::InvalidCharacter(bad));
        }
        Ok(Self(s))
    }

    /// Returns the code as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SessionCode {
    type Err = CodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl AsRef<str> for SessionCode {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
