//! Session identifiers
//!
//! Session ids are interpolated into index filter expressions, so they are
//! restricted to ASCII letters, digits, `_` and `-`, at most 128 bytes.

use serde::{Deserialize, Serialize};
use thiserror::Error;

const MAX_LEN: usize = 128;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionIdError {
    #[error("session id is empty")]
    Empty,
    #[error("session id is longer than {MAX_LEN} bytes")]
    TooLong,
    #[error("session id may only contain ASCII letters, digits, '_' and '-'")]
    InvalidChars,
}

/// Scope of short-term memory and episodic replay
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

impl SessionId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for SessionId {
    type Error = SessionIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let legal = |c: char| c.is_ascii_alphanumeric() || matches!(c, '_' | '-');
        match value.len() {
            0 => Err(SessionIdError::Empty),
            n if n > MAX_LEN => Err(SessionIdError::TooLong),
            _ if !value.chars().all(legal) => Err(SessionIdError::InvalidChars),
            _ => Ok(Self(value)),
        }
    }
}

impl TryFrom<&str> for SessionId {
    type Error = SessionIdError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::try_from(value.to_owned())
    }
}

impl From<SessionId> for String {
    fn from(id: SessionId) -> Self {
        id.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
