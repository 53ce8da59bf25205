//! # Error Taxonomy
//!
//! Every directory operation fails with a [`DirectoryError`]. Handler-level
//! preconditions (permission, non-empty input) fail a whole call; per-item
//! failures inside a batch are reported in that item's result entry instead.
//!
//! | Variant | Kind | Systemic |
//! |---------|------|----------|
//! | `PermissionDenied` | authorization | no |
//! | `NotFound` | missing entity | no |
//! | `EmptyGroup` / `EmptyNodes` / `EmptyUsers` | empty input | no |
//! | `Codec` | data corruption | yes |
//! | `Store` / `Io` / `Json` | persistence | yes |
//! | `Reachability` | remote node check | no |
//! | `Policy` | policy file rejected | no |
//! | `Transport` / `Remote` | client side only | - |
//!
//! Errors cross the wire as an [`ErrorKind`] plus [`DirectoryError::detail`], and are
//! rebuilt on the client with [`DirectoryError::from_wire`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DirectoryError>;

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("permission denied")]
    PermissionDenied,
    #[error("{0} not found")]
    NotFound(String),
    #[error("empty group")]
    EmptyGroup,
    #[error("empty nodes")]
    EmptyNodes,
    #[error("empty user")]
    EmptyUsers,
    #[error("codec error: {0}")]
    Codec(String),
    #[error("store error: {0}")]
    Store(String),
    #[error("unreachable: {0}")]
    Reachability(String),
    #[error("invalid policy: {0}")]
    Policy(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("transport error: {0}")]
    Transport(String),
    /// A server-side failure whose original type does not survive the wire.
    #[error("{0}")]
    Remote(String),
}

impl From<rusqlite::Error> for DirectoryError {
    fn from(e: rusqlite::Error) -> Self {
        DirectoryError::Store(e.to_string())
    }
}

/// Wire classification of a [`DirectoryError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    PermissionDenied,
    NotFound,
    EmptyGroup,
    EmptyNodes,
    EmptyUsers,
    Codec,
    Store,
    Reachability,
    Policy,
    Internal,
}

impl DirectoryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DirectoryError::PermissionDenied => ErrorKind::PermissionDenied,
            DirectoryError::NotFound(_) => ErrorKind::NotFound,
            DirectoryError::EmptyGroup => ErrorKind::EmptyGroup,
            DirectoryError::EmptyNodes => ErrorKind::EmptyNodes,
            DirectoryError::EmptyUsers => ErrorKind::EmptyUsers,
            DirectoryError::Codec(_) => ErrorKind::Codec,
            DirectoryError::Store(_) | DirectoryError::Io(_) => ErrorKind::Store,
            DirectoryError::Json(_) => ErrorKind::Codec,
            DirectoryError::Reachability(_) => ErrorKind::Reachability,
            DirectoryError::Policy(_) => ErrorKind::Policy,
            DirectoryError::Transport(_) | DirectoryError::Remote(_) => ErrorKind::Internal,
        }
    }

    /// True when the failure means the directory itself is broken rather
    /// than the caller being refused.
    pub fn is_systemic(&self) -> bool {
        matches!(self.kind(), ErrorKind::Codec | ErrorKind::Store)
    }

    /// The message sent alongside [`ErrorKind`]; `from_wire(kind, detail)`
    /// displays the same text as the original error.
    pub fn detail(&self) -> String {
        match self {
            DirectoryError::NotFound(s)
            | DirectoryError::Codec(s)
            | DirectoryError::Store(s)
            | DirectoryError::Reachability(s)
            | DirectoryError::Policy(s)
            | DirectoryError::Transport(s)
            | DirectoryError::Remote(s) => s.clone(),
            DirectoryError::Io(e) => e.to_string(),
            DirectoryError::Json(e) => e.to_string(),
            other => other.to_string(),
        }
    }

    /// Rebuild an error received as `(kind, detail)` from the server.
    pub fn from_wire(kind: ErrorKind, message: String) -> Self {
        match kind {
            ErrorKind::PermissionDenied => DirectoryError::PermissionDenied,
            ErrorKind::NotFound => DirectoryError::NotFound(message),
            ErrorKind::EmptyGroup => DirectoryError::EmptyGroup,
            ErrorKind::EmptyNodes => DirectoryError::EmptyNodes,
            ErrorKind::EmptyUsers => DirectoryError::EmptyUsers,
            ErrorKind::Codec => DirectoryError::Codec(message),
            ErrorKind::Store => DirectoryError::Store(message),
            ErrorKind::Reachability => DirectoryError::Reachability(message),
            ErrorKind::Policy => DirectoryError::Policy(message),
            ErrorKind::Internal => DirectoryError::Remote(message),
        }
    }
}
