//! Model error types.

use thiserror::Error;

/// Errors produced by the model layer.
#[derive(Debug, Error)]
pub enum Error {
    /// The request never produced an HTTP response.
    #[error("transport: {0}")]
    Transport(String),

    /// The API answered with a non-success status.
    #[error("http {status}: {message}")]
    Http { status: u16, message: String },

    /// The API rejected our credentials (HTTP 401).
    #[error("unauthorized")]
    Unauthorized,

    /// A response or record could not be interpreted.
    #[error("parse: {0}")]
    Parse(String),

    /// An action name that does not exist.
    #[error("unknown action: {0}")]
    UnknownAction(String),

    /// The action is not offered in the entity's current state.
    #[error("action {action} not allowed in state {state}")]
    ActionNotAllowed { action: String, state: String },

    /// The action target is not an entity of the expected kind.
    #[error("invalid target: {0}")]
    InvalidTarget(String),

    /// Entity not present in its collection.
    #[error("not found: {0}")]
    NotFound(String),

    /// Attempt to change the identifier of an existing entity.
    #[error("id of {kind} {id} cannot change")]
    IdChange { kind: String, id: String },

    /// Invalid attribute schema (cycles, duplicate declarations).
    #[error("schema: {0}")]
    Schema(String),

    /// Persisted view preferences could not be read or written.
    #[error("prefs: {0}")]
    Prefs(String),
}

impl Error {
    /// HTTP status code carried by the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Http { status, .. } => Some(*status),
            Error::Unauthorized => Some(401),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) if status.as_u16() == 401 => Error::Unauthorized,
            Some(status) => Error::Http {
                status: status.as_u16(),
                message: e.to_string(),
            },
            None => Error::Transport(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Parse(e.to_string())
    }
}

/// Result type for model operations.
pub type Result<T> = std::result::Result<T, Error>;
