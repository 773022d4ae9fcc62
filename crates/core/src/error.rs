use serde::{Deserialize, Serialize};

/// Errors surfaced by the access layer. Every failure of a read or mutation ends up
/// as one of these, either in `QueryResult::error` or in a mutation's `Err`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum DataError {
    /// The remote call could not complete (network, timeout, backend unavailable).
    #[error("transport: {0}")]
    Transport(String),
    /// The remote service rejected the payload or the request.
    #[error("validation: {message}")]
    Validation { code: Option<String>, message: String },
    /// Update/delete target does not exist.
    #[error("not_found: {collection}/{id}")]
    NotFound { collection: String, id: String },
    /// A record could not be decoded into the caller's shape.
    #[error("decode: {0}")]
    Decode(String),
}

pub type DataResult<T> = Result<T, DataError>;

impl DataError {
    pub fn transport(msg: impl Into<String>) -> Self { DataError::Transport(msg.into()) }

    pub fn validation(msg: impl Into<String>) -> Self {
        DataError::Validation { code: None, message: msg.into() }
    }

    pub fn validation_code(code: impl Into<String>, msg: impl Into<String>) -> Self {
        DataError::Validation { code: Some(code.into()), message: msg.into() }
    }

    pub fn not_found(collection: &str, id: impl Into<String>) -> Self {
        DataError::NotFound { collection: collection.to_string(), id: id.into() }
    }

    /// Short machine-readable label, used for metric labels and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            DataError::Transport(_) => "transport",
            DataError::Validation { .. } => "validation",
            DataError::NotFound { .. } => "not_found",
            DataError::Decode(_) => "decode",
        }
    }

    /// Backend-provided error code, if any.
    pub fn code(&self) -> Option<&str> {
        match self {
            DataError::Validation { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    pub fn is_transport(&self) -> bool { matches!(self, DataError::Transport(_)) }
}

impl From<serde_json::Error> for DataError {
    fn from(err: serde_json::Error) -> Self { DataError::Decode(err.to_string()) }
}
