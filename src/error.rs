//! Error types for scratchpush.
//!
//! Core modules return `crate::error::Result`. Application-level code
//! (main, server loop, client) wraps these in `anyhow` with context.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ServerError>;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Framing-level violation. Terminal for the connection.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// User-visible abort. Terminates the current operation, not the
    /// session. `hint` tells the user how to proceed.
    #[error("abort: {message}")]
    Abort {
        message: String,
        hint: Option<String>,
    },

    #[error("config error: {0}")]
    Config(String),

    #[error("bundle store error: {0}")]
    Store(String),

    #[error("no bundle found for handle {0}")]
    StoreNotFound(String),

    #[error("index error: {0}")]
    Index(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A code path that must be unreachable in a correct peer exchange.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServerError {
    pub fn abort(message: impl Into<String>) -> Self {
        ServerError::Abort {
            message: message.into(),
            hint: None,
        }
    }

    pub fn abort_with_hint(message: impl Into<String>, hint: impl Into<String>) -> Self {
        ServerError::Abort {
            message: message.into(),
            hint: Some(hint.into()),
        }
    }

    /// Render the error the way it should be reported to the pushing
    /// client: message plus hint on a separate line when present.
    pub fn user_message(&self) -> String {
        match self {
            ServerError::Abort {
                message,
                hint: Some(hint),
            } => format!("{}\n({})", message, hint),
            other => other.to_string(),
        }
    }
}
