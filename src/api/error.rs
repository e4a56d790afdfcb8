//! Error type shared by all API surfaces.

use thiserror::Error;

/// Errors reported by the HTTP core and the typed APIs on top of it.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Transport-level failure after the retry budget is exhausted.
    #[error("Netzwerkfehler: {0}")]
    Network(String),

    /// Server answered with an error envelope (HTTP status >= 400).
    #[error("{message} (HTTP {status_code})")]
    Api {
        status_code: u16,
        message: String,
        details: serde_json::Value,
    },
}

impl ApiError {
    pub fn api(status_code: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status_code,
            message: message.into(),
            details: serde_json::Value::Null,
        }
    }

    /// HTTP status code, if the server produced one.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Network(_) => None,
            Self::Api { status_code, .. } => Some(*status_code),
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status_code() == Some(401)
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
