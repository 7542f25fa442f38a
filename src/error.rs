use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

/// A client mistake in the request body. Always surfaced as a 400.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{0} is required")]
    MissingField(&'static str),
    #[error("invalid request body: {0}")]
    Malformed(String),
    #[error("unsupported model: {0}")]
    UnsupportedModel(String),
}

/// Failure talking to the completion provider.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("upstream transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("upstream returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed upstream event: {0}")]
    Protocol(String),
}

/// No tokenizer could be built for a configured model.
#[derive(Debug, Error)]
#[error("no tokenizer available for model {model}: {reason}")]
pub struct TokenizerError {
    pub model: String,
    pub reason: String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{name} has an invalid value {value:?}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Everything that can stop a relay session before its stream opens.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    #[error(transparent)]
    Tokenizer(#[from] TokenizerError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl RelayError {
    pub fn status(&self) -> StatusCode {
        match self {
            RelayError::Validation(_) => StatusCode::BAD_REQUEST,
            RelayError::Upstream(_) => StatusCode::BAD_GATEWAY,
            RelayError::Tokenizer(_) | RelayError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Client-facing message. Provider and tokenizer details stay in the logs.
    fn public_message(&self) -> String {
        match self {
            RelayError::Validation(e) => e.to_string(),
            RelayError::Upstream(_) => "upstream request failed".to_string(),
            RelayError::Tokenizer(_) | RelayError::Internal(_) => {
                "internal server error".to_string()
            }
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("❌ {}", self);
        }
        (status, Json(json!({ "error": self.public_message() }))).into_response()
    }
}
