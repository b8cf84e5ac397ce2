use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Failure talking to the time-series store.
#[derive(Debug, Error)]
pub enum ReadError {
    #[error("time-series store unreachable: {0}")]
    Unreachable(String),

    #[error("time-series query rejected ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("time-series query timed out after {0:?}")]
    Timeout(Duration),

    #[error("malformed time-series response: {0}")]
    Malformed(String),
}

/// Failure delivering one push message. Never escalated past the subscription.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("malformed subscription descriptor: {0}")]
    MalformedDescriptor(#[from] serde_json::Error),

    #[error("push endpoint is gone ({0})")]
    Gone(u16),

    #[error("push transport rejected message ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("push transport unreachable: {0}")]
    Unreachable(String),

    #[error("push delivery timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error(transparent)]
    UpstreamRead(#[from] ReadError),

    #[error("persistence failure: {0:#}")]
    Persistence(anyhow::Error),
}

pub type CoreResult<T> = std::result::Result<T, CoreError>;

impl CoreError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::UpstreamRead(_) => StatusCode::BAD_GATEWAY,
            Self::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, status = %status, "request failed");
        }
        let body = ErrorBody {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
