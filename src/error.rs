use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::store::{AccountError, StoreError};

/// Failure talking to an upstream model or search provider.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("provider call timed out")]
    Timeout,

    #[error("provider request failed: {0}")]
    Transport(String),

    #[error("provider returned status {code}: {body}")]
    Status { code: u16, body: String },

    #[error("provider payload could not be parsed: {0}")]
    Parse(String),

    #[error("provider is not configured: {0}")]
    NotConfigured(&'static str),
}

impl ProviderError {
    /// Transport failures, timeouts, throttling and 5xx responses are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout | Self::Transport(_) => true,
            Self::Status { code, .. } => *code == 429 || *code >= 500,
            Self::Parse(_) | Self::NotConfigured(_) => false,
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_decode() {
            Self::Parse(err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }
}

/// Everything an HTTP handler can fail with.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Unauthorized")]
    Unauthorized,

    #[error("{0}")]
    BadRequest(String),

    #[error("Monthly limit for research reached.")]
    QuotaExceeded { available_in_days: i64 },

    #[error("{0}")]
    PlanLimit(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

impl From<AccountError> for ApiError {
    fn from(err: AccountError) -> Self {
        match err {
            AccountError::UnknownAccount(_) => Self::Unauthorized,
            AccountError::QuotaExceeded { available_in_days } => {
                Self::QuotaExceeded { available_in_days }
            }
            other => Self::PlanLimit(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            Self::Unauthorized => (StatusCode::UNAUTHORIZED, json!({ "error": self.to_string() })),
            Self::BadRequest(_) => (StatusCode::BAD_REQUEST, json!({ "error": self.to_string() })),
            Self::QuotaExceeded { available_in_days } => (
                StatusCode::TOO_MANY_REQUESTS,
                json!({ "error": self.to_string(), "availableInDays": available_in_days }),
            ),
            Self::PlanLimit(_) => (
                StatusCode::TOO_MANY_REQUESTS,
                json!({ "error": self.to_string() }),
            ),
            Self::Store(StoreError::SessionNotFound(_)) => {
                (StatusCode::NOT_FOUND, json!({ "error": self.to_string() }))
            }
            Self::Provider(err) => {
                error!("Provider failure surfaced to client: {}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "error": "Internal server error" }),
                )
            }
        };
        (status, Json(body)).into_response()
    }
}
