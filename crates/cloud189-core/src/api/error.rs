use std::sync::Arc;

use thiserror::Error;

use crate::config::ConfigError;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Session expired or invalid: {0}")]
    AuthExpired(String),

    #[error("Login required: {0}")]
    LoginRequired(String),

    #[error("Session refresh failed: {0}")]
    RefreshFailed(#[source] Arc<ApiError>),

    #[error("Failed to persist config: {0}")]
    Persistence(#[from] ConfigError),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Rate limited - please wait before retrying")]
    RateLimited,

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Service error {code}: {message}")]
    Service { code: String, message: String },

    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl ApiError {
    /// Truncate a response body to avoid logging excessive data
    pub(crate) fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            return body.to_string();
        }
        let mut end = MAX_ERROR_BODY_LENGTH;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
    }

    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let truncated = Self::truncate_body(body);
        match status.as_u16() {
            401 => ApiError::AuthExpired(truncated),
            403 => ApiError::AccessDenied(truncated),
            404 => ApiError::NotFound(truncated),
            429 => ApiError::RateLimited,
            500..=599 => ApiError::ServerError(truncated),
            _ => ApiError::InvalidResponse(format!("Status {}: {}", status, truncated)),
        }
    }

    /// Rebuild the error every waiter of a shared refresh receives.
    ///
    /// A refresh that could not even start because no credential is stored
    /// keeps its `LoginRequired` identity so front ends can ask for a login.
    pub(crate) fn from_refresh(shared: &Arc<ApiError>) -> Self {
        match shared.as_ref() {
            ApiError::LoginRequired(reason) => ApiError::LoginRequired(reason.clone()),
            _ => ApiError::RefreshFailed(Arc::clone(shared)),
        }
    }

    /// True when the user has to log in interactively before retrying.
    pub fn requires_login(&self) -> bool {
        match self {
            ApiError::LoginRequired(_) => true,
            ApiError::RefreshFailed(inner) => inner.requires_login(),
            _ => false,
        }
    }
}
