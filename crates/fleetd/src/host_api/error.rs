//! Host API error types.

use reqwest::StatusCode;
use thiserror::Error;

/// Result type for host API calls.
pub type HostApiResult<T> = Result<T, HostApiError>;

#[derive(Debug, Error)]
pub enum HostApiError {
    /// Could not reach the host.
    #[error("failed to reach {url}: {message}")]
    Transport { url: String, message: String },

    /// The host did not answer in time.
    #[error("request to {url} timed out")]
    Timeout { url: String },

    /// Credentials were rejected.
    #[error("host rejected credentials for {url}")]
    Unauthorized { url: String },

    #[error("access to {url} is forbidden")]
    Forbidden { url: String },

    #[error("{url} not found on host")]
    NotFound { url: String },

    /// Any other non-success status.
    #[error("host returned {status} for {url}: {message}")]
    Status {
        url: String,
        status: StatusCode,
        message: String,
    },

    /// The response body did not have the expected shape.
    #[error("invalid response from {url}: {message}")]
    Decode { url: String, message: String },

    /// Could not obtain credentials for the host.
    #[error("failed to obtain credentials: {0}")]
    Credentials(String),
}

impl HostApiError {
    pub(crate) fn from_reqwest(url: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            HostApiError::Timeout {
                url: url.to_string(),
            }
        } else if err.is_decode() {
            HostApiError::Decode {
                url: url.to_string(),
                message: err.to_string(),
            }
        } else {
            HostApiError::Transport {
                url: url.to_string(),
                message: err.to_string(),
            }
        }
    }

    pub(crate) fn from_status(url: &str, status: StatusCode, message: String) -> Self {
        let url = url.to_string();
        match status {
            StatusCode::UNAUTHORIZED => HostApiError::Unauthorized { url },
            StatusCode::FORBIDDEN => HostApiError::Forbidden { url },
            StatusCode::NOT_FOUND => HostApiError::NotFound { url },
            _ => HostApiError::Status {
                url,
                status,
                message,
            },
        }
    }

    /// Whether the failure happened before the host produced an answer.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            HostApiError::Transport { .. } | HostApiError::Timeout { .. }
        )
    }
}
