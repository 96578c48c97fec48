//! API error type and its JSON rendering.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, warn};

use crate::events::HubError;
use crate::hosts::StoreError;
use crate::orchestrator::OrchestratorError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    ServiceUnavailable(String),

    #[error("{0}")]
    Internal(String),

    #[error("{0}")]
    BadGateway(String),
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::BadGateway(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

/// Body of every error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub message: String,
    pub code: u16,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = self.to_string();

        match &self {
            ApiError::Internal(msg) | ApiError::BadGateway(msg) => {
                error!(status = status.as_u16(), message = %msg, "API error");
            }
            ApiError::ServiceUnavailable(msg) => {
                warn!(status = status.as_u16(), message = %msg, "Service unavailable");
            }
            _ => {
                tracing::debug!(status = status.as_u16(), message = %message, "Client error");
            }
        }

        let body = ErrorResponse {
            message,
            code: status.as_u16(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        let message = err.to_string();
        match err {
            OrchestratorError::HostNotFound(_) | OrchestratorError::VmNotFound { .. } => {
                ApiError::NotFound(message)
            }
            OrchestratorError::HostDisabled(_) | OrchestratorError::Conflict(_) => {
                ApiError::Conflict(message)
            }
            OrchestratorError::HostUnhealthy(_) => ApiError::ServiceUnavailable(message),
            OrchestratorError::Store(err) => err.into(),
            // the host refused or failed us, not the caller
            OrchestratorError::Unauthorized(_)
            | OrchestratorError::Forbidden(_)
            | OrchestratorError::Transport(_)
            | OrchestratorError::Protocol(_)
            | OrchestratorError::Operation { .. } => ApiError::BadGateway(message),
        }
    }
}

impl From<HubError> for ApiError {
    fn from(err: HubError) -> Self {
        let message = err.to_string();
        match err {
            HubError::NotRunning => ApiError::ServiceUnavailable(message),
            HubError::ClientNotFound(_) => ApiError::NotFound(message),
            HubError::GlobalIsMandatory
            | HubError::NothingToUnsubscribe(_)
            | HubError::InvalidEventTypes(_) => ApiError::BadRequest(message),
            HubError::ConnectionLimit(_) => ApiError::Conflict(message),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        let message = err.to_string();
        match err {
            StoreError::NotFound(_) => ApiError::NotFound(message),
            StoreError::AlreadyExists(_) => ApiError::Conflict(message),
            StoreError::Io(_) | StoreError::Serde(_) => ApiError::Internal(message),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
