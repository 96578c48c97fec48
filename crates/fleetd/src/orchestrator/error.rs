//! Orchestrator error types.

use thiserror::Error;

use crate::host_api::HostApiError;
use crate::hosts::StoreError;

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("host {0} not found")]
    HostNotFound(String),

    #[error("virtual machine {vm_id} not found on host {host_id}")]
    VmNotFound { host_id: String, vm_id: String },

    #[error("host {0} is disabled")]
    HostDisabled(String),

    #[error("host {0} is not healthy")]
    HostUnhealthy(String),

    #[error("not authorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The stored record changed while a snapshot was being computed.
    #[error("host {0} was modified concurrently")]
    Conflict(String),

    /// Dial, read, write or timeout failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// A frame or response did not have the expected shape.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// A caller-initiated host operation failed.
    #[error("{operation} on host {host_id} failed: {source}")]
    Operation {
        host_id: String,
        operation: String,
        #[source]
        source: HostApiError,
    },
}

impl OrchestratorError {
    pub fn operation(host_id: &str, operation: impl Into<String>, source: HostApiError) -> Self {
        OrchestratorError::Operation {
            host_id: host_id.to_string(),
            operation: operation.into(),
            source,
        }
    }
}

impl From<HostApiError> for OrchestratorError {
    fn from(err: HostApiError) -> Self {
        match err {
            HostApiError::Unauthorized { url } => OrchestratorError::Unauthorized(url),
            HostApiError::Forbidden { url } => OrchestratorError::Forbidden(url),
            HostApiError::Decode { .. } => OrchestratorError::Protocol(err.to_string()),
            other => OrchestratorError::Transport(other.to_string()),
        }
    }
}
