//! Hub error types.

use fleetd_protocol::ParseEventTypesError;
use thiserror::Error;

pub type HubResult<T> = Result<T, HubError>;

#[derive(Debug, Error)]
pub enum HubError {
    /// The hub was never initialized or has been shut down.
    #[error("event hub is not running")]
    NotRunning,

    #[error("client not found: {0}")]
    ClientNotFound(String),

    /// Every client stays subscribed to `global`.
    #[error("cannot unsubscribe from the global event type")]
    GlobalIsMandatory,

    #[error("client {0} is not subscribed to any of the requested event types")]
    NothingToUnsubscribe(String),

    #[error("{0}")]
    InvalidEventTypes(#[from] ParseEventTypesError),

    /// Another live connection already comes from this address.
    #[error("a connection from {0} is already active")]
    ConnectionLimit(String),
}
