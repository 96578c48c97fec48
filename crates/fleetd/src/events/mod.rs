//! Pub/sub hub for external WebSocket subscribers.
//!
//! A single engine task owns the subscription maps; everything else talks to
//! it through [`EventHub`]. Each subscriber socket runs a reader and a writer
//! pump (see [`client`]).

pub mod client;
mod error;
mod handler;
mod hub;
mod system;

pub use client::{ClientIdentity, ClientLiveness, HubClient};
pub use error::{HubError, HubResult};
pub use handler::{ClientAddr, subscribe_handler};
pub use hub::{EventHub, HubSettings, RunMode};
pub use system::{ClientEventHandler, SystemHandler};
