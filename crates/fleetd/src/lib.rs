//! fleetd keeps a fleet of virtualization hosts reconciled, holds a live
//! event stream to each of them and fans events out to external subscribers.

pub mod api;
pub mod config;
pub mod events;
pub mod host_api;
pub mod hosts;
pub mod orchestrator;
