//! Wire types shared by fleetd, the hosts it manages and its event subscribers.
//!
//! ```text
//! Host --[WS: EventMessage]--> fleetd --[WS: EventMessage]--> Subscribers
//! ```
//!
//! The same JSON envelope travels in both directions. Routing is by
//! [`EventType`]; an envelope with `client_id` set is addressed to one
//! subscriber only.

pub mod events;
pub mod payloads;
pub mod stats;

pub use events::{EventMessage, EventType, ParseEventTypesError, parse_event_types};
pub use payloads::{ConnectResponse, UnsubscribeRequest, UnsubscribeResponse};
pub use stats::{ClientInfo, HubStats};
