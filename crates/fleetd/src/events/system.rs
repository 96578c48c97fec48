//! Handlers for messages sent by subscribers.

use async_trait::async_trait;
use fleetd_protocol::payloads::{CLIENT_ID_REQUEST, ClientIdResponse};
use fleetd_protocol::{EventMessage, EventType};
use log::debug;

use super::hub::EventHub;

/// Reacts to messages a subscriber sends on one or more event types.
#[async_trait]
pub trait ClientEventHandler: Send + Sync {
    async fn handle(&self, hub: &EventHub, client_id: &str, message: EventMessage);
}

/// Answers `system` control messages.
pub struct SystemHandler;

#[async_trait]
impl ClientEventHandler for SystemHandler {
    async fn handle(&self, hub: &EventHub, client_id: &str, message: EventMessage) {
        if message.message != CLIENT_ID_REQUEST {
            debug!(
                "ignoring system message '{}' from subscriber {}",
                message.message, client_id
            );
            return;
        }

        let reply = EventMessage::new(EventType::System, CLIENT_ID_REQUEST)
            .with_body(ClientIdResponse {
                client_id: client_id.to_string(),
            })
            .for_client(client_id)
            .with_ref(message.id);
        if let Err(e) = hub.broadcast_message(reply).await {
            debug!("client-id reply to {} not delivered: {}", client_id, e);
        }
    }
}
