//! Routing of host-originated events to handlers.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use fleetd_protocol::{EventMessage, EventType};
use log::debug;

/// Reacts to events pushed by hosts.
#[async_trait]
pub trait HostEventHandler: Send + Sync {
    async fn handle(&self, host_id: &str, event_type: EventType, payload: &EventMessage);
}

/// Topic to handler registry shared by the manager and its clients.
#[derive(Default)]
pub struct EventDispatcher {
    handlers: DashMap<EventType, Vec<Arc<dyn HostEventHandler>>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// A handler may be registered for several topics, and a topic may have several handlers.
    /// Registering the same handler for a topic again is a no-op.
    pub fn register(&self, types: &[EventType], handler: Arc<dyn HostEventHandler>) {
        for event_type in types {
            let mut handlers = self.handlers.entry(*event_type).or_default();
            if handlers.iter().any(|h| Arc::ptr_eq(h, &handler)) {
                debug!("handler already registered for {}", event_type);
                continue;
            }
            handlers.push(handler.clone());
        }
    }

    /// Topics with at least one handler, in a stable order.
    pub fn topics(&self) -> Vec<EventType> {
        let mut topics: Vec<EventType> = self.handlers.iter().map(|e| *e.key()).collect();
        topics.sort();
        topics
    }

    /// Run every handler for the message type on its own task. Never waits
    /// for the handlers; returns how many were started.
    pub fn dispatch(&self, host_id: &str, payload: EventMessage) -> usize {
        let handlers = self
            .handlers
            .get(&payload.event_type)
            .map(|h| h.clone())
            .unwrap_or_default();
        if handlers.is_empty() {
            debug!(
                "no handler for {} event from host {}",
                payload.event_type, host_id
            );
            return 0;
        }

        let payload = Arc::new(payload);
        for handler in &handlers {
            let handler = handler.clone();
            let payload = payload.clone();
            let host_id = host_id.to_string();
            tokio::spawn(async move {
                handler
                    .handle(&host_id, payload.event_type, &payload)
                    .await;
            });
        }
        handlers.len()
    }
}
