//! Application state shared across handlers.

use std::sync::Arc;

use crate::events::EventHub;
use crate::hosts::HostStore;
use crate::orchestrator::{HostOperations, HostWebSocketManager, ReconciliationLoop};

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<EventHub>,
    pub store: Arc<dyn HostStore>,
    pub reconciler: Arc<ReconciliationLoop>,
    pub operations: Arc<HostOperations>,
    pub connections: Arc<HostWebSocketManager>,
    /// Treat every request as coming from an admin.
    pub dev_mode: bool,
}
