//! Message names and bodies published by the orchestrator.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::events::EventType;

// ============================================================================
// Message names
// ============================================================================

pub const HOST_WEBSOCKET_CONNECTED: &str = "HOST_WEBSOCKET_CONNECTED";
pub const HOST_WEBSOCKET_DISCONNECTED: &str = "HOST_WEBSOCKET_DISCONNECTED";
pub const HOST_LOGS_UPDATE: &str = "HOST_LOGS_UPDATE";
pub const HOST_STATS_UPDATE: &str = "HOST_STATS_UPDATE";
pub const HOST_VM_STATE_CHANGED: &str = "HOST_VM_STATE_CHANGED";
pub const HOST_VM_ADDED: &str = "HOST_VM_ADDED";
pub const HOST_VM_REMOVED: &str = "HOST_VM_REMOVED";
pub const HOST_VM_UPDATED: &str = "HOST_VM_UPDATED";

/// VM lifecycle messages emitted by hosts on the `pdfm` topic.
pub const VM_STATE_CHANGED: &str = "VM_STATE_CHANGED";
pub const VM_ADDED: &str = "VM_ADDED";
pub const VM_REMOVED: &str = "VM_REMOVED";
pub const VM_UPDATED: &str = "VM_UPDATED";

pub const STATE_WEBSOCKET_CONNECTED: &str = "websocket_connected";
pub const STATE_WEBSOCKET_DISCONNECTED: &str = "websocket_disconnected";

/// Heartbeat text sent to hosts and answered with `pong`.
pub const PING: &str = "ping";
pub const PONG: &str = "pong";

/// Subscriber control message asking for its own client id.
pub const CLIENT_ID_REQUEST: &str = "client-id";
/// Message text of protocol error replies.
pub const ERROR: &str = "error";
pub const WARNING: &str = "warning";

pub const WELCOME_MESSAGE: &str = "WebSocket connection established subscribed to global by default";

// ============================================================================
// Bodies
// ============================================================================

/// Host connection state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostHealthUpdate {
    pub host_id: String,
    pub state: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostLogsUpdate {
    pub host_id: String,
    pub log: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostStatsUpdate {
    pub host_id: String,
    pub stats: Value,
}

/// VM event re-published with the id of the host it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostVmEvent {
    pub host_id: String,
    pub event: Value,
}

/// Minimal heartbeat frame sent to hosts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatFrame {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub message: String,
}

impl HeartbeatFrame {
    pub fn ping() -> Self {
        Self {
            event_type: EventType::Health,
            message: PING.to_string(),
        }
    }
}

// ============================================================================
// Subscriber requests and replies
// ============================================================================

/// Sent to a subscriber right after it is registered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectResponse {
    pub client_id: String,
    pub subscriptions: Vec<EventType>,
}

/// Remove topics from a subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsubscribeRequest {
    pub client_id: String,
    pub event_types: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsubscribeResponse {
    pub client_id: String,
    pub removed: Vec<EventType>,
}

/// Reply to a `client-id` control request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientIdResponse {
    pub client_id: String,
}

/// Body of a `system`/`error` or `system`/`warning` reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolNotice {
    pub error: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub valid_types: Vec<EventType>,
}
