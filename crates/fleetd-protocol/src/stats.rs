//! Hub statistics snapshot.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::events::EventType;

/// Per-subscriber detail, only exposed to privileged callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub id: String,
    pub user_id: String,
    pub username: String,
    pub connected_at: DateTime<Utc>,
    pub last_ping_at: DateTime<Utc>,
    pub last_pong_at: DateTime<Utc>,
    pub event_subscriptions: Vec<EventType>,
    pub is_alive: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HubStats {
    pub total_clients: usize,
    pub total_subscriptions: usize,
    /// Subscriber count per topic.
    pub type_stats: BTreeMap<EventType, usize>,
    pub messages_sent: u64,
    pub start_time: DateTime<Utc>,
    /// Human readable uptime, e.g. `1h2m3s`.
    pub uptime: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clients: Option<Vec<ClientInfo>>,
}
