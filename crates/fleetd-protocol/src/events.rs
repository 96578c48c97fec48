//! Event envelope and topic names.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

// ============================================================================
// Event types
// ============================================================================

/// Routing key for pub/sub delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventType {
    /// Every subscriber is implicitly subscribed to this topic.
    Global,
    System,
    Vm,
    Host,
    Pdfm,
    Orchestrator,
    Health,
    Stats,
    SystemLogs,
}

impl EventType {
    pub const ALL: [EventType; 9] = [
        EventType::Global,
        EventType::System,
        EventType::Vm,
        EventType::Host,
        EventType::Pdfm,
        EventType::Orchestrator,
        EventType::Health,
        EventType::Stats,
        EventType::SystemLogs,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Global => "global",
            EventType::System => "system",
            EventType::Vm => "vm",
            EventType::Host => "host",
            EventType::Pdfm => "pdfm",
            EventType::Orchestrator => "orchestrator",
            EventType::Health => "health",
            EventType::Stats => "stats",
            EventType::SystemLogs => "system_logs",
        }
    }

    /// Comma separated list of every valid topic name.
    pub fn valid_names() -> String {
        Self::ALL
            .iter()
            .map(|t| t.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a topic name is not recognised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownEventType(pub String);

impl fmt::Display for UnknownEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown event type '{}'", self.0)
    }
}

impl std::error::Error for UnknownEventType {}

impl FromStr for EventType {
    type Err = UnknownEventType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == normalized)
            .ok_or_else(|| UnknownEventType(s.trim().to_string()))
    }
}

impl Serialize for EventType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Result of parsing a list of topic names where some entries were invalid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseEventTypesError {
    /// Topics that parsed successfully, in request order without duplicates.
    pub valid: Vec<EventType>,
    /// Names that did not match any topic.
    pub invalid: Vec<String>,
}

impl fmt::Display for ParseEventTypesError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid event types: {}. Valid types are: {}",
            self.invalid.join(", "),
            EventType::valid_names()
        )
    }
}

impl std::error::Error for ParseEventTypesError {}

/// Parse topic names, trimming whitespace and ignoring case and empty entries.
pub fn parse_event_types<I, S>(names: I) -> Result<Vec<EventType>, ParseEventTypesError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut valid = Vec::new();
    let mut invalid = Vec::new();
    for name in names {
        let name = name.as_ref().trim();
        if name.is_empty() {
            continue;
        }
        match name.parse::<EventType>() {
            Ok(t) if !valid.contains(&t) => valid.push(t),
            Ok(_) => {}
            Err(e) => invalid.push(e.0),
        }
    }
    if invalid.is_empty() {
        Ok(valid)
    } else {
        Err(ParseEventTypesError { valid, invalid })
    }
}

// ============================================================================
// Envelope
// ============================================================================

/// JSON envelope exchanged with hosts and subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMessage {
    #[serde(default = "new_message_id")]
    pub id: String,

    /// Topic. Older hosts send this as `event_type`.
    #[serde(rename = "type", alias = "event_type")]
    pub event_type: EventType,

    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,

    #[serde(default)]
    pub message: String,

    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub body: Value,

    /// When set, the message goes to this subscriber only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    /// Correlates a reply with the request that caused it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ref_id: Option<String>,
}

fn new_message_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl EventMessage {
    pub fn new(event_type: EventType, message: impl Into<String>) -> Self {
        Self {
            id: new_message_id(),
            event_type,
            timestamp: Utc::now(),
            message: message.into(),
            body: Value::Null,
            client_id: None,
            ref_id: None,
        }
    }

    pub fn with_body(mut self, body: impl Serialize) -> Self {
        self.body = serde_json::to_value(body).unwrap_or(Value::Null);
        self
    }

    pub fn for_client(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn with_ref(mut self, ref_id: impl Into<String>) -> Self {
        self.ref_id = Some(ref_id.into());
        self
    }

    /// Whether this message is addressed to a single subscriber.
    pub fn is_unicast(&self) -> bool {
        self.client_id.as_deref().is_some_and(|id| !id.is_empty())
    }

    /// Serialize for the wire.
    pub fn to_json(&self) -> String {
        // Serializing a struct of strings and a Value cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_parsing_is_trimmed_and_case_insensitive() {
        assert_eq!(" VM ".parse::<EventType>().unwrap(), EventType::Vm);
        assert_eq!(
            "System_Logs".parse::<EventType>().unwrap(),
            EventType::SystemLogs
        );
        assert!("vms".parse::<EventType>().is_err());
    }

    #[test]
    fn parse_event_types_splits_valid_and_invalid() {
        let err = parse_event_types(["vm", "bogus", "HOST", "vm", ""]).unwrap_err();
        assert_eq!(err.valid, vec![EventType::Vm, EventType::Host]);
        assert_eq!(err.invalid, vec!["bogus".to_string()]);
        assert!(err.to_string().contains("system_logs"));

        let ok = parse_event_types("health,stats".split(',')).unwrap();
        assert_eq!(ok, vec![EventType::Health, EventType::Stats]);
    }

    #[test]
    fn envelope_accepts_legacy_event_type_key() {
        let raw = r#"{"event_type":"health","message":"pong"}"#;
        let msg: EventMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.event_type, EventType::Health);
        assert_eq!(msg.message, "pong");
        assert!(!msg.id.is_empty());
        assert!(!msg.is_unicast());
    }

    #[test]
    fn envelope_omits_empty_optionals() {
        let msg = EventMessage::new(EventType::Vm, "hello");
        let json: Value = serde_json::from_str(&msg.to_json()).unwrap();
        assert_eq!(json["type"], "vm");
        assert!(json.get("client_id").is_none());
        assert!(json.get("body").is_none());

        let msg = msg.for_client("abc").with_ref("req-1");
        assert!(msg.is_unicast());
        let json: Value = serde_json::from_str(&msg.to_json()).unwrap();
        assert_eq!(json["client_id"], "abc");
        assert_eq!(json["ref_id"], "req-1");
    }
}
