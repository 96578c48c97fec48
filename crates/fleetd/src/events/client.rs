//! Subscriber connections.
//!
//! Each socket gets a reader pump and a writer pump. Whichever pump fails
//! first tears the client down; [`ClientLiveness::mark_dead`] makes sure the
//! hub hears about it exactly once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use chrono::{DateTime, Utc};
use fleetd_protocol::payloads::{CLIENT_ID_REQUEST, ERROR, ProtocolNotice};
use fleetd_protocol::{EventMessage, EventType};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::{Instant, interval_at, timeout};
use tokio_util::sync::CancellationToken;

use super::hub::EventHub;

/// Who is on the other end of a subscriber socket.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClientIdentity {
    pub user_id: String,
    pub username: String,
}

/// Heartbeat bookkeeping shared between the pumps and the hub.
#[derive(Debug)]
pub struct ClientLiveness {
    alive: AtomicBool,
    last_ping_at: Mutex<DateTime<Utc>>,
    last_pong_at: Mutex<DateTime<Utc>>,
}

impl ClientLiveness {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            alive: AtomicBool::new(true),
            last_ping_at: Mutex::new(now),
            last_pong_at: Mutex::new(now),
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Flip alive to dead. Only the first caller gets `true`.
    pub fn mark_dead(&self) -> bool {
        self.alive
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn touch_ping(&self) {
        *self.last_ping_at.lock().unwrap_or_else(PoisonError::into_inner) = Utc::now();
    }

    pub fn touch_pong(&self) {
        *self.last_pong_at.lock().unwrap_or_else(PoisonError::into_inner) = Utc::now();
    }

    pub fn last_ping_at(&self) -> DateTime<Utc> {
        *self.last_ping_at.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn last_pong_at(&self) -> DateTime<Utc> {
        *self.last_pong_at.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A registered subscriber as the hub engine sees it.
#[derive(Debug)]
pub struct HubClient {
    pub id: String,
    pub identity: ClientIdentity,
    pub remote_ip: Option<String>,
    pub connected_at: DateTime<Utc>,
    liveness: Arc<ClientLiveness>,
    mailbox: mpsc::Sender<EventMessage>,
}

impl HubClient {
    /// Create a client and the receiving end of its mailbox.
    pub fn new(
        identity: ClientIdentity,
        remote_ip: Option<String>,
        mailbox_size: usize,
    ) -> (Self, mpsc::Receiver<EventMessage>) {
        let (tx, rx) = mpsc::channel(mailbox_size.max(1));
        let now = Utc::now();
        let client = Self {
            id: uuid::Uuid::new_v4().to_string(),
            identity,
            remote_ip,
            connected_at: now,
            liveness: Arc::new(ClientLiveness::new(now)),
            mailbox: tx,
        };
        (client, rx)
    }

    pub fn liveness(&self) -> Arc<ClientLiveness> {
        self.liveness.clone()
    }

    pub(crate) fn mailbox(&self) -> &mpsc::Sender<EventMessage> {
        &self.mailbox
    }
}

/// Loose shape of what subscribers send us. Older clients send
/// `{"type": "client-id"}` rather than a `system` message.
#[derive(Debug, Deserialize)]
struct ClientRequest {
    #[serde(default)]
    id: Option<String>,
    #[serde(rename = "type", alias = "event_type", default)]
    kind: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    body: Value,
}

impl ClientRequest {
    fn into_event(self) -> Result<EventMessage, String> {
        let (event_type, message) = if self.kind.eq_ignore_ascii_case(CLIENT_ID_REQUEST) {
            (EventType::System, CLIENT_ID_REQUEST.to_string())
        } else {
            let event_type = self.kind.parse::<EventType>().map_err(|e| e.to_string())?;
            (event_type, self.message)
        };

        let mut event = EventMessage::new(event_type, message);
        if let Some(id) = self.id.filter(|id| !id.is_empty()) {
            event.id = id;
        }
        event.body = self.body;
        Ok(event)
    }
}

/// Per-connection state shared by both pumps.
struct ClientSession {
    id: String,
    hub: Arc<EventHub>,
    liveness: Arc<ClientLiveness>,
    closed: CancellationToken,
}

impl ClientSession {
    /// Runs at most once per client, whichever pump gets here first.
    async fn teardown(&self) {
        if self.liveness.mark_dead() {
            if let Err(e) = self.hub.unregister_client(&self.id).await {
                debug!("unregister of client {} skipped: {}", self.id, e);
            }
            info!("subscriber {} disconnected", self.id);
        }
        self.closed.cancel();
    }

    async fn reply_error(&self, error: String) {
        let notice = ProtocolNotice {
            error,
            valid_types: Vec::new(),
        };
        if let Err(e) = self
            .hub
            .send_to_client(&self.id, EventType::System, ERROR, notice)
            .await
        {
            debug!("could not report protocol error to {}: {}", self.id, e);
        }
    }

    async fn handle_text(&self, text: &str) {
        let request = match serde_json::from_str::<ClientRequest>(text) {
            Ok(request) => request,
            Err(e) => {
                warn!("malformed message from subscriber {}: {}", self.id, e);
                self.reply_error(format!("invalid message: {e}")).await;
                return;
            }
        };

        match request.into_event() {
            Ok(event) => self.hub.dispatch_client_message(&self.id, event),
            Err(e) => self.reply_error(e).await,
        }
    }
}

/// Register `socket` with the hub and run both pumps until the connection ends.
pub async fn serve_client(
    socket: WebSocket,
    hub: Arc<EventHub>,
    identity: ClientIdentity,
    remote_ip: Option<String>,
    requested: Vec<String>,
) {
    let settings = hub.settings().clone();
    let (client, mailbox) = HubClient::new(identity, remote_ip, settings.mailbox_size);
    let id = client.id.clone();
    let liveness = client.liveness();

    let mut socket = socket;
    if let Err(e) = hub.register_client(client, requested).await {
        warn!("failed to register subscriber {}: {}", id, e);
        let _ = socket.send(Message::Close(None)).await;
        return;
    }

    let session = Arc::new(ClientSession {
        id,
        hub,
        liveness,
        closed: CancellationToken::new(),
    });

    let (sink, stream) = socket.split();
    let writer = tokio::spawn(write_pump(
        session.clone(),
        sink,
        mailbox,
        settings.ping_interval,
        settings.write_timeout,
    ));
    read_pump(session.clone(), stream, settings.pong_timeout).await;
    let _ = writer.await;
}

async fn write_frame(
    sink: &mut SplitSink<WebSocket, Message>,
    frame: Message,
    deadline: Duration,
) -> Result<(), String> {
    match timeout(deadline, sink.send(frame)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err("write deadline exceeded".to_string()),
    }
}

async fn write_pump(
    session: Arc<ClientSession>,
    mut sink: SplitSink<WebSocket, Message>,
    mut mailbox: mpsc::Receiver<EventMessage>,
    ping_interval: Duration,
    write_timeout: Duration,
) {
    let mut ping = interval_at(Instant::now() + ping_interval, ping_interval);

    loop {
        tokio::select! {
            _ = session.closed.cancelled() => break,

            next = mailbox.recv() => {
                let Some(message) = next else {
                    // Hub dropped the mailbox: unregistered or shutting down.
                    let _ = write_frame(&mut sink, Message::Close(None), write_timeout).await;
                    break;
                };
                if let Err(e) = write_frame(&mut sink, Message::Text(message.to_json().into()), write_timeout).await {
                    warn!("write to subscriber {} failed: {}", session.id, e);
                    break;
                }
            }

            _ = ping.tick() => {
                session.liveness.touch_ping();
                if let Err(e) = write_frame(&mut sink, Message::Ping(Bytes::new()), write_timeout).await {
                    debug!("ping to subscriber {} failed: {}", session.id, e);
                    break;
                }
            }
        }
    }

    session.teardown().await;
}

async fn read_pump(session: Arc<ClientSession>, mut stream: SplitStream<WebSocket>, pong_timeout: Duration) {
    loop {
        let next = tokio::select! {
            _ = session.closed.cancelled() => break,
            next = timeout(pong_timeout, stream.next()) => next,
        };

        let frame = match next {
            Err(_) => {
                warn!("subscriber {} missed its heartbeat deadline", session.id);
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                debug!("read from subscriber {} failed: {}", session.id, e);
                break;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        match frame {
            Message::Text(text) => session.handle_text(text.as_str()).await,
            Message::Binary(data) => session.handle_text(&String::from_utf8_lossy(&data)).await,
            Message::Pong(_) => session.liveness.touch_pong(),
            // axum answers pings itself
            Message::Ping(_) => {}
            Message::Close(_) => break,
        }
    }

    session.teardown().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_dead_succeeds_once() {
        let liveness = ClientLiveness::new(Utc::now());
        assert!(liveness.is_alive());
        assert!(liveness.mark_dead());
        assert!(!liveness.mark_dead());
        assert!(!liveness.is_alive());
    }

    #[test]
    fn legacy_client_id_request_becomes_system_message() {
        let request: ClientRequest =
            serde_json::from_str(r#"{"id":"req-9","type":"client-id"}"#).unwrap();
        let event = request.into_event().unwrap();
        assert_eq!(event.event_type, EventType::System);
        assert_eq!(event.message, CLIENT_ID_REQUEST);
        assert_eq!(event.id, "req-9");
    }

    #[test]
    fn unknown_type_is_rejected() {
        let request: ClientRequest = serde_json::from_str(r#"{"type":"bogus"}"#).unwrap();
        assert!(request.into_event().is_err());
    }

    #[tokio::test]
    async fn new_client_has_open_mailbox() {
        let (client, mut rx) = HubClient::new(ClientIdentity::default(), None, 2);
        client
            .mailbox()
            .try_send(EventMessage::new(EventType::Global, "hi"))
            .unwrap();
        assert_eq!(rx.recv().await.unwrap().message, "hi");
        assert!(client.liveness().is_alive());
    }
}
