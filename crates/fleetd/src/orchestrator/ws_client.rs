//! Resilient outbound WebSocket connection to one host.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use fleetd_protocol::payloads::{
    HOST_WEBSOCKET_CONNECTED, HOST_WEBSOCKET_DISCONNECTED, HeartbeatFrame, HostHealthUpdate,
    STATE_WEBSOCKET_CONNECTED, STATE_WEBSOCKET_DISCONNECTED,
};
use fleetd_protocol::{EventMessage, EventType};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;

use super::backoff::{Backoff, sleep_or_cancel};
use super::dispatch::EventDispatcher;
use super::error::{OrchestratorError, OrchestratorResult};
use crate::config::WebSocketConfig;
use crate::events::EventHub;
use crate::host_api::CredentialResolver;
use crate::hosts::HostRecord;

type HostStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type HostSink = SplitSink<HostStream, Message>;
type HostSource = SplitStream<HostStream>;

/// Path of the subscribe endpoint, relative to the host's API base.
pub const SUBSCRIBE_PATH: &str = "/v1/ws/subscribe";

#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub handshake_timeout: Duration,
    pub probe_timeout: Duration,
    pub ping_interval: Duration,
    pub backoff: Backoff,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self::from(&WebSocketConfig::default())
    }
}

impl From<&WebSocketConfig> for ClientSettings {
    fn from(config: &WebSocketConfig) -> Self {
        Self {
            handshake_timeout: Duration::from_secs(config.handshake_timeout_secs.max(1)),
            probe_timeout: Duration::from_secs(config.probe_timeout_secs.max(1)),
            ping_interval: Duration::from_secs(config.ping_interval_secs.max(1)),
            backoff: Backoff::new(
                Duration::from_secs(config.reconnect_base_secs),
                Duration::from_secs(config.reconnect_max_secs),
            ),
        }
    }
}

/// Build the subscribe URL for `host`. The scheme follows the host's HTTP
/// scheme (`http` to `ws`, `https` to `wss`).
pub fn subscribe_url(host: &HostRecord, types: &[EventType]) -> OrchestratorResult<String> {
    let base = host.base_url();
    let base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base
    };

    let mut url = reqwest::Url::parse(&format!("{base}{SUBSCRIBE_PATH}"))
        .map_err(|e| OrchestratorError::Protocol(format!("invalid host address {base}: {e}")))?;
    if !types.is_empty() {
        let filter = types
            .iter()
            .map(EventType::as_str)
            .collect::<Vec<_>>()
            .join(",");
        url.query_pairs_mut().append_pair("event_types", &filter);
    }
    Ok(url.into())
}

/// One persistent connection to a host.
///
/// [`HostWebSocketClient::run`] owns the connect loop and the single reader.
/// Writers (the pinger and [`HostWebSocketClient::send`]) share the sink
/// behind a mutex.
pub struct HostWebSocketClient {
    host: HostRecord,
    settings: ClientSettings,
    credentials: Arc<dyn CredentialResolver>,
    dispatcher: Arc<EventDispatcher>,
    hub: Arc<EventHub>,
    stop: CancellationToken,
    closed: AtomicBool,
    connected: AtomicBool,
    writer: Mutex<Option<HostSink>>,
}

impl HostWebSocketClient {
    /// `stop` is usually a child of the manager's shutdown token.
    pub fn new(
        host: HostRecord,
        settings: ClientSettings,
        credentials: Arc<dyn CredentialResolver>,
        dispatcher: Arc<EventDispatcher>,
        hub: Arc<EventHub>,
        stop: CancellationToken,
    ) -> Self {
        Self {
            host,
            settings,
            credentials,
            dispatcher,
            hub,
            stop,
            closed: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            writer: Mutex::new(None),
        }
    }

    pub fn host_id(&self) -> &str {
        &self.host.id
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Connect and keep reconnecting until [`HostWebSocketClient::close`] is
    /// called or the parent token is cancelled.
    pub async fn run(self: Arc<Self>, types: Vec<EventType>) {
        let mut failures: u32 = 0;

        while !self.stop.is_cancelled() {
            match self.establish_connection(&types).await {
                Ok(source) => {
                    failures = 0;
                    let session = self.stop.child_token();
                    self.start_ping_routine(session.clone());
                    self.read_loop(source).await;
                    session.cancel();
                    self.drop_connection().await;

                    if self.stop.is_cancelled() {
                        break;
                    }
                    info!("connection to host {} lost, reconnecting", self.host.id);
                    self.publish_state(HOST_WEBSOCKET_DISCONNECTED, STATE_WEBSOCKET_DISCONNECTED)
                        .await;
                    if !sleep_or_cancel(self.settings.backoff.base, &self.stop).await {
                        break;
                    }
                }
                Err(err) => {
                    failures = failures.saturating_add(1);
                    let delay = self.settings.backoff.delay(failures);
                    warn!(
                        "connecting to host {} failed (attempt {}): {}; retrying in {:?}",
                        self.host.id, failures, err, delay
                    );
                    if !sleep_or_cancel(delay, &self.stop).await {
                        break;
                    }
                }
            }
        }

        debug!("connect loop for host {} stopped", self.host.id);
    }

    async fn establish_connection(&self, types: &[EventType]) -> OrchestratorResult<HostSource> {
        let request = self.build_request(types).await?;
        let stream = self.dial(request, self.settings.handshake_timeout).await?;
        let (sink, source) = stream.split();

        *self.writer.lock().await = Some(sink);
        self.connected.store(true, Ordering::Release);

        // close() may have run while the handshake was in flight
        if self.stop.is_cancelled() {
            self.drop_connection().await;
            return Err(OrchestratorError::Transport(format!(
                "host {} stopped during handshake",
                self.host.id
            )));
        }

        info!("connected to host {} event stream", self.host.id);
        self.publish_state(HOST_WEBSOCKET_CONNECTED, STATE_WEBSOCKET_CONNECTED)
            .await;
        Ok(source)
    }

    async fn build_request(&self, types: &[EventType]) -> OrchestratorResult<Request> {
        let url = subscribe_url(&self.host, types)?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| OrchestratorError::Protocol(format!("invalid subscribe url {url}: {e}")))?;

        match self.credentials.resolve(&self.host).await {
            Ok(Some(header)) => {
                let value = HeaderValue::from_str(&header.value).map_err(|e| {
                    OrchestratorError::Protocol(format!("invalid {} header: {e}", header.name))
                })?;
                request.headers_mut().insert(header.name, value);
            }
            Ok(None) => {}
            Err(err) => warn!(
                "no credentials for host {} ({}), connecting without authentication",
                self.host.id, err
            ),
        }
        Ok(request)
    }

    async fn dial(&self, request: Request, limit: Duration) -> OrchestratorResult<HostStream> {
        let dial = tokio::time::timeout(limit, connect_async(request));
        tokio::select! {
            _ = self.stop.cancelled() => Err(OrchestratorError::Transport(format!(
                "host {} stopped while dialing",
                self.host.id
            ))),
            result = dial => match result {
                Ok(Ok((stream, _))) => Ok(stream),
                Ok(Err(err)) => Err(OrchestratorError::Transport(err.to_string())),
                Err(_) => Err(OrchestratorError::Transport(format!(
                    "handshake with host {} timed out after {:?}",
                    self.host.id, limit
                ))),
            },
        }
    }

    async fn read_loop(&self, mut source: HostSource) {
        loop {
            let frame = tokio::select! {
                _ = self.stop.cancelled() => break,
                frame = source.next() => frame,
            };

            match frame {
                Some(Ok(Message::Text(text))) => self.handle_frame(text.as_str()),
                Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                    Ok(text) => self.handle_frame(text),
                    Err(_) => warn!("host {} sent a non UTF-8 binary frame", self.host.id),
                },
                Some(Ok(Message::Close(frame))) => {
                    debug!("host {} closed the stream: {:?}", self.host.id, frame);
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!("read from host {} failed: {}", self.host.id, err);
                    break;
                }
                None => break,
            }
        }
    }

    fn handle_frame(&self, text: &str) {
        match serde_json::from_str::<EventMessage>(text) {
            Ok(message) => {
                debug!(
                    "host {} event {}/{}",
                    self.host.id, message.event_type, message.message
                );
                self.dispatcher.dispatch(&self.host.id, message);
            }
            Err(err) => warn!(
                "skipping malformed frame from host {}: {}",
                self.host.id, err
            ),
        }
    }

    fn start_ping_routine(self: &Arc<Self>, session: CancellationToken) {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(client.settings.ping_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = session.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = client.send_ping().await {
                            warn!("ping to host {} failed: {}", client.host.id, err);
                        }
                    }
                }
            }
        });
    }

    /// Send a JSON frame to the host.
    pub async fn send(&self, payload: &impl Serialize) -> OrchestratorResult<()> {
        let text = serde_json::to_string(payload)
            .map_err(|e| OrchestratorError::Protocol(e.to_string()))?;
        let mut writer = self.writer.lock().await;
        let sink = writer.as_mut().ok_or_else(|| {
            OrchestratorError::Transport(format!("host {} is not connected", self.host.id))
        })?;
        sink.send(Message::Text(text.into()))
            .await
            .map_err(|e| OrchestratorError::Transport(e.to_string()))
    }

    pub async fn send_ping(&self) -> OrchestratorResult<()> {
        self.send(&HeartbeatFrame::ping()).await
    }

    /// Short-lived check that the host speaks the event protocol: dial,
    /// ping, and wait for an envelope back. The socket is always closed.
    pub async fn probe(&self) -> bool {
        let limit = self.settings.probe_timeout;
        let request = match self.build_request(&[EventType::Health]).await {
            Ok(request) => request,
            Err(err) => {
                debug!("probe of host {} failed: {}", self.host.id, err);
                return false;
            }
        };
        let mut stream = match self.dial(request, limit).await {
            Ok(stream) => stream,
            Err(err) => {
                debug!("probe of host {} failed: {}", self.host.id, err);
                return false;
            }
        };

        let ok = match tokio::time::timeout(limit, probe_exchange(&mut stream)).await {
            Ok(Ok(())) => true,
            Ok(Err(err)) => {
                debug!("probe of host {} failed: {}", self.host.id, err);
                false
            }
            Err(_) => {
                debug!("probe of host {} got no answer within {:?}", self.host.id, limit);
                false
            }
        };

        if let Err(err) = tokio::time::timeout(limit, stream.close(None)).await {
            debug!("closing probe socket of host {}: {}", self.host.id, err);
        }
        ok
    }

    /// Stop reconnecting and close the socket. Safe to call repeatedly,
    /// including before the client ever connected.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop.cancel();
        self.drop_connection().await;
        debug!("client for host {} closed", self.host.id);
    }

    async fn drop_connection(&self) {
        self.connected.store(false, Ordering::Release);
        let sink = self.writer.lock().await.take();
        if let Some(mut sink) = sink {
            let limit = self.settings.handshake_timeout;
            if tokio::time::timeout(limit, sink.close()).await.is_err() {
                debug!("closing socket of host {} timed out", self.host.id);
            }
        }
    }

    async fn publish_state(&self, message: &str, state: &str) {
        let body = HostHealthUpdate {
            host_id: self.host.id.clone(),
            state: state.to_string(),
        };
        if let Err(err) = self
            .hub
            .send_to_type(EventType::Orchestrator, message, body)
            .await
        {
            debug!("not publishing {} for host {}: {}", message, self.host.id, err);
        }
    }
}

async fn probe_exchange(stream: &mut HostStream) -> OrchestratorResult<()> {
    let ping = serde_json::to_string(&HeartbeatFrame::ping())
        .map_err(|e| OrchestratorError::Protocol(e.to_string()))?;
    stream
        .send(Message::Text(ping.into()))
        .await
        .map_err(|e| OrchestratorError::Transport(e.to_string()))?;

    while let Some(frame) = stream.next().await {
        let text = match frame.map_err(|e| OrchestratorError::Transport(e.to_string()))? {
            Message::Text(text) => text.as_str().to_string(),
            Message::Binary(data) => String::from_utf8_lossy(&data).into_owned(),
            Message::Close(_) => break,
            _ => continue,
        };
        return serde_json::from_str::<EventMessage>(&text)
            .map(|_| ())
            .map_err(|e| OrchestratorError::Protocol(format!("unexpected probe reply: {e}")));
    }
    Err(OrchestratorError::Transport(
        "stream closed before answering".to_string(),
    ))
}
