//! Registry of live host connections.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use fleetd_protocol::payloads::{
    HOST_WEBSOCKET_DISCONNECTED, HostHealthUpdate, STATE_WEBSOCKET_DISCONNECTED,
};
use fleetd_protocol::{EventMessage, EventType};
use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::dispatch::{EventDispatcher, HostEventHandler};
use super::error::{OrchestratorError, OrchestratorResult};
use super::ws_client::{ClientSettings, HostWebSocketClient};
use crate::events::EventHub;
use crate::host_api::CredentialResolver;
use crate::hosts::{HostRecord, HostStore};

struct ClientHandle {
    client: Arc<HostWebSocketClient>,
    task: JoinHandle<()>,
}

/// What a [`HostWebSocketManager::refresh_connections`] call started.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct RefreshSummary {
    /// Hosts being probed for a new connection.
    pub connecting: Vec<String>,
    /// Hosts whose connection is being torn down.
    pub disconnecting: Vec<String>,
}

/// Removes a host from the in-flight probe set when dropped.
struct ProbeGuard<'a> {
    probing: &'a Mutex<HashSet<String>>,
    host_id: String,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        self.probing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.host_id);
    }
}

/// Owns one [`HostWebSocketClient`] per connected host and routes their
/// events to registered handlers.
pub struct HostWebSocketManager {
    clients: RwLock<HashMap<String, ClientHandle>>,
    dispatcher: Arc<EventDispatcher>,
    hub: Arc<EventHub>,
    credentials: Arc<dyn CredentialResolver>,
    settings: ClientSettings,
    probing: Mutex<HashSet<String>>,
    shutdown: CancellationToken,
}

impl HostWebSocketManager {
    /// `shutdown` is the process-wide token. Client loops stop when it fires.
    pub fn new(
        settings: ClientSettings,
        credentials: Arc<dyn CredentialResolver>,
        hub: Arc<EventHub>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            dispatcher: Arc::new(EventDispatcher::new()),
            hub,
            credentials,
            settings,
            probing: Mutex::new(HashSet::new()),
            shutdown,
        }
    }

    pub fn register_handler(&self, types: &[EventType], handler: Arc<dyn HostEventHandler>) {
        self.dispatcher.register(types, handler);
    }

    /// Hand a host event to every handler registered for its type without
    /// waiting for them.
    pub fn dispatch_message(&self, host_id: &str, payload: EventMessage) -> usize {
        self.dispatcher.dispatch(host_id, payload)
    }

    fn new_client(&self, host: &HostRecord) -> HostWebSocketClient {
        HostWebSocketClient::new(
            host.clone(),
            self.settings.clone(),
            self.credentials.clone(),
            self.dispatcher.clone(),
            self.hub.clone(),
            self.shutdown.child_token(),
        )
    }

    /// Start a persistent client for `host`. Does nothing if one exists.
    /// An empty `types` subscribes to every topic with a registered handler.
    /// Returns whether a new client was started.
    pub async fn connect_host(&self, host: &HostRecord, types: &[EventType]) -> bool {
        if self.shutdown.is_cancelled() {
            return false;
        }

        let mut types = if types.is_empty() {
            self.dispatcher.topics()
        } else {
            types.to_vec()
        };
        if types.is_empty() {
            types.push(EventType::Global);
        }

        let mut clients = self.clients.write().await;
        if clients.contains_key(&host.id) {
            debug!("host {} already has a client", host.id);
            return false;
        }

        let client = Arc::new(self.new_client(host));
        let task = tokio::spawn(client.clone().run(types));
        clients.insert(host.id.clone(), ClientHandle { client, task });
        info!("started event stream client for host {}", host.id);
        true
    }

    /// Close and forget the client for `host_id`. Returns whether one existed.
    pub async fn disconnect_host(&self, host_id: &str) -> bool {
        let handle = self.clients.write().await.remove(host_id);
        let Some(handle) = handle else {
            return false;
        };

        self.stop_client(handle).await;
        info!("disconnected event stream of host {}", host_id);

        let body = HostHealthUpdate {
            host_id: host_id.to_string(),
            state: STATE_WEBSOCKET_DISCONNECTED.to_string(),
        };
        if let Err(err) = self
            .hub
            .send_to_type(EventType::Orchestrator, HOST_WEBSOCKET_DISCONNECTED, body)
            .await
        {
            debug!("not publishing disconnect of host {}: {}", host_id, err);
        }
        true
    }

    async fn stop_client(&self, handle: ClientHandle) {
        handle.client.close().await;
        let limit = self.settings.handshake_timeout;
        if tokio::time::timeout(limit, handle.task).await.is_err() {
            warn!(
                "client of host {} did not stop within {:?}",
                handle.client.host_id(),
                limit
            );
        }
    }

    pub async fn is_connected(&self, host_id: &str) -> bool {
        self.clients
            .read()
            .await
            .get(host_id)
            .is_some_and(|h| h.client.is_connected())
    }

    /// Whether a client exists for the host, connected or reconnecting.
    pub async fn has_client(&self, host_id: &str) -> bool {
        self.clients.read().await.contains_key(host_id)
    }

    pub async fn connected_hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self
            .clients
            .read()
            .await
            .iter()
            .filter(|(_, h)| h.client.is_connected())
            .map(|(id, _)| id.clone())
            .collect();
        hosts.sort();
        hosts
    }

    pub async fn send_ping(&self, host_id: &str) -> OrchestratorResult<()> {
        let client = self
            .clients
            .read()
            .await
            .get(host_id)
            .map(|h| h.client.clone())
            .ok_or_else(|| OrchestratorError::HostNotFound(host_id.to_string()))?;
        client.send_ping().await
    }

    /// Probe `host` and start a persistent client only if it answers.
    /// At most one probe per host runs at a time.
    pub async fn probe_and_connect(&self, host: &HostRecord) -> bool {
        if self.has_client(&host.id).await {
            return true;
        }

        let inserted = self
            .probing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(host.id.clone());
        if !inserted {
            debug!("probe of host {} already in flight", host.id);
            return false;
        }
        let _guard = ProbeGuard {
            probing: &self.probing,
            host_id: host.id.clone(),
        };

        let probe = self.new_client(host);
        let answered = probe.probe().await;
        probe.close().await;
        if !answered {
            info!(
                "host {} did not answer the event stream probe, not connecting",
                host.id
            );
            return false;
        }

        self.connect_host(host, &[]).await;
        true
    }

    /// Align live connections with `hosts`: enabled hosts without a client
    /// are probed, clients of hosts that are gone or disabled are closed.
    /// Both happen in the background.
    pub async fn refresh_connections(self: &Arc<Self>, hosts: &[HostRecord]) -> RefreshSummary {
        let eligible: HashMap<&str, &HostRecord> = hosts
            .iter()
            .filter(|h| h.enabled)
            .map(|h| (h.id.as_str(), h))
            .collect();
        let current: Vec<String> = self.clients.read().await.keys().cloned().collect();

        let mut summary = RefreshSummary::default();

        for host_id in current.iter().filter(|id| !eligible.contains_key(id.as_str())) {
            summary.disconnecting.push(host_id.clone());
            let manager = Arc::clone(self);
            let host_id = host_id.clone();
            tokio::spawn(async move {
                manager.disconnect_host(&host_id).await;
            });
        }

        for (host_id, host) in &eligible {
            if current.iter().any(|id| id == host_id) {
                continue;
            }
            summary.connecting.push(host_id.to_string());
            let manager = Arc::clone(self);
            let host = (*host).clone();
            tokio::spawn(async move {
                manager.probe_and_connect(&host).await;
            });
        }

        summary.connecting.sort();
        summary.disconnecting.sort();
        summary
    }

    /// Periodically re-read the host list and call
    /// [`HostWebSocketManager::refresh_connections`]. The first pass runs immediately.
    pub fn start_connection_monitor(
        self: &Arc<Self>,
        store: Arc<dyn HostStore>,
        interval: Duration,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = manager.shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match store.list().await {
                    Ok(hosts) => {
                        let summary = manager.refresh_connections(&hosts).await;
                        if !summary.connecting.is_empty() || !summary.disconnecting.is_empty() {
                            debug!(
                                "connection monitor: connecting {:?}, disconnecting {:?}",
                                summary.connecting, summary.disconnecting
                            );
                        }
                    }
                    Err(err) => warn!("connection monitor could not list hosts: {}", err),
                }
            }
            debug!("connection monitor stopped");
        })
    }

    /// Close every client and stop the monitor. Safe to call more than once.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<ClientHandle> = self.clients.write().await.drain().map(|(_, h)| h).collect();
        if handles.is_empty() {
            return;
        }
        info!("closing {} host event stream(s)", handles.len());
        for handle in handles {
            self.stop_client(handle).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::HubSettings;
    use crate::host_api::{AuthHeader, HostApiResult};
    use crate::orchestrator::backoff::Backoff;
    use async_trait::async_trait;

    struct NoCredentials;

    #[async_trait]
    impl CredentialResolver for NoCredentials {
        async fn resolve(&self, _host: &HostRecord) -> HostApiResult<Option<AuthHeader>> {
            Ok(None)
        }
    }

    fn manager() -> Arc<HostWebSocketManager> {
        let settings = ClientSettings {
            handshake_timeout: Duration::from_millis(200),
            probe_timeout: Duration::from_millis(200),
            ping_interval: Duration::from_secs(30),
            backoff: Backoff::new(Duration::from_millis(50), Duration::from_millis(200)),
        };
        Arc::new(HostWebSocketManager::new(
            settings,
            Arc::new(NoCredentials),
            Arc::new(EventHub::new(HubSettings::default())),
            CancellationToken::new(),
        ))
    }

    #[tokio::test]
    async fn connect_host_is_idempotent() {
        let manager = manager();
        // nothing listens on port 9, the client just keeps retrying
        let mut host = HostRecord::new("h1", "127.0.0.1");
        host.port = Some(9);

        assert!(manager.connect_host(&host, &[EventType::Health]).await);
        assert!(!manager.connect_host(&host, &[EventType::Health]).await);
        assert!(manager.has_client("h1").await);
        assert!(!manager.is_connected("h1").await);
        assert!(manager.connected_hosts().await.is_empty());

        assert!(manager.disconnect_host("h1").await);
        assert!(!manager.disconnect_host("h1").await);
        assert!(!manager.has_client("h1").await);
    }

    #[tokio::test]
    async fn failed_probe_does_not_connect() {
        let manager = manager();
        let mut host = HostRecord::new("h1", "127.0.0.1");
        host.port = Some(9);

        assert!(!manager.probe_and_connect(&host).await);
        assert!(!manager.has_client("h1").await);
    }

    #[tokio::test]
    async fn shutdown_twice_and_refuses_new_clients() {
        let manager = manager();
        let mut host = HostRecord::new("h1", "127.0.0.1");
        host.port = Some(9);
        manager.connect_host(&host, &[]).await;

        manager.shutdown().await;
        manager.shutdown().await;
        assert!(!manager.has_client("h1").await);
        assert!(!manager.connect_host(&host, &[]).await);
    }

    #[tokio::test]
    async fn send_ping_to_unknown_host_fails() {
        let manager = manager();
        assert!(matches!(
            manager.send_ping("nope").await,
            Err(OrchestratorError::HostNotFound(_))
        ));
    }
}
