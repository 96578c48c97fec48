//! Hub engine and its handle.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use fleetd_protocol::payloads::{ProtocolNotice, WARNING, WELCOME_MESSAGE};
use fleetd_protocol::{
    ClientInfo, ConnectResponse, EventMessage, EventType, HubStats, parse_event_types,
};
use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::client::{ClientLiveness, HubClient};
use super::error::{HubError, HubResult};
use super::system::{ClientEventHandler, SystemHandler};
use crate::config::EventsConfig;

/// Process role. Only server-hosting roles run the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Api,
    Orchestrator,
    Cli,
}

impl RunMode {
    fn hosts_server(&self) -> bool {
        matches!(self, RunMode::Api | RunMode::Orchestrator)
    }
}

#[derive(Debug, Clone)]
pub struct HubSettings {
    pub command_buffer: usize,
    pub mailbox_size: usize,
    pub write_timeout: Duration,
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
    pub allow_multiple_connections_per_ip: bool,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self::from(&EventsConfig::default())
    }
}

impl From<&EventsConfig> for HubSettings {
    fn from(config: &EventsConfig) -> Self {
        Self {
            command_buffer: config.command_buffer.max(1),
            mailbox_size: config.mailbox_size.max(1),
            write_timeout: Duration::from_secs(config.write_timeout_secs),
            ping_interval: Duration::from_secs(config.ping_interval_secs.max(1)),
            pong_timeout: Duration::from_secs(config.pong_timeout_secs.max(1)),
            allow_multiple_connections_per_ip: config.allow_multiple_connections_per_ip,
        }
    }
}

enum HubCommand {
    Register {
        client: HubClient,
        requested: Vec<String>,
        reply: oneshot::Sender<ConnectResponse>,
    },
    Unregister {
        client_id: String,
    },
    Unsubscribe {
        client_id: String,
        types: Vec<EventType>,
        reply: oneshot::Sender<HubResult<Vec<EventType>>>,
    },
    Broadcast {
        message: EventMessage,
        reply: oneshot::Sender<HubResult<usize>>,
    },
}

/// Read-only view published by the engine after every change.
#[derive(Debug, Default)]
struct HubSnapshot {
    clients: Vec<ClientSummary>,
    type_counts: BTreeMap<EventType, usize>,
    ips: HashSet<String>,
}

#[derive(Debug, Clone)]
struct ClientSummary {
    id: String,
    user_id: String,
    username: String,
    connected_at: DateTime<Utc>,
    subscriptions: Vec<EventType>,
    liveness: Arc<ClientLiveness>,
}

struct HubRuntime {
    commands: mpsc::Sender<HubCommand>,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
    started_at: DateTime<Utc>,
}

/// Topic-based broker for external subscribers.
///
/// Construct once and share as `Arc<EventHub>`. Nothing runs until
/// [`EventHub::initialize`] is called.
pub struct EventHub {
    settings: HubSettings,
    runtime: Mutex<Option<HubRuntime>>,
    snapshot: Arc<RwLock<HubSnapshot>>,
    messages_sent: Arc<AtomicU64>,
    handlers: DashMap<EventType, Vec<Arc<dyn ClientEventHandler>>>,
}

impl EventHub {
    pub fn new(settings: HubSettings) -> Self {
        let hub = Self {
            settings,
            runtime: Mutex::new(None),
            snapshot: Arc::new(RwLock::new(HubSnapshot::default())),
            messages_sent: Arc::new(AtomicU64::new(0)),
            handlers: DashMap::new(),
        };
        hub.register_handler(&[EventType::System], Arc::new(SystemHandler));
        hub
    }

    pub fn settings(&self) -> &HubSettings {
        &self.settings
    }

    /// Start the engine task. Calling it again while running only logs a warning.
    pub fn initialize(&self, mode: RunMode) {
        if !mode.hosts_server() {
            info!("event hub disabled in {:?} mode", mode);
            return;
        }

        let mut runtime = self.runtime.lock().unwrap_or_else(PoisonError::into_inner);
        if runtime.is_some() {
            warn!("event hub already initialized");
            return;
        }

        let (commands, inbox) = mpsc::channel(self.settings.command_buffer);
        let shutdown = CancellationToken::new();
        let engine = HubEngine {
            clients: HashMap::new(),
            subscriptions: HashMap::new(),
            snapshot: self.snapshot.clone(),
            messages_sent: self.messages_sent.clone(),
        };
        let task = tokio::spawn(engine.run(inbox, shutdown.clone()));

        *runtime = Some(HubRuntime {
            commands,
            shutdown,
            task,
            started_at: Utc::now(),
        });
        info!("event hub started");
    }

    pub fn is_running(&self) -> bool {
        self.runtime
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Stop the engine and close every client mailbox. Safe to call repeatedly.
    pub async fn shutdown(&self) {
        let runtime = self
            .runtime
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(runtime) = runtime else {
            debug!("event hub shutdown requested but it is not running");
            return;
        };

        runtime.shutdown.cancel();
        drop(runtime.commands);
        if let Err(e) = runtime.task.await {
            warn!("event hub engine ended abnormally: {}", e);
        }
        info!("event hub stopped");
    }

    fn commands(&self) -> HubResult<mpsc::Sender<HubCommand>> {
        self.runtime
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|r| r.commands.clone())
            .ok_or(HubError::NotRunning)
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> HubCommand,
    ) -> HubResult<T> {
        let commands = self.commands()?;
        let (tx, rx) = oneshot::channel();
        commands
            .send(build(tx))
            .await
            .map_err(|_| HubError::NotRunning)?;
        rx.await.map_err(|_| HubError::NotRunning)
    }

    /// Register a client with its requested topics plus `global`.
    ///
    /// Unknown topic names are dropped and reported to the client.
    pub async fn register_client(
        &self,
        client: HubClient,
        requested: Vec<String>,
    ) -> HubResult<ConnectResponse> {
        self.request(|reply| HubCommand::Register {
            client,
            requested,
            reply,
        })
        .await
    }

    pub async fn unregister_client(&self, client_id: &str) -> HubResult<()> {
        self.commands()?
            .send(HubCommand::Unregister {
                client_id: client_id.to_string(),
            })
            .await
            .map_err(|_| HubError::NotRunning)
    }

    /// Remove topics from a client. Returns the topics actually removed.
    /// Unknown names are skipped as long as at least one name is valid.
    pub async fn unsubscribe(&self, client_id: &str, names: &[String]) -> HubResult<Vec<EventType>> {
        let types = match parse_event_types(names) {
            Ok(types) => types,
            Err(err) if !err.valid.is_empty() => {
                warn!("client {}: ignoring unsubscribe from {}", client_id, err.invalid.join(", "));
                err.valid
            }
            Err(err) => return Err(err.into()),
        };
        self.request(|reply| HubCommand::Unsubscribe {
            client_id: client_id.to_string(),
            types,
            reply,
        })
        .await?
    }

    /// Deliver to one client if `client_id` is set, otherwise to every
    /// subscriber of the message type. Returns the number of mailboxes that
    /// accepted the message.
    pub async fn broadcast_message(&self, message: EventMessage) -> HubResult<usize> {
        self.request(|reply| HubCommand::Broadcast { message, reply })
            .await?
    }

    pub async fn send_to_type(
        &self,
        event_type: EventType,
        message: &str,
        body: impl Serialize,
    ) -> HubResult<usize> {
        self.broadcast_message(EventMessage::new(event_type, message).with_body(body))
            .await
    }

    pub async fn send_to_client(
        &self,
        client_id: &str,
        event_type: EventType,
        message: &str,
        body: impl Serialize,
    ) -> HubResult<usize> {
        self.broadcast_message(
            EventMessage::new(event_type, message)
                .with_body(body)
                .for_client(client_id),
        )
        .await
    }

    pub async fn send_to_all(&self, message: &str, body: impl Serialize) -> HubResult<usize> {
        self.send_to_type(EventType::Global, message, body).await
    }

    /// Whether a live client connected from `ip`.
    pub fn has_active_connection_from_ip(&self, ip: &str) -> bool {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .ips
            .contains(ip)
    }

    pub fn client_count(&self) -> usize {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clients
            .len()
    }

    /// Counters and per-topic subscriber counts. Client detail only when
    /// `include_clients` is set.
    pub fn get_stats(&self, include_clients: bool) -> HubStats {
        let started_at = self
            .runtime
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|r| r.started_at);
        let snapshot = self.snapshot.read().unwrap_or_else(PoisonError::into_inner);

        let now = Utc::now();
        let start_time = started_at.unwrap_or(now);
        let clients = include_clients.then(|| {
            snapshot
                .clients
                .iter()
                .map(|c| ClientInfo {
                    id: c.id.clone(),
                    user_id: c.user_id.clone(),
                    username: c.username.clone(),
                    connected_at: c.connected_at,
                    last_ping_at: c.liveness.last_ping_at(),
                    last_pong_at: c.liveness.last_pong_at(),
                    event_subscriptions: c.subscriptions.clone(),
                    is_alive: c.liveness.is_alive(),
                })
                .collect()
        });

        HubStats {
            total_clients: snapshot.clients.len(),
            total_subscriptions: snapshot.type_counts.values().sum(),
            type_stats: snapshot.type_counts.clone(),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            start_time,
            uptime: format_uptime(now - start_time),
            clients,
        }
    }

    /// Route a subscriber-sent message to the handlers for its type.
    pub fn register_handler(&self, types: &[EventType], handler: Arc<dyn ClientEventHandler>) {
        for event_type in types {
            self.handlers
                .entry(*event_type)
                .or_default()
                .push(handler.clone());
        }
    }

    /// Runs each matching handler on its own task.
    pub fn dispatch_client_message(self: &Arc<Self>, client_id: &str, message: EventMessage) {
        let handlers = self
            .handlers
            .get(&message.event_type)
            .map(|h| h.clone())
            .unwrap_or_default();
        if handlers.is_empty() {
            debug!(
                "no handler for {} message from subscriber {}",
                message.event_type, client_id
            );
            return;
        }

        for handler in handlers {
            let hub = self.clone();
            let client_id = client_id.to_string();
            let message = message.clone();
            tokio::spawn(async move {
                handler.handle(&hub, &client_id, message).await;
            });
        }
    }
}

fn format_uptime(elapsed: chrono::Duration) -> String {
    let secs = elapsed.num_seconds().max(0);
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{h}h{m}m{s}s")
    } else if m > 0 {
        format!("{m}m{s}s")
    } else {
        format!("{s}s")
    }
}

// ============================================================================
// Engine
// ============================================================================

struct ClientEntry {
    client: HubClient,
    subscriptions: BTreeSet<EventType>,
}

/// Owns all mutable hub state. Runs on a single task.
struct HubEngine {
    clients: HashMap<String, ClientEntry>,
    subscriptions: HashMap<EventType, HashSet<String>>,
    snapshot: Arc<RwLock<HubSnapshot>>,
    messages_sent: Arc<AtomicU64>,
}

impl HubEngine {
    async fn run(mut self, mut inbox: mpsc::Receiver<HubCommand>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                command = inbox.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
            }
        }

        inbox.close();
        self.close_all();
    }

    fn handle(&mut self, command: HubCommand) {
        match command {
            HubCommand::Register {
                client,
                requested,
                reply,
            } => {
                let response = self.register(client, requested);
                let _ = reply.send(response);
            }
            HubCommand::Unregister { client_id } => self.unregister(&client_id),
            HubCommand::Unsubscribe {
                client_id,
                types,
                reply,
            } => {
                let _ = reply.send(self.unsubscribe(&client_id, &types));
            }
            HubCommand::Broadcast { message, reply } => {
                let _ = reply.send(self.broadcast(message));
            }
        }
    }

    fn register(&mut self, client: HubClient, requested: Vec<String>) -> ConnectResponse {
        let (valid, invalid) = match parse_event_types(&requested) {
            Ok(valid) => (valid, Vec::new()),
            Err(e) => (e.valid, e.invalid),
        };

        let mut subscriptions: BTreeSet<EventType> = valid.into_iter().collect();
        subscriptions.insert(EventType::Global);

        let id = client.id.clone();
        for event_type in &subscriptions {
            self.subscriptions
                .entry(*event_type)
                .or_default()
                .insert(id.clone());
        }

        let response = ConnectResponse {
            client_id: id.clone(),
            subscriptions: subscriptions.iter().copied().collect(),
        };
        info!(
            "subscriber {} ({}) registered for [{}]",
            id,
            client.identity.username,
            response
                .subscriptions
                .iter()
                .map(|t| t.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );

        let entry = ClientEntry {
            client,
            subscriptions,
        };
        Self::deliver(
            &self.messages_sent,
            &entry.client,
            EventMessage::new(EventType::Global, WELCOME_MESSAGE)
                .with_body(&response)
                .for_client(&id),
        );
        if !invalid.is_empty() {
            warn!("subscriber {} requested unknown event types {:?}", id, invalid);
            let notice = ProtocolNotice {
                error: format!("ignored invalid event types: {}", invalid.join(", ")),
                valid_types: EventType::ALL.to_vec(),
            };
            Self::deliver(
                &self.messages_sent,
                &entry.client,
                EventMessage::new(EventType::System, WARNING)
                    .with_body(notice)
                    .for_client(&id),
            );
        }

        self.clients.insert(id, entry);
        self.publish_snapshot();
        response
    }

    fn unregister(&mut self, client_id: &str) {
        let Some(entry) = self.clients.remove(client_id) else {
            debug!("subscriber {} already unregistered", client_id);
            return;
        };

        for event_type in &entry.subscriptions {
            self.remove_from_index(*event_type, client_id);
        }
        // Pumps that observe the closed mailbox must not unregister again.
        entry.client.liveness().mark_dead();
        self.publish_snapshot();

        // Dropping the entry closes the mailbox.
        drop(entry);
        debug!("subscriber {} unregistered", client_id);
    }

    fn unsubscribe(&mut self, client_id: &str, types: &[EventType]) -> HubResult<Vec<EventType>> {
        let entry = self
            .clients
            .get_mut(client_id)
            .ok_or_else(|| HubError::ClientNotFound(client_id.to_string()))?;

        let removed: Vec<EventType> = types
            .iter()
            .copied()
            .filter(|t| *t != EventType::Global && entry.subscriptions.remove(t))
            .collect();

        if removed.is_empty() {
            return if types.contains(&EventType::Global) {
                Err(HubError::GlobalIsMandatory)
            } else {
                Err(HubError::NothingToUnsubscribe(client_id.to_string()))
            };
        }

        for event_type in &removed {
            self.remove_from_index(*event_type, client_id);
        }
        self.publish_snapshot();
        Ok(removed)
    }

    fn remove_from_index(&mut self, event_type: EventType, client_id: &str) {
        if let Some(ids) = self.subscriptions.get_mut(&event_type) {
            ids.remove(client_id);
            if ids.is_empty() {
                self.subscriptions.remove(&event_type);
            }
        }
    }

    fn broadcast(&mut self, message: EventMessage) -> HubResult<usize> {
        if message.is_unicast() {
            let client_id = message.client_id.clone().unwrap_or_default();
            let entry = self
                .clients
                .get(&client_id)
                .ok_or(HubError::ClientNotFound(client_id))?;
            return Ok(usize::from(Self::deliver(
                &self.messages_sent,
                &entry.client,
                message,
            )));
        }

        let Some(ids) = self.subscriptions.get(&message.event_type) else {
            return Ok(0);
        };
        let mut delivered = 0;
        for id in ids {
            if let Some(entry) = self.clients.get(id)
                && Self::deliver(&self.messages_sent, &entry.client, message.clone())
            {
                delivered += 1;
            }
        }
        Ok(delivered)
    }

    /// Never blocks: a full mailbox loses this one message.
    fn deliver(counter: &AtomicU64, client: &HubClient, message: EventMessage) -> bool {
        match client.mailbox().try_send(message) {
            Ok(()) => {
                counter.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(mpsc::error::TrySendError::Full(message)) => {
                warn!(
                    "mailbox of subscriber {} is full, dropping {} message",
                    client.id, message.event_type
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("mailbox of subscriber {} is closed", client.id);
                false
            }
        }
    }

    fn close_all(&mut self) {
        let closing: Vec<ClientEntry> = self.clients.drain().map(|(_, entry)| entry).collect();
        for entry in &closing {
            entry.client.liveness().mark_dead();
        }
        self.subscriptions.clear();
        self.publish_snapshot();
        debug!("closing {} subscriber mailbox(es)", closing.len());
    }

    fn publish_snapshot(&self) {
        let clients = self
            .clients
            .values()
            .map(|entry| ClientSummary {
                id: entry.client.id.clone(),
                user_id: entry.client.identity.user_id.clone(),
                username: entry.client.identity.username.clone(),
                connected_at: entry.client.connected_at,
                subscriptions: entry.subscriptions.iter().copied().collect(),
                liveness: entry.client.liveness(),
            })
            .collect();
        let type_counts = self
            .subscriptions
            .iter()
            .map(|(t, ids)| (*t, ids.len()))
            .collect();
        let ips = self
            .clients
            .values()
            .filter_map(|entry| entry.client.remote_ip.clone())
            .collect();

        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = HubSnapshot {
            clients,
            type_counts,
            ips,
        };
    }
}
