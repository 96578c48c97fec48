//! Shared fixtures for integration tests.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use fleetd::api::AppState;
use fleetd::events::{ClientIdentity, EventHub, HubClient, HubSettings, RunMode};
use fleetd::host_api::{
    AuthHeader, CredentialResolver, HealthProbe, HostApi, HostApiError, HostApiResult, VmAction,
};
use fleetd::hosts::{HealthCheck, HostRecord, HostResources, HostStore, VirtualMachine};
use fleetd::orchestrator::{
    Backoff, ClientSettings, HostOperations, HostWebSocketManager, ReconciliationLoop,
};
use fleetd_protocol::payloads::PONG;
use fleetd_protocol::{EventMessage, EventType};
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, Notify, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

pub fn host(id: &str) -> HostRecord {
    let mut host = HostRecord::new(id, "127.0.0.1");
    host.port = Some(9);
    host
}

pub fn healthy_host(id: &str, vms: &[&str]) -> HostRecord {
    let mut host = host(id);
    host.set_healthy();
    host.virtual_machines = vms
        .iter()
        .map(|vm| VirtualMachine {
            id: vm.to_string(),
            state: "stopped".to_string(),
            ..Default::default()
        })
        .collect();
    host
}

pub fn running_hub() -> Arc<EventHub> {
    let hub = Arc::new(EventHub::new(HubSettings::default()));
    hub.initialize(RunMode::Api);
    hub
}

/// Register an in-process subscriber and swallow its welcome message.
pub async fn subscriber(hub: &EventHub, types: &[&str]) -> (String, mpsc::Receiver<EventMessage>) {
    let (client, mut rx) = HubClient::new(ClientIdentity::default(), None, 64);
    let response = hub
        .register_client(client, types.iter().map(|t| t.to_string()).collect())
        .await
        .unwrap();
    rx.recv().await.unwrap();
    (response.client_id, rx)
}

/// Next message whose text is `message`, skipping others.
pub async fn expect_message(rx: &mut mpsc::Receiver<EventMessage>, message: &str) -> EventMessage {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let next = rx.recv().await.expect("hub closed the mailbox");
            if next.message == message {
                return next;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("no {message} message within 5s"))
}

pub fn fast_client_settings() -> ClientSettings {
    ClientSettings {
        handshake_timeout: Duration::from_millis(500),
        probe_timeout: Duration::from_millis(500),
        ping_interval: Duration::from_secs(30),
        backoff: Backoff::new(Duration::from_millis(20), Duration::from_millis(80)),
    }
}

pub struct NoCredentials;

#[async_trait]
impl CredentialResolver for NoCredentials {
    async fn resolve(&self, _host: &HostRecord) -> HostApiResult<Option<AuthHeader>> {
        Ok(None)
    }
}

/// Full router state over `store` and `api`. Background loops are not started.
pub fn app_state(
    hub: Arc<EventHub>,
    store: Arc<dyn HostStore>,
    api: Arc<ScriptedApi>,
    dev_mode: bool,
) -> AppState {
    let reconciler = Arc::new(ReconciliationLoop::new(
        store.clone(),
        api.clone(),
        Duration::from_secs(3600),
        CancellationToken::new(),
    ));
    let operations = Arc::new(HostOperations::new(
        store.clone(),
        api,
        reconciler.clone(),
    ));
    let connections = Arc::new(HostWebSocketManager::new(
        fast_client_settings(),
        Arc::new(NoCredentials),
        hub.clone(),
        CancellationToken::new(),
    ));
    AppState {
        hub,
        store,
        reconciler,
        operations,
        connections,
        dev_mode,
    }
}

// ============================================================================
// Scripted host API
// ============================================================================

/// In-memory [`HostApi`] that records which hosts were called.
#[derive(Default)]
pub struct ScriptedApi {
    pub calls: Mutex<Vec<(String, String)>>,
    pub health_calls: AtomicUsize,
    pub vms: Vec<VirtualMachine>,
    pub fail_hosts: Vec<String>,
    /// When set, `system_health` waits for a notification before answering.
    pub gate: Option<Arc<Notify>>,
}

impl ScriptedApi {
    async fn record(&self, host: &HostRecord, call: &str) {
        self.calls
            .lock()
            .await
            .push((host.id.clone(), call.to_string()));
    }

    pub async fn calls_for(&self, host_id: &str) -> Vec<String> {
        self.calls
            .lock()
            .await
            .iter()
            .filter(|(id, _)| id == host_id)
            .map(|(_, call)| call.clone())
            .collect()
    }

    fn fails(&self, host: &HostRecord) -> HostApiResult<()> {
        if self.fail_hosts.contains(&host.id) {
            return Err(HostApiError::Transport {
                url: host.base_url(),
                message: "connection refused".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl HostApi for ScriptedApi {
    async fn health_probe(&self, host: &HostRecord) -> HostApiResult<HealthProbe> {
        self.record(host, "health_probe").await;
        self.fails(host)?;
        Ok(HealthProbe {
            status: "ok".to_string(),
        })
    }

    async fn system_health(&self, host: &HostRecord) -> HostApiResult<HealthCheck> {
        self.record(host, "system_health").await;
        self.health_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        self.fails(host)?;
        Ok(HealthCheck {
            healthy: true,
            ..Default::default()
        })
    }

    async fn hardware_info(&self, host: &HostRecord) -> HostApiResult<HostResources> {
        self.record(host, "hardware_info").await;
        self.fails(host)?;
        Ok(HostResources {
            cpu_type: "x86_64".to_string(),
            cpu_brand: "Xeon".to_string(),
            ..Default::default()
        })
    }

    async fn virtual_machines(&self, host: &HostRecord) -> HostApiResult<Vec<VirtualMachine>> {
        self.record(host, "virtual_machines").await;
        self.fails(host)?;
        Ok(self.vms.clone())
    }

    async fn vm_action(
        &self,
        host: &HostRecord,
        vm_id: &str,
        action: VmAction,
    ) -> HostApiResult<Value> {
        self.record(host, &format!("{action} {vm_id}")).await;
        self.fails(host)?;
        Ok(json!({"id": vm_id, "operation": action.verb(), "status": "success"}))
    }

    async fn delete_vm(&self, host: &HostRecord, vm_id: &str) -> HostApiResult<()> {
        self.record(host, &format!("delete {vm_id}")).await;
        self.fails(host)
    }

    async fn catalog_cache(&self, host: &HostRecord) -> HostApiResult<Value> {
        self.record(host, "catalog_cache").await;
        self.fails(host)?;
        Ok(json!({"manifests": [], "total_size": 0}))
    }

    async fn delete_catalog_cache(
        &self,
        host: &HostRecord,
        catalog_id: Option<&str>,
        version: Option<&str>,
    ) -> HostApiResult<()> {
        let call = format!(
            "delete_catalog_cache {} {}",
            catalog_id.unwrap_or("*"),
            version.unwrap_or("*")
        );
        self.record(host, &call).await;
        self.fails(host)
    }
}

// ============================================================================
// Fake host event stream
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeHostMode {
    /// Every connection is upgraded and answers pings.
    Healthy,
    /// Only the first connection is upgraded; later ones are dropped
    /// mid-handshake.
    FailAfterFirst,
}

/// WebSocket server standing in for a host's `/v1/ws/subscribe` endpoint.
pub struct FakeHost {
    pub addr: SocketAddr,
    /// TCP connections accepted so far.
    pub accepted: Arc<AtomicUsize>,
    /// Highest number of rejected handshakes seen in flight at once.
    pub max_parallel_rejects: Arc<AtomicUsize>,
    push: broadcast::Sender<String>,
    task: JoinHandle<()>,
}

impl FakeHost {
    pub async fn start(mode: FakeHostMode) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let max_parallel_rejects = Arc::new(AtomicUsize::new(0));
        let rejecting = Arc::new(AtomicUsize::new(0));
        let (push, _) = broadcast::channel::<String>(64);

        let task = {
            let accepted = accepted.clone();
            let max_parallel_rejects = max_parallel_rejects.clone();
            let push = push.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let seen = accepted.fetch_add(1, Ordering::SeqCst);
                    if mode == FakeHostMode::FailAfterFirst && seen > 0 {
                        let rejecting = rejecting.clone();
                        let max = max_parallel_rejects.clone();
                        tokio::spawn(async move {
                            let now = rejecting.fetch_add(1, Ordering::SeqCst) + 1;
                            max.fetch_max(now, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(30)).await;
                            drop(stream);
                            rejecting.fetch_sub(1, Ordering::SeqCst);
                        });
                        continue;
                    }

                    let mut pushed = push.subscribe();
                    tokio::spawn(async move {
                        let Ok(socket) = tokio_tungstenite::accept_async(stream).await else {
                            return;
                        };
                        let (mut tx, mut rx) = socket.split();
                        loop {
                            tokio::select! {
                                frame = rx.next() => match frame {
                                    Some(Ok(Message::Text(text))) if text.as_str().contains("ping") => {
                                        let pong = EventMessage::new(EventType::Health, PONG);
                                        let reply = serde_json::to_string(&pong).unwrap();
                                        if tx.send(Message::Text(reply.into())).await.is_err() {
                                            break;
                                        }
                                    }
                                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                                    Some(Ok(_)) => {}
                                },
                                text = pushed.recv() => match text {
                                    Ok(text) => {
                                        if tx.send(Message::Text(text.into())).await.is_err() {
                                            break;
                                        }
                                    }
                                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                                    Err(broadcast::error::RecvError::Closed) => break,
                                },
                            }
                        }
                    });
                }
            })
        };

        Self {
            addr,
            accepted,
            max_parallel_rejects,
            push,
            task,
        }
    }

    /// Host record pointing at this server.
    pub fn record(&self, id: &str) -> HostRecord {
        let mut host = HostRecord::new(id, self.addr.ip().to_string());
        host.port = Some(self.addr.port());
        host
    }

    /// Send a frame to every open stream.
    pub fn push(&self, message: &EventMessage) {
        let _ = self.push.send(serde_json::to_string(message).unwrap());
    }

    pub fn push_raw(&self, text: &str) {
        let _ = self.push.send(text.to_string());
    }

    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }
}

impl Drop for FakeHost {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Poll `check` until it holds or five seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
