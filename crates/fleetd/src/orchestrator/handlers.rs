//! Handlers for events pushed by hosts.

use std::sync::Arc;

use async_trait::async_trait;
use fleetd_protocol::payloads::{
    HOST_LOGS_UPDATE, HOST_STATS_UPDATE, HOST_VM_ADDED, HOST_VM_REMOVED, HOST_VM_STATE_CHANGED,
    HOST_VM_UPDATED, HostLogsUpdate, HostStatsUpdate, HostVmEvent, PONG, VM_ADDED, VM_REMOVED,
    VM_STATE_CHANGED, VM_UPDATED,
};
use fleetd_protocol::{EventMessage, EventType};
use log::{debug, info, warn};
use serde::Deserialize;
use serde::de::DeserializeOwned;

use super::dispatch::HostEventHandler;
use crate::events::EventHub;
use crate::hosts::{HostRecord, HostStore, VirtualMachine};

/// Marks a host healthy when it answers a heartbeat.
pub struct HostHealthHandler {
    store: Arc<dyn HostStore>,
}

impl HostHealthHandler {
    pub fn new(store: Arc<dyn HostStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl HostEventHandler for HostHealthHandler {
    async fn handle(&self, host_id: &str, _event_type: EventType, payload: &EventMessage) {
        if payload.message != PONG {
            return;
        }
        let mut host = match self.store.get(host_id).await {
            Ok(Some(host)) => host,
            Ok(None) => return,
            Err(err) => {
                warn!("loading host {} after pong failed: {}", host_id, err);
                return;
            }
        };
        if host.is_healthy() {
            return;
        }
        host.set_healthy();
        match self.store.update(host).await {
            Ok(_) => info!("host {} answered heartbeat, marked healthy", host_id),
            Err(err) => warn!("marking host {} healthy failed: {}", host_id, err),
        }
    }
}

/// Re-publishes host log lines to subscribers.
pub struct HostLogsHandler {
    hub: Arc<EventHub>,
}

impl HostLogsHandler {
    pub fn new(hub: Arc<EventHub>) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl HostEventHandler for HostLogsHandler {
    async fn handle(&self, host_id: &str, _event_type: EventType, payload: &EventMessage) {
        let body = HostLogsUpdate {
            host_id: host_id.to_string(),
            log: payload.body.clone(),
        };
        publish(&self.hub, HOST_LOGS_UPDATE, body).await;
    }
}

/// Re-publishes host resource statistics to subscribers.
pub struct HostStatsHandler {
    hub: Arc<EventHub>,
}

impl HostStatsHandler {
    pub fn new(hub: Arc<EventHub>) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl HostEventHandler for HostStatsHandler {
    async fn handle(&self, host_id: &str, _event_type: EventType, payload: &EventMessage) {
        let body = HostStatsUpdate {
            host_id: host_id.to_string(),
            stats: payload.body.clone(),
        };
        publish(&self.hub, HOST_STATS_UPDATE, body).await;
    }
}

#[derive(Debug, Deserialize)]
struct VmStateChange {
    vm_id: String,
    #[serde(default)]
    previous_state: String,
    current_state: String,
}

/// Body of both `VM_ADDED` and `VM_UPDATED`.
#[derive(Debug, Deserialize)]
struct VmSnapshot {
    vm_id: String,
    new_vm: VirtualMachine,
}

#[derive(Debug, Deserialize)]
struct VmRemoved {
    vm_id: String,
}

/// Keeps the cached VM list in the store in step with hypervisor events and
/// forwards them to subscribers.
pub struct HostVmEventHandler {
    store: Arc<dyn HostStore>,
    hub: Arc<EventHub>,
}

impl HostVmEventHandler {
    pub fn new(store: Arc<dyn HostStore>, hub: Arc<EventHub>) -> Self {
        Self { store, hub }
    }

    async fn update_host(
        &self,
        host_id: &str,
        change: impl FnOnce(&mut HostRecord) -> bool,
    ) -> bool {
        let mut host = match self.store.get(host_id).await {
            Ok(Some(host)) => host,
            Ok(None) => {
                warn!("VM event for unknown host {}", host_id);
                return false;
            }
            Err(err) => {
                warn!("loading host {} for VM event failed: {}", host_id, err);
                return false;
            }
        };
        if !change(&mut host) {
            return false;
        }
        match self.store.update(host).await {
            Ok(_) => true,
            Err(err) => {
                warn!("saving VM change of host {} failed: {}", host_id, err);
                false
            }
        }
    }
}

fn parse_body<T: DeserializeOwned>(host_id: &str, payload: &EventMessage) -> Option<T> {
    match serde_json::from_value(payload.body.clone()) {
        Ok(body) => Some(body),
        Err(err) => {
            warn!(
                "malformed {} body from host {}: {}",
                payload.message, host_id, err
            );
            None
        }
    }
}

#[async_trait]
impl HostEventHandler for HostVmEventHandler {
    async fn handle(&self, host_id: &str, _event_type: EventType, payload: &EventMessage) {
        let forwarded = match payload.message.as_str() {
            VM_STATE_CHANGED => {
                let Some(change) = parse_body::<VmStateChange>(host_id, payload) else {
                    return;
                };
                debug!(
                    "host {} VM {}: {} -> {}",
                    host_id, change.vm_id, change.previous_state, change.current_state
                );
                self.update_host(host_id, |host| {
                    match host.virtual_machines.iter_mut().find(|vm| vm.id == change.vm_id) {
                        Some(vm) => {
                            vm.state = change.current_state.clone();
                            true
                        }
                        None => {
                            warn!("VM {} not found on host {}", change.vm_id, host_id);
                            false
                        }
                    }
                })
                .await;
                HOST_VM_STATE_CHANGED
            }
            VM_ADDED => {
                let Some(added) = parse_body::<VmSnapshot>(host_id, payload) else {
                    return;
                };
                self.update_host(host_id, |host| {
                    let vm = host.tag_vm(added.new_vm);
                    host.virtual_machines.retain(|existing| existing.id != added.vm_id);
                    host.virtual_machines.push(vm);
                    true
                })
                .await;
                HOST_VM_ADDED
            }
            VM_REMOVED => {
                let Some(removed) = parse_body::<VmRemoved>(host_id, payload) else {
                    return;
                };
                self.update_host(host_id, |host| {
                    let before = host.virtual_machines.len();
                    host.virtual_machines.retain(|vm| vm.id != removed.vm_id);
                    host.virtual_machines.len() != before
                })
                .await;
                HOST_VM_REMOVED
            }
            VM_UPDATED => {
                let Some(updated) = parse_body::<VmSnapshot>(host_id, payload) else {
                    return;
                };
                self.update_host(host_id, |host| {
                    let vm = host.tag_vm(updated.new_vm);
                    match host.virtual_machines.iter_mut().find(|v| v.id == updated.vm_id) {
                        Some(existing) => *existing = vm,
                        None => {
                            debug!("updated VM {} was unknown on host {}", updated.vm_id, host_id);
                            host.virtual_machines.push(vm);
                        }
                    }
                    true
                })
                .await;
                HOST_VM_UPDATED
            }
            other => {
                debug!("ignoring {} event from host {}", other, host_id);
                return;
            }
        };

        let event = match serde_json::to_value(payload) {
            Ok(event) => event,
            Err(err) => {
                warn!("encoding VM event of host {} failed: {}", host_id, err);
                return;
            }
        };
        let body = HostVmEvent {
            host_id: host_id.to_string(),
            event,
        };
        publish(&self.hub, forwarded, body).await;
    }
}

async fn publish(hub: &EventHub, message: &str, body: impl serde::Serialize) {
    if let Err(err) = hub.send_to_type(EventType::Orchestrator, message, body).await {
        debug!("not publishing {}: {}", message, err);
    }
}
