//! Host-targeted actions run on behalf of API callers.

use std::sync::Arc;

use log::{debug, info};
use serde_json::Value;

use super::error::{OrchestratorError, OrchestratorResult};
use super::reconcile::ReconciliationLoop;
use crate::host_api::{HostApi, VmAction};
use crate::hosts::{HostRecord, HostState, HostStore};

pub struct HostOperations {
    store: Arc<dyn HostStore>,
    api: Arc<dyn HostApi>,
    reconciler: Arc<ReconciliationLoop>,
}

impl HostOperations {
    pub fn new(
        store: Arc<dyn HostStore>,
        api: Arc<dyn HostApi>,
        reconciler: Arc<ReconciliationLoop>,
    ) -> Self {
        Self {
            store,
            api,
            reconciler,
        }
    }

    /// Load a host that can take requests right now.
    async fn usable_host(&self, host_id: &str) -> OrchestratorResult<HostRecord> {
        let host = self
            .store
            .get(host_id)
            .await?
            .ok_or_else(|| OrchestratorError::HostNotFound(host_id.to_string()))?;
        if !host.enabled {
            return Err(OrchestratorError::HostDisabled(host_id.to_string()));
        }
        if !host.is_healthy() {
            return Err(OrchestratorError::HostUnhealthy(host_id.to_string()));
        }
        Ok(host)
    }

    fn ensure_vm(host: &HostRecord, vm_id: &str) -> OrchestratorResult<()> {
        if host.virtual_machines.iter().any(|vm| vm.id == vm_id) {
            Ok(())
        } else {
            Err(OrchestratorError::VmNotFound {
                host_id: host.id.clone(),
                vm_id: vm_id.to_string(),
            })
        }
    }

    /// Live state from the host's probe endpoint. Disabled hosts are not
    /// contacted and keep their stored state.
    pub async fn live_state(&self, host: &HostRecord) -> HostState {
        if !host.enabled {
            return host.state;
        }
        match self.api.health_probe(host).await {
            Ok(probe) if probe.is_ok() => HostState::Healthy,
            Ok(probe) => {
                debug!("host {} probe answered '{}'", host.id, probe.status);
                HostState::Unhealthy
            }
            Err(err) => {
                debug!("host {} probe failed: {}", host.id, err);
                HostState::Unhealthy
            }
        }
    }

    pub async fn vm_action(
        &self,
        host_id: &str,
        vm_id: &str,
        action: VmAction,
    ) -> OrchestratorResult<Value> {
        let host = self.usable_host(host_id).await?;
        Self::ensure_vm(&host, vm_id)?;

        let result = self
            .api
            .vm_action(&host, vm_id, action)
            .await
            .map_err(|e| OrchestratorError::operation(host_id, format!("{action} {vm_id}"), e))?;
        info!("{} of VM {} on host {} done", action, vm_id, host_id);
        self.reconciler.refresh();
        Ok(result)
    }

    pub async fn delete_vm(&self, host_id: &str, vm_id: &str) -> OrchestratorResult<()> {
        let host = self.usable_host(host_id).await?;
        Self::ensure_vm(&host, vm_id)?;

        self.api
            .delete_vm(&host, vm_id)
            .await
            .map_err(|e| OrchestratorError::operation(host_id, format!("delete {vm_id}"), e))?;
        info!("deleted VM {} on host {}", vm_id, host_id);
        self.reconciler.refresh();
        Ok(())
    }

    pub async fn catalog_cache(&self, host_id: &str) -> OrchestratorResult<Value> {
        let host = self.usable_host(host_id).await?;
        self.api
            .catalog_cache(&host)
            .await
            .map_err(|e| OrchestratorError::operation(host_id, "list catalog cache", e))
    }

    /// Drop the whole cache, one catalog, or one version of a catalog.
    pub async fn delete_catalog_cache(
        &self,
        host_id: &str,
        catalog_id: Option<&str>,
        version: Option<&str>,
    ) -> OrchestratorResult<()> {
        let host = self.usable_host(host_id).await?;
        self.api
            .delete_catalog_cache(&host, catalog_id, version)
            .await
            .map_err(|e| OrchestratorError::operation(host_id, "delete catalog cache", e))?;
        info!("cleared catalog cache on host {}", host_id);
        self.reconciler.refresh();
        Ok(())
    }
}
