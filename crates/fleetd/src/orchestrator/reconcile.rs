//! Periodic refresh of host health, hardware and VM inventory.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::backoff::sleep_or_cancel;
use super::error::{OrchestratorError, OrchestratorResult};
use crate::host_api::HostApi;
use crate::hosts::{HostRecord, HostStore};

/// Merge a reconciliation snapshot into the record currently in the store.
///
/// The stored record is always the base: only the volatile fields come from
/// the snapshot, so durable edits made after `origin` survive.
pub fn merge_snapshot(mut stored: HostRecord, snapshot: &HostRecord) -> HostRecord {
    stored.overlay_volatile(snapshot);
    stored
}

/// Removes a host from the in-flight map when dropped. The map value is the
/// rerun flag set by requests that arrived while the host was being refreshed.
struct InFlight<'a> {
    hosts: &'a Mutex<HashMap<String, bool>>,
    host_id: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.hosts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.host_id);
    }
}

pub struct ReconciliationLoop {
    store: Arc<dyn HostStore>,
    api: Arc<dyn HostApi>,
    interval: Duration,
    in_flight: Mutex<HashMap<String, bool>>,
    cancel: CancellationToken,
}

impl ReconciliationLoop {
    pub fn new(
        store: Arc<dyn HostStore>,
        api: Arc<dyn HostApi>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            api,
            interval,
            in_flight: Mutex::new(HashMap::new()),
            cancel,
        }
    }

    /// Run cycles until cancelled. With `ready`, the first cycle waits for
    /// the flag to turn true.
    pub async fn run(self: Arc<Self>, ready: Option<watch::Receiver<bool>>) {
        if let Some(mut ready) = ready {
            info!("reconciliation waiting for the API to come up");
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                result = async { ready.wait_for(|up| *up).await.map(|_| ()) } => {
                    if result.is_err() {
                        warn!("readiness signal dropped, starting reconciliation anyway");
                    }
                }
            }
        }

        info!("reconciliation loop started, interval {:?}", self.interval);
        while !self.cancel.is_cancelled() {
            match self.reconcile_once().await {
                Ok(0) => {}
                Ok(count) => info!("reconciled {} host(s)", count),
                Err(err) => warn!("reconciliation cycle failed: {}", err),
            }
            if !sleep_or_cancel(self.interval, &self.cancel).await {
                break;
            }
        }
        info!("reconciliation loop stopped");
    }

    /// One full cycle: refresh every enabled host concurrently and wait for
    /// all of them. Returns the number of hosts processed.
    pub async fn reconcile_once(self: &Arc<Self>) -> OrchestratorResult<usize> {
        let hosts = self.store.list().await?;
        let mut tasks = JoinSet::new();

        for host in hosts {
            if !host.enabled {
                debug!("skipping disabled host {}", host.id);
                continue;
            }
            let this = Arc::clone(self);
            tasks.spawn(async move { this.process_host(host).await });
        }

        let mut processed = 0;
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(()) => processed += 1,
                Err(err) => warn!("host refresh task failed: {}", err),
            }
        }
        Ok(processed)
    }

    /// Start an out-of-band cycle without waiting for it.
    pub fn refresh(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = this.reconcile_once().await {
                warn!("refresh failed: {}", err);
            }
        });
    }

    /// Refresh one host. A request for a host that is already in flight is
    /// folded into one more pass by the task holding it, started from the
    /// freshly stored record.
    async fn process_host(&self, mut host: HostRecord) {
        {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(rerun) = in_flight.get_mut(&host.id) {
                debug!("host {} is already being refreshed, queueing another pass", host.id);
                *rerun = true;
                return;
            }
            in_flight.insert(host.id.clone(), false);
        }
        let _guard = InFlight {
            hosts: &self.in_flight,
            host_id: host.id.clone(),
        };

        loop {
            self.refresh_host(host.clone()).await;
            if !self.take_rerun(&host.id) {
                break;
            }
            match self.store.get(&host.id).await {
                Ok(Some(fresh)) if fresh.enabled => host = fresh,
                Ok(_) => break,
                Err(err) => {
                    warn!("reloading host {} failed: {}", host.id, err);
                    break;
                }
            }
        }
    }

    /// Clear and return the rerun flag. When none is pending the host leaves
    /// the in-flight map under the same lock, so no request slips between.
    fn take_rerun(&self, host_id: &str) -> bool {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        match in_flight.get_mut(host_id) {
            Some(rerun) if *rerun => {
                *rerun = false;
                true
            }
            _ => {
                in_flight.remove(host_id);
                false
            }
        }
    }

    /// Health, then hardware, then inventory. The first failure marks the
    /// host unhealthy and ends the pass.
    async fn refresh_host(&self, mut host: HostRecord) {
        let origin = host.updated_at;
        debug!("refreshing host {}", host.id);

        match self.api.system_health(&host).await {
            Ok(check) => {
                host.set_healthy();
                host.health_check = Some(check);
            }
            Err(err) => {
                self.fail(host, origin, "health check", err.to_string()).await;
                return;
            }
        }

        match self.api.hardware_info(&host).await {
            Ok(resources) => {
                host.architecture = resources.cpu_type.clone();
                host.cpu_model = resources.cpu_brand.clone();
                host.resources = Some(resources);
            }
            Err(err) => {
                self.fail(host, origin, "hardware info", err.to_string()).await;
                return;
            }
        }

        match self.api.virtual_machines(&host).await {
            Ok(vms) => {
                host.virtual_machines = vms.into_iter().map(|vm| host.tag_vm(vm)).collect();
            }
            Err(err) => {
                self.fail(host, origin, "virtual machines", err.to_string()).await;
                return;
            }
        }

        if let Err(err) = self.persist_host(&host, origin).await {
            warn!("saving host {} failed: {}", host.id, err);
        }
        host.clear_volatile();
    }

    async fn fail(&self, mut host: HostRecord, origin: DateTime<Utc>, stage: &str, reason: String) {
        warn!("{} of host {} failed: {}", stage, host.id, reason);
        host.health_check = None;
        host.set_unhealthy(reason);
        if let Err(err) = self.persist_host(&host, origin).await {
            warn!("saving host {} failed: {}", host.id, err);
        }
    }

    /// Write the snapshot's volatile fields over the freshly stored record.
    /// `origin` is the `updated_at` the snapshot was read with.
    async fn persist_host(
        &self,
        snapshot: &HostRecord,
        origin: DateTime<Utc>,
    ) -> OrchestratorResult<HostRecord> {
        let stored = self
            .store
            .get(&snapshot.id)
            .await?
            .ok_or_else(|| OrchestratorError::HostNotFound(snapshot.id.clone()))?;

        if stored.updated_at != origin {
            debug!(
                "{}, keeping its durable fields",
                OrchestratorError::Conflict(snapshot.id.clone())
            );
        }
        Ok(self.store.update(merge_snapshot(stored, snapshot)).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host_api::{HealthProbe, HostApiError, HostApiResult, VmAction};
    use crate::hosts::{HealthCheck, HostResources, HostState, MemoryHostStore, VirtualMachine};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingApi {
        calls: AtomicUsize,
        fail_health: bool,
    }

    #[async_trait]
    impl HostApi for CountingApi {
        async fn health_probe(&self, _host: &HostRecord) -> HostApiResult<HealthProbe> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(HealthProbe { status: "ok".to_string() })
        }

        async fn system_health(&self, host: &HostRecord) -> HostApiResult<HealthCheck> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_health {
                return Err(HostApiError::Timeout { url: host.base_url() });
            }
            Ok(HealthCheck { healthy: true, ..Default::default() })
        }

        async fn hardware_info(&self, _host: &HostRecord) -> HostApiResult<HostResources> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(HostResources {
                cpu_type: "arm64".to_string(),
                cpu_brand: "Apple M2".to_string(),
                ..Default::default()
            })
        }

        async fn virtual_machines(&self, _host: &HostRecord) -> HostApiResult<Vec<VirtualMachine>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![VirtualMachine {
                id: "vm-1".to_string(),
                state: "running".to_string(),
                ..Default::default()
            }])
        }

        async fn vm_action(&self, _: &HostRecord, _: &str, _: VmAction) -> HostApiResult<Value> {
            unreachable!()
        }

        async fn delete_vm(&self, _: &HostRecord, _: &str) -> HostApiResult<()> {
            unreachable!()
        }

        async fn catalog_cache(&self, _: &HostRecord) -> HostApiResult<Value> {
            unreachable!()
        }

        async fn delete_catalog_cache(
            &self,
            _: &HostRecord,
            _: Option<&str>,
            _: Option<&str>,
        ) -> HostApiResult<()> {
            unreachable!()
        }
    }

    /// Holds the first inventory call open until released.
    struct GatedApi {
        vm_state: std::sync::Mutex<String>,
        vm_calls: AtomicUsize,
        entered: tokio::sync::Notify,
        release: tokio::sync::Notify,
    }

    impl GatedApi {
        fn new(vm_state: &str) -> Self {
            Self {
                vm_state: std::sync::Mutex::new(vm_state.to_string()),
                vm_calls: AtomicUsize::new(0),
                entered: tokio::sync::Notify::new(),
                release: tokio::sync::Notify::new(),
            }
        }
    }

    #[async_trait]
    impl HostApi for GatedApi {
        async fn health_probe(&self, _host: &HostRecord) -> HostApiResult<HealthProbe> {
            unreachable!()
        }

        async fn system_health(&self, _host: &HostRecord) -> HostApiResult<HealthCheck> {
            Ok(HealthCheck { healthy: true, ..Default::default() })
        }

        async fn hardware_info(&self, _host: &HostRecord) -> HostApiResult<HostResources> {
            Ok(HostResources::default())
        }

        async fn virtual_machines(&self, _host: &HostRecord) -> HostApiResult<Vec<VirtualMachine>> {
            let state = self.vm_state.lock().unwrap().clone();
            if self.vm_calls.fetch_add(1, Ordering::SeqCst) == 0 {
                self.entered.notify_one();
                self.release.notified().await;
            }
            Ok(vec![VirtualMachine {
                id: "vm-1".to_string(),
                state,
                ..Default::default()
            }])
        }

        async fn vm_action(&self, _: &HostRecord, _: &str, _: VmAction) -> HostApiResult<Value> {
            unreachable!()
        }

        async fn delete_vm(&self, _: &HostRecord, _: &str) -> HostApiResult<()> {
            unreachable!()
        }

        async fn catalog_cache(&self, _: &HostRecord) -> HostApiResult<Value> {
            unreachable!()
        }

        async fn delete_catalog_cache(
            &self,
            _: &HostRecord,
            _: Option<&str>,
            _: Option<&str>,
        ) -> HostApiResult<()> {
            unreachable!()
        }
    }

    fn reconciler(store: Arc<MemoryHostStore>, api: Arc<dyn HostApi>) -> Arc<ReconciliationLoop> {
        Arc::new(ReconciliationLoop::new(
            store,
            api,
            Duration::from_secs(60),
            CancellationToken::new(),
        ))
    }

    #[test]
    fn merge_keeps_durable_fields_from_store() {
        let mut stored = HostRecord::new("h1", "10.0.0.9");
        stored.tags = vec!["edited".to_string()];
        stored.enabled = false;

        let mut snapshot = HostRecord::new("h1", "10.0.0.5");
        snapshot.set_healthy();
        snapshot.virtual_machines.push(VirtualMachine {
            id: "vm-1".to_string(),
            ..Default::default()
        });

        let merged = merge_snapshot(stored, &snapshot);
        assert_eq!(merged.host, "10.0.0.9");
        assert_eq!(merged.tags, vec!["edited".to_string()]);
        assert!(!merged.enabled);
        assert_eq!(merged.state, HostState::Healthy);
        assert_eq!(merged.virtual_machines.len(), 1);
    }

    #[tokio::test]
    async fn full_pass_fills_volatile_fields() {
        let store = Arc::new(MemoryHostStore::with_hosts([HostRecord::new("h1", "10.0.0.5")]));
        let api = Arc::new(CountingApi::default());
        let processed = reconciler(store.clone(), api.clone()).reconcile_once().await.unwrap();
        assert_eq!(processed, 1);

        let host = store.get("h1").await.unwrap().unwrap();
        assert_eq!(host.state, HostState::Healthy);
        assert_eq!(host.architecture, "arm64");
        assert_eq!(host.cpu_model, "Apple M2");
        assert_eq!(host.virtual_machines[0].host_id, "h1");
        assert_eq!(api.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn health_failure_stops_the_pass() {
        let mut host = HostRecord::new("h1", "10.0.0.5");
        host.set_healthy();
        let store = Arc::new(MemoryHostStore::with_hosts([host]));
        let api = Arc::new(CountingApi {
            fail_health: true,
            ..Default::default()
        });
        reconciler(store.clone(), api.clone()).reconcile_once().await.unwrap();

        let host = store.get("h1").await.unwrap().unwrap();
        assert_eq!(host.state, HostState::Unhealthy);
        assert!(host.last_unhealthy_error_message.is_some());
        assert_eq!(api.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn refresh_during_a_pass_runs_again_with_fresh_inventory() {
        let store = Arc::new(MemoryHostStore::with_hosts([HostRecord::new("h1", "10.0.0.5")]));
        let api = Arc::new(GatedApi::new("stopped"));
        let reconciler = reconciler(store.clone(), api.clone());

        let pass = tokio::spawn({
            let reconciler = reconciler.clone();
            async move { reconciler.reconcile_once().await }
        });
        api.entered.notified().await;

        // the host changes after the first pass read its inventory
        *api.vm_state.lock().unwrap() = "running".to_string();
        reconciler.refresh();
        tokio::time::timeout(Duration::from_secs(5), async {
            while reconciler.in_flight.lock().unwrap().get("h1") != Some(&true) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("refresh was not queued");

        api.release.notify_one();
        assert_eq!(pass.await.unwrap().unwrap(), 1);

        assert_eq!(api.vm_calls.load(Ordering::SeqCst), 2);
        let host = store.get("h1").await.unwrap().unwrap();
        assert_eq!(host.virtual_machines[0].state, "running");
        assert!(reconciler.in_flight.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn disabled_hosts_are_not_called() {
        let mut host = HostRecord::new("h1", "10.0.0.5");
        host.enabled = false;
        let store = Arc::new(MemoryHostStore::with_hosts([host]));
        let api = Arc::new(CountingApi::default());

        let processed = reconciler(store, api.clone()).reconcile_once().await.unwrap();
        assert_eq!(processed, 0);
        assert_eq!(api.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn run_stops_on_cancel() {
        let store = Arc::new(MemoryHostStore::new());
        let cancel = CancellationToken::new();
        let reconciler = Arc::new(ReconciliationLoop::new(
            store,
            Arc::new(CountingApi::default()),
            Duration::from_secs(3600),
            cancel.clone(),
        ));
        let (ready_tx, ready_rx) = watch::channel(false);
        let task = tokio::spawn(reconciler.run(Some(ready_rx)));
        ready_tx.send(true).unwrap();
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
