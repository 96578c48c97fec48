//! Host API client.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::credentials::CredentialResolver;
use super::error::{HostApiError, HostApiResult};
use crate::hosts::{HealthCheck, HostRecord, HostResources, VirtualMachine};

/// Response of `GET /health/probe`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthProbe {
    pub status: String,
}

impl HealthProbe {
    pub fn is_ok(&self) -> bool {
        self.status.eq_ignore_ascii_case("ok")
    }
}

/// VM verbs exposed by hosts as `GET /v1/machines/{id}/{verb}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmAction {
    Start,
    Stop { force: bool },
    Suspend,
    Resume,
    Pause,
    Reset,
    Restart,
}

impl VmAction {
    pub fn verb(&self) -> &'static str {
        match self {
            VmAction::Start => "start",
            VmAction::Stop { .. } => "stop",
            VmAction::Suspend => "suspend",
            VmAction::Resume => "resume",
            VmAction::Pause => "pause",
            VmAction::Reset => "reset",
            VmAction::Restart => "restart",
        }
    }
}

impl fmt::Display for VmAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.verb())
    }
}

impl FromStr for VmAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "start" => Ok(VmAction::Start),
            "stop" => Ok(VmAction::Stop { force: false }),
            "suspend" => Ok(VmAction::Suspend),
            "resume" => Ok(VmAction::Resume),
            "pause" => Ok(VmAction::Pause),
            "reset" => Ok(VmAction::Reset),
            "restart" => Ok(VmAction::Restart),
            other => Err(format!("unknown VM action '{other}'")),
        }
    }
}

/// Calls the orchestrator makes against a host.
#[async_trait]
pub trait HostApi: Send + Sync {
    async fn health_probe(&self, host: &HostRecord) -> HostApiResult<HealthProbe>;

    async fn system_health(&self, host: &HostRecord) -> HostApiResult<HealthCheck>;

    async fn hardware_info(&self, host: &HostRecord) -> HostApiResult<HostResources>;

    async fn virtual_machines(&self, host: &HostRecord) -> HostApiResult<Vec<VirtualMachine>>;

    async fn vm_action(&self, host: &HostRecord, vm_id: &str, action: VmAction) -> HostApiResult<Value>;

    async fn delete_vm(&self, host: &HostRecord, vm_id: &str) -> HostApiResult<()>;

    async fn catalog_cache(&self, host: &HostRecord) -> HostApiResult<Value>;

    async fn delete_catalog_cache(
        &self,
        host: &HostRecord,
        catalog_id: Option<&str>,
        version: Option<&str>,
    ) -> HostApiResult<()>;
}

/// Per-call-class timeouts.
#[derive(Debug, Clone, Copy)]
pub struct HostApiTimeouts {
    pub health: Duration,
    pub request: Duration,
    pub operation: Duration,
}

impl Default for HostApiTimeouts {
    fn default() -> Self {
        Self {
            health: Duration::from_secs(5),
            request: Duration::from_secs(120),
            operation: Duration::from_secs(180),
        }
    }
}

/// `reqwest` implementation of [`HostApi`].
#[derive(Clone)]
pub struct HostApiClient {
    client: Client,
    credentials: Arc<dyn CredentialResolver>,
    timeouts: HostApiTimeouts,
}

impl HostApiClient {
    pub fn new(client: Client, credentials: Arc<dyn CredentialResolver>, timeouts: HostApiTimeouts) -> Self {
        Self {
            client,
            credentials,
            timeouts,
        }
    }

    async fn request(
        &self,
        host: &HostRecord,
        method: Method,
        path: &str,
        timeout: Duration,
    ) -> HostApiResult<(String, RequestBuilder)> {
        let url = format!("{}{}", host.base_url(), path);
        let mut builder = self.client.request(method, &url).timeout(timeout);
        if let Some(header) = self.credentials.resolve(host).await? {
            builder = builder.header(header.name, header.value);
        }
        Ok((url, builder))
    }

    async fn send(&self, host: &HostRecord, url: &str, builder: RequestBuilder) -> HostApiResult<Response> {
        debug!("host {}: {}", host.id, url);
        let response = builder
            .send()
            .await
            .map_err(|e| HostApiError::from_reqwest(url, e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::UNAUTHORIZED {
            self.credentials.invalidate(&host.id);
        }
        let message = response.text().await.unwrap_or_default();
        Err(HostApiError::from_status(url, status, message))
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        host: &HostRecord,
        path: &str,
        timeout: Duration,
    ) -> HostApiResult<T> {
        let (url, builder) = self.request(host, Method::GET, path, timeout).await?;
        let response = self.send(host, &url, builder).await?;
        response.json().await.map_err(|e| HostApiError::Decode {
            url,
            message: e.to_string(),
        })
    }
}

#[async_trait]
impl HostApi for HostApiClient {
    async fn health_probe(&self, host: &HostRecord) -> HostApiResult<HealthProbe> {
        self.get_json(host, "/health/probe", self.timeouts.health).await
    }

    async fn system_health(&self, host: &HostRecord) -> HostApiResult<HealthCheck> {
        self.get_json(host, "/health/system", self.timeouts.health).await
    }

    async fn hardware_info(&self, host: &HostRecord) -> HostApiResult<HostResources> {
        self.get_json(host, "/v1/config/hardware", self.timeouts.request).await
    }

    async fn virtual_machines(&self, host: &HostRecord) -> HostApiResult<Vec<VirtualMachine>> {
        self.get_json(host, "/v1/machines", self.timeouts.request).await
    }

    async fn vm_action(&self, host: &HostRecord, vm_id: &str, action: VmAction) -> HostApiResult<Value> {
        let mut path = format!("/v1/machines/{}/{}", vm_id, action.verb());
        if let VmAction::Stop { force } = action {
            path.push_str(&format!("?force={force}"));
        }
        self.get_json(host, &path, self.timeouts.operation).await
    }

    async fn delete_vm(&self, host: &HostRecord, vm_id: &str) -> HostApiResult<()> {
        let path = format!("/v1/machines/{vm_id}");
        let (url, builder) = self
            .request(host, Method::DELETE, &path, self.timeouts.operation)
            .await?;
        self.send(host, &url, builder).await?;
        Ok(())
    }

    async fn catalog_cache(&self, host: &HostRecord) -> HostApiResult<Value> {
        self.get_json(host, "/v1/catalog/cache", self.timeouts.request).await
    }

    async fn delete_catalog_cache(
        &self,
        host: &HostRecord,
        catalog_id: Option<&str>,
        version: Option<&str>,
    ) -> HostApiResult<()> {
        let mut path = "/v1/catalog/cache".to_string();
        for segment in [catalog_id, version].into_iter().flatten() {
            path.push('/');
            path.push_str(segment);
        }

        let (url, builder) = self
            .request(host, Method::DELETE, &path, self.timeouts.operation)
            .await?;
        let response = self.send(host, &url, builder).await?;
        if response.status() != StatusCode::ACCEPTED {
            warn!(
                "host {} answered {} to cache deletion, expected 202",
                host.id,
                response.status()
            );
        }
        Ok(())
    }
}
