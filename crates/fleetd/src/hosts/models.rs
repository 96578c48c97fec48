//! Host record model.
//!
//! A record mixes two kinds of data. Durable fields (address, credentials,
//! tags, claims, enabled flag) only change through explicit updates. Volatile
//! fields (health check, resources, VM inventory and health status) are
//! rebuilt on every reconciliation cycle.

use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Health of an enabled host. Meaningless while the host is disabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostState {
    Healthy,
    #[default]
    Unhealthy,
}

/// Credentials used when calling the host.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HostAuthentication {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceHealth {
    pub name: String,
    pub healthy: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error_message: String,
}

/// Response of `GET /health/system`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheck {
    pub healthy: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error_message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<ServiceHealth>,
}

impl HealthCheck {
    /// Summarise service health as `(healthy, description)`.
    pub fn status(&self) -> (bool, &'static str) {
        let failing = self.services.iter().filter(|s| !s.healthy).count();
        if failing == 0 {
            (true, "All Services Running")
        } else if failing < self.services.len() {
            (false, "Service Degraded")
        } else {
            (false, "Service Unhealthy")
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HostResourceItem {
    pub physical_cpu_count: i64,
    pub logical_cpu_count: i64,
    pub memory_size: f64,
    pub disk_size: f64,
    pub free_disk_size: f64,
}

/// Response of `GET /v1/config/hardware`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HostResources {
    pub cpu_type: String,
    pub cpu_brand: String,
    pub devops_version: String,
    pub os_name: String,
    pub os_version: String,
    pub external_ip_address: String,
    pub total: HostResourceItem,
    pub total_available: HostResourceItem,
    pub total_in_use: HostResourceItem,
    pub total_reserved: HostResourceItem,
}

/// A VM as reported by `GET /v1/machines`.
///
/// Only the fields the orchestrator reads are typed; the rest of the host's
/// payload is kept verbatim in `extra`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct VirtualMachine {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub state: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub host_id: String,
    /// Base URL of the host the VM runs on.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub host: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub host_state: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_path_prefix() -> String {
    "/api".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostRecord {
    pub id: String,
    #[serde(default)]
    pub enabled: bool,
    /// Hostname, IP address, or a full `http(s)://host:port` URL.
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    #[serde(default = "default_path_prefix")]
    pub path_prefix: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub architecture: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cpu_model: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authentication: Option<HostAuthentication>,
    #[serde(default)]
    pub state: HostState,
    #[serde(default, rename = "last_seen", skip_serializing_if = "Option::is_none")]
    pub last_unhealthy: Option<DateTime<Utc>>,
    #[serde(
        default,
        rename = "last_seen_error_message",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_unhealthy_error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<HostResources>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheck>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub virtual_machines: Vec<VirtualMachine>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_claims: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_roles: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl HostRecord {
    pub fn new(id: impl Into<String>, host: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            enabled: true,
            host: host.into(),
            port: None,
            schema: None,
            path_prefix: default_path_prefix(),
            architecture: String::new(),
            cpu_model: String::new(),
            description: String::new(),
            tags: Vec::new(),
            authentication: None,
            state: HostState::Unhealthy,
            last_unhealthy: None,
            last_unhealthy_error_message: None,
            resources: None,
            health_check: None,
            virtual_machines: Vec::new(),
            required_claims: Vec::new(),
            required_roles: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Base URL of the host API, e.g. `http://10.0.0.5:8080/api`.
    ///
    /// A `host` given as a full URL wins over `schema`/`port`.
    pub fn base_url(&self) -> String {
        let prefix = self.path_prefix.trim_end_matches('/');
        let prefix = if prefix.is_empty() || prefix.starts_with('/') {
            prefix.to_string()
        } else {
            format!("/{prefix}")
        };

        if (self.host.starts_with("http://") || self.host.starts_with("https://"))
            && let Ok(url) = Url::parse(&self.host)
        {
            let authority = match url.port() {
                Some(port) => format!("{}:{}", url.host_str().unwrap_or_default(), port),
                None => url.host_str().unwrap_or_default().to_string(),
            };
            return format!("{}://{}{}", url.scheme(), authority, prefix);
        }

        let schema = self
            .schema
            .as_deref()
            .map(|s| s.trim_end_matches("://"))
            .filter(|s| !s.is_empty())
            .unwrap_or("http");
        match self.port {
            Some(port) => format!("{schema}://{}:{port}{prefix}", self.host),
            None => format!("{schema}://{}{prefix}", self.host),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.enabled && self.state == HostState::Healthy
    }

    /// Record a failure. The first failure time is kept while the host stays unhealthy.
    pub fn set_unhealthy(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        if self.state != HostState::Unhealthy || self.last_unhealthy.is_none() {
            self.last_unhealthy = Some(Utc::now());
        }
        self.state = HostState::Unhealthy;
        self.last_unhealthy_error_message = Some(reason);
    }

    pub fn set_healthy(&mut self) {
        self.state = HostState::Healthy;
        self.last_unhealthy = None;
        self.last_unhealthy_error_message = None;
    }

    /// Copy the fields rebuilt by reconciliation from `snapshot`: health
    /// check, resources (and the architecture/CPU model derived from them),
    /// VM inventory and health status. Durable fields stay as they are on `self`.
    pub fn overlay_volatile(&mut self, snapshot: &HostRecord) {
        self.health_check = snapshot.health_check.clone();
        self.resources = snapshot.resources.clone();
        self.virtual_machines = snapshot.virtual_machines.clone();
        self.architecture = snapshot.architecture.clone();
        self.cpu_model = snapshot.cpu_model.clone();
        self.state = snapshot.state;
        self.last_unhealthy = snapshot.last_unhealthy;
        self.last_unhealthy_error_message = snapshot.last_unhealthy_error_message.clone();
    }

    /// Drop cached data that the store keeps authoritatively.
    pub fn clear_volatile(&mut self) {
        self.health_check = None;
        self.resources = None;
        self.virtual_machines = Vec::new();
    }

    /// Stamp a VM reported by this host with the host's identity.
    pub fn tag_vm(&self, mut vm: VirtualMachine) -> VirtualMachine {
        vm.host_id = self.id.clone();
        vm.host = self.base_url();
        vm
    }

    /// Copy without credentials, for API responses.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        copy.authentication = None;
        copy
    }
}
