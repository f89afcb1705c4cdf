use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::SandboxError;

pub type SandboxName = String;

// ── Provider endpoint ───────────────────────────────────────────────

/// Host and port of one provisioning service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProviderEndpoint {
    pub host: String,
    pub port: u16,
}

impl ProviderEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn base_url(&self) -> String {
        if self.host.starts_with("http://") || self.host.starts_with("https://") {
            format!("{}:{}", self.host.trim_end_matches('/'), self.port)
        } else {
            format!("http://{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for ProviderEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for ProviderEndpoint {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| SandboxError::Serde(format!("provider endpoint missing port: {s}")))?;
        if host.is_empty() {
            return Err(SandboxError::Serde(format!("provider endpoint missing host: {s}")));
        }
        let port = port
            .parse::<u16>()
            .map_err(|e| SandboxError::Serde(format!("invalid provider port in {s}: {e}")))?;
        Ok(Self::new(host, port))
    }
}

impl TryFrom<String> for ProviderEndpoint {
    type Error = SandboxError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ProviderEndpoint> for String {
    fn from(value: ProviderEndpoint) -> Self {
        value.to_string()
    }
}

// ── Sandbox config (input to start_container) ───────────────────────

/// Immutable description of one sandbox instance. One per pool slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxConfig {
    pub name: SandboxName,
    pub os_type: String,
    pub screen_width: u32,
    pub screen_height: u32,
    pub disk_size: String,
    pub ram_size: String,
    pub cpu_cores: u32,
    #[serde(default)]
    pub headless: bool,
}

// ── Connection info ─────────────────────────────────────────────────

/// Network endpoints of a live sandbox.
///
/// Rendered downstream as `host:control_port:display_port:vnc_port:aux_port`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub host: String,
    pub control_port: u16,
    pub display_port: u16,
    pub vnc_port: u16,
    pub aux_port: u16,
}

impl fmt::Display for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}:{}",
            self.host, self.control_port, self.display_port, self.vnc_port, self.aux_port
        )
    }
}

impl FromStr for ConnectionInfo {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split(':').collect();
        if parts.len() != 5 || parts[0].is_empty() {
            return Err(SandboxError::Serde(format!(
                "connection string must be host:control:display:vnc:aux, got {s}"
            )));
        }
        let port = |idx: usize| -> Result<u16, SandboxError> {
            parts[idx]
                .parse::<u16>()
                .map_err(|e| SandboxError::Serde(format!("invalid port {:?}: {e}", parts[idx])))
        };
        Ok(Self {
            host: parts[0].to_string(),
            control_port: port(1)?,
            display_port: port(2)?,
            vnc_port: port(3)?,
            aux_port: port(4)?,
        })
    }
}

/// The provider returns connection info either as an object or as the
/// compact connection string.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum ConnectionInfoWire {
    Compact(String),
    Detailed(ConnectionInfo),
}

fn deserialize_connection_info<'de, D>(deserializer: D) -> Result<Option<ConnectionInfo>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match Option::<ConnectionInfoWire>::deserialize(deserializer)? {
        None => Ok(None),
        Some(ConnectionInfoWire::Detailed(info)) => Ok(Some(info)),
        Some(ConnectionInfoWire::Compact(s)) => s
            .parse()
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

// ── Status ──────────────────────────────────────────────────────────

/// Health of a pool slot's sandbox, as seen by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxStatus {
    Idle,
    Busy,
    Unhealthy,
    Retired,
}

impl fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SandboxStatus::Idle => "idle",
            SandboxStatus::Busy => "busy",
            SandboxStatus::Unhealthy => "unhealthy",
            SandboxStatus::Retired => "retired",
        };
        f.write_str(s)
    }
}

// ── Provisioning API wire types ─────────────────────────────────────

pub const STATUS_SUCCESS: &str = "success";

#[derive(Debug, Clone, Deserialize)]
pub struct StartContainerResponse {
    pub status: String,
    #[serde(default)]
    pub name: Option<SandboxName>,
    #[serde(default, deserialize_with = "deserialize_connection_info")]
    pub connection_info: Option<ConnectionInfo>,
    #[serde(default, alias = "error")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusOnlyResponse {
    pub status: String,
    #[serde(default, alias = "error")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerStatusResponse {
    pub status: String,
    #[serde(default, deserialize_with = "deserialize_connection_info")]
    pub connection_info: Option<ConnectionInfo>,
    #[serde(default, alias = "error")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RevertRequest {
    pub container_name: SandboxName,
    pub snapshot_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListResponse {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub containers: Vec<ContainerEntry>,
}

/// One container in a `/list` response. Older providers return bare names.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ContainerEntry {
    Name(SandboxName),
    Detailed {
        name: SandboxName,
        #[serde(default)]
        status: Option<String>,
    },
}

/// Introspection summary of a container known to a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerSummary {
    pub name: SandboxName,
    pub provider: ProviderEndpoint,
    pub status: Option<String>,
}

impl ContainerEntry {
    pub fn into_summary(self, provider: &ProviderEndpoint) -> ContainerSummary {
        match self {
            ContainerEntry::Name(name) => ContainerSummary {
                name,
                provider: provider.clone(),
                status: None,
            },
            ContainerEntry::Detailed { name, status } => ContainerSummary {
                name,
                provider: provider.clone(),
                status,
            },
        }
    }
}
