//! The runtime port: a capability surface over the device container runtime.
//!
//! The engine never talks to RouterOS directly; it goes through
//! [`RuntimePort`], a fixed operation set covering containers, virtual
//! ethernet interfaces, bridge ports, and files. Production wires in
//! [`RouterOsClient`] (REST over HTTPS with basic auth); tests wire in
//! [`MemoryRuntime`].
//!
//! Implementations must be safe for concurrent calls and must honor task
//! cancellation within one in-flight I/O operation (dropping the future
//! aborts the underlying request).

mod memory;
mod routeros;

pub use memory::MemoryRuntime;
pub use routeros::RouterOsClient;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

// =============================================================================
// Container State
// =============================================================================

/// Container status as reported by the runtime.
///
/// RouterOS reports free-form strings; the known ones get variants and
/// anything else lands in [`ContainerStatus::Other`] (and maps to a
/// `Waiting` pod state downstream).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Running,
    Stopped,
    Error,
    /// The runtime is still unpacking the image tarball.
    Extracting,
    #[serde(untagged)]
    Other(String),
}

impl ContainerStatus {
    /// Parses a runtime status string.
    pub fn parse(raw: &str) -> Self {
        match raw {
            "running" => Self::Running,
            "stopped" => Self::Stopped,
            "error" => Self::Error,
            "extracting" => Self::Extracting,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Error => write!(f, "error"),
            Self::Extracting => write!(f, "extracting"),
            Self::Other(s) => write!(f, "{s}"),
        }
    }
}

/// The runtime's view of a container. Produced by the port, never mutated
/// locally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerRecord {
    /// Stable opaque ID (RouterOS `.id`, e.g. `*7`).
    pub id: String,
    /// Human name.
    pub name: String,
    pub status: ContainerStatus,
    /// Interface binding, if any.
    #[serde(default)]
    pub interface: String,
}

/// Request to create a container.
#[derive(Debug, Clone, Default)]
pub struct ContainerCreateSpec {
    pub name: String,
    /// Image tarball path as the runtime sees it.
    pub file: String,
    /// veth interface to bind.
    pub interface: String,
    /// Directory the runtime unpacks the rootfs into.
    pub root_dir: String,
    /// `host-path:mount-path` pairs.
    pub mounts: Vec<String>,
    pub envs: BTreeMap<String, String>,
    /// Command line, space-joined.
    pub cmd: String,
    pub hostname: String,
    /// Comma-separated DNS servers.
    pub dns: String,
    pub logging: bool,
    pub start_on_boot: bool,
}

/// A virtual ethernet interface as reported by the runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VethRecord {
    pub name: String,
    /// Assigned address in CIDR form, empty if unset.
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub gateway: String,
}

// =============================================================================
// The Port
// =============================================================================

/// Uniform capability surface over the device container runtime.
///
/// All operations are request-scoped and cancellable. Failure kinds are the
/// crate [`Error`](crate::Error) variants `NotFound`, `AlreadyExists`,
/// `Conflict`, `Transport`, and `Auth`.
#[async_trait]
pub trait RuntimePort: Send + Sync {
    // ── containers ─────────────────────────────────────────────────────

    async fn list_containers(&self) -> Result<Vec<ContainerRecord>>;

    /// Looks a container up by its human name.
    async fn get_container(&self, name: &str) -> Result<ContainerRecord>;

    async fn create_container(&self, spec: &ContainerCreateSpec) -> Result<()>;

    async fn start_container(&self, id: &str) -> Result<()>;

    async fn stop_container(&self, id: &str) -> Result<()>;

    async fn remove_container(&self, id: &str) -> Result<()>;

    // ── interfaces ─────────────────────────────────────────────────────

    /// Creates a veth with an address in CIDR form and a gateway.
    async fn create_veth(&self, name: &str, address: &str, gateway: &str) -> Result<()>;

    async fn remove_veth(&self, name: &str) -> Result<()>;

    async fn list_veths(&self) -> Result<Vec<VethRecord>>;

    /// Attaches a veth to a bridge. Bridges are pre-created on the device.
    async fn add_bridge_port(&self, bridge: &str, port: &str) -> Result<()>;

    async fn remove_bridge_port(&self, bridge: &str, port: &str) -> Result<()>;

    // ── files ──────────────────────────────────────────────────────────

    async fn upload_file(&self, path: &str, data: Vec<u8>) -> Result<()>;

    async fn remove_file(&self, path: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_parse() {
        assert_eq!(ContainerStatus::parse("running"), ContainerStatus::Running);
        assert_eq!(ContainerStatus::parse("stopped"), ContainerStatus::Stopped);
        assert_eq!(
            ContainerStatus::parse("extracting"),
            ContainerStatus::Extracting
        );
        assert_eq!(
            ContainerStatus::parse("paused"),
            ContainerStatus::Other("paused".to_string())
        );
    }

    #[test]
    fn test_status_display_roundtrip() {
        for raw in ["running", "stopped", "error", "extracting", "weird"] {
            assert_eq!(ContainerStatus::parse(raw).to_string(), raw);
        }
    }
}
