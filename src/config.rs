//! YAML configuration for the orchestrator.
//!
//! Every field has a default so a minimal config file only needs the
//! RouterOS endpoint and credentials. Durations are given in seconds or
//! minutes in the file and converted to [`Duration`] via accessors.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Name this node reports to feeds and in logs.
    pub node_name: String,
    /// RouterOS REST transport settings.
    pub routeros: RouterOsConfig,
    /// Pod networking.
    pub network: NetworkConfig,
    /// Embedded OCI registry.
    pub registry: RegistryConfig,
    /// Image pipeline and volume storage.
    pub storage: StorageConfig,
    /// Supervisor (boot ordering, watchdog, restart policy).
    pub supervisor: SupervisorConfig,
    /// Management API.
    pub api: ApiConfig,
    /// Infrastructure containers the watchdog keeps alive.
    pub infra: Vec<InfraContainerConfig>,
    /// Local pod manifest for standalone mode.
    pub manifest_path: Option<PathBuf>,
    /// Seconds between reconciliation passes.
    pub reconcile_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_name: "roskube".to_string(),
            routeros: RouterOsConfig::default(),
            network: NetworkConfig::default(),
            registry: RegistryConfig::default(),
            storage: StorageConfig::default(),
            supervisor: SupervisorConfig::default(),
            api: ApiConfig::default(),
            infra: Vec::new(),
            manifest_path: None,
            reconcile_interval_secs: crate::constants::RECONCILE_INTERVAL.as_secs(),
        }
    }
}

impl Config {
    /// Loads configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&raw).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Interval between reconciliation passes.
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs.max(1))
    }
}

/// RouterOS REST API connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterOsConfig {
    /// Base URL, e.g. `https://192.168.88.1`.
    pub endpoint: String,
    pub username: String,
    pub password: String,
    /// Verify the device's TLS certificate. Disable for self-signed certs.
    pub tls_verify: bool,
}

impl Default for RouterOsConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://192.168.88.1".to_string(),
            username: "admin".to_string(),
            password: String::new(),
            tls_verify: true,
        }
    }
}

/// A logical switch definition: one bridge, one subnet, one gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchConfig {
    pub name: String,
    /// Bridge interface on the device. Bridges are pre-created in RouterOS.
    pub bridge: String,
    pub cidr: String,
    pub gateway: String,
    #[serde(default)]
    pub dns_zone: Option<String>,
}

/// Pod networking settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Logical switches. The first entry is the pod network.
    pub switches: Vec<SwitchConfig>,
    /// DNS servers handed to containers.
    pub dns_servers: Vec<String>,
    /// Optional YAML snapshot of switches/ports, persisted after changes.
    pub state_path: Option<PathBuf>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            switches: vec![SwitchConfig {
                name: "pods".to_string(),
                bridge: "containers".to_string(),
                cidr: "172.20.0.0/24".to_string(),
                gateway: "172.20.0.1".to_string(),
                dns_zone: None,
            }],
            dns_servers: vec!["172.20.0.1".to_string()],
            state_path: None,
        }
    }
}

impl NetworkConfig {
    /// The switch pods attach to (the first configured one).
    pub fn pod_switch(&self) -> &SwitchConfig {
        &self.switches[0]
    }
}

/// Embedded registry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub listen_addr: String,
    pub store_path: PathBuf,
    /// Fetch-and-cache from upstreams on cache miss.
    pub pull_through: bool,
    /// Upstream registries tried in order during pull-through.
    pub upstreams: Vec<String>,
    /// Addresses that refer to this embedded registry. Used to rewrite bare
    /// `localhost/` references and to decide when to pull over plain HTTP.
    pub local_addresses: Vec<String>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:5000".to_string(),
            store_path: default_store_path(),
            pull_through: true,
            upstreams: vec!["registry-1.docker.io".to_string()],
            local_addresses: Vec::new(),
        }
    }
}

/// Default registry store location: under the home directory when one
/// exists (root's on a device), else a fixed system path.
fn default_store_path() -> PathBuf {
    match dirs::home_dir() {
        Some(home) => home.join(".roskube").join("registry"),
        None => PathBuf::from("/var/lib/roskube/registry"),
    }
}

/// Image pipeline and volume storage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory on the device under which container root-dirs and volumes
    /// are provisioned.
    pub base_path: String,
    /// Directory for converted image tarballs.
    pub tarball_cache: String,
    /// When the pipeline itself runs inside a runtime-hosted container,
    /// the device sees the pipeline's `/` as this directory. Internal write
    /// paths are translated through it in all runtime file arguments.
    pub self_root_dir: Option<String>,
    /// Architecture written into docker-save configs. Defaults to the
    /// architecture this binary was built for.
    pub arch: Option<String>,
    pub gc_interval_minutes: u64,
    pub gc_keep_recent: usize,
    pub gc_dry_run: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_path: "/containers".to_string(),
            tarball_cache: "/container-cache".to_string(),
            self_root_dir: None,
            arch: None,
            gc_interval_minutes: crate::constants::GC_INTERVAL.as_secs() / 60,
            gc_keep_recent: crate::constants::GC_KEEP_RECENT,
            gc_dry_run: false,
        }
    }
}

impl StorageConfig {
    /// Interval between GC sweeps.
    pub fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.gc_interval_minutes.max(1) * 60)
    }

    /// Architecture for docker-save configs, in GOARCH vocabulary.
    pub fn arch(&self) -> String {
        self.arch.clone().unwrap_or_else(|| build_arch().to_string())
    }
}

/// Supervisor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub watchdog_interval_secs: u64,
    pub max_restarts: u32,
    pub restart_cooldown_secs: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            watchdog_interval_secs: crate::constants::WATCHDOG_INTERVAL.as_secs(),
            max_restarts: crate::constants::MAX_RESTARTS,
            restart_cooldown_secs: crate::constants::RESTART_COOLDOWN.as_secs(),
        }
    }
}

impl SupervisorConfig {
    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_secs(self.watchdog_interval_secs.max(1))
    }

    pub fn restart_cooldown(&self) -> Duration {
        Duration::from_secs(self.restart_cooldown_secs)
    }
}

/// Management API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub listen_addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8082".to_string(),
        }
    }
}

/// An infrastructure container the watchdog keeps alive.
///
/// These run on the device but are not pod-managed (the registry itself,
/// the self-updater). The reconciler never reaps them as orphans.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfraContainerConfig {
    /// RouterOS container name.
    pub name: String,
    /// HTTP health check URL, e.g. `http://192.168.200.3:5001/healthz`.
    pub health_url: String,
}

/// The architecture this binary was built for, in GOARCH vocabulary.
fn build_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "arm" => "arm",
        other => other,
    }
}
