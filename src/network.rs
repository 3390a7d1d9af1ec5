//! Pod network management: veth interfaces, bridge ports, and IPAM.
//!
//! The manager owns the [`Allocator`] and drives the runtime port: allocate
//! an address, create the veth, attach it to the switch's bridge, and roll
//! everything back if a step fails. At startup [`NetworkManager::sync`]
//! reads the veths already present on the device and seeds the allocator so
//! a restart never double-allocates.
//!
//! When `state_path` is configured, a YAML snapshot of logical switches and
//! ports is written after every change; the snapshot is advisory (hostnames
//! for the API), the device remains the source of truth for addresses.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::NetworkConfig;
use crate::error::{Error, Result};
use crate::ipam::Allocator;
use crate::runtime::RuntimePort;

// =============================================================================
// Logical Model
// =============================================================================

/// A network segment: one bridge, one subnet, one gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogicalSwitch {
    pub name: String,
    pub bridge: String,
    pub cidr: String,
    pub gateway: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns_zone: Option<String>,
}

/// A port on a logical switch (maps to a veth on the device).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogicalPort {
    pub name: String,
    /// Parent switch name.
    pub switch: String,
    /// Assigned address in CIDR form.
    pub address: String,
    pub gateway: String,
    #[serde(default)]
    pub hostname: String,
}

/// Persisted snapshot of switches and ports.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkState {
    #[serde(default)]
    pub switches: BTreeMap<String, LogicalSwitch>,
    #[serde(default)]
    pub ports: BTreeMap<String, LogicalPort>,
}

/// Per-switch summary served by the management API.
#[derive(Debug, Clone, Serialize)]
pub struct SwitchSummary {
    pub name: String,
    pub bridge: String,
    pub cidr: String,
    pub gateway: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns_zone: Option<String>,
    pub ports: usize,
}

/// Per-port summary served by the management API.
#[derive(Debug, Clone, Serialize)]
pub struct PortSummary {
    pub name: String,
    pub ip: String,
    pub hostname: String,
}

// =============================================================================
// Manager
// =============================================================================

/// Orchestrates veth/bridge state on the device on top of IPAM.
pub struct NetworkManager {
    cfg: NetworkConfig,
    runtime: Arc<dyn RuntimePort>,
    ipam: Allocator,
    ports: Mutex<BTreeMap<String, LogicalPort>>,
    state_path: Option<PathBuf>,
}

impl NetworkManager {
    /// Builds the manager and registers one IPAM pool per configured switch.
    pub fn new(cfg: NetworkConfig, runtime: Arc<dyn RuntimePort>) -> Result<Self> {
        let ipam = Allocator::new();
        for sw in &cfg.switches {
            let gateway: Ipv4Addr = sw.gateway.parse().map_err(|_| Error::InvalidCidr {
                cidr: sw.gateway.clone(),
                reason: "invalid gateway address".to_string(),
            })?;
            ipam.add_pool(&sw.name, &sw.cidr, gateway)?;
        }

        let state_path = cfg.state_path.clone();
        let mgr = Self {
            cfg,
            runtime,
            ipam,
            ports: Mutex::new(BTreeMap::new()),
            state_path,
        };
        mgr.load_state();
        Ok(mgr)
    }

    /// The pool pods allocate from (the first configured switch).
    pub fn pod_pool(&self) -> &str {
        &self.cfg.switches[0].name
    }

    pub fn allocator(&self) -> &Allocator {
        &self.ipam
    }

    /// Seeds the allocator from veths already present on the device, so
    /// restarts reproduce the allocations of already-running containers.
    pub async fn sync(&self) -> Result<()> {
        let veths = self.runtime.list_veths().await?;
        let mut count = 0usize;

        for veth in veths {
            if veth.address.is_empty() {
                continue;
            }
            let ip_part = veth.address.split('/').next().unwrap_or("");
            let Ok(ip) = ip_part.parse::<Ipv4Addr>() else {
                continue;
            };
            if let Some(pool) = self.ipam.pool_for_ip(ip) {
                self.ipam.record(&pool, &veth.name, ip);
                debug!(veth = %veth.name, ip = %ip, pool = %pool, "synced existing allocation");
                count += 1;
            }
        }

        info!(count, "synced existing allocations");
        Ok(())
    }

    /// Creates a veth on the pod network, assigns it an address, and
    /// attaches it to the bridge. Returns `(address-in-CIDR, gateway)`.
    pub async fn allocate_interface(
        &self,
        veth_name: &str,
        hostname: &str,
    ) -> Result<(String, String)> {
        let pool = self.pod_pool().to_string();
        let sw = &self.cfg.switches[0];

        let ip = self.ipam.allocate(&pool, veth_name)?;
        let (cidr, _) = self
            .ipam
            .pool_subnet(&pool)
            .ok_or_else(|| Error::PoolNotFound { pool: pool.clone() })?;
        let address = format!("{}/{}", ip, cidr.prefix());
        let gateway = sw.gateway.clone();

        match self.runtime.create_veth(veth_name, &address, &gateway).await {
            Ok(()) => {}
            Err(e) if e.is_already_exists() => {
                debug!(veth = veth_name, "veth already exists");
            }
            Err(e) => {
                self.ipam.release(&pool, veth_name);
                return Err(e);
            }
        }

        match self.runtime.add_bridge_port(&sw.bridge, veth_name).await {
            Ok(()) => {}
            Err(e) if e.is_already_exists() => {
                debug!(veth = veth_name, bridge = %sw.bridge, "bridge port already attached");
            }
            Err(e) => {
                // Roll back the partial veth before surfacing the failure.
                if let Err(re) = self.runtime.remove_veth(veth_name).await {
                    warn!(veth = veth_name, error = %re, "rollback veth removal failed");
                }
                self.ipam.release(&pool, veth_name);
                return Err(e);
            }
        }

        {
            let mut ports = self.ports.lock().unwrap();
            ports.insert(
                veth_name.to_string(),
                LogicalPort {
                    name: veth_name.to_string(),
                    switch: pool.clone(),
                    address: address.clone(),
                    gateway: gateway.clone(),
                    hostname: hostname.to_string(),
                },
            );
        }
        self.save_state();

        info!(veth = veth_name, ip = %address, bridge = %sw.bridge, "interface allocated");
        Ok((address, gateway))
    }

    /// Removes the veth and returns its address to the pool. Tolerates a
    /// veth that is already gone.
    pub async fn release_interface(&self, veth_name: &str) {
        match self.runtime.remove_veth(veth_name).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(veth = veth_name, error = %e, "error removing veth"),
        }

        // RouterOS drops the bridge port assignment with the veth; only the
        // allocator and the snapshot need updating.
        for sw in &self.cfg.switches {
            self.ipam.release(&sw.name, veth_name);
        }
        self.ports.lock().unwrap().remove(veth_name);
        self.save_state();

        info!(veth = veth_name, "interface released");
    }

    /// All allocations across pools as key → IP.
    pub fn allocations(&self) -> BTreeMap<String, String> {
        self.ipam.all_allocations()
    }

    /// Summaries of all configured switches.
    pub fn switches(&self) -> Vec<SwitchSummary> {
        self.cfg
            .switches
            .iter()
            .map(|sw| SwitchSummary {
                name: sw.name.clone(),
                bridge: sw.bridge.clone(),
                cidr: sw.cidr.clone(),
                gateway: sw.gateway.clone(),
                dns_zone: sw.dns_zone.clone(),
                ports: self
                    .ipam
                    .pool_allocations(&sw.name)
                    .map(|a| a.len())
                    .unwrap_or(0),
            })
            .collect()
    }

    /// Detail for one switch, or `None` if unknown.
    pub fn switch_detail(&self, name: &str) -> Option<SwitchSummary> {
        self.switches().into_iter().find(|s| s.name == name)
    }

    /// Ports on one switch, or `None` if unknown.
    pub fn switch_ports(&self, name: &str) -> Option<Vec<PortSummary>> {
        let allocs = self.ipam.pool_allocations(name)?;
        let ports = self.ports.lock().unwrap();
        Some(
            allocs
                .into_iter()
                .map(|(key, ip)| PortSummary {
                    hostname: ports.get(&key).map(|p| p.hostname.clone()).unwrap_or_default(),
                    name: key,
                    ip: ip.to_string(),
                })
                .collect(),
        )
    }

    // ── state snapshot ─────────────────────────────────────────────────

    fn load_state(&self) {
        let Some(path) = &self.state_path else {
            return;
        };
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(_) => return,
        };
        match serde_yaml::from_str::<NetworkState>(&raw) {
            Ok(state) => {
                let mut ports = self.ports.lock().unwrap();
                *ports = state.ports;
                info!(path = %path.display(), ports = ports.len(), "loaded network state");
            }
            Err(e) => warn!(path = %path.display(), error = %e, "failed to parse network state"),
        }
    }

    fn save_state(&self) {
        let Some(path) = &self.state_path else {
            return;
        };
        let state = NetworkState {
            switches: self
                .cfg
                .switches
                .iter()
                .map(|sw| {
                    (
                        sw.name.clone(),
                        LogicalSwitch {
                            name: sw.name.clone(),
                            bridge: sw.bridge.clone(),
                            cidr: sw.cidr.clone(),
                            gateway: sw.gateway.clone(),
                            dns_zone: sw.dns_zone.clone(),
                        },
                    )
                })
                .collect(),
            ports: self.ports.lock().unwrap().clone(),
        };
        match serde_yaml::to_string(&state) {
            Ok(raw) => {
                if let Err(e) = std::fs::write(path, raw) {
                    warn!(path = %path.display(), error = %e, "failed to write network state");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize network state"),
        }
    }
}
