//! In-memory runtime port for tests and dry runs.
//!
//! Mirrors the visible behavior of the REST transport: the same error kinds
//! for missing and duplicate objects, RouterOS-style `*N` container IDs,
//! and an operation log tests can assert against.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{Error, Result};

use super::{ContainerCreateSpec, ContainerRecord, ContainerStatus, RuntimePort, VethRecord};

#[derive(Default)]
struct Inner {
    containers: Vec<ContainerRecord>,
    specs: BTreeMap<String, ContainerCreateSpec>,
    veths: Vec<VethRecord>,
    bridge_ports: Vec<(String, String)>,
    files: BTreeMap<String, Vec<u8>>,
    next_id: u64,
    ops: Vec<String>,
}

/// An in-memory [`RuntimePort`].
#[derive(Default)]
pub struct MemoryRuntime {
    inner: Mutex<Inner>,
}

impl MemoryRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forces a container into a status, simulating external state changes.
    pub fn set_container_status(&self, name: &str, status: ContainerStatus) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(c) = inner.containers.iter_mut().find(|c| c.name == name) {
            c.status = status;
        }
    }

    /// Pre-seeds a veth, simulating state left over from a previous run.
    pub fn seed_veth(&self, name: &str, address: &str, gateway: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.veths.push(VethRecord {
            name: name.to_string(),
            address: address.to_string(),
            gateway: gateway.to_string(),
        });
    }

    /// The create spec captured for a container, if it exists.
    pub fn container_spec(&self, name: &str) -> Option<ContainerCreateSpec> {
        self.inner.lock().unwrap().specs.get(name).cloned()
    }

    /// Names of currently present veths.
    pub fn veth_names(&self) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .veths
            .iter()
            .map(|v| v.name.clone())
            .collect()
    }

    /// `(bridge, port)` attachments currently present.
    pub fn bridge_ports(&self) -> Vec<(String, String)> {
        self.inner.lock().unwrap().bridge_ports.clone()
    }

    /// Paths of files currently present.
    pub fn file_paths(&self) -> Vec<String> {
        self.inner.lock().unwrap().files.keys().cloned().collect()
    }

    /// Raw bytes of an uploaded file.
    pub fn file_contents(&self, path: &str) -> Option<Vec<u8>> {
        self.inner.lock().unwrap().files.get(path).cloned()
    }

    /// Chronological log of mutating operations, e.g. `start:*1`.
    pub fn operations(&self) -> Vec<String> {
        self.inner.lock().unwrap().ops.clone()
    }

    pub fn clear_operations(&self) {
        self.inner.lock().unwrap().ops.clear();
    }
}

#[async_trait]
impl RuntimePort for MemoryRuntime {
    async fn list_containers(&self) -> Result<Vec<ContainerRecord>> {
        Ok(self.inner.lock().unwrap().containers.clone())
    }

    async fn get_container(&self, name: &str) -> Result<ContainerRecord> {
        self.inner
            .lock()
            .unwrap()
            .containers
            .iter()
            .find(|c| c.name == name)
            .cloned()
            .ok_or_else(|| Error::NotFound {
                what: format!("container {name}"),
            })
    }

    async fn create_container(&self, spec: &ContainerCreateSpec) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.containers.iter().any(|c| c.name == spec.name) {
            return Err(Error::AlreadyExists {
                what: format!("container {}", spec.name),
            });
        }
        let id = format!("*{}", inner.next_id);
        inner.next_id += 1;
        inner.containers.push(ContainerRecord {
            id: id.clone(),
            name: spec.name.clone(),
            status: ContainerStatus::Stopped,
            interface: spec.interface.clone(),
        });
        inner.specs.insert(spec.name.clone(), spec.clone());
        inner.ops.push(format!("create:{}", spec.name));
        Ok(())
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        match inner.containers.iter_mut().find(|c| c.id == id) {
            Some(c) => {
                c.status = ContainerStatus::Running;
            }
            None => {
                return Err(Error::NotFound {
                    what: format!("container {id}"),
                })
            }
        }
        inner.ops.push(format!("start:{id}"));
        Ok(())
    }

    async fn stop_container(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        match inner.containers.iter_mut().find(|c| c.id == id) {
            Some(c) => {
                c.status = ContainerStatus::Stopped;
            }
            None => {
                return Err(Error::NotFound {
                    what: format!("container {id}"),
                })
            }
        }
        inner.ops.push(format!("stop:{id}"));
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let idx = inner
            .containers
            .iter()
            .position(|c| c.id == id)
            .ok_or_else(|| Error::NotFound {
                what: format!("container {id}"),
            })?;
        let removed = inner.containers.remove(idx);
        inner.specs.remove(&removed.name);
        inner.ops.push(format!("remove:{id}"));
        Ok(())
    }

    async fn create_veth(&self, name: &str, address: &str, gateway: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.veths.iter().any(|v| v.name == name) {
            return Err(Error::AlreadyExists {
                what: format!("veth {name}"),
            });
        }
        inner.veths.push(VethRecord {
            name: name.to_string(),
            address: address.to_string(),
            gateway: gateway.to_string(),
        });
        inner.ops.push(format!("veth-create:{name}"));
        Ok(())
    }

    async fn remove_veth(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let idx = inner
            .veths
            .iter()
            .position(|v| v.name == name)
            .ok_or_else(|| Error::NotFound {
                what: format!("veth {name}"),
            })?;
        inner.veths.remove(idx);
        inner.bridge_ports.retain(|(_, port)| port != name);
        inner.ops.push(format!("veth-remove:{name}"));
        Ok(())
    }

    async fn list_veths(&self) -> Result<Vec<VethRecord>> {
        Ok(self.inner.lock().unwrap().veths.clone())
    }

    async fn add_bridge_port(&self, bridge: &str, port: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let key = (bridge.to_string(), port.to_string());
        if inner.bridge_ports.contains(&key) {
            return Err(Error::AlreadyExists {
                what: format!("bridge port {port}"),
            });
        }
        inner.bridge_ports.push(key);
        inner.ops.push(format!("bridge-add:{bridge}:{port}"));
        Ok(())
    }

    async fn remove_bridge_port(&self, bridge: &str, port: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let key = (bridge.to_string(), port.to_string());
        let idx = inner
            .bridge_ports
            .iter()
            .position(|k| *k == key)
            .ok_or_else(|| Error::NotFound {
                what: format!("bridge port {port}"),
            })?;
        inner.bridge_ports.remove(idx);
        inner.ops.push(format!("bridge-remove:{bridge}:{port}"));
        Ok(())
    }

    async fn upload_file(&self, path: &str, data: Vec<u8>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.files.insert(path.to_string(), data);
        inner.ops.push(format!("upload:{path}"));
        Ok(())
    }

    async fn remove_file(&self, path: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.files.remove(path).is_none() {
            return Err(Error::NotFound {
                what: format!("file {path}"),
            });
        }
        inner.ops.push(format!("file-remove:{path}"));
        Ok(())
    }
}
