//! The pod provider: translates pod specs into runtime operations.
//!
//! `create_pod` walks a pod's containers in declaration order: ensure the
//! image tarball, allocate a veth on the pod bridge, provision volume
//! mounts, create and start the runtime container, and register a
//! supervision unit when the restart policy asks for it. Updates are
//! delete-then-create because runtime containers are immutable; deletion
//! tolerates `NotFound` at every step so a half-gone pod still converges.
//!
//! The tracker owns a deep copy of every accepted pod plus a per-pod
//! "in-flight" marker. The marker is set before image/network work starts
//! and cleared when the create/update completes (or fails), so the
//! reconciler never collides with an in-progress change.

pub mod api;
mod infra;
mod reconcile;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::config::Config;
use crate::constants::{CONTAINER_NAME_MAX_LEN, VETH_POD_PREFIX_LEN};
use crate::error::{Error, Result};
use crate::image::ImageManager;
use crate::network::NetworkManager;
use crate::pod::{
    ContainerState, ContainerStatusView, NodeDescription, Pod, PodCondition, PodPhase, PodStatus,
    RestartPolicy,
};
use crate::runtime::{ContainerCreateSpec, RuntimePort};
use crate::supervisor::{Supervisor, Unit};

pub(crate) struct TrackedPod {
    pub pod: Pod,
    pub in_flight: bool,
}

/// Infrastructure watchdog bookkeeping.
#[derive(Default)]
pub(crate) struct InfraState {
    pub failures: HashMap<String, u32>,
    pub last_restart: HashMap<String, DateTime<Utc>>,
}

/// Translates pod desired state into RouterOS container state and owns the
/// pod tracker.
pub struct Provider {
    cfg: Config,
    runtime: Arc<dyn RuntimePort>,
    images: Arc<ImageManager>,
    network: Arc<NetworkManager>,
    supervisor: Arc<Supervisor>,
    http: reqwest::Client,
    start_time: DateTime<Utc>,
    pub(crate) tracker: Mutex<HashMap<String, TrackedPod>>,
    pub(crate) infra: Mutex<InfraState>,
}

impl Provider {
    pub fn new(
        cfg: Config,
        runtime: Arc<dyn RuntimePort>,
        images: Arc<ImageManager>,
        network: Arc<NetworkManager>,
        supervisor: Arc<Supervisor>,
    ) -> Self {
        Self {
            cfg,
            runtime,
            images,
            network,
            supervisor,
            http: reqwest::Client::new(),
            start_time: Utc::now(),
            tracker: Mutex::new(HashMap::new()),
            infra: Mutex::new(InfraState::default()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn network(&self) -> &NetworkManager {
        &self.network
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub(crate) fn runtime(&self) -> &Arc<dyn RuntimePort> {
        &self.runtime
    }

    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// The node object this provider publishes to a desired-state feed.
    pub fn node_description(&self) -> NodeDescription {
        NodeDescription::routeros(&self.cfg.node_name)
    }

    // ── lifecycle ──────────────────────────────────────────────────────

    /// Creates every container of a pod, in declaration order, and tracks
    /// the pod on success.
    pub async fn create_pod(&self, pod: &Pod) -> Result<()> {
        let key = pod.key();
        info!(pod = %key, "creating pod");

        // In-flight marker keeps the reconciler away while we work.
        {
            let mut tracker = self.tracker.lock().unwrap();
            tracker.insert(
                key.clone(),
                TrackedPod {
                    pod: pod.clone(),
                    in_flight: true,
                },
            );
        }

        let result = self.create_pod_inner(pod).await;

        let mut tracker = self.tracker.lock().unwrap();
        match &result {
            Ok(()) => {
                tracker.insert(
                    key,
                    TrackedPod {
                        pod: pod.clone(),
                        in_flight: false,
                    },
                );
            }
            Err(e) => {
                warn!(pod = %pod.key(), error = %e, "pod create failed");
                tracker.remove(&key);
            }
        }
        result
    }

    async fn create_pod_inner(&self, pod: &Pod) -> Result<()> {
        let start_on_boot = pod.restart_policy == RestartPolicy::Always;

        for (i, container) in pod.containers.iter().enumerate() {
            let name = runtime_container_name(pod, &container.name);

            // 1. Image → runtime-visible tarball path.
            let tarball_path = self.images.ensure_image(&container.image).await?;

            // 2. Network: veth + address + bridge attachment.
            let veth = veth_name(&pod.name, i);
            let (ip, gateway) = self.network.allocate_interface(&veth, &pod.name).await?;
            info!(pod = %pod.key(), veth = %veth, ip = %ip, gateway = %gateway, "allocated network");

            // 3. Volume mounts.
            let mut mounts = Vec::with_capacity(container.volume_mounts.len());
            for vm in &container.volume_mounts {
                let host_path = self
                    .images
                    .provision_volume(&name, &vm.name, &vm.mount_path)
                    .await?;
                mounts.push(format!("{host_path}:{}", vm.mount_path));
            }

            // 4. Create and start.
            let spec = ContainerCreateSpec {
                name: name.clone(),
                file: tarball_path,
                interface: veth,
                root_dir: format!(
                    "{}/{}",
                    self.cfg.storage.base_path.trim_end_matches('/'),
                    name
                ),
                mounts,
                envs: container.env.clone(),
                cmd: container.command.join(" "),
                hostname: pod.name.clone(),
                dns: self.cfg.network.dns_servers.join(","),
                logging: true,
                start_on_boot,
            };
            self.runtime.create_container(&spec).await?;

            let record = self.runtime.get_container(&name).await?;
            self.runtime.start_container(&record.id).await?;

            // 5. Supervision for boot-persistent containers.
            if start_on_boot {
                self.supervisor
                    .register(
                        Unit::new(name.clone(), record.id.clone())
                            .with_policy(pod.restart_policy)
                            .with_probe(container.probe.clone())
                            .with_priority(pod.boot_priority(i))
                            .with_dependencies(pod.depends_on()),
                    )
                    .await;
            }

            info!(pod = %pod.key(), name = %name, id = %record.id, "container created and started");
        }

        Ok(())
    }

    /// Replaces a pod. Runtime containers are immutable, so this is a
    /// delete followed by a create.
    pub async fn update_pod(&self, pod: &Pod) -> Result<()> {
        info!(pod = %pod.key(), "updating pod (delete-then-create)");
        if let Err(e) = self.delete_pod(pod).await {
            warn!(pod = %pod.key(), error = %e, "error deleting old pod during update");
        }
        self.create_pod(pod).await
    }

    /// Removes a pod's containers, network allocations, and supervision
    /// units. Every step tolerates state that is already gone; volumes are
    /// left for the GC sweeper.
    pub async fn delete_pod(&self, pod: &Pod) -> Result<()> {
        let key = pod.key();
        info!(pod = %key, "deleting pod");

        for (i, container) in pod.containers.iter().enumerate() {
            let name = runtime_container_name(pod, &container.name);

            match self.runtime.get_container(&name).await {
                Ok(record) => {
                    if record.status.is_running() {
                        if let Err(e) = self.runtime.stop_container(&record.id).await {
                            warn!(name = %name, error = %e, "error stopping container");
                        }
                    }
                    if let Err(e) = self.runtime.remove_container(&record.id).await {
                        warn!(name = %name, error = %e, "error removing container");
                    }
                }
                Err(e) if e.is_not_found() => {
                    warn!(name = %name, "container not found during delete");
                }
                Err(e) => {
                    warn!(name = %name, error = %e, "error looking up container during delete");
                }
            }

            self.network.release_interface(&veth_name(&pod.name, i)).await;
            self.supervisor.unregister(&name).await;
            self.images.release_image(&container.image).await;

            info!(name = %name, "container removed");
        }

        self.tracker.lock().unwrap().remove(&key);
        Ok(())
    }

    // ── queries ────────────────────────────────────────────────────────

    /// The tracked pod object, as last accepted.
    pub fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod> {
        let tracker = self.tracker.lock().unwrap();
        tracker
            .get(&format!("{namespace}/{name}"))
            .map(|t| t.pod.clone())
            .ok_or_else(|| Error::PodNotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            })
    }

    /// All tracked pods.
    pub fn get_pods(&self) -> Vec<Pod> {
        let tracker = self.tracker.lock().unwrap();
        tracker.values().map(|t| t.pod.clone()).collect()
    }

    /// Live status for a tracked pod, derived from runtime container state.
    pub async fn pod_status(&self, namespace: &str, name: &str) -> Result<PodStatus> {
        let pod = self.get_pod(namespace, name)?;

        let mut container_statuses = Vec::with_capacity(pod.containers.len());
        let mut all_running = true;

        for container in &pod.containers {
            let runtime_name = runtime_container_name(&pod, &container.name);

            let (ready, state) = match self.runtime.get_container(&runtime_name).await {
                Ok(record) => match record.status {
                    crate::runtime::ContainerStatus::Running => (true, ContainerState::Running),
                    crate::runtime::ContainerStatus::Stopped
                    | crate::runtime::ContainerStatus::Error => (
                        false,
                        ContainerState::Terminated {
                            reason: record.status.to_string(),
                        },
                    ),
                    other => (
                        false,
                        ContainerState::Waiting {
                            reason: other.to_string(),
                        },
                    ),
                },
                Err(_) => (
                    false,
                    ContainerState::Waiting {
                        reason: "ContainerNotFound".to_string(),
                    },
                ),
            };

            if !ready {
                all_running = false;
            }
            container_statuses.push(ContainerStatusView {
                name: container.name.clone(),
                image: container.image.clone(),
                ready,
                state,
            });
        }

        let phase = if all_running {
            PodPhase::Running
        } else {
            PodPhase::Pending
        };

        Ok(PodStatus {
            phase,
            container_statuses,
            conditions: vec![
                PodCondition {
                    condition_type: "Ready".to_string(),
                    status: bool_condition(all_running),
                },
                PodCondition {
                    condition_type: "Scheduled".to_string(),
                    status: "True".to_string(),
                },
            ],
            host_ip: Some(self.cfg.network.pod_switch().gateway.clone()),
            start_time: self.start_time,
        })
    }

    /// Runtime container names a pod is expected to own.
    pub(crate) fn expected_container_names(pod: &Pod) -> Vec<String> {
        pod.containers
            .iter()
            .map(|c| runtime_container_name(pod, &c.name))
            .collect()
    }
}

fn bool_condition(v: bool) -> String {
    if v { "True" } else { "False" }.to_string()
}

// =============================================================================
// Naming
// =============================================================================

/// The runtime container name for a pod's container: the namespaced pod
/// name joined with the container name, made RouterOS-safe.
pub fn runtime_container_name(pod: &Pod, container_name: &str) -> String {
    sanitize_name(&format!("{}-{}", pod.namespace, pod.name), container_name)
}

/// Converts a pod/container name pair into a RouterOS-safe container name:
/// lowercase `[a-z0-9-]`, at most 32 characters.
pub fn sanitize_name(pod_name: &str, container_name: &str) -> String {
    let joined = format!("{pod_name}-{container_name}");
    let mapped: String = joined
        .chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '-' => c,
            'A'..='Z' => c.to_ascii_lowercase(),
            _ => '-',
        })
        .collect();
    truncate(&mapped, CONTAINER_NAME_MAX_LEN)
}

/// Veth name for the `index`-th container of a pod.
pub fn veth_name(pod_name: &str, index: usize) -> String {
    format!("veth-{}-{}", truncate(pod_name, VETH_POD_PREFIX_LEN), index)
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}
