//! Pod model: the desired-state unit and its status vocabulary.
//!
//! Pods arrive either from a desired-state feed or from a local manifest
//! file containing Kubernetes-shaped YAML documents. Parsing is
//! `serde_yaml::Value`-based so unknown fields are tolerated and only the
//! parts the engine acts on are validated.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{ANNOTATION_BOOT_PRIORITY, ANNOTATION_DEPENDS_ON, PROBE_TIMEOUT};
use crate::error::{Error, Result};

// =============================================================================
// Desired State
// =============================================================================

/// Restart policy for a pod's containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RestartPolicy {
    #[default]
    Always,
    OnFailure,
    Never,
}

impl RestartPolicy {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "OnFailure" => Self::OnFailure,
            "Never" => Self::Never,
            _ => Self::Always,
        }
    }
}

/// How to probe a container's health.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProbeKind {
    Http { path: String, port: u16 },
    Tcp { port: u16 },
    /// No reachable endpoint; healthy iff the runtime reports `running`.
    StatusOnly,
}

/// A health probe with its schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeSpec {
    pub kind: ProbeKind,
    /// Seconds between probes. Zero means "use the watchdog interval".
    pub interval_secs: u64,
    pub timeout_secs: u64,
    /// Consecutive failures before the unit is declared unhealthy.
    pub failure_threshold: u32,
}

impl ProbeSpec {
    pub fn timeout(&self) -> Duration {
        if self.timeout_secs == 0 {
            PROBE_TIMEOUT
        } else {
            Duration::from_secs(self.timeout_secs)
        }
    }
}

/// One mount of a named volume into a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    pub name: String,
    pub mount_path: String,
}

/// One container in a pod.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub volume_mounts: Vec<VolumeMount>,
    #[serde(default)]
    pub probe: Option<ProbeSpec>,
}

/// The desired-state unit, identified by `(namespace, name)`.
///
/// Owns all of its substructure; cloning yields a deep independent copy
/// with nothing shared with the feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pod {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    pub containers: Vec<ContainerSpec>,
    #[serde(default)]
    pub restart_policy: RestartPolicy,
}

impl Pod {
    /// Tracker key, `namespace/name`.
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// Boot priority for the container at `index`: the boot-priority
    /// annotation if present and parseable, else `index * 10`.
    pub fn boot_priority(&self, index: usize) -> i32 {
        self.annotations
            .get(ANNOTATION_BOOT_PRIORITY)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or((index as i32) * 10)
    }

    /// Dependency names from the depends-on annotation, comma-separated.
    pub fn depends_on(&self) -> Vec<String> {
        self.annotations
            .get(ANNOTATION_DEPENDS_ON)
            .map(|raw| {
                raw.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }

    // ── parsing ────────────────────────────────────────────────────────

    /// Parses a single Kubernetes-shaped Pod manifest.
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let doc: serde_yaml::Value =
            serde_yaml::from_str(raw).map_err(|e| Error::InvalidManifest(e.to_string()))?;
        Self::from_value(&doc)
    }

    /// Parses a pod out of a YAML document value.
    pub fn from_value(doc: &serde_yaml::Value) -> Result<Self> {
        let metadata = doc.get("metadata");

        let name = metadata
            .and_then(|m| m.get("name"))
            .and_then(|n| n.as_str())
            .ok_or_else(|| Error::InvalidManifest("missing metadata.name".to_string()))?
            .to_string();

        let namespace = metadata
            .and_then(|m| m.get("namespace"))
            .and_then(|n| n.as_str())
            .unwrap_or("default")
            .to_string();

        let labels = string_map(metadata.and_then(|m| m.get("labels")));
        let annotations = string_map(metadata.and_then(|m| m.get("annotations")));

        let spec = doc.get("spec");

        let containers_seq = spec
            .and_then(|s| s.get("containers"))
            .and_then(|c| c.as_sequence())
            .ok_or_else(|| Error::InvalidManifest("missing spec.containers".to_string()))?;
        if containers_seq.is_empty() {
            return Err(Error::InvalidManifest(
                "at least one container required".to_string(),
            ));
        }

        let containers = containers_seq
            .iter()
            .map(parse_container)
            .collect::<Result<Vec<_>>>()?;

        let restart_policy = spec
            .and_then(|s| s.get("restartPolicy"))
            .and_then(|r| r.as_str())
            .map(RestartPolicy::parse)
            .unwrap_or_default();

        Ok(Self {
            namespace,
            name,
            labels,
            annotations,
            containers,
            restart_policy,
        })
    }

    /// Loads every Pod from a multi-document YAML manifest file.
    /// Documents whose `kind` is present and not `Pod` are skipped.
    pub fn load_manifest(path: &Path) -> Result<Vec<Pod>> {
        let raw = std::fs::read_to_string(path)?;
        let mut pods = Vec::new();

        for document in raw.split("\n---") {
            let document = document.trim();
            if document.is_empty() {
                continue;
            }
            let value: serde_yaml::Value = serde_yaml::from_str(document)
                .map_err(|e| Error::InvalidManifest(e.to_string()))?;
            if value.is_null() {
                continue;
            }
            if let Some(kind) = value.get("kind").and_then(|k| k.as_str()) {
                if kind != "Pod" {
                    continue;
                }
            }
            pods.push(Pod::from_value(&value)?);
        }

        Ok(pods)
    }
}

fn string_map(value: Option<&serde_yaml::Value>) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    if let Some(mapping) = value.and_then(|v| v.as_mapping()) {
        for (k, v) in mapping {
            if let (Some(k), Some(v)) = (k.as_str(), v.as_str()) {
                out.insert(k.to_string(), v.to_string());
            }
        }
    }
    out
}

fn parse_container(value: &serde_yaml::Value) -> Result<ContainerSpec> {
    let name = value
        .get("name")
        .and_then(|n| n.as_str())
        .ok_or_else(|| Error::InvalidManifest("container missing name".to_string()))?
        .to_string();
    let image = value
        .get("image")
        .and_then(|i| i.as_str())
        .ok_or_else(|| Error::InvalidManifest(format!("container {name} missing image")))?
        .to_string();

    let command = value
        .get("command")
        .and_then(|c| c.as_sequence())
        .map(|seq| {
            seq.iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default();

    let mut env = BTreeMap::new();
    if let Some(seq) = value.get("env").and_then(|e| e.as_sequence()) {
        for item in seq {
            if let Some(key) = item.get("name").and_then(|n| n.as_str()) {
                let val = item
                    .get("value")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                env.insert(key.to_string(), val.to_string());
            }
        }
    }

    let mut volume_mounts = Vec::new();
    if let Some(seq) = value.get("volumeMounts").and_then(|m| m.as_sequence()) {
        for item in seq {
            let (Some(name), Some(mount_path)) = (
                item.get("name").and_then(|n| n.as_str()),
                item.get("mountPath").and_then(|p| p.as_str()),
            ) else {
                continue;
            };
            volume_mounts.push(VolumeMount {
                name: name.to_string(),
                mount_path: mount_path.to_string(),
            });
        }
    }

    let probe = value.get("livenessProbe").map(parse_probe);

    Ok(ContainerSpec {
        name,
        image,
        command,
        env,
        volume_mounts,
        probe,
    })
}

fn parse_probe(value: &serde_yaml::Value) -> ProbeSpec {
    let kind = if let Some(http) = value.get("httpGet") {
        ProbeKind::Http {
            path: http
                .get("path")
                .and_then(|p| p.as_str())
                .unwrap_or("/")
                .to_string(),
            port: http.get("port").and_then(|p| p.as_u64()).unwrap_or(80) as u16,
        }
    } else if let Some(tcp) = value.get("tcpSocket") {
        ProbeKind::Tcp {
            port: tcp.get("port").and_then(|p| p.as_u64()).unwrap_or(0) as u16,
        }
    } else {
        ProbeKind::StatusOnly
    };

    ProbeSpec {
        kind,
        interval_secs: value
            .get("periodSeconds")
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
        timeout_secs: value
            .get("timeoutSeconds")
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
        failure_threshold: value
            .get("failureThreshold")
            .and_then(|v| v.as_u64())
            .unwrap_or(3) as u32,
    }
}

// =============================================================================
// Observed State
// =============================================================================

/// High-level pod phase: `Running` iff every container runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodPhase {
    Pending,
    Running,
}

/// Observed state of one container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum ContainerState {
    Waiting { reason: String },
    Running,
    Terminated { reason: String },
}

/// Status of one container inside a pod status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerStatusView {
    pub name: String,
    pub image: String,
    pub ready: bool,
    #[serde(flatten)]
    pub state: ContainerState,
}

/// A pod-level condition, Kubernetes style.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodCondition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: String,
}

/// Observed status of a pod.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodStatus {
    pub phase: PodPhase,
    pub container_statuses: Vec<ContainerStatusView>,
    pub conditions: Vec<PodCondition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_ip: Option<String>,
    pub start_time: chrono::DateTime<chrono::Utc>,
}

// =============================================================================
// Node Description
// =============================================================================

/// A scheduling taint on the virtual node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Taint {
    pub key: String,
    pub value: String,
    pub effect: String,
}

/// What this node reports to a desired-state feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDescription {
    pub name: String,
    pub architecture: String,
    pub operating_system: String,
    pub capacity: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub taints: Vec<Taint>,
}

impl NodeDescription {
    /// The description of a RouterOS-backed virtual node.
    pub fn routeros(name: &str) -> Self {
        let mut capacity = BTreeMap::new();
        capacity.insert("cpu".to_string(), "4".to_string());
        capacity.insert("memory".to_string(), "1Gi".to_string());
        capacity.insert("pods".to_string(), "20".to_string());

        let mut labels = BTreeMap::new();
        labels.insert("type".to_string(), "virtual-kubelet".to_string());
        labels.insert("kubernetes.io/os".to_string(), "linux".to_string());
        labels.insert("kubernetes.io/arch".to_string(), "arm64".to_string());
        labels.insert("node.kubernetes.io/role".to_string(), "mikrotik".to_string());

        Self {
            name: name.to_string(),
            architecture: "arm64".to_string(),
            operating_system: "linux".to_string(),
            capacity,
            labels,
            taints: vec![Taint {
                key: crate::constants::NODE_TAINT_KEY.to_string(),
                value: crate::constants::NODE_TAINT_VALUE.to_string(),
                effect: "NoSchedule".to_string(),
            }],
        }
    }
}
