//! Constants for the orchestration engine.
//!
//! All intervals, thresholds, and limits are defined here to ensure
//! consistency and prevent magic numbers throughout the codebase.

use std::time::Duration;

// =============================================================================
// Reconciliation
// =============================================================================

/// How often the standalone reconciler diffs desired vs actual state.
pub const RECONCILE_INTERVAL: Duration = Duration::from_secs(10);

// =============================================================================
// Supervisor
// =============================================================================

/// Default interval between watchdog sweeps.
pub const WATCHDOG_INTERVAL: Duration = Duration::from_secs(15);

/// Default number of restarts before a unit is marked failed.
pub const MAX_RESTARTS: u32 = 5;

/// Default minimum time between restarts of the same unit.
pub const RESTART_COOLDOWN: Duration = Duration::from_secs(10);

/// Pause between stopping and restarting an unhealthy container.
pub const RESTART_STOP_DELAY: Duration = Duration::from_secs(2);

/// How long the boot sequence waits for a probed unit to come up healthy
/// before moving on. Caps the damage a single bad dependency can do.
pub const BOOT_HEALTH_TIMEOUT: Duration = Duration::from_secs(30);

/// Pause between container starts during the boot sequence, so a burst of
/// starts does not saturate the device.
pub const BOOT_STAGGER: Duration = Duration::from_millis(500);

/// Default health probe timeout when the probe spec leaves it unset.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Polling cadence while waiting for a unit to become healthy.
pub const HEALTH_WAIT_POLL: Duration = Duration::from_secs(2);

// =============================================================================
// Infrastructure Watchdog
// =============================================================================

/// Interval between infrastructure container health checks.
pub const INFRA_CHECK_INTERVAL: Duration = Duration::from_secs(15);

/// Consecutive failures before an infrastructure container is restarted.
pub const INFRA_HEALTH_THRESHOLD: u32 = 3;

/// HTTP timeout for infrastructure health check requests.
pub const INFRA_HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Minimum time between restarts of the same infrastructure container.
pub const INFRA_RESTART_COOLDOWN: Duration = Duration::from_secs(60);

/// Settle time between stopping and starting an infrastructure container.
pub const INFRA_STOP_SETTLE: Duration = Duration::from_secs(3);

// =============================================================================
// Image Pipeline
// =============================================================================

/// Timeout for image pull operations.
pub const IMAGE_PULL_TIMEOUT: Duration = Duration::from_secs(300);

/// Default interval between image/volume GC sweeps.
pub const GC_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Default number of most-recently-pulled idle tarballs the GC keeps.
pub const GC_KEEP_RECENT: usize = 5;

/// Maximum size of a single OCI layer (512 MiB).
pub const MAX_LAYER_SIZE: usize = 512 * 1024 * 1024;

/// Maximum total flattened rootfs size (4 GiB).
pub const MAX_ROOTFS_SIZE: u64 = 4 * 1024 * 1024 * 1024;

/// Maximum number of layers in an OCI image.
pub const MAX_LAYERS: usize = 128;

/// Maximum manifest size (1 MiB).
pub const MAX_MANIFEST_SIZE: usize = 1024 * 1024;

/// Maximum config blob size (1 MiB).
pub const MAX_CONFIG_SIZE: usize = 1024 * 1024;

/// Maximum OCI image reference length (bytes).
pub const MAX_IMAGE_REF_LEN: usize = 512;

// =============================================================================
// Naming
// =============================================================================

/// RouterOS container names are limited to this many characters.
pub const CONTAINER_NAME_MAX_LEN: usize = 32;

/// How much of the pod name survives into the veth name.
pub const VETH_POD_PREFIX_LEN: usize = 8;

// =============================================================================
// Registry
// =============================================================================

/// Value of the `Docker-Distribution-API-Version` header.
pub const DISTRIBUTION_API_VERSION: &str = "registry/2.0";

/// Content type assumed for manifests stored without one.
pub const DEFAULT_MANIFEST_MEDIA_TYPE: &str =
    "application/vnd.docker.distribution.manifest.v2+json";

// =============================================================================
// Pod Annotations
// =============================================================================

/// Annotation carrying a container boot priority (integer; lower first).
pub const ANNOTATION_BOOT_PRIORITY: &str = "mikrotik.io/boot-priority";

/// Annotation carrying a comma-separated dependency list.
pub const ANNOTATION_DEPENDS_ON: &str = "mikrotik.io/depends-on";

// =============================================================================
// Node Description
// =============================================================================

/// Taint key that keeps ordinary workloads off the virtual node.
pub const NODE_TAINT_KEY: &str = "virtual-kubelet.io/provider";

/// Taint value identifying this provider.
pub const NODE_TAINT_VALUE: &str = "mikrotik";
