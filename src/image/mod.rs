//! The image pipeline: OCI reference → runtime-visible tarball path.
//!
//! `ensure_image` drives the whole conversion: consult the cache, pull the
//! image pinned to `(linux, configured arch)`, flatten the layers into one
//! uncompressed rootfs tar, wrap it docker-save style, then either write it
//! locally (when the runtime already sees this process's filesystem under
//! `self_root_dir`) or upload it through the runtime port. Entries carry an
//! in-use count; the GC sweeper reaps idle tarballs beyond the most recent
//! N and removes volumes whose container no longer exists.
//!
//! The cache is keyed by the *requested* reference, before any localhost
//! rewriting, so repeated pod creates hit without re-resolving.

pub mod archive;
pub mod flatten;
pub mod pull;

pub use archive::write_docker_save;
pub use flatten::flatten_layers;
pub use pull::{
    ContainerConfig, ImageConfigFile, ImagePuller, PulledImage, PulledLayer, RegistryPuller,
};

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::{RegistryConfig, StorageConfig};
use crate::error::Result;
use crate::runtime::RuntimePort;

// =============================================================================
// Cache Records
// =============================================================================

/// A cached image tarball on the device filesystem.
#[derive(Debug, Clone)]
pub struct CachedImage {
    pub reference: String,
    /// Path as the runtime sees it.
    pub tarball_path: String,
    pub pulled_at: DateTime<Utc>,
    pub size: u64,
    /// Containers currently created from this tarball.
    pub in_use: u32,
}

/// A volume directory provisioned for a container mount.
#[derive(Debug, Clone)]
pub struct ProvisionedVolume {
    pub volume_name: String,
    pub container_name: String,
    pub host_path: String,
    pub mount_path: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Default)]
struct CacheState {
    images: HashMap<String, CachedImage>,
    volumes: HashMap<String, ProvisionedVolume>,
}

// =============================================================================
// Manager
// =============================================================================

/// Owns the image cache, the volume records, and the GC policy.
pub struct ImageManager {
    cfg: StorageConfig,
    registry_cfg: RegistryConfig,
    runtime: Arc<dyn RuntimePort>,
    puller: Arc<dyn ImagePuller>,
    // One lock over both maps. Held across a pull, which serializes image
    // conversions; RouterOS devices do not benefit from parallel pulls.
    state: Mutex<CacheState>,
}

impl ImageManager {
    pub fn new(
        cfg: StorageConfig,
        registry_cfg: RegistryConfig,
        runtime: Arc<dyn RuntimePort>,
    ) -> Self {
        let puller = Arc::new(RegistryPuller::new(cfg.arch()));
        Self::with_puller(cfg, registry_cfg, runtime, puller)
    }

    /// Construction seam for tests: swap the network-facing puller.
    pub fn with_puller(
        cfg: StorageConfig,
        registry_cfg: RegistryConfig,
        runtime: Arc<dyn RuntimePort>,
        puller: Arc<dyn ImagePuller>,
    ) -> Self {
        Self {
            cfg,
            registry_cfg,
            runtime,
            puller,
            state: Mutex::new(CacheState::default()),
        }
    }

    // ── ensure / release ───────────────────────────────────────────────

    /// Makes sure `image_ref` is available as a tarball the runtime can
    /// load, and returns its runtime-visible path.
    pub async fn ensure_image(&self, image_ref: &str) -> Result<String> {
        let mut state = self.state.lock().await;

        if let Some(cached) = state.images.get_mut(image_ref) {
            cached.in_use += 1;
            debug!(reference = image_ref, path = %cached.tarball_path, "image cache hit");
            return Ok(cached.tarball_path.clone());
        }

        // Bare localhost/<repo> would otherwise be resolved as a Docker Hub
        // path by the reference parser.
        let pull_ref = self.rewrite_localhost(image_ref);
        let insecure = self.is_local_registry(&pull_ref);

        info!(reference = %pull_ref, insecure, "pulling image");
        let pulled = self.puller.pull(&pull_ref, insecure).await?;

        info!(reference = %pull_ref, layers = pulled.layers.len(), "flattening layers to rootfs");
        let rootfs = flatten_layers(&pulled.layers)?;
        let archive = write_docker_save(&rootfs, &pull_ref, &pulled.config, &self.cfg.arch())?;

        let tarball_path = format!(
            "{}/{}.tar",
            self.cfg.tarball_cache.trim_end_matches('/'),
            sanitize_image_ref(image_ref)
        );
        let size = archive.len() as u64;

        let visible_path = if self.cfg.self_root_dir.is_some() {
            // The runtime sees our filesystem; write locally and hand the
            // runtime the translated path.
            info!(path = %tarball_path, size, "writing tarball to local disk");
            if let Some(parent) = std::path::Path::new(&tarball_path).parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&tarball_path, &archive)?;
            self.runtime_visible_path(&tarball_path)
        } else {
            info!(path = %tarball_path, size, "uploading tarball to device");
            match self.runtime.upload_file(&tarball_path, archive).await {
                Ok(()) => {}
                Err(e) if e.is_already_exists() => {
                    debug!(path = %tarball_path, "tarball already on device");
                }
                Err(e) => return Err(e),
            }
            tarball_path.clone()
        };

        state.images.insert(
            image_ref.to_string(),
            CachedImage {
                reference: image_ref.to_string(),
                tarball_path: visible_path.clone(),
                pulled_at: Utc::now(),
                size,
                in_use: 1,
            },
        );

        Ok(visible_path)
    }

    /// Decrements the use count of an image. Floors at zero.
    pub async fn release_image(&self, image_ref: &str) {
        let mut state = self.state.lock().await;
        if let Some(cached) = state.images.get_mut(image_ref) {
            cached.in_use = cached.in_use.saturating_sub(1);
        }
    }

    /// Snapshot of the image cache.
    pub async fn cached_images(&self) -> Vec<CachedImage> {
        self.state.lock().await.images.values().cloned().collect()
    }

    // ── volumes ────────────────────────────────────────────────────────

    /// Records a volume directory for a container mount and returns its
    /// host path. The directory itself materializes when the container
    /// starts with `root-dir` set; tracking exists for orphan GC.
    pub async fn provision_volume(
        &self,
        container_name: &str,
        volume_name: &str,
        mount_path: &str,
    ) -> Result<String> {
        let host_path = format!(
            "{}/{}/{}",
            self.cfg.base_path.trim_end_matches('/'),
            container_name,
            volume_name
        );
        let key = format!("{container_name}/{volume_name}");

        let mut state = self.state.lock().await;
        state.volumes.insert(
            key,
            ProvisionedVolume {
                volume_name: volume_name.to_string(),
                container_name: container_name.to_string(),
                host_path: host_path.clone(),
                mount_path: mount_path.to_string(),
                created_at: Utc::now(),
            },
        );

        info!(container = container_name, volume = volume_name, path = %host_path, "volume provisioned");
        Ok(host_path)
    }

    /// Snapshot of tracked volumes.
    pub async fn volumes(&self) -> Vec<ProvisionedVolume> {
        self.state.lock().await.volumes.values().cloned().collect()
    }

    // ── garbage collection ─────────────────────────────────────────────

    /// Periodic GC driver.
    pub async fn run_gc(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.cfg.gc_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await; // consume the immediate tick

        info!(interval = ?self.cfg.gc_interval(), "image GC started");
        loop {
            tokio::select! {
                _ = ticker.tick() => self.run_gc_once().await,
                _ = shutdown.changed() => {
                    info!("image GC shutting down");
                    return;
                }
            }
        }
    }

    /// One GC sweep: reap idle tarballs beyond the most recent N, then
    /// volumes whose container no longer exists.
    pub async fn run_gc_once(&self) {
        let mut state = self.state.lock().await;
        debug!("running image garbage collection");

        let mut candidates: Vec<(String, DateTime<Utc>, String)> = state
            .images
            .values()
            .filter(|img| img.in_use == 0)
            .map(|img| (img.reference.clone(), img.pulled_at, img.tarball_path.clone()))
            .collect();
        candidates.sort_by(|a, b| a.1.cmp(&b.1).then(a.0.cmp(&b.0)));

        let keep = self.cfg.gc_keep_recent;
        let mut removed = 0usize;
        if candidates.len() > keep {
            for (reference, _, path) in candidates[..candidates.len() - keep].iter() {
                if self.cfg.gc_dry_run {
                    info!(reference, path, "GC dry-run: would remove image");
                    continue;
                }
                match self.runtime.remove_file(path).await {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => {}
                    Err(e) => {
                        warn!(reference, error = %e, "GC: failed to remove image");
                        continue;
                    }
                }
                state.images.remove(reference);
                removed += 1;
            }
        }

        let containers = match self.runtime.list_containers().await {
            Ok(containers) => containers,
            Err(e) => {
                warn!(error = %e, "GC: failed to list containers");
                return;
            }
        };
        let active: std::collections::HashSet<&str> =
            containers.iter().map(|c| c.name.as_str()).collect();

        let orphan_keys: Vec<String> = state
            .volumes
            .iter()
            .filter(|(_, vol)| !active.contains(vol.container_name.as_str()))
            .map(|(key, _)| key.clone())
            .collect();

        let mut removed_volumes = 0usize;
        for key in orphan_keys {
            let path = state.volumes[&key].host_path.clone();
            if self.cfg.gc_dry_run {
                info!(path, "GC dry-run: would remove volume");
                continue;
            }
            match self.runtime.remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    warn!(path, error = %e, "GC: failed to remove volume");
                    continue;
                }
            }
            state.volumes.remove(&key);
            removed_volumes += 1;
        }

        if removed > 0 || removed_volumes > 0 {
            info!(images = removed, volumes = removed_volumes, "GC completed");
        }
    }

    // ── helpers ────────────────────────────────────────────────────────

    /// Rewrites bare `localhost/<repo>` to the first configured local
    /// registry address.
    fn rewrite_localhost(&self, image_ref: &str) -> String {
        if let Some(rest) = image_ref.strip_prefix("localhost/") {
            if let Some(addr) = self.registry_cfg.local_addresses.first() {
                let rewritten = format!("{addr}/{rest}");
                info!(original = image_ref, rewritten = %rewritten, "rewrote bare localhost ref");
                return rewritten;
            }
        }
        image_ref.to_string()
    }

    /// Whether a reference points at the embedded registry.
    fn is_local_registry(&self, image_ref: &str) -> bool {
        let registry = match image_ref.parse::<oci_distribution::Reference>() {
            Ok(reference) => reference.registry().to_string(),
            Err(_) => {
                return image_ref.starts_with("localhost:") || image_ref.starts_with("localhost/")
            }
        };
        registry == "localhost"
            || registry.starts_with("localhost:")
            || self.registry_cfg.local_addresses.iter().any(|a| *a == registry)
    }

    /// Translates a path inside this process to the path the runtime sees.
    fn runtime_visible_path(&self, path: &str) -> String {
        match &self.cfg.self_root_dir {
            Some(root) => format!(
                "{}/{}",
                root.trim_end_matches('/'),
                path.trim_start_matches('/')
            ),
            None => path.to_string(),
        }
    }
}

/// Turns an image reference into a filesystem-safe name: lowercased, with
/// anything outside `[a-z0-9-]` replaced by `-`.
pub fn sanitize_image_ref(reference: &str) -> String {
    reference
        .chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '-' => c,
            'A'..='Z' => c.to_ascii_lowercase(),
            _ => '-',
        })
        .collect()
}
