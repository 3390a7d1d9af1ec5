//! On-disk storage for OCI blobs and manifests.
//!
//! Directory structure:
//!
//! ```text
//! <root>/
//!   blobs/
//!     sha256/
//!       <hex digest>          — raw blob data
//!   manifests/
//!     <repo>/
//!       <tag or digest>.json  — manifest data
//!       <tag or digest>.type  — content-type metadata
//! ```
//!
//! Manifest references are sanitized for the filesystem by replacing the
//! digest separator `:` with `-`. A single reader/writer lock guards both
//! trees; manifest writes are rare and short, and blob writes are atomic
//! (unique temp file + rename) so a crash never leaves a partial blob
//! visible.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use tracing::{debug, info, warn};

use crate::constants::DEFAULT_MANIFEST_MEDIA_TYPE;
use crate::error::{Error, Result};

/// Content-addressed store backing the embedded registry.
pub struct BlobStore {
    root: PathBuf,
    lock: RwLock<()>,
}

impl BlobStore {
    /// Creates a store at the given root, making the directory skeleton.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for dir in [root.join("blobs").join("sha256"), root.join("manifests")] {
            fs::create_dir_all(&dir).map_err(|e| Error::StorageInitFailed {
                path: dir.clone(),
                reason: e.to_string(),
            })?;
        }
        info!(root = %root.display(), "blob store initialized");
        Ok(Self {
            root,
            lock: RwLock::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    // ── blobs ──────────────────────────────────────────────────────────

    /// Returns the raw data for a blob by digest (e.g. `sha256:abc123`).
    pub fn get_blob(&self, digest: &str) -> Result<Vec<u8>> {
        let _guard = self.lock.read().unwrap();
        fs::read(self.blob_path(digest)).map_err(|_| Error::BlobNotFound {
            digest: digest.to_string(),
        })
    }

    /// Whether a blob exists, and its size.
    pub fn has_blob(&self, digest: &str) -> (bool, u64) {
        let _guard = self.lock.read().unwrap();
        match fs::metadata(self.blob_path(digest)) {
            Ok(meta) => (true, meta.len()),
            Err(_) => (false, 0),
        }
    }

    /// Stores blob data keyed by digest. Atomic: data lands in a unique
    /// temp file first and is renamed into place.
    pub fn put_blob(&self, digest: &str, data: &[u8]) -> Result<()> {
        let _guard = self.lock.write().unwrap();

        let path = self.blob_path(digest);
        if path.exists() {
            debug!(digest, "blob already present");
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::StorageWriteFailed(e.to_string()))?;
        }

        // Unique temp name: concurrent writers of the same blob use
        // different temp files and the last rename wins with identical
        // content.
        let temp_path = path.with_extension(format!("tmp.{}", uuid::Uuid::now_v7()));
        fs::write(&temp_path, data).map_err(|e| Error::StorageWriteFailed(e.to_string()))?;
        fs::rename(&temp_path, &path).map_err(|e| {
            let _ = fs::remove_file(&temp_path);
            Error::StorageWriteFailed(e.to_string())
        })?;

        debug!(digest, size = data.len(), "stored blob");
        Ok(())
    }

    /// Removes a blob. Missing blobs are fine.
    pub fn remove_blob(&self, digest: &str) -> Result<()> {
        let _guard = self.lock.write().unwrap();
        let path = self.blob_path(digest);
        if path.exists() {
            fs::remove_file(&path).map_err(|e| Error::StorageWriteFailed(e.to_string()))?;
        }
        Ok(())
    }

    // ── manifests ──────────────────────────────────────────────────────

    /// Returns manifest data and content type for a repo/reference.
    pub fn get_manifest(&self, repo: &str, reference: &str) -> Result<(Vec<u8>, String)> {
        let _guard = self.lock.read().unwrap();

        let data_path = self.manifest_path(repo, reference);
        let data = fs::read(&data_path).map_err(|_| Error::ManifestNotFound {
            repo: repo.to_string(),
            reference: reference.to_string(),
        })?;

        let content_type = fs::read_to_string(data_path.with_extension("type"))
            .unwrap_or_else(|_| DEFAULT_MANIFEST_MEDIA_TYPE.to_string());

        Ok((data, content_type))
    }

    /// Stores a manifest for a repo/reference with its content type.
    pub fn put_manifest(
        &self,
        repo: &str,
        reference: &str,
        content_type: &str,
        data: &[u8],
    ) -> Result<()> {
        let _guard = self.lock.write().unwrap();

        let data_path = self.manifest_path(repo, reference);
        if let Some(parent) = data_path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::StorageWriteFailed(e.to_string()))?;
        }
        fs::write(&data_path, data).map_err(|e| Error::StorageWriteFailed(e.to_string()))?;
        if !content_type.is_empty() {
            fs::write(data_path.with_extension("type"), content_type)
                .map_err(|e| Error::StorageWriteFailed(e.to_string()))?;
        }

        debug!(repo, reference, size = data.len(), "stored manifest");
        Ok(())
    }

    /// All repository names with at least one stored manifest, sorted and
    /// unique.
    pub fn list_repositories(&self) -> Vec<String> {
        let _guard = self.lock.read().unwrap();

        let manifests_dir = self.root.join("manifests");
        let mut repos = Vec::new();
        collect_repos(&manifests_dir, &manifests_dir, &mut repos);
        repos.sort();
        repos.dedup();
        repos
    }

    // ── paths ──────────────────────────────────────────────────────────

    fn blob_path(&self, digest: &str) -> PathBuf {
        let (algo, hex_part) = digest.split_once(':').unwrap_or(("sha256", digest));

        // Constrain both halves so a hostile digest cannot traverse out of
        // the store.
        let algo = match algo {
            "sha256" | "sha384" | "sha512" => algo,
            other => {
                warn!(algo = other, "unknown digest algorithm, defaulting to sha256");
                "sha256"
            }
        };
        let safe_hex: String = hex_part.chars().filter(|c| c.is_ascii_hexdigit()).collect();
        if safe_hex.is_empty() {
            return self.root.join("blobs").join("invalid");
        }

        self.root.join("blobs").join(algo).join(safe_hex)
    }

    fn manifest_path(&self, repo: &str, reference: &str) -> PathBuf {
        let safe_ref = reference.replace(':', "-");
        let mut path = self.root.join("manifests");
        for part in repo.split('/').filter(|p| !p.is_empty() && *p != "." && *p != "..") {
            path.push(part);
        }
        path.join(format!("{safe_ref}.json"))
    }
}

/// Walks the manifests tree collecting repo names (directories that hold at
/// least one `.json` manifest).
fn collect_repos(base: &Path, dir: &Path, repos: &mut Vec<String>) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return,
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_repos(base, &path, repos);
        } else if path.extension().map(|e| e == "json").unwrap_or(false) {
            if let Some(parent) = path.parent() {
                if let Ok(rel) = parent.strip_prefix(base) {
                    let repo = rel
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/");
                    if !repo.is_empty() {
                        repos.push(repo);
                    }
                }
            }
        }
    }
}
