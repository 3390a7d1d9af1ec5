//! Error types for the orchestration engine.

use std::path::PathBuf;
use std::time::Duration;

/// Result type alias for orchestrator operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur across the orchestration engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Runtime Port Errors
    // =========================================================================
    /// A runtime object (container, veth, file) was not found.
    #[error("not found: {what}")]
    NotFound { what: String },

    /// A runtime object already exists. Idempotent callers treat this as
    /// success (see [`Error::is_already_exists`]).
    #[error("already exists: {what}")]
    AlreadyExists { what: String },

    /// The runtime rejected an operation because of conflicting state.
    #[error("conflict on {what}: {reason}")]
    Conflict { what: String, reason: String },

    /// The REST transport failed (5xx, connection refused, malformed body).
    #[error("transport failure during {operation}: {reason}")]
    Transport { operation: String, reason: String },

    /// The runtime rejected our credentials (401/403).
    #[error("authentication failure: {reason}")]
    Auth { reason: String },

    // =========================================================================
    // IPAM Errors
    // =========================================================================
    /// No pool registered under the requested name.
    #[error("IPAM pool {pool:?} not found")]
    PoolNotFound { pool: String },

    /// Every usable address in the pool is allocated.
    #[error("IPAM: no available IPs in {pool} (all {capacity} addresses allocated)")]
    PoolExhausted { pool: String, capacity: u32 },

    /// A static allocation fell outside the pool's subnet.
    #[error("IP {ip} not in subnet {subnet}")]
    OutOfSubnet { ip: String, subnet: String },

    /// A static allocation asked for the gateway address.
    #[error("IP {ip} is the gateway")]
    GatewayReserved { ip: String },

    /// A static allocation collided with an existing allocation.
    #[error("IP {ip} already allocated to {holder}")]
    AddressTaken { ip: String, holder: String },

    /// A CIDR string failed to parse.
    #[error("invalid CIDR {cidr:?}: {reason}")]
    InvalidCidr { cidr: String, reason: String },

    // =========================================================================
    // Image Pipeline Errors
    // =========================================================================
    /// Failed to parse an image reference.
    #[error("invalid image reference '{reference}': {reason}")]
    InvalidImageReference { reference: String, reason: String },

    /// Image pull failed.
    #[error("failed to pull image '{reference}': {reason}")]
    ImagePullFailed { reference: String, reason: String },

    /// Layer decompression or flattening failed.
    #[error("failed to extract layer {digest}: {reason}")]
    LayerExtractionFailed { digest: String, reason: String },

    /// Image size exceeded limits.
    #[error("image exceeds size limit: {size} > {limit} bytes")]
    ImageTooLarge { size: u64, limit: u64 },

    /// Path traversal attempt detected in a layer archive.
    #[error("path traversal detected in layer: {path}")]
    PathTraversal { path: String },

    /// Failed to build the docker-save archive.
    #[error("failed to build image archive: {0}")]
    ArchiveBuildFailed(String),

    // =========================================================================
    // Blob Store Errors
    // =========================================================================
    /// Store initialization failed.
    #[error("failed to initialize store at {path}: {reason}")]
    StorageInitFailed { path: PathBuf, reason: String },

    /// Blob not found in the store.
    #[error("blob not found: {digest}")]
    BlobNotFound { digest: String },

    /// Manifest not found in the store.
    #[error("manifest not found: {repo}:{reference}")]
    ManifestNotFound { repo: String, reference: String },

    /// Store write failed.
    #[error("failed to write to store: {0}")]
    StorageWriteFailed(String),

    // =========================================================================
    // Pod / Provider Errors
    // =========================================================================
    /// No pod tracked under namespace/name.
    #[error("pod {namespace}/{name} not found")]
    PodNotFound { namespace: String, name: String },

    /// A pod manifest failed validation.
    #[error("invalid pod manifest: {0}")]
    InvalidManifest(String),

    // =========================================================================
    // General Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Operation timed out.
    #[error("operation timed out after {duration:?}: {operation}")]
    Timeout { operation: String, duration: Duration },

    /// Internal error (should not happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True for every "the thing is absent" error kind.
    ///
    /// Deletion paths use this to keep going: a container, veth, or file
    /// that is already gone counts as deleted.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::NotFound { .. }
                | Error::BlobNotFound { .. }
                | Error::ManifestNotFound { .. }
                | Error::PodNotFound { .. }
        )
    }

    /// True when the runtime reported the object as already present.
    ///
    /// Creation paths for veths, bridge ports, and file uploads treat this
    /// as success.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::AlreadyExists { .. })
    }
}
