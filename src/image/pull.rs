//! OCI image pulling.
//!
//! [`ImagePuller`] is the seam between the pipeline and the registry world:
//! production uses [`RegistryPuller`] (oci-distribution with the platform
//! pinned to Linux and the configured architecture), tests substitute a
//! fake that returns synthetic layers.

use async_trait::async_trait;
use oci_distribution::client::{Client, ClientConfig, ClientProtocol};
use oci_distribution::manifest::{OciDescriptor, OciImageManifest, OciManifest};
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::Reference;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::constants::{
    IMAGE_PULL_TIMEOUT, MAX_CONFIG_SIZE, MAX_IMAGE_REF_LEN, MAX_LAYERS, MAX_LAYER_SIZE,
};
use crate::error::{Error, Result};

// =============================================================================
// Pulled Image Types
// =============================================================================

/// Image config file content (the `<digest>.json` blob of an image).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageConfigFile {
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub os: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<ContainerConfig>,
}

/// The `config` block of an image config: how the image wants to run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerConfig {
    #[serde(rename = "Entrypoint", default, skip_serializing_if = "Vec::is_empty")]
    pub entrypoint: Vec<String>,
    #[serde(rename = "Cmd", default, skip_serializing_if = "Vec::is_empty")]
    pub cmd: Vec<String>,
    #[serde(rename = "WorkingDir", default, skip_serializing_if = "String::is_empty")]
    pub working_dir: String,
    #[serde(rename = "Env", default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
}

impl ContainerConfig {
    pub fn is_empty(&self) -> bool {
        self.entrypoint.is_empty()
            && self.cmd.is_empty()
            && self.working_dir.is_empty()
            && self.env.is_empty()
    }
}

/// One pulled layer, still in its transport encoding.
#[derive(Debug, Clone)]
pub struct PulledLayer {
    pub digest: String,
    pub media_type: String,
    pub data: Vec<u8>,
}

/// A fully pulled image: ordered layers bottom-to-top plus its config.
#[derive(Debug, Clone)]
pub struct PulledImage {
    pub reference: String,
    pub digest: String,
    pub layers: Vec<PulledLayer>,
    pub config: ImageConfigFile,
}

// =============================================================================
// Puller Seam
// =============================================================================

/// Pulls OCI images. Selected at construction time; no further dispatch.
#[async_trait]
pub trait ImagePuller: Send + Sync {
    /// Pulls `reference` for the target platform. `insecure` selects plain
    /// HTTP (for the embedded registry).
    async fn pull(&self, reference: &str, insecure: bool) -> Result<PulledImage>;
}

/// Production puller backed by oci-distribution.
pub struct RegistryPuller {
    /// Target architecture in GOARCH vocabulary (`amd64`, `arm64`, ...).
    arch: String,
}

impl RegistryPuller {
    pub fn new(arch: impl Into<String>) -> Self {
        Self { arch: arch.into() }
    }
}

#[async_trait]
impl ImagePuller for RegistryPuller {
    async fn pull(&self, image_ref: &str, insecure: bool) -> Result<PulledImage> {
        validate_reference(image_ref)?;

        let reference: Reference =
            image_ref.parse().map_err(|e| Error::InvalidImageReference {
                reference: image_ref.to_string(),
                reason: format!("{e}"),
            })?;

        let protocol = if insecure {
            ClientProtocol::Http
        } else {
            ClientProtocol::Https
        };
        let client = Client::new(ClientConfig {
            protocol,
            ..Default::default()
        });

        // Anonymous resolution lets the transport perform the OAuth2 bearer
        // token exchange public registries require.
        let auth = RegistryAuth::Anonymous;

        info!(reference = image_ref, arch = %self.arch, "pulling image");

        let (manifest, digest) = tokio::time::timeout(IMAGE_PULL_TIMEOUT, async {
            client.pull_manifest(&reference, &auth).await
        })
        .await
        .map_err(|_| Error::Timeout {
            operation: format!("pull manifest for {image_ref}"),
            duration: IMAGE_PULL_TIMEOUT,
        })?
        .map_err(|e| Error::ImagePullFailed {
            reference: image_ref.to_string(),
            reason: e.to_string(),
        })?;

        let image_manifest = self
            .resolve_manifest(&client, &reference, &auth, manifest)
            .await?;

        let config = pull_config(&client, &reference, &image_manifest, image_ref).await?;
        let layers = pull_layers(&client, &reference, &image_manifest, image_ref).await?;

        Ok(PulledImage {
            reference: image_ref.to_string(),
            digest,
            layers,
            config,
        })
    }
}

impl RegistryPuller {
    /// Resolves a manifest, descending through a multi-arch index to the
    /// `(linux, target-arch)` entry.
    async fn resolve_manifest(
        &self,
        client: &Client,
        reference: &Reference,
        auth: &RegistryAuth,
        manifest: OciManifest,
    ) -> Result<OciImageManifest> {
        match manifest {
            OciManifest::Image(img) => Ok(img),
            OciManifest::ImageIndex(index) => {
                let matching = index.manifests.iter().find(|m| {
                    m.platform
                        .as_ref()
                        .map(|p| p.os == "linux" && p.architecture == self.arch)
                        .unwrap_or(false)
                });

                let descriptor = matching.ok_or_else(|| {
                    let available: Vec<String> = index
                        .manifests
                        .iter()
                        .filter_map(|m| m.platform.as_ref())
                        .map(|p| format!("{}/{}", p.os, p.architecture))
                        .collect();
                    Error::ImagePullFailed {
                        reference: reference.to_string(),
                        reason: format!(
                            "no manifest for linux/{}. Available: {}",
                            self.arch,
                            available.join(", ")
                        ),
                    }
                })?;

                let digest_ref = format!(
                    "{}/{}@{}",
                    reference.registry(),
                    reference.repository(),
                    descriptor.digest
                );
                let platform_ref: Reference =
                    digest_ref.parse().map_err(|e| Error::ImagePullFailed {
                        reference: reference.to_string(),
                        reason: format!("failed to build digest reference: {e}"),
                    })?;

                let (platform_manifest, _) = client
                    .pull_manifest(&platform_ref, auth)
                    .await
                    .map_err(|e| Error::ImagePullFailed {
                        reference: reference.to_string(),
                        reason: format!("failed to pull platform manifest: {e}"),
                    })?;

                match platform_manifest {
                    OciManifest::Image(img) => Ok(img),
                    _ => Err(Error::ImagePullFailed {
                        reference: reference.to_string(),
                        reason: "nested image index not supported".to_string(),
                    }),
                }
            }
        }
    }
}

async fn pull_config(
    client: &Client,
    reference: &Reference,
    manifest: &OciImageManifest,
    image_ref: &str,
) -> Result<ImageConfigFile> {
    let config_size = manifest.config.size as usize;
    if config_size > MAX_CONFIG_SIZE {
        return Err(Error::ImageTooLarge {
            size: config_size as u64,
            limit: MAX_CONFIG_SIZE as u64,
        });
    }

    let mut data = Vec::new();
    pull_blob_checked(client, reference, &manifest.config, &mut data, image_ref).await?;

    serde_json::from_slice(&data).map_err(|e| Error::ImagePullFailed {
        reference: image_ref.to_string(),
        reason: format!("parsing image config: {e}"),
    })
}

async fn pull_layers(
    client: &Client,
    reference: &Reference,
    manifest: &OciImageManifest,
    image_ref: &str,
) -> Result<Vec<PulledLayer>> {
    if manifest.layers.len() > MAX_LAYERS {
        return Err(Error::ImagePullFailed {
            reference: image_ref.to_string(),
            reason: format!("too many layers: {} > {}", manifest.layers.len(), MAX_LAYERS),
        });
    }

    let mut layers = Vec::with_capacity(manifest.layers.len());
    for descriptor in &manifest.layers {
        if descriptor.size > MAX_LAYER_SIZE as i64 {
            return Err(Error::ImageTooLarge {
                size: descriptor.size as u64,
                limit: MAX_LAYER_SIZE as u64,
            });
        }

        debug!(digest = %descriptor.digest, size = descriptor.size, "pulling layer");

        let mut data = Vec::new();
        pull_blob_checked(client, reference, descriptor, &mut data, image_ref).await?;

        layers.push(PulledLayer {
            digest: descriptor.digest.clone(),
            media_type: descriptor.media_type.clone(),
            data,
        });
    }

    Ok(layers)
}

async fn pull_blob_checked(
    client: &Client,
    reference: &Reference,
    descriptor: &OciDescriptor,
    out: &mut Vec<u8>,
    image_ref: &str,
) -> Result<()> {
    tokio::time::timeout(IMAGE_PULL_TIMEOUT, async {
        client.pull_blob(reference, descriptor, out).await
    })
    .await
    .map_err(|_| Error::Timeout {
        operation: format!("pull blob {} for {image_ref}", descriptor.digest),
        duration: IMAGE_PULL_TIMEOUT,
    })?
    .map_err(|e| Error::ImagePullFailed {
        reference: image_ref.to_string(),
        reason: format!("pulling blob {}: {e}", descriptor.digest),
    })
}

/// Validates reference length and character set before parsing.
fn validate_reference(image_ref: &str) -> Result<()> {
    if image_ref.len() > MAX_IMAGE_REF_LEN {
        return Err(Error::InvalidImageReference {
            reference: image_ref.to_string(),
            reason: format!("exceeds {MAX_IMAGE_REF_LEN} bytes"),
        });
    }
    let valid = image_ref.chars().all(|c| {
        c.is_ascii_alphanumeric()
            || c == '/'
            || c == ':'
            || c == '.'
            || c == '-'
            || c == '_'
            || c == '@'
    });
    if !valid {
        return Err(Error::InvalidImageReference {
            reference: image_ref.to_string(),
            reason: "contains invalid characters".to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_validation() {
        assert!(validate_reference("nginx:1.25").is_ok());
        assert!(validate_reference("ghcr.io/org/app@sha256:abc").is_ok());
        assert!(validate_reference("nginx :latest").is_err());
        let long = "a".repeat(MAX_IMAGE_REF_LEN + 1);
        assert!(validate_reference(&long).is_err());
    }

    #[test]
    fn test_container_config_is_empty() {
        assert!(ContainerConfig::default().is_empty());
        let cfg = ContainerConfig {
            cmd: vec!["/bin/sh".to_string()],
            ..Default::default()
        };
        assert!(!cfg.is_empty());
    }
}
