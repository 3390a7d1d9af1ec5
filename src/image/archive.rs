//! Docker-save archive writing.
//!
//! RouterOS loads container images from docker-save format tars with an
//! uncompressed layer:
//!
//! ```text
//! manifest.json          — Config path, RepoTags, Layers
//! repositories           — repo → tag → layer-id
//! <config-sha>.json      — image config (architecture, os, rootfs, config)
//! <layer-id>/VERSION     — "1.0"
//! <layer-id>/json        — legacy per-layer config
//! <layer-id>/layer.tar   — the flattened rootfs
//! ```
//!
//! The layer id is the hex SHA-256 of `layer.tar`, and the config's
//! `rootfs.diff_ids` carries the same digest.

use oci_distribution::Reference;
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

use super::pull::ImageConfigFile;

/// Writes a docker-save archive for a single flattened layer.
///
/// `arch` is the architecture recorded in the image config (GOARCH
/// vocabulary); the runtime refuses images built for the wrong one.
pub fn write_docker_save(
    rootfs_tar: &[u8],
    image_ref: &str,
    image_config: &ImageConfigFile,
    arch: &str,
) -> Result<Vec<u8>> {
    let layer_id = hex::encode(Sha256::digest(rootfs_tar));
    let (repo, tag) = repo_tag(image_ref);
    let repo_tag = format!("{repo}:{tag}");

    // The config block travels from the source image so entrypoint, cmd,
    // workdir, and env survive the conversion.
    let container_cfg = image_config
        .config
        .as_ref()
        .filter(|c| !c.is_empty())
        .map(|c| {
            let mut obj = serde_json::Map::new();
            if !c.entrypoint.is_empty() {
                obj.insert("Entrypoint".to_string(), json!(c.entrypoint));
            }
            if !c.cmd.is_empty() {
                obj.insert("Cmd".to_string(), json!(c.cmd));
            }
            if !c.working_dir.is_empty() {
                obj.insert("WorkingDir".to_string(), json!(c.working_dir));
            }
            if !c.env.is_empty() {
                obj.insert("Env".to_string(), json!(c.env));
            }
            serde_json::Value::Object(obj)
        });

    let mut config_obj = json!({
        "architecture": arch,
        "os": "linux",
        "rootfs": {
            "type": "layers",
            "diff_ids": [format!("sha256:{layer_id}")],
        },
    });
    if let Some(cfg) = &container_cfg {
        config_obj["config"] = cfg.clone();
    }
    let config_json = serde_json::to_vec(&config_obj)
        .map_err(|e| Error::ArchiveBuildFailed(e.to_string()))?;
    let config_name = format!("{}.json", hex::encode(Sha256::digest(&config_json)));

    let manifest_json = serde_json::to_vec(&json!([{
        "Config": config_name,
        "RepoTags": [repo_tag],
        "Layers": [format!("{layer_id}/layer.tar")],
    }]))
    .map_err(|e| Error::ArchiveBuildFailed(e.to_string()))?;

    let mut tags = serde_json::Map::new();
    tags.insert(tag.clone(), json!(layer_id));
    let mut repos = serde_json::Map::new();
    repos.insert(repo.clone(), serde_json::Value::Object(tags));
    let repositories_json = serde_json::to_vec(&serde_json::Value::Object(repos))
        .map_err(|e| Error::ArchiveBuildFailed(e.to_string()))?;

    // Legacy per-layer config kept for older loaders.
    let layer_json = serde_json::to_vec(&json!({
        "id": layer_id,
        "created": "1970-01-01T00:00:00Z",
        "config": container_cfg.unwrap_or_else(|| json!({})),
    }))
    .map_err(|e| Error::ArchiveBuildFailed(e.to_string()))?;

    let mut builder = tar::Builder::new(Vec::new());
    append_file(&mut builder, "manifest.json", &manifest_json)?;
    append_file(&mut builder, "repositories", &repositories_json)?;
    append_file(&mut builder, &config_name, &config_json)?;
    append_file(&mut builder, &format!("{layer_id}/VERSION"), b"1.0")?;
    append_file(&mut builder, &format!("{layer_id}/json"), &layer_json)?;
    append_file(&mut builder, &format!("{layer_id}/layer.tar"), rootfs_tar)?;

    builder
        .into_inner()
        .map_err(|e| Error::ArchiveBuildFailed(e.to_string()))
}

fn append_file(builder: &mut tar::Builder<Vec<u8>>, name: &str, data: &[u8]) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_mode(0o644);
    header.set_size(data.len() as u64);
    builder
        .append_data(&mut header, name, data)
        .map_err(|e| Error::ArchiveBuildFailed(format!("{name}: {e}")))
}

/// Derives `(repository, tag)` from an image reference; falls back to the
/// reference verbatim with tag `latest` when it does not parse.
fn repo_tag(image_ref: &str) -> (String, String) {
    match image_ref.parse::<Reference>() {
        Ok(reference) => {
            let repo = reference.repository().to_string();
            let tag = reference.tag().unwrap_or("latest").to_string();
            (repo, tag)
        }
        Err(_) => {
            let (repo, tag) = image_ref
                .rsplit_once(':')
                .unwrap_or((image_ref, "latest"));
            (repo.to_string(), tag.to_string())
        }
    }
}
