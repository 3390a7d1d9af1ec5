//! Layer flattening: ordered OCI layers → one uncompressed rootfs tar.
//!
//! Layers are applied bottom-to-top into an in-memory file map, with later
//! layers overwriting earlier ones and whiteout markers removing content:
//!
//! - `.wh.<name>` deletes `<name>` (and everything under it),
//! - `.wh..wh..opq` marks its directory opaque, clearing every entry the
//!   lower layers put there.
//!
//! The map is then serialized back into a single tar whose byte content is
//! deterministic for a given layer sequence, which is what the docker-save
//! layer SHA is computed over.
//!
//! Layer archives never get to touch the filesystem here, but the same
//! validation the extraction path would need still applies: entries with
//! absolute paths or `..` components are rejected, and cumulative size is
//! capped.

use std::collections::BTreeMap;
use std::io::Read;

use flate2::read::GzDecoder;
use tar::{Archive, EntryType, Header};
use tracing::debug;

use crate::constants::{MAX_LAYER_SIZE, MAX_ROOTFS_SIZE};
use crate::error::{Error, Result};

use super::pull::PulledLayer;

/// One file in the flattened rootfs.
#[derive(Debug, Clone)]
struct FlatEntry {
    entry_type: EntryType,
    mode: u32,
    uid: u64,
    gid: u64,
    mtime: u64,
    link_name: Option<String>,
    data: Vec<u8>,
}

/// Flattens ordered layers into a single uncompressed rootfs tar.
pub fn flatten_layers(layers: &[PulledLayer]) -> Result<Vec<u8>> {
    let mut files: BTreeMap<String, FlatEntry> = BTreeMap::new();
    let mut total_size = 0u64;

    for layer in layers {
        debug!(digest = %layer.digest, size = layer.data.len(), "applying layer");

        if layer.data.len() > MAX_LAYER_SIZE {
            return Err(Error::ImageTooLarge {
                size: layer.data.len() as u64,
                limit: MAX_LAYER_SIZE as u64,
            });
        }

        let data = decode_layer(layer)?;
        apply_layer(&layer.digest, &data, &mut files, &mut total_size)?;
    }

    serialize_rootfs(&files)
}

/// Decompresses a layer when its media type or magic bytes say gzip.
fn decode_layer(layer: &PulledLayer) -> Result<Vec<u8>> {
    let gzipped = layer.media_type.ends_with("gzip")
        || layer.data.starts_with(&[0x1f, 0x8b]);
    if !gzipped {
        return Ok(layer.data.clone());
    }

    let mut decoder = GzDecoder::new(&layer.data[..]);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| Error::LayerExtractionFailed {
            digest: layer.digest.clone(),
            reason: format!("gzip: {e}"),
        })?;
    Ok(out)
}

fn apply_layer(
    digest: &str,
    data: &[u8],
    files: &mut BTreeMap<String, FlatEntry>,
    total_size: &mut u64,
) -> Result<()> {
    let mut archive = Archive::new(data);

    for entry in archive.entries().map_err(|e| Error::LayerExtractionFailed {
        digest: digest.to_string(),
        reason: e.to_string(),
    })? {
        let mut entry = entry.map_err(|e| Error::LayerExtractionFailed {
            digest: digest.to_string(),
            reason: e.to_string(),
        })?;

        let raw_path = entry
            .path()
            .map_err(|e| Error::LayerExtractionFailed {
                digest: digest.to_string(),
                reason: e.to_string(),
            })?
            .to_string_lossy()
            .into_owned();

        let Some(path) = normalize_path(&raw_path)? else {
            continue;
        };

        // Whiteout markers delete content from lower layers.
        let (dir, file_name) = split_path(&path);
        if file_name == ".wh..wh..opq" {
            let prefix = if dir.is_empty() {
                String::new()
            } else {
                format!("{dir}/")
            };
            files.retain(|k, _| !k.starts_with(&prefix) || k == &dir);
            continue;
        }
        if let Some(target) = file_name.strip_prefix(".wh.") {
            let target_path = if dir.is_empty() {
                target.to_string()
            } else {
                format!("{dir}/{target}")
            };
            let subtree = format!("{target_path}/");
            files.retain(|k, _| k != &target_path && !k.starts_with(&subtree));
            continue;
        }

        let header = entry.header();
        let entry_type = header.entry_type();
        let link_name = entry
            .link_name()
            .ok()
            .flatten()
            .map(|l| l.to_string_lossy().into_owned());

        if let Some(link) = &link_name {
            validate_link_target(&path, link)?;
        }

        let mode = header.mode().unwrap_or(0o644);
        let uid = header.uid().unwrap_or(0);
        let gid = header.gid().unwrap_or(0);
        let mtime = header.mtime().unwrap_or(0);

        let mut data = Vec::new();
        if entry_type.is_file() {
            *total_size += entry.size();
            if *total_size > MAX_ROOTFS_SIZE {
                return Err(Error::ImageTooLarge {
                    size: *total_size,
                    limit: MAX_ROOTFS_SIZE,
                });
            }
            entry
                .read_to_end(&mut data)
                .map_err(|e| Error::LayerExtractionFailed {
                    digest: digest.to_string(),
                    reason: e.to_string(),
                })?;
        }

        files.insert(
            path,
            FlatEntry {
                entry_type,
                mode,
                uid,
                gid,
                mtime,
                link_name,
                data,
            },
        );
    }

    Ok(())
}

/// Normalizes a tar entry path, rejecting traversal. Returns `None` for
/// entries that carry no content (`.`, empty, pax globals).
fn normalize_path(raw: &str) -> Result<Option<String>> {
    if raw.starts_with('/') || raw.split('/').any(|c| c == "..") {
        return Err(Error::PathTraversal {
            path: raw.to_string(),
        });
    }
    let trimmed = raw
        .trim_start_matches("./")
        .trim_end_matches('/')
        .to_string();
    if trimmed.is_empty() || trimmed == "." {
        return Ok(None);
    }
    Ok(Some(trimmed))
}

fn split_path(path: &str) -> (String, String) {
    match path.rsplit_once('/') {
        Some((dir, name)) => (dir.to_string(), name.to_string()),
        None => (String::new(), path.to_string()),
    }
}

/// Rejects link targets that escape the rootfs via `..` components.
fn validate_link_target(entry_path: &str, target: &str) -> Result<()> {
    if target.starts_with('/') {
        if target.split('/').any(|c| c == "..") {
            return Err(Error::PathTraversal {
                path: format!("link target: {target}"),
            });
        }
        return Ok(());
    }

    let parent = split_path(entry_path).0;
    let mut depth: i32 = parent.split('/').filter(|c| !c.is_empty()).count() as i32;
    for component in target.split('/') {
        match component {
            ".." => depth -= 1,
            "" | "." => {}
            _ => depth += 1,
        }
        if depth < 0 {
            return Err(Error::PathTraversal {
                path: format!("link target escapes rootfs: {target}"),
            });
        }
    }
    Ok(())
}

/// Serializes the flattened file map back into one tar stream.
fn serialize_rootfs(files: &BTreeMap<String, FlatEntry>) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());

    for (path, entry) in files {
        let mut header = Header::new_gnu();
        header.set_entry_type(entry.entry_type);
        header.set_mode(entry.mode);
        header.set_uid(entry.uid);
        header.set_gid(entry.gid);
        header.set_mtime(entry.mtime);
        header.set_size(entry.data.len() as u64);

        let name = if entry.entry_type.is_dir() {
            format!("{path}/")
        } else {
            path.clone()
        };

        let result = match &entry.link_name {
            Some(link) => {
                header.set_size(0);
                builder.append_link(&mut header, &name, link)
            }
            None => builder.append_data(&mut header, &name, entry.data.as_slice()),
        };
        result.map_err(|e| Error::ArchiveBuildFailed(format!("rootfs entry {path}: {e}")))?;
    }

    builder
        .into_inner()
        .map_err(|e| Error::ArchiveBuildFailed(format!("finalizing rootfs tar: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tar_with(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, data) in entries {
            let mut header = Header::new_gnu();
            header.set_mode(0o644);
            header.set_size(data.len() as u64);
            // Write the path bytes directly, bypassing `set_path`'s `..`
            // rejection, so traversal-attempt archives can be constructed.
            let name = header.as_old_mut().name.as_mut();
            let bytes = path.as_bytes();
            name[..bytes.len()].copy_from_slice(bytes);
            header.set_cksum();
            builder.append(&header, *data).unwrap();
        }
        builder.into_inner().unwrap()
    }

    fn layer(digest: &str, data: Vec<u8>) -> PulledLayer {
        PulledLayer {
            digest: digest.to_string(),
            media_type: "application/vnd.oci.image.layer.v1.tar".to_string(),
            data,
        }
    }

    fn entry_names(tar_bytes: &[u8]) -> Vec<String> {
        let mut archive = Archive::new(tar_bytes);
        archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_later_layer_overwrites() {
        let l1 = layer("sha256:a", tar_with(&[("etc/motd", b"old")]));
        let l2 = layer("sha256:b", tar_with(&[("etc/motd", b"new")]));

        let rootfs = flatten_layers(&[l1, l2]).unwrap();
        let mut archive = Archive::new(rootfs.as_slice());
        let mut entry = archive.entries().unwrap().next().unwrap().unwrap();
        let mut content = Vec::new();
        entry.read_to_end(&mut content).unwrap();
        assert_eq!(content, b"new");
    }

    #[test]
    fn test_whiteout_removes_file() {
        let l1 = layer(
            "sha256:a",
            tar_with(&[("app/keep", b"x"), ("app/drop", b"y")]),
        );
        let l2 = layer("sha256:b", tar_with(&[("app/.wh.drop", b"")]));

        let rootfs = flatten_layers(&[l1, l2]).unwrap();
        let names = entry_names(&rootfs);
        assert!(names.contains(&"app/keep".to_string()));
        assert!(!names.iter().any(|n| n.contains("drop")));
    }

    #[test]
    fn test_opaque_dir_clears_lower_content() {
        let l1 = layer(
            "sha256:a",
            tar_with(&[("cfg/a.conf", b"1"), ("cfg/b.conf", b"2")]),
        );
        let l2 = layer(
            "sha256:b",
            tar_with(&[("cfg/.wh..wh..opq", b""), ("cfg/c.conf", b"3")]),
        );

        let rootfs = flatten_layers(&[l1, l2]).unwrap();
        let names = entry_names(&rootfs);
        assert_eq!(names, vec!["cfg/c.conf".to_string()]);
    }

    #[test]
    fn test_traversal_rejected() {
        let evil = layer("sha256:evil", tar_with(&[("../../etc/passwd", b"pwn")]));
        assert!(matches!(
            flatten_layers(&[evil]),
            Err(Error::PathTraversal { .. })
        ));
    }

    #[test]
    fn test_gzip_layer_decoded() {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write;

        let plain = tar_with(&[("hello", b"world")]);
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&plain).unwrap();
        let gz = encoder.finish().unwrap();

        let mut l = layer("sha256:gz", gz);
        l.media_type = "application/vnd.oci.image.layer.v1.tar+gzip".to_string();

        let rootfs = flatten_layers(&[l]).unwrap();
        assert_eq!(entry_names(&rootfs), vec!["hello".to_string()]);
    }

    #[test]
    fn test_deterministic_output() {
        let l1 = layer("sha256:a", tar_with(&[("b", b"2"), ("a", b"1")]));
        let out1 = flatten_layers(std::slice::from_ref(&l1)).unwrap();
        let out2 = flatten_layers(&[l1]).unwrap();
        assert_eq!(out1, out2);
    }
}
