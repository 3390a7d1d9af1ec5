//! Tests for the docker-save archive writer.

use std::collections::HashMap;
use std::io::Read;

use roskube::image::{write_docker_save, ContainerConfig, ImageConfigFile};
use sha2::{Digest, Sha256};

fn sample_rootfs() -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_mode(0o755);
    header.set_size(5);
    builder.append_data(&mut header, "bin/sh", &b"shell"[..]).unwrap();
    builder.into_inner().unwrap()
}

fn archive_entries(data: &[u8]) -> HashMap<String, Vec<u8>> {
    let mut archive = tar::Archive::new(data);
    let mut out = HashMap::new();
    for entry in archive.entries().unwrap() {
        let mut entry = entry.unwrap();
        let path = entry.path().unwrap().to_string_lossy().into_owned();
        let mut content = Vec::new();
        entry.read_to_end(&mut content).unwrap();
        out.insert(path, content);
    }
    out
}

#[test]
fn test_layout_and_layer_digest() {
    let rootfs = sample_rootfs();
    let config = ImageConfigFile {
        architecture: "arm64".to_string(),
        os: "linux".to_string(),
        config: None,
    };

    let archive = write_docker_save(&rootfs, "nginx:1.25", &config, "arm64").unwrap();
    let entries = archive_entries(&archive);

    let layer_id = hex::encode(Sha256::digest(&rootfs));

    assert!(entries.contains_key("manifest.json"));
    assert!(entries.contains_key("repositories"));
    assert_eq!(entries[&format!("{layer_id}/VERSION")], b"1.0");
    assert!(entries.contains_key(&format!("{layer_id}/json")));
    assert_eq!(entries[&format!("{layer_id}/layer.tar")], rootfs);
}

#[test]
fn test_manifest_points_at_config_and_layer() {
    let rootfs = sample_rootfs();
    let config = ImageConfigFile::default();

    let archive = write_docker_save(&rootfs, "nginx:1.25", &config, "arm64").unwrap();
    let entries = archive_entries(&archive);
    let layer_id = hex::encode(Sha256::digest(&rootfs));

    let manifest: serde_json::Value =
        serde_json::from_slice(&entries["manifest.json"]).unwrap();
    let entry = &manifest[0];

    let config_name = entry["Config"].as_str().unwrap();
    assert!(entries.contains_key(config_name), "config blob present");
    assert_eq!(entry["RepoTags"], serde_json::json!(["library/nginx:1.25"]));
    assert_eq!(
        entry["Layers"],
        serde_json::json!([format!("{layer_id}/layer.tar")])
    );

    // The config file is named after its own SHA-256.
    let config_sha = hex::encode(Sha256::digest(&entries[config_name]));
    assert_eq!(config_name, format!("{config_sha}.json"));
}

#[test]
fn test_config_carries_architecture_and_diff_ids() {
    let rootfs = sample_rootfs();
    let config = ImageConfigFile {
        architecture: "amd64".to_string(),
        os: "linux".to_string(),
        config: Some(ContainerConfig {
            entrypoint: vec!["/docker-entrypoint.sh".to_string()],
            cmd: vec!["nginx".to_string(), "-g".to_string()],
            working_dir: "/app".to_string(),
            env: vec!["PATH=/usr/bin".to_string()],
        }),
    };

    let archive = write_docker_save(&rootfs, "nginx:1.25", &config, "arm64").unwrap();
    let entries = archive_entries(&archive);
    let layer_id = hex::encode(Sha256::digest(&rootfs));

    let manifest: serde_json::Value =
        serde_json::from_slice(&entries["manifest.json"]).unwrap();
    let config_name = manifest[0]["Config"].as_str().unwrap();
    let image_config: serde_json::Value =
        serde_json::from_slice(&entries[config_name]).unwrap();

    // Architecture is pinned from configuration, not from the source image.
    assert_eq!(image_config["architecture"], "arm64");
    assert_eq!(image_config["os"], "linux");
    assert_eq!(
        image_config["rootfs"]["diff_ids"],
        serde_json::json!([format!("sha256:{layer_id}")])
    );
    assert_eq!(
        image_config["config"]["Entrypoint"],
        serde_json::json!(["/docker-entrypoint.sh"])
    );
    assert_eq!(image_config["config"]["WorkingDir"], "/app");
    assert_eq!(image_config["config"]["Env"], serde_json::json!(["PATH=/usr/bin"]));
}

#[test]
fn test_repositories_maps_repo_tag_to_layer() {
    let rootfs = sample_rootfs();
    let archive =
        write_docker_save(&rootfs, "ghcr.io/acme/app:v2", &ImageConfigFile::default(), "arm64")
            .unwrap();
    let entries = archive_entries(&archive);
    let layer_id = hex::encode(Sha256::digest(&rootfs));

    let repositories: serde_json::Value =
        serde_json::from_slice(&entries["repositories"]).unwrap();
    assert_eq!(repositories["acme/app"]["v2"], serde_json::json!(layer_id));
}
