//! Shared test fixtures.
#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;

use roskube::config::{Config, NetworkConfig, RegistryConfig, StorageConfig, SwitchConfig};
use roskube::error::Result;
use roskube::image::{
    ContainerConfig, ImageConfigFile, ImageManager, ImagePuller, PulledImage, PulledLayer,
};
use roskube::network::NetworkManager;
use roskube::provider::Provider;
use roskube::runtime::{MemoryRuntime, RuntimePort};
use roskube::supervisor::Supervisor;

/// A puller that fabricates a one-file image without touching the network.
pub struct FakePuller;

#[async_trait]
impl ImagePuller for FakePuller {
    async fn pull(&self, reference: &str, _insecure: bool) -> Result<PulledImage> {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_mode(0o755);
        header.set_size(reference.len() as u64);
        builder
            .append_data(&mut header, "bin/app", reference.as_bytes())
            .unwrap();
        let layer = builder.into_inner().unwrap();

        Ok(PulledImage {
            reference: reference.to_string(),
            digest: "sha256:fabricated".to_string(),
            layers: vec![PulledLayer {
                digest: "sha256:layer0".to_string(),
                media_type: "application/vnd.oci.image.layer.v1.tar".to_string(),
                data: layer,
            }],
            config: ImageConfigFile {
                architecture: "arm64".to_string(),
                os: "linux".to_string(),
                config: Some(ContainerConfig {
                    entrypoint: vec!["/bin/app".to_string()],
                    ..Default::default()
                }),
            },
        })
    }
}

/// Config with a /24 pod network and no state file.
pub fn test_config() -> Config {
    Config {
        network: NetworkConfig {
            switches: vec![SwitchConfig {
                name: "pods".to_string(),
                bridge: "containers".to_string(),
                cidr: "172.20.0.0/24".to_string(),
                gateway: "172.20.0.1".to_string(),
                dns_zone: None,
            }],
            dns_servers: vec!["172.20.0.1".to_string()],
            state_path: None,
        },
        ..Default::default()
    }
}

/// Everything a provider test needs, wired against the in-memory runtime
/// and the fake puller.
pub struct Harness {
    pub runtime: Arc<MemoryRuntime>,
    pub provider: Arc<Provider>,
    pub supervisor: Arc<Supervisor>,
    pub network: Arc<NetworkManager>,
    pub images: Arc<ImageManager>,
}

pub fn harness() -> Harness {
    harness_with_config(test_config())
}

pub fn harness_with_config(cfg: Config) -> Harness {
    let runtime = Arc::new(MemoryRuntime::new());
    let port: Arc<dyn RuntimePort> = runtime.clone();

    let network = Arc::new(NetworkManager::new(cfg.network.clone(), port.clone()).unwrap());
    let images = Arc::new(ImageManager::with_puller(
        StorageConfig::default(),
        RegistryConfig::default(),
        port.clone(),
        Arc::new(FakePuller),
    ));
    let supervisor = Arc::new(Supervisor::new(cfg.supervisor.clone(), port.clone()));
    let provider = Arc::new(Provider::new(
        cfg,
        port,
        images.clone(),
        network.clone(),
        supervisor.clone(),
    ));

    Harness {
        runtime,
        provider,
        supervisor,
        network,
        images,
    }
}
