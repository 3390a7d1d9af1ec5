//! Tests for the network manager.

mod common;

use std::sync::Arc;

use roskube::network::NetworkManager;
use roskube::runtime::{MemoryRuntime, RuntimePort};

fn manager() -> (Arc<MemoryRuntime>, NetworkManager) {
    let runtime = Arc::new(MemoryRuntime::new());
    let port: Arc<dyn RuntimePort> = runtime.clone();
    let mgr = NetworkManager::new(common::test_config().network, port).unwrap();
    (runtime, mgr)
}

#[tokio::test]
async fn test_allocate_creates_veth_and_bridge_port() {
    let (runtime, mgr) = manager();

    let (address, gateway) = mgr.allocate_interface("veth-web-0", "web").await.unwrap();
    assert_eq!(address, "172.20.0.2/24");
    assert_eq!(gateway, "172.20.0.1");

    assert_eq!(runtime.veth_names(), vec!["veth-web-0".to_string()]);
    assert_eq!(
        runtime.bridge_ports(),
        vec![("containers".to_string(), "veth-web-0".to_string())]
    );
}

#[tokio::test]
async fn test_release_removes_veth_and_frees_ip() {
    let (runtime, mgr) = manager();

    mgr.allocate_interface("veth-web-0", "web").await.unwrap();
    mgr.release_interface("veth-web-0").await;

    assert!(runtime.veth_names().is_empty());
    assert!(mgr.allocations().is_empty());

    // The freed address is available again.
    let (address, _) = mgr.allocate_interface("veth-db-0", "db").await.unwrap();
    assert_eq!(address, "172.20.0.2/24");
}

#[tokio::test]
async fn test_release_tolerates_missing_veth() {
    let (_runtime, mgr) = manager();
    mgr.release_interface("veth-ghost-0").await;
}

#[tokio::test]
async fn test_sync_seeds_allocator_from_device() {
    let (runtime, mgr) = manager();
    runtime.seed_veth("veth-old-0", "172.20.0.5/24", "172.20.0.1");
    runtime.seed_veth("veth-other", "10.99.0.5/24", "10.99.0.1");

    mgr.sync().await.unwrap();

    let allocs = mgr.allocations();
    assert_eq!(allocs.get("veth-old-0"), Some(&"172.20.0.5".to_string()));
    // Addresses outside every pool are ignored.
    assert!(!allocs.contains_key("veth-other"));

    // New allocations avoid the synced address.
    for i in 0..10 {
        let (address, _) = mgr
            .allocate_interface(&format!("veth-new-{i}"), "new")
            .await
            .unwrap();
        assert_ne!(address, "172.20.0.5/24");
    }
}

#[tokio::test]
async fn test_switch_summaries_and_ports() {
    let (_runtime, mgr) = manager();
    mgr.allocate_interface("veth-web-0", "web").await.unwrap();

    let switches = mgr.switches();
    assert_eq!(switches.len(), 1);
    assert_eq!(switches[0].name, "pods");
    assert_eq!(switches[0].bridge, "containers");
    assert_eq!(switches[0].ports, 1);

    let ports = mgr.switch_ports("pods").unwrap();
    assert_eq!(ports.len(), 1);
    assert_eq!(ports[0].name, "veth-web-0");
    assert_eq!(ports[0].ip, "172.20.0.2");
    assert_eq!(ports[0].hostname, "web");

    assert!(mgr.switch_detail("nope").is_none());
    assert!(mgr.switch_ports("nope").is_none());
}
