//! Tests for the IPAM allocator.

use std::net::Ipv4Addr;

use roskube::error::Error;
use roskube::ipam::Allocator;

fn gw(s: &str) -> Ipv4Addr {
    s.parse().unwrap()
}

#[test]
fn test_sequential_allocation() {
    let a = Allocator::new();
    a.add_pool("test", "172.20.0.0/24", gw("172.20.0.1")).unwrap();

    let ip1 = a.allocate("test", "veth-0").unwrap();
    assert_eq!(ip1, gw("172.20.0.2"));

    let ip2 = a.allocate("test", "veth-1").unwrap();
    assert_eq!(ip2, gw("172.20.0.3"));

    assert_eq!(a.get("test", "veth-0"), Some(ip1));
}

#[test]
fn test_allocations_distinct_inside_subnet_not_gateway() {
    let a = Allocator::new();
    a.add_pool("p", "10.1.0.0/26", gw("10.1.0.1")).unwrap();

    let mut seen = std::collections::HashSet::new();
    for i in 0..30 {
        let ip = a.allocate("p", &format!("k{i}")).unwrap();
        assert_ne!(ip, gw("10.1.0.1"), "gateway must never be allocated");
        assert!(
            u32::from(ip) & 0xffff_ffc0 == u32::from(gw("10.1.0.0")),
            "{ip} outside subnet"
        );
        assert!(seen.insert(ip), "duplicate allocation {ip}");
    }
}

#[test]
fn test_exhaustion_on_tiny_pool() {
    let a = Allocator::new();
    a.add_pool("test", "172.20.0.0/30", gw("172.20.0.1")).unwrap();

    // .2 is the only usable address (.1 is the gateway).
    let ip = a.allocate("test", "veth-0").unwrap();
    assert_eq!(ip, gw("172.20.0.2"));

    assert!(matches!(
        a.allocate("test", "veth-1"),
        Err(Error::PoolExhausted { .. })
    ));
}

#[test]
fn test_release_then_reallocate() {
    let a = Allocator::new();
    a.add_pool("test", "172.20.0.0/30", gw("172.20.0.1")).unwrap();

    let ip = a.allocate("test", "veth-0").unwrap();
    assert_eq!(ip, gw("172.20.0.2"));

    a.release("test", "veth-0");

    let ip2 = a.allocate("test", "veth-1").unwrap();
    assert_eq!(ip2, gw("172.20.0.2"));
}

#[test]
fn test_release_is_idempotent() {
    let a = Allocator::new();
    a.add_pool("test", "10.0.0.0/24", gw("10.0.0.1")).unwrap();

    a.release("test", "never-allocated");
    a.release("unknown-pool", "whatever");
}

#[test]
fn test_record_seeds_without_cursor_bump() {
    let a = Allocator::new();
    a.add_pool("net", "10.0.0.0/24", gw("10.0.0.1")).unwrap();

    a.record("net", "veth-a", gw("10.0.0.5"));
    a.record("net", "veth-b", gw("10.0.0.6"));

    let allocs = a.pool_allocations("net").unwrap();
    assert_eq!(allocs.len(), 2);

    // Recorded addresses are skipped; the cursor still starts at .2.
    let ip = a.allocate("net", "veth-c").unwrap();
    assert_eq!(ip, gw("10.0.0.2"));
    assert_ne!(ip, gw("10.0.0.5"));
    assert_ne!(ip, gw("10.0.0.6"));
}

#[test]
fn test_allocate_unknown_pool() {
    let a = Allocator::new();
    assert!(matches!(
        a.allocate("nonexistent", "key"),
        Err(Error::PoolNotFound { .. })
    ));
}

#[test]
fn test_static_allocation_blocks_dynamic() {
    let a = Allocator::new();
    a.add_pool("gt", "192.168.200.0/24", gw("192.168.200.1")).unwrap();

    a.allocate_static("gt", "veth-dns-0", gw("192.168.200.199"))
        .unwrap();
    assert_eq!(a.get("gt", "veth-dns-0"), Some(gw("192.168.200.199")));

    for i in 0..50 {
        let ip = a.allocate("gt", &format!("veth-dyn-{i}")).unwrap();
        assert_ne!(ip, gw("192.168.200.199"));
    }
}

#[test]
fn test_static_rejects_duplicate() {
    let a = Allocator::new();
    a.add_pool("gt", "192.168.200.0/24", gw("192.168.200.1")).unwrap();

    a.allocate_static("gt", "veth-0", gw("192.168.200.10")).unwrap();
    assert!(matches!(
        a.allocate_static("gt", "veth-1", gw("192.168.200.10")),
        Err(Error::AddressTaken { .. })
    ));
}

#[test]
fn test_static_rejects_gateway() {
    let a = Allocator::new();
    a.add_pool("gt", "192.168.200.0/24", gw("192.168.200.1")).unwrap();

    assert!(matches!(
        a.allocate_static("gt", "veth-0", gw("192.168.200.1")),
        Err(Error::GatewayReserved { .. })
    ));
}

#[test]
fn test_static_rejects_out_of_subnet() {
    let a = Allocator::new();
    a.add_pool("gt", "192.168.200.0/24", gw("192.168.200.1")).unwrap();

    assert!(matches!(
        a.allocate_static("gt", "veth-0", gw("10.0.0.5")),
        Err(Error::OutOfSubnet { .. })
    ));
}

#[test]
fn test_static_rejects_unknown_pool() {
    let a = Allocator::new();
    assert!(matches!(
        a.allocate_static("nonexistent", "veth-0", gw("192.168.200.10")),
        Err(Error::PoolNotFound { .. })
    ));
}

#[test]
fn test_pool_for_ip() {
    let a = Allocator::new();
    a.add_pool("net1", "10.0.0.0/24", gw("10.0.0.1")).unwrap();
    a.add_pool("net2", "172.16.0.0/24", gw("172.16.0.1")).unwrap();

    assert_eq!(a.pool_for_ip(gw("10.0.0.42")), Some("net1".to_string()));
    assert_eq!(a.pool_for_ip(gw("172.16.0.99")), Some("net2".to_string()));
    assert_eq!(a.pool_for_ip(gw("192.168.1.1")), None);
}

#[test]
fn test_all_allocations() {
    let a = Allocator::new();
    a.add_pool("net1", "10.0.0.0/24", gw("10.0.0.1")).unwrap();
    a.add_pool("net2", "172.16.0.0/24", gw("172.16.0.1")).unwrap();

    a.allocate("net1", "veth-a").unwrap();
    a.allocate("net2", "veth-b").unwrap();

    let all = a.all_allocations();
    assert_eq!(all.len(), 2);
    assert!(all.contains_key("veth-a"));
    assert!(all.contains_key("veth-b"));
}

#[test]
fn test_allocation_deterministic_from_cursor_state() {
    let build = || {
        let a = Allocator::new();
        a.add_pool("p", "10.0.0.0/24", gw("10.0.0.1")).unwrap();
        a.allocate("p", "k1").unwrap();
        a.allocate("p", "k2").unwrap();
        a.release("p", "k1");
        a
    };

    let ip1 = build().allocate("p", "k3").unwrap();
    let ip2 = build().allocate("p", "k3").unwrap();
    assert_eq!(ip1, ip2);
}

#[test]
fn test_cursor_wraps_past_broadcast() {
    let a = Allocator::new();
    a.add_pool("p", "10.0.0.0/29", gw("10.0.0.1")).unwrap();

    // Usable hosts are .1...6; the gateway .1 is excluded, so five
    // allocations fit.
    for _ in 0..5 {
        a.allocate("p", &uuid_key()).unwrap();
    }
    assert!(a.allocate("p", "overflow").is_err());

    // Freeing one address makes the wrapped cursor find it again.
    let key = a.all_allocations().keys().next().unwrap().clone();
    a.release("p", &key);
    a.allocate("p", "reclaimed").unwrap();
}

fn uuid_key() -> String {
    use std::sync::atomic::{AtomicU32, Ordering};
    static N: AtomicU32 = AtomicU32::new(0);
    format!("k-{}", N.fetch_add(1, Ordering::SeqCst))
}
