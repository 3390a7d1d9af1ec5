//! IP address management for pod networks.
//!
//! A pool-scoped sequential IPv4 allocator. Each pool covers one subnet
//! with a gateway excluded from allocation. Allocation walks a rolling
//! cursor: the cursor advances *before* the taken-check so two racing
//! allocators inside one pool can never be handed the same candidate, and
//! wraps past the broadcast address back to host offset 2.
//!
//! Allocations survive restarts through [`Allocator::record`]: at startup
//! the network manager enumerates existing veth interfaces on the device,
//! matches their addresses to pools, and seeds the allocation maps without
//! bumping the cursor.

use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// =============================================================================
// CIDR Math
// =============================================================================

/// An IPv4 subnet in CIDR notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Cidr {
    network: u32,
    prefix: u8,
}

impl Ipv4Cidr {
    /// Parses `a.b.c.d/len`. The address is masked down to the network.
    pub fn parse(s: &str) -> Result<Self> {
        let (addr, prefix) = s.split_once('/').ok_or_else(|| Error::InvalidCidr {
            cidr: s.to_string(),
            reason: "missing prefix length".to_string(),
        })?;
        let addr: Ipv4Addr = addr.parse().map_err(|_| Error::InvalidCidr {
            cidr: s.to_string(),
            reason: "invalid address".to_string(),
        })?;
        let prefix: u8 = prefix.parse().map_err(|_| Error::InvalidCidr {
            cidr: s.to_string(),
            reason: "invalid prefix length".to_string(),
        })?;
        if prefix > 32 {
            return Err(Error::InvalidCidr {
                cidr: s.to_string(),
                reason: "prefix length exceeds 32".to_string(),
            });
        }
        let mask = Self::mask(prefix);
        Ok(Self {
            network: u32::from(addr) & mask,
            prefix,
        })
    }

    fn mask(prefix: u8) -> u32 {
        if prefix == 0 {
            0
        } else {
            u32::MAX << (32 - prefix)
        }
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.network)
    }

    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.network | !Self::mask(self.prefix))
    }

    /// Number of addresses in the subnet, including network and broadcast.
    pub fn host_count(&self) -> u32 {
        if self.prefix >= 32 {
            1
        } else {
            1u32.checked_shl(32 - self.prefix as u32).unwrap_or(0)
        }
    }

    /// Number of usable host addresses (excluding network and broadcast).
    pub fn usable_hosts(&self) -> u32 {
        self.host_count().saturating_sub(2)
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        u32::from(ip) & Self::mask(self.prefix) == self.network
    }

    /// Highest usable host address (broadcast − 1).
    pub fn max_usable_ip(&self) -> Ipv4Addr {
        Ipv4Addr::from((self.network | !Self::mask(self.prefix)).saturating_sub(1))
    }

    /// Address a subnet-local DNS instance conventionally takes
    /// (broadcast − 3, leaving the top two hosts for routers).
    pub fn dns_server_ip(&self) -> Ipv4Addr {
        Ipv4Addr::from((self.network | !Self::mask(self.prefix)).saturating_sub(3))
    }
}

impl std::fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.network(), self.prefix)
    }
}

impl Serialize for Ipv4Cidr {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Ipv4Cidr {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Pools
// =============================================================================

/// Allocation state for one subnet.
#[derive(Debug)]
struct Pool {
    cidr: Ipv4Cidr,
    gateway: Ipv4Addr,
    /// Allocation key (typically a veth name) → address.
    allocated: HashMap<String, Ipv4Addr>,
    /// Next host offset to try. Starts at 2 (skipping the network address
    /// and the conventional gateway at .1).
    next_offset: u32,
}

impl Pool {
    fn allocate(&mut self, pool_name: &str, key: &str) -> Result<Ipv4Addr> {
        let usable = self.cidr.usable_hosts();

        for _ in 0..usable {
            let candidate = Ipv4Addr::from(u32::from(self.cidr.network()) + self.next_offset);
            let taken = self.allocated.values().any(|ip| *ip == candidate);

            // Advance the cursor before the taken-check result is acted on,
            // so a wrapped retry never re-proposes the same offset.
            self.next_offset += 1;
            if self.next_offset > usable {
                self.next_offset = 2;
            }

            if !taken && candidate != self.gateway {
                self.allocated.insert(key.to_string(), candidate);
                return Ok(candidate);
            }
        }

        Err(Error::PoolExhausted {
            pool: pool_name.to_string(),
            capacity: usable,
        })
    }
}

// =============================================================================
// Allocator
// =============================================================================

/// Manages IP allocation across multiple named pools.
///
/// One lock covers all pools; every method acquires it.
#[derive(Default)]
pub struct Allocator {
    pools: Mutex<HashMap<String, Pool>>,
}

impl Allocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a subnet for allocation.
    pub fn add_pool(&self, name: &str, cidr: &str, gateway: Ipv4Addr) -> Result<()> {
        let cidr = Ipv4Cidr::parse(cidr)?;
        let mut pools = self.pools.lock().unwrap();
        pools.insert(
            name.to_string(),
            Pool {
                cidr,
                gateway,
                allocated: HashMap::new(),
                next_offset: 2,
            },
        );
        Ok(())
    }

    /// Picks the next free IP in the named pool and records it under `key`.
    pub fn allocate(&self, pool_name: &str, key: &str) -> Result<Ipv4Addr> {
        let mut pools = self.pools.lock().unwrap();
        let pool = pools.get_mut(pool_name).ok_or_else(|| Error::PoolNotFound {
            pool: pool_name.to_string(),
        })?;
        pool.allocate(pool_name, key)
    }

    /// Reserves a specific IP in the named pool.
    pub fn allocate_static(&self, pool_name: &str, key: &str, ip: Ipv4Addr) -> Result<()> {
        let mut pools = self.pools.lock().unwrap();
        let pool = pools.get_mut(pool_name).ok_or_else(|| Error::PoolNotFound {
            pool: pool_name.to_string(),
        })?;

        if !pool.cidr.contains(ip) {
            return Err(Error::OutOfSubnet {
                ip: ip.to_string(),
                subnet: pool.cidr.to_string(),
            });
        }
        if ip == pool.gateway {
            return Err(Error::GatewayReserved { ip: ip.to_string() });
        }
        if let Some((holder, _)) = pool.allocated.iter().find(|(_, v)| **v == ip) {
            return Err(Error::AddressTaken {
                ip: ip.to_string(),
                holder: holder.clone(),
            });
        }

        pool.allocated.insert(key.to_string(), ip);
        Ok(())
    }

    /// Frees the IP held by `key`. Idempotent; unknown pools and keys are
    /// ignored.
    pub fn release(&self, pool_name: &str, key: &str) {
        let mut pools = self.pools.lock().unwrap();
        if let Some(pool) = pools.get_mut(pool_name) {
            pool.allocated.remove(key);
        }
    }

    /// Marks an IP as already allocated without moving the cursor. Used by
    /// startup reconciliation to seed state recovered from the device.
    pub fn record(&self, pool_name: &str, key: &str, ip: Ipv4Addr) {
        let mut pools = self.pools.lock().unwrap();
        if let Some(pool) = pools.get_mut(pool_name) {
            pool.allocated.insert(key.to_string(), ip);
        }
    }

    /// Returns the IP allocated for `key`, if any.
    pub fn get(&self, pool_name: &str, key: &str) -> Option<Ipv4Addr> {
        let pools = self.pools.lock().unwrap();
        pools.get(pool_name)?.allocated.get(key).copied()
    }

    /// Snapshot of allocations for one pool.
    pub fn pool_allocations(&self, pool_name: &str) -> Option<BTreeMap<String, Ipv4Addr>> {
        let pools = self.pools.lock().unwrap();
        let pool = pools.get(pool_name)?;
        Some(
            pool.allocated
                .iter()
                .map(|(k, v)| (k.clone(), *v))
                .collect(),
        )
    }

    /// All allocations across all pools as key → IP string.
    pub fn all_allocations(&self) -> BTreeMap<String, String> {
        let pools = self.pools.lock().unwrap();
        let mut out = BTreeMap::new();
        for pool in pools.values() {
            for (k, ip) in &pool.allocated {
                out.insert(k.clone(), ip.to_string());
            }
        }
        out
    }

    /// Name of the pool whose subnet contains `ip`, if any.
    pub fn pool_for_ip(&self, ip: Ipv4Addr) -> Option<String> {
        let pools = self.pools.lock().unwrap();
        pools
            .iter()
            .find(|(_, pool)| pool.cidr.contains(ip))
            .map(|(name, _)| name.clone())
    }

    /// The subnet and gateway of a pool.
    pub fn pool_subnet(&self, pool_name: &str) -> Option<(Ipv4Cidr, Ipv4Addr)> {
        let pools = self.pools.lock().unwrap();
        pools.get(pool_name).map(|p| (p.cidr, p.gateway))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cidr_parse_and_contains() {
        let cidr = Ipv4Cidr::parse("192.168.200.17/24").unwrap();
        assert_eq!(cidr.network(), Ipv4Addr::new(192, 168, 200, 0));
        assert_eq!(cidr.broadcast(), Ipv4Addr::new(192, 168, 200, 255));
        assert!(cidr.contains(Ipv4Addr::new(192, 168, 200, 42)));
        assert!(!cidr.contains(Ipv4Addr::new(192, 168, 201, 42)));
        assert_eq!(cidr.to_string(), "192.168.200.0/24");
    }

    #[test]
    fn test_cidr_parse_rejects_garbage() {
        assert!(Ipv4Cidr::parse("10.0.0.0").is_err());
        assert!(Ipv4Cidr::parse("10.0.0.0/33").is_err());
        assert!(Ipv4Cidr::parse("banana/24").is_err());
    }

    #[test]
    fn test_cidr_helpers() {
        let cidr = Ipv4Cidr::parse("192.168.200.0/24").unwrap();
        assert_eq!(cidr.usable_hosts(), 254);
        assert_eq!(cidr.max_usable_ip(), Ipv4Addr::new(192, 168, 200, 254));
        assert_eq!(cidr.dns_server_ip(), Ipv4Addr::new(192, 168, 200, 252));
    }
}
