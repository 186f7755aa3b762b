//! Neighbor resolution boundary.
//!
//! ARP itself lives outside the core; the datapath consumes exactly one
//! operation: resolve a destination IP to a MAC within a timeout. Multicast
//! destinations never consult the resolver — their MAC is derived
//! arithmetically.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::Duration;

use parking_lot::RwLock;

use crate::hdr::MacAddr;

/// Destination MAC resolution consumed by TX session bind.
pub trait NeighborResolver: Send + Sync {
    /// Resolve `ip`, waiting up to `timeout`.
    ///
    /// A zero timeout is a non-blocking query: `None` means "not resolved
    /// yet", and the caller mirrors kernel sendto semantics (accept the
    /// bytes, drop on the wire).
    fn resolve(&self, ip: Ipv4Addr, timeout: Duration) -> Option<MacAddr>;
}

/// Static neighbor table; the default for tests and for backends that do
/// their own L2 (kernel socket, RDMA).
#[derive(Default)]
pub struct StaticNeighbors {
    entries: RwLock<HashMap<Ipv4Addr, MacAddr>>,
}

impl StaticNeighbors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, ip: Ipv4Addr, mac: MacAddr) {
        self.entries.write().insert(ip, mac);
    }
}

impl NeighborResolver for StaticNeighbors {
    fn resolve(&self, ip: Ipv4Addr, _timeout: Duration) -> Option<MacAddr> {
        self.entries.read().get(&ip).copied()
    }
}

/// Resolver for backends that delegate L2 to the kernel or to verbs:
/// every destination "resolves" to a placeholder the backend strips.
pub struct AlwaysResolved(pub MacAddr);

impl NeighborResolver for AlwaysResolved {
    fn resolve(&self, _ip: Ipv4Addr, _timeout: Duration) -> Option<MacAddr> {
        Some(self.0)
    }
}

/// Resolve the destination MAC for a session leg.
///
/// Multicast IPs map directly; unicast goes through the resolver.
pub fn resolve_dest_mac(
    resolver: &dyn NeighborResolver,
    ip: Ipv4Addr,
    timeout: Duration,
) -> Option<MacAddr> {
    if ip.is_multicast() {
        Some(MacAddr::from_multicast_ip(ip))
    } else {
        resolver.resolve(ip, timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multicast_skips_resolver() {
        let table = StaticNeighbors::new();
        let mac = resolve_dest_mac(
            &table,
            Ipv4Addr::new(239, 0, 0, 1),
            Duration::ZERO,
        );
        assert_eq!(mac, Some(MacAddr([0x01, 0x00, 0x5E, 0, 0, 1])));
    }

    #[test]
    fn unicast_uses_table() {
        let table = StaticNeighbors::new();
        let ip = Ipv4Addr::new(192, 168, 1, 20);
        assert_eq!(resolve_dest_mac(&table, ip, Duration::ZERO), None);
        table.insert(ip, MacAddr([2, 0, 0, 0, 0, 9]));
        assert_eq!(
            resolve_dest_mac(&table, ip, Duration::ZERO),
            Some(MacAddr([2, 0, 0, 0, 0, 9]))
        );
    }
}
