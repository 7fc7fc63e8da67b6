//! Virtual address pool.
//!
//! Addresses are handed out sequentially from the configured block. The
//! server owns the first host; clients get the following hosts in
//! first-registration order. Allocation is keyed by device id so a device
//! reconnecting within one server lifetime always gets the same address.

use crate::config::ReclaimPolicy;
use crate::error::{OverlayError, OverlayResult};
use ipnet::Ipv4Net;
use std::collections::HashMap;
use std::net::Ipv4Addr;

/// Address pool for assigning virtual addresses to devices.
#[derive(Debug)]
pub struct AddressPool {
    network: Ipv4Net,
    server_ip: Ipv4Addr,
    next_ip: u32,
    /// Last assignable host (broadcast excluded).
    max_ip: u32,
    assigned: HashMap<String, Ipv4Addr>,
    /// Addresses returned under `ReclaimPolicy::OnRemove`.
    released: Vec<Ipv4Addr>,
    reclaim: ReclaimPolicy,
}

impl AddressPool {
    pub fn new(network: Ipv4Net, reclaim: ReclaimPolicy) -> Self {
        let net_addr: u32 = network.network().into();
        let broadcast: u32 = network.broadcast().into();

        Self {
            network,
            server_ip: Ipv4Addr::from(net_addr + 1),
            next_ip: net_addr + 2,
            max_ip: broadcast.saturating_sub(1),
            assigned: HashMap::new(),
            released: Vec::new(),
            reclaim,
        }
    }

    /// Address reserved for the server itself.
    pub fn server_ip(&self) -> Ipv4Addr {
        self.server_ip
    }

    /// Server address with the block's prefix length.
    pub fn server_net(&self) -> OverlayResult<Ipv4Net> {
        Ipv4Net::new(self.server_ip, self.network.prefix_len())
            .map_err(|e| OverlayError::config_with_source("Invalid server address", e))
    }

    /// Allocate an address for a device, or return the one it already holds.
    pub fn allocate(&mut self, device_id: &str) -> OverlayResult<Ipv4Addr> {
        if let Some(&ip) = self.assigned.get(device_id) {
            return Ok(ip);
        }

        let ip = if let Some(ip) = self.released.pop() {
            ip
        } else if self.next_ip <= self.max_ip {
            let ip = Ipv4Addr::from(self.next_ip);
            self.next_ip += 1;
            ip
        } else {
            return Err(OverlayError::IpAssignment(format!(
                "No addresses left in {} for {}",
                self.network, device_id
            )));
        };

        self.assigned.insert(device_id.to_string(), ip);
        Ok(ip)
    }

    /// Address currently held by a device.
    pub fn lookup(&self, device_id: &str) -> Option<Ipv4Addr> {
        self.assigned.get(device_id).copied()
    }

    /// Forget a device. Its address is reused only under `OnRemove`.
    ///
    /// Under `Never` the allocation is kept, so a removed device that
    /// registers again still gets its original address.
    pub fn release(&mut self, device_id: &str) -> Option<Ipv4Addr> {
        match self.reclaim {
            ReclaimPolicy::Never => None,
            ReclaimPolicy::OnRemove => {
                let ip = self.assigned.remove(device_id)?;
                self.released.push(ip);
                Some(ip)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(cidr: &str, reclaim: ReclaimPolicy) -> AddressPool {
        AddressPool::new(cidr.parse().unwrap(), reclaim)
    }

    #[test]
    fn test_sequential_allocation() {
        let mut pool = pool("10.0.0.0/24", ReclaimPolicy::Never);

        assert_eq!(pool.server_ip(), Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(pool.allocate("dev-1").unwrap(), Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(pool.allocate("dev-2").unwrap(), Ipv4Addr::new(10, 0, 0, 3));
    }

    #[test]
    fn test_allocation_is_stable_per_device() {
        let mut pool = pool("10.0.0.0/24", ReclaimPolicy::Never);

        let first = pool.allocate("dev-1").unwrap();
        pool.allocate("dev-2").unwrap();
        assert_eq!(pool.allocate("dev-1").unwrap(), first);
        assert_eq!(pool.lookup("dev-1"), Some(first));
    }

    #[test]
    fn test_never_policy_keeps_address_after_release() {
        let mut pool = pool("10.0.0.0/24", ReclaimPolicy::Never);

        let ip = pool.allocate("dev-1").unwrap();
        assert_eq!(pool.release("dev-1"), None);
        assert_eq!(pool.allocate("dev-2").unwrap(), Ipv4Addr::new(10, 0, 0, 3));
        assert_eq!(pool.allocate("dev-1").unwrap(), ip);
    }

    #[test]
    fn test_on_remove_policy_reuses_address() {
        let mut pool = pool("10.0.0.0/24", ReclaimPolicy::OnRemove);

        let ip = pool.allocate("dev-1").unwrap();
        assert_eq!(pool.release("dev-1"), Some(ip));
        assert_eq!(pool.lookup("dev-1"), None);
        assert_eq!(pool.allocate("dev-2").unwrap(), ip);
    }

    #[test]
    fn test_pool_exhaustion() {
        // /30: network .0, server .1, one client .2, broadcast .3
        let mut pool = pool("10.0.0.0/30", ReclaimPolicy::Never);

        assert_eq!(pool.allocate("dev-1").unwrap(), Ipv4Addr::new(10, 0, 0, 2));
        assert!(matches!(
            pool.allocate("dev-2"),
            Err(OverlayError::IpAssignment(_))
        ));
    }

    #[test]
    fn test_custom_block() {
        let mut pool = pool("172.16.8.0/22", ReclaimPolicy::Never);
        assert_eq!(pool.server_ip(), Ipv4Addr::new(172, 16, 8, 1));
        assert_eq!(pool.allocate("a").unwrap(), Ipv4Addr::new(172, 16, 8, 2));

        let net = pool.server_net().unwrap();
        assert_eq!(net.prefix_len(), 22);
        assert_eq!(net.addr(), Ipv4Addr::new(172, 16, 8, 1));
    }
}
