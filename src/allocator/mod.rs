//! Address allocation behind the delegation endpoint.
//!
//! The dispatcher never tracks addresses itself. For every request it asks an
//! [`AllocatorFactory`] for a short-lived [`IpAllocator`] bound to the range
//! set of the requested scope, and all allocation state lives in the shared
//! [`Store`](store::Store) behind that factory.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use ipnet::{IpAddrRange, IpNet, Ipv4AddrRange, Ipv6AddrRange};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::protocol::ContainerKey;
use crate::types::IpConfig;

pub mod disk;
pub mod range;
pub mod store;

pub use disk::DiskStore;
pub use range::RangeAllocator;
pub use store::{MemoryStore, Store, StoreError};

#[async_trait]
pub trait IpAllocator: Send + Sync {
    /// Allocate an address for `key`. With `requested` set exactly that
    /// address is reserved, otherwise the first free one is taken.
    async fn get(
        &self,
        key: &ContainerKey,
        requested: Option<IpAddr>,
    ) -> Result<IpConfig, AllocationError>;

    /// Release everything held by `key`.
    ///
    /// Fails with [`AllocationError::NotAllocated`] when `key` holds nothing.
    async fn release(&self, key: &ContainerKey) -> Result<(), AllocationError>;
}

/// Produces one allocator per request.
pub trait AllocatorFactory: Send + Sync + 'static {
    type Allocator: IpAllocator;

    fn allocator(&self, ranges: &RangeSet) -> Self::Allocator;
}

/// Hands out [`RangeAllocator`]s that all share one store and one lock.
#[derive(Clone)]
pub struct StoreAllocatorFactory {
    store: Arc<dyn Store>,
    lock: Arc<Mutex<()>>,
}

impl StoreAllocatorFactory {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            lock: Arc::new(Mutex::new(())),
        }
    }
}

impl AllocatorFactory for StoreAllocatorFactory {
    type Allocator = RangeAllocator;

    fn allocator(&self, ranges: &RangeSet) -> RangeAllocator {
        RangeAllocator::new(
            ranges.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.lock),
        )
    }
}

/// The ranges one scope allocates from, tried in order.
pub type RangeSet = Vec<Range>;

/// One subnet, optionally narrowed to `rangeStart..=rangeEnd`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Range {
    pub subnet: IpNet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range_start: Option<IpAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range_end: Option<IpAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<IpAddr>,
}

impl Range {
    pub fn new(subnet: IpNet) -> Self {
        Self {
            subnet,
            range_start: None,
            range_end: None,
            gateway: None,
        }
    }

    /// Check that the bounds and gateway belong to the subnet.
    pub fn validate(&self) -> Result<(), AllocationError> {
        self.bounds()?;
        if let Some(gateway) = self.gateway {
            if !self.subnet.contains(&gateway) {
                return Err(self.invalid(format!("gateway {gateway} outside of subnet")));
            }
        }
        Ok(())
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        match self.bounds() {
            Ok((start, end)) => {
                start <= ip && ip <= end && self.subnet.contains(&ip) && self.is_assignable(ip)
            }
            Err(_) => false,
        }
    }

    /// Addresses that may be handed out, in ascending order.
    pub fn candidates(&self) -> Result<impl Iterator<Item = IpAddr> + '_, AllocationError> {
        let (start, end) = self.bounds()?;
        let addrs = match (start, end) {
            (IpAddr::V4(start), IpAddr::V4(end)) => IpAddrRange::from(Ipv4AddrRange::new(start, end)),
            (IpAddr::V6(start), IpAddr::V6(end)) => IpAddrRange::from(Ipv6AddrRange::new(start, end)),
            _ => return Err(self.invalid("mixed address families".into())),
        };
        Ok(addrs.filter(move |ip| self.is_assignable(*ip)))
    }

    /// The result entry for `ip`, which must lie in this range.
    pub fn ip_config(&self, ip: IpAddr) -> Result<IpConfig, AllocationError> {
        let address = IpNet::new(ip, self.subnet.prefix_len())
            .map_err(|e| self.invalid(e.to_string()))?;
        Ok(IpConfig::new(address, self.gateway))
    }

    fn is_assignable(&self, ip: IpAddr) -> bool {
        if Some(ip) == self.gateway || ip == self.subnet.network() {
            return false;
        }
        match self.subnet {
            IpNet::V4(net) if net.prefix_len() < 31 => ip != IpAddr::V4(net.broadcast()),
            _ => true,
        }
    }

    fn bounds(&self) -> Result<(IpAddr, IpAddr), AllocationError> {
        let mut hosts = self.subnet.hosts();
        let first = hosts
            .next()
            .ok_or_else(|| self.invalid("subnet has no host addresses".into()))?;
        let last = hosts.next_back().unwrap_or(first);

        let start = self.range_start.unwrap_or(first);
        let end = self.range_end.unwrap_or(last);
        if !self.subnet.contains(&start) {
            return Err(self.invalid(format!("rangeStart {start} outside of subnet")));
        }
        if !self.subnet.contains(&end) {
            return Err(self.invalid(format!("rangeEnd {end} outside of subnet")));
        }
        if start > end {
            return Err(self.invalid(format!("rangeStart {start} after rangeEnd {end}")));
        }
        Ok((start, end))
    }

    fn invalid(&self, reason: String) -> AllocationError {
        AllocationError::InvalidRange {
            subnet: self.subnet,
            reason,
        }
    }
}

#[derive(Debug, Error)]
pub enum AllocationError {
    #[error("no free addresses left in range set")]
    Exhausted,
    #[error("requested address {0} is not in any configured range")]
    NotInRange(IpAddr),
    #[error("requested address {0} is already allocated")]
    AlreadyAllocated(IpAddr),
    #[error("no address is allocated to {0}")]
    NotAllocated(ContainerKey),
    #[error("invalid range {subnet}: {reason}")]
    InvalidRange { subnet: IpNet, reason: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(subnet: &str) -> Range {
        Range::new(subnet.parse().unwrap())
    }

    #[test]
    fn candidates_skip_network_broadcast_and_gateway() {
        let mut r = range("10.0.0.0/29");
        r.gateway = Some("10.0.0.1".parse().unwrap());

        let ips: Vec<IpAddr> = r.candidates().unwrap().collect();
        let expected: Vec<IpAddr> = ["10.0.0.2", "10.0.0.3", "10.0.0.4", "10.0.0.5", "10.0.0.6"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        assert_eq!(ips, expected);
    }

    #[test]
    fn candidates_honour_start_and_end() {
        let mut r = range("192.168.1.0/24");
        r.range_start = Some("192.168.1.100".parse().unwrap());
        r.range_end = Some("192.168.1.102".parse().unwrap());

        let ips: Vec<String> = r.candidates().unwrap().map(|ip| ip.to_string()).collect();
        assert_eq!(ips, vec!["192.168.1.100", "192.168.1.101", "192.168.1.102"]);
        assert!(r.contains("192.168.1.101".parse().unwrap()));
        assert!(!r.contains("192.168.1.99".parse().unwrap()));
    }

    #[test]
    fn explicit_range_end_never_hands_out_broadcast() {
        let mut r = range("10.0.0.0/24");
        r.range_start = Some("10.0.0.254".parse().unwrap());
        r.range_end = Some("10.0.0.255".parse().unwrap());
        assert!(r.validate().is_ok());

        let ips: Vec<String> = r.candidates().unwrap().map(|ip| ip.to_string()).collect();
        assert_eq!(ips, vec!["10.0.0.254"]);
        assert!(!r.contains("10.0.0.255".parse().unwrap()));
    }

    #[test]
    fn ipv6_candidates_skip_subnet_router_address() {
        let r = range("fd00::/126");
        let first = r.candidates().unwrap().next().unwrap();
        assert_eq!(first, "fd00::1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn validate_rejects_bounds_outside_subnet() {
        let mut r = range("10.0.0.0/24");
        r.range_start = Some("10.0.1.5".parse().unwrap());
        assert!(matches!(r.validate(), Err(AllocationError::InvalidRange { .. })));

        let mut r = range("10.0.0.0/24");
        r.range_start = Some("10.0.0.20".parse().unwrap());
        r.range_end = Some("10.0.0.10".parse().unwrap());
        assert!(r.validate().is_err());

        let mut r = range("10.0.0.0/24");
        r.gateway = Some("10.9.9.9".parse().unwrap());
        assert!(r.validate().is_err());
    }

    #[test]
    fn ip_config_uses_subnet_prefix() {
        let mut r = range("10.0.0.0/24");
        r.gateway = Some("10.0.0.1".parse().unwrap());

        let config = r.ip_config("10.0.0.7".parse().unwrap()).unwrap();
        assert_eq!(config.version, "4");
        assert_eq!(config.address.to_string(), "10.0.0.7/24");
        assert_eq!(config.gateway, r.gateway);
    }

    #[test]
    fn range_set_decodes_camel_case() {
        let json = r#"[{"subnet": "10.0.0.0/24", "rangeStart": "10.0.0.10", "gateway": "10.0.0.1"}]"#;
        let set: RangeSet = serde_json::from_str(json).unwrap();
        assert_eq!(set[0].range_start, Some("10.0.0.10".parse().unwrap()));
        assert_eq!(set[0].range_end, None);
    }
}
