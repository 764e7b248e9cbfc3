//! Data structures exchanged between the plugin and the remote daemon.
//!
//! These types are serialised using [`serde`](https://serde.rs/) into the
//! JSON result envelope the container runtime expects from an IPAM plugin.
//! The daemon builds a [`DelegationResult`] for every successful `add`, the
//! plugin decodes it and prints it back to the runtime without touching the
//! addresses, routes or DNS block.

use std::net::IpAddr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

/// Result schema versions this plugin understands.
pub const SUPPORTED_VERSIONS: &[&str] = &["0.3.0", "0.3.1", "0.4.0"];

/// The outcome of a successful `add`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegationResult {
    /// Schema version of this envelope. Stamped by whoever emits it.
    #[serde(
        rename = "cniVersion",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub cni_version: Option<String>,
    /// Interfaces referenced by `ips[].interface`. The daemon sets none.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interfaces: Vec<Interface>,
    /// Allocated addresses, in allocation order.
    #[serde(default)]
    pub ips: Vec<IpConfig>,
    /// Routes the container should install.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<Route>,
    #[serde(default, skip_serializing_if = "DnsConfig::is_empty")]
    pub dns: DnsConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interface {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<String>,
}

/// A single allocated address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpConfig {
    /// `"4"` or `"6"`.
    pub version: String,
    /// Index into [`DelegationResult::interfaces`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<usize>,
    /// The address together with the prefix length of its subnet.
    pub address: IpNet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<IpAddr>,
}

impl IpConfig {
    pub fn new(address: IpNet, gateway: Option<IpAddr>) -> Self {
        let version = match address {
            IpNet::V4(_) => "4",
            IpNet::V6(_) => "6",
        };
        Self {
            version: version.into(),
            interface: None,
            address,
            gateway,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub dst: IpNet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gw: Option<IpAddr>,
}

/// Resolver settings handed to the container.
///
/// Built once from a `resolv.conf`-style file when the daemon starts and
/// treated as read-only afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nameservers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub search: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

impl DnsConfig {
    pub fn is_empty(&self) -> bool {
        self.nameservers.is_empty()
            && self.domain.is_none()
            && self.search.is_empty()
            && self.options.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_omits_empty_sections() {
        let result = DelegationResult {
            cni_version: None,
            interfaces: Vec::new(),
            ips: vec![IpConfig::new("10.0.0.2/24".parse().unwrap(), None)],
            routes: Vec::new(),
            dns: DnsConfig::default(),
        };

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "ips": [{ "version": "4", "address": "10.0.0.2/24" }]
            })
        );
    }

    #[test]
    fn result_decodes_full_envelope() {
        let body = r#"{
            "cniVersion": "0.4.0",
            "ips": [{ "version": "6", "address": "fd00::5/64", "gateway": "fd00::1" }],
            "routes": [{ "dst": "0.0.0.0/0", "gw": "10.0.0.1" }],
            "dns": { "nameservers": ["10.0.0.53"], "domain": "cluster.local" }
        }"#;

        let result: DelegationResult = serde_json::from_str(body).unwrap();
        assert_eq!(result.cni_version.as_deref(), Some("0.4.0"));
        assert_eq!(result.ips[0].version, "6");
        assert_eq!(result.ips[0].gateway, Some("fd00::1".parse().unwrap()));
        assert_eq!(result.routes[0].gw, Some("10.0.0.1".parse().unwrap()));
        assert_eq!(result.dns.nameservers, vec!["10.0.0.53"]);
        assert_eq!(result.dns.domain.as_deref(), Some("cluster.local"));
        assert!(result.dns.search.is_empty());
    }

    #[test]
    fn interfaces_survive_decode_and_encode() {
        let body = serde_json::json!({
            "cniVersion": "0.4.0",
            "interfaces": [{ "name": "eth0", "mac": "0a:58:0a:00:00:02", "sandbox": "/var/run/netns/abc" }],
            "ips": [{ "version": "4", "interface": 0, "address": "10.0.0.2/24" }]
        });

        let result: DelegationResult = serde_json::from_value(body.clone()).unwrap();
        assert_eq!(result.interfaces[0].name, "eth0");
        assert_eq!(result.ips[0].interface, Some(0));
        assert_eq!(serde_json::to_value(&result).unwrap(), body);
    }
}
