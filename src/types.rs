//! Data structures passed between the address sources and their consumers.
//!
//! Address sources (the DHCP clients and the static configuration) publish
//! [`NodeEvent`]s on a single channel.  The observer keeps the parts that say
//! which addresses and names mean "this node"; everything else is handed to
//! the network adapter.

use std::net::{IpAddr, Ipv4Addr};

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

/// A change reported by an address source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeEvent {
    /// The full set of addresses `source` currently holds.  Replaces whatever
    /// the same source reported before.
    Addresses {
        source: String,
        addresses: Vec<IpAddr>,
    },
    /// The node's short hostname and fully qualified name.
    Hostname { hostname: String, fqdn: String },
    /// Link configuration derived from a lease, for the network adapter.
    Network {
        link: String,
        config: Box<NetworkConfig>,
    },
}

/// Everything a lease asks the OS to configure on one link.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub address: Option<Ipv4Net>,
    pub routes: Vec<Route>,
    pub dns_servers: Vec<Ipv4Addr>,
    pub search_domains: Vec<String>,
    pub ntp_servers: Vec<Ipv4Addr>,
    pub mtu: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RouteScope {
    /// Reached through a gateway.
    Global,
    /// Directly reachable on the link.
    Link,
}

/// A route to install.  Routes without a gateway are link-scoped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub destination: Ipv4Net,
    pub gateway: Option<Ipv4Addr>,
    pub link: String,
    pub link_index: u32,
    pub metric: u32,
    pub scope: RouteScope,
}

impl Route {
    pub fn via(destination: Ipv4Net, gateway: Ipv4Addr, link: &str, link_index: u32, metric: u32) -> Self {
        Self {
            destination,
            gateway: Some(gateway),
            link: link.to_owned(),
            link_index,
            metric,
            scope: RouteScope::Global,
        }
    }

    pub fn on_link(destination: Ipv4Net, link: &str, link_index: u32, metric: u32) -> Self {
        Self {
            destination,
            gateway: None,
            link: link.to_owned(),
            link_index,
            metric,
            scope: RouteScope::Link,
        }
    }

    pub fn is_default(&self) -> bool {
        self.destination.prefix_len() == 0
    }
}
