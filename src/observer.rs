//! Live view of the addresses and names that resolve to this node.
//!
//! The director asks [`LocalAddresses::is_local_target`] before fanning a call
//! out, so that a call aimed at the node itself is served locally instead of
//! looping back through the network.

use std::collections::{BTreeMap, BTreeSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, PoisonError, RwLock};

use log::{debug, info};

use crate::types::NodeEvent;

/// Source of the addresses and names configured at startup.
pub const STATIC_SOURCE: &str = "static";
/// Source of the hostname learned from a DHCP lease.
pub const DHCP_SOURCE: &str = "dhcp";

#[derive(Debug, Default)]
struct Snapshot {
    addresses: BTreeMap<String, BTreeSet<IpAddr>>,
    hostnames: BTreeMap<String, BTreeSet<String>>,
}

/// Shared handle; clones observe the same snapshot.
#[derive(Debug, Clone, Default)]
pub struct LocalAddresses {
    inner: Arc<RwLock<Snapshot>>,
}

impl LocalAddresses {
    pub fn new() -> Self {
        Self::default()
    }

    /// True iff `target` names one of this node's addresses or hostnames.
    /// `target` may be an IP, `ip:port`, `[ipv6]:port` or a hostname.
    pub fn is_local_target(&self, target: &str) -> bool {
        let snapshot = self.inner.read().unwrap_or_else(PoisonError::into_inner);

        if let Some(ip) = parse_ip(target) {
            return snapshot.addresses.values().any(|set| set.contains(&ip));
        }
        let host = normalize_host(target);
        snapshot.hostnames.values().any(|set| set.contains(&host))
    }

    /// Replaces the address set reported by `source`.
    pub fn set_addresses(&self, source: &str, addresses: impl IntoIterator<Item = IpAddr>) {
        let addresses: BTreeSet<IpAddr> = addresses.into_iter().collect();
        let mut snapshot = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if addresses.is_empty() {
            snapshot.addresses.remove(source);
        } else {
            snapshot.addresses.insert(source.to_owned(), addresses);
        }
    }

    /// Replaces the hostname set reported by `source`.
    pub fn set_hostnames<I, S>(&self, source: &str, names: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let hostnames: BTreeSet<String> = names
            .into_iter()
            .map(|name| normalize_host(name.as_ref()))
            .filter(|name| !name.is_empty())
            .collect();
        let mut snapshot = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if hostnames.is_empty() {
            snapshot.hostnames.remove(source);
        } else {
            snapshot.hostnames.insert(source.to_owned(), hostnames);
        }
    }

    pub fn addresses(&self) -> Vec<IpAddr> {
        let snapshot = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let all: BTreeSet<IpAddr> = snapshot.addresses.values().flatten().copied().collect();
        all.into_iter().collect()
    }

    pub fn hostnames(&self) -> Vec<String> {
        let snapshot = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let all: BTreeSet<&String> = snapshot.hostnames.values().flatten().collect();
        all.into_iter().cloned().collect()
    }

    /// Applies an event. Events that do not describe local identity are ignored.
    pub fn apply(&self, event: &NodeEvent) {
        match event {
            NodeEvent::Addresses { source, addresses } => {
                info!("local addresses from {}: {:?}", source, addresses);
                self.set_addresses(source, addresses.iter().copied());
            }
            NodeEvent::Hostname { hostname, fqdn } => {
                info!("local hostname {} ({})", hostname, fqdn);
                self.set_hostnames(DHCP_SOURCE, [hostname, fqdn]);
            }
            NodeEvent::Network { link, .. } => {
                debug!("observer ignoring network config for {}", link);
            }
        }
    }
}

fn parse_ip(target: &str) -> Option<IpAddr> {
    if let Ok(ip) = target.parse::<IpAddr>() {
        return Some(ip);
    }
    if let Ok(addr) = target.parse::<SocketAddr>() {
        return Some(addr.ip());
    }
    target
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .and_then(|inner| inner.parse().ok())
}

fn normalize_host(name: &str) -> String {
    let host = match name.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) && !host.contains(':') => host,
        _ => name,
    };
    host.trim_end_matches('.').to_ascii_lowercase()
}
