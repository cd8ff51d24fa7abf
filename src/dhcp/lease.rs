//! Validated leases and what they turn into.

use std::net::Ipv4Addr;
use std::time::Duration;

use ipnet::Ipv4Net;

use super::packet::{Message, MessageType, PacketError};
use crate::types::{NetworkConfig, Route};

/// Shortest lease accepted.
pub const MIN_LEASE_SECS: u32 = 60;

/// Used when the server does not say.
pub const DEFAULT_LEASE_SECS: u32 = 30 * 60;

#[derive(Debug, thiserror::Error)]
pub enum LeaseError {
    #[error("expected an ACK, got {0:?}")]
    NotAck(Option<MessageType>),
    #[error("no address offered")]
    NoAddress,
    #[error("subnet mask {0} is not contiguous")]
    BadMask(Ipv4Addr),
    #[error("{address} is the network or broadcast address of {net}")]
    ReservedAddress { address: Ipv4Addr, net: Ipv4Net },
    #[error("lease of {0}s is shorter than {}s", MIN_LEASE_SECS)]
    TooShort(u32),
    #[error(transparent)]
    Malformed(#[from] PacketError),
}

/// A lease granted on one link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub your_ip: Ipv4Addr,
    pub subnet: Ipv4Net,
    pub server_ip: Ipv4Addr,
    pub routers: Vec<Ipv4Addr>,
    pub classless_routes: Vec<(Ipv4Net, Ipv4Addr)>,
    pub dns_servers: Vec<Ipv4Addr>,
    pub search_domains: Vec<String>,
    pub ntp_servers: Vec<Ipv4Addr>,
    pub host_name: Option<String>,
    pub domain_name: Option<String>,
    pub mtu: Option<u16>,
    pub lease_seconds: u32,
    pub ack: Message,
}

/// Routes configured locally on top of what the lease provides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticRoute {
    pub destination: Ipv4Net,
    pub gateway: Option<Ipv4Addr>,
}

/// Where the lease's routes go and how they are weighted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteTarget<'a> {
    pub link: &'a str,
    pub link_index: u32,
    pub metric: u32,
    pub static_metric: u32,
}

impl Lease {
    /// Validates an ACK and extracts the lease from it.
    pub fn from_ack(ack: Message) -> Result<Self, LeaseError> {
        match ack.message_type() {
            Some(MessageType::Ack) => {}
            other => return Err(LeaseError::NotAck(other)),
        }

        let your_ip = ack.yiaddr;
        if your_ip.is_unspecified() || your_ip.is_broadcast() {
            return Err(LeaseError::NoAddress);
        }

        let prefix_len = match ack.subnet_mask()? {
            Some(mask) => mask_prefix(mask).ok_or(LeaseError::BadMask(mask))?,
            None => classful_prefix(your_ip),
        };
        let subnet = Ipv4Net::new(your_ip, prefix_len).map_err(|_| LeaseError::NoAddress)?;
        if prefix_len < 31 && (your_ip == subnet.network() || your_ip == subnet.broadcast()) {
            return Err(LeaseError::ReservedAddress {
                address: your_ip,
                net: subnet.trunc(),
            });
        }

        let lease_seconds = ack.lease_time()?.unwrap_or(DEFAULT_LEASE_SECS);
        if lease_seconds < MIN_LEASE_SECS {
            return Err(LeaseError::TooShort(lease_seconds));
        }

        let server_ip = match ack.server_id()? {
            Some(server) => server,
            None => ack.siaddr,
        };

        Ok(Self {
            your_ip,
            subnet,
            server_ip,
            routers: ack.routers()?,
            classless_routes: ack.classless_routes()?,
            dns_servers: ack.dns_servers()?,
            search_domains: ack.search_domains()?,
            ntp_servers: ack.ntp_servers()?,
            host_name: ack.host_name().filter(|name| !name.is_empty()),
            domain_name: ack.domain_name().filter(|name| !name.is_empty()),
            mtu: ack.mtu()?,
            lease_seconds,
            ack,
        })
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs(u64::from(self.lease_seconds))
    }

    /// Routes to install, in order: the classless routes if the server sent
    /// any (routers are then ignored), else a default route per router, then
    /// the static routes.
    pub fn routes(&self, target: RouteTarget<'_>, static_routes: &[StaticRoute]) -> Vec<Route> {
        let RouteTarget {
            link,
            link_index,
            metric,
            static_metric,
        } = target;
        let mut routes = Vec::new();

        if !self.classless_routes.is_empty() {
            for (destination, gateway) in &self.classless_routes {
                routes.push(if gateway.is_unspecified() {
                    Route::on_link(*destination, link, link_index, metric)
                } else {
                    Route::via(*destination, *gateway, link, link_index, metric)
                });
            }
        } else {
            for router in &self.routers {
                routes.push(Route::via(Ipv4Net::default(), *router, link, link_index, metric));
                if !self.subnet.contains(router) {
                    routes.push(Route::on_link(Ipv4Net::from(*router), link, link_index, metric));
                }
            }
        }

        for route in static_routes {
            routes.push(match route.gateway {
                Some(gateway) => Route::via(route.destination, gateway, link, link_index, static_metric),
                None => Route::on_link(route.destination, link, link_index, static_metric),
            });
        }
        routes
    }

    /// Short host name and FQDN. Without a host name from the server one is
    /// made up from the address (`talos-10-0-0-5`).
    pub fn hostname(&self) -> (String, String) {
        let given = self
            .host_name
            .clone()
            .unwrap_or_else(|| synthesized_hostname(self.your_ip));
        let short = given.split('.').next().unwrap_or(&given).to_owned();

        let fqdn = match &self.domain_name {
            Some(domain) => format!("{}.{}", short, domain.trim_end_matches('.')),
            None => given,
        };
        (short, fqdn)
    }

    /// Link configuration to hand to the network adapter.
    pub fn network_config(&self, target: RouteTarget<'_>, static_routes: &[StaticRoute]) -> NetworkConfig {
        NetworkConfig {
            address: Some(self.subnet),
            routes: self.routes(target, static_routes),
            dns_servers: self.dns_servers.clone(),
            search_domains: self.search_domains.clone(),
            ntp_servers: self.ntp_servers.clone(),
            mtu: self.mtu,
        }
    }
}

pub fn synthesized_hostname(ip: Ipv4Addr) -> String {
    format!("talos-{}", ip.to_string().replace('.', "-"))
}

fn mask_prefix(mask: Ipv4Addr) -> Option<u8> {
    let bits = u32::from(mask);
    let len = bits.leading_ones();
    (bits.checked_shl(len).unwrap_or(0) == 0).then_some(len as u8)
}

fn classful_prefix(ip: Ipv4Addr) -> u8 {
    match ip.octets()[0] {
        0..=127 => 8,
        128..=191 => 16,
        _ => 24,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::dhcp::packet::{encode_classless_routes, opt, Parameters};
    use crate::types::RouteScope;

    const TARGET: RouteTarget<'static> = RouteTarget {
        link: "eth0",
        link_index: 2,
        metric: 1024,
        static_metric: 2048,
    };

    pub(crate) fn ack(your_ip: [u8; 4]) -> Message {
        let mut msg = Message::discover(1, [0, 1, 2, 3, 4, 5], &Parameters::default());
        msg.op = 2;
        msg.yiaddr = Ipv4Addr::from(your_ip);
        msg.options.set(opt::MESSAGE_TYPE, [5]);
        msg.options.set(opt::SUBNET_MASK, [255, 255, 255, 0]);
        msg.options.set(opt::SERVER_ID, [your_ip[0], your_ip[1], your_ip[2], 1]);
        msg.options.set(opt::LEASE_TIME, 3600u32.to_be_bytes());
        msg
    }

    #[test]
    fn classless_routes_replace_routers() {
        let mut msg = ack([10, 0, 0, 5]);
        msg.options.set(
            opt::CLASSLESS_ROUTE,
            encode_classless_routes(&[("10.0.0.0/8".parse().unwrap(), Ipv4Addr::new(10, 128, 0, 1))]),
        );
        msg.options.set(opt::ROUTER, [192, 168, 1, 1]);
        msg.options.set(opt::DNS_SERVERS, [1, 1, 1, 1]);

        let lease = Lease::from_ack(msg).unwrap();
        let routes = lease.routes(TARGET, &[]);

        assert_eq!(
            routes,
            vec![Route::via(
                "10.0.0.0/8".parse().unwrap(),
                Ipv4Addr::new(10, 128, 0, 1),
                "eth0",
                2,
                1024
            )]
        );
        assert_eq!(lease.dns_servers, vec![Ipv4Addr::new(1, 1, 1, 1)]);
    }

    #[test]
    fn unspecified_classless_gateway_is_on_link() {
        let mut msg = ack([10, 0, 0, 5]);
        msg.options.set(
            opt::CLASSLESS_ROUTE,
            encode_classless_routes(&[("172.16.0.0/16".parse().unwrap(), Ipv4Addr::UNSPECIFIED)]),
        );

        let routes = Lease::from_ack(msg).unwrap().routes(TARGET, &[]);
        assert_eq!(routes[0].scope, RouteScope::Link);
        assert_eq!(routes[0].gateway, None);
    }

    #[test]
    fn routers_become_default_routes() {
        let mut msg = ack([192, 168, 1, 10]);
        msg.options.set(opt::ROUTER, [192, 168, 1, 1, 10, 9, 9, 9]);

        let routes = Lease::from_ack(msg).unwrap().routes(TARGET, &[]);

        assert_eq!(routes.len(), 3);
        assert!(routes[0].is_default());
        assert_eq!(routes[0].gateway, Some(Ipv4Addr::new(192, 168, 1, 1)));
        assert!(routes[1].is_default());
        assert_eq!(routes[1].gateway, Some(Ipv4Addr::new(10, 9, 9, 9)));
        // The second router is outside 192.168.1.0/24 and needs a host route.
        assert_eq!(routes[2].destination, "10.9.9.9/32".parse::<Ipv4Net>().unwrap());
        assert_eq!(routes[2].scope, RouteScope::Link);
    }

    #[test]
    fn static_routes_follow_with_their_own_metric() {
        let mut msg = ack([192, 168, 1, 10]);
        msg.options.set(opt::ROUTER, [192, 168, 1, 1]);
        let statics = [StaticRoute {
            destination: "10.10.0.0/16".parse().unwrap(),
            gateway: Some(Ipv4Addr::new(192, 168, 1, 254)),
        }];

        let routes = Lease::from_ack(msg).unwrap().routes(TARGET, &statics);
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].metric, 1024);
        assert_eq!(routes[1].metric, 2048);
        assert_eq!(routes[1].destination, "10.10.0.0/16".parse::<Ipv4Net>().unwrap());
    }

    #[test]
    fn hostname_is_synthesized_from_the_address() {
        let lease = Lease::from_ack(ack([10, 0, 0, 5])).unwrap();
        assert_eq!(lease.hostname(), ("talos-10-0-0-5".into(), "talos-10-0-0-5".into()));

        let mut msg = ack([10, 0, 0, 5]);
        msg.options.set(opt::DOMAIN_NAME, "example.com");
        let lease = Lease::from_ack(msg).unwrap();
        assert_eq!(
            lease.hostname(),
            ("talos-10-0-0-5".into(), "talos-10-0-0-5.example.com".into())
        );
    }

    #[test]
    fn empty_host_name_counts_as_missing() {
        let mut msg = ack([192, 168, 5, 7]);
        msg.options.set(opt::HOST_NAME, "");
        msg.options.set(opt::DOMAIN_NAME, "corp.lan");

        let (_, fqdn) = Lease::from_ack(msg).unwrap().hostname();
        assert_eq!(fqdn, "talos-192-168-5-7.corp.lan");
    }

    #[test]
    fn given_fqdn_is_split() {
        let mut msg = ack([10, 0, 0, 5]);
        msg.options.set(opt::HOST_NAME, "worker-1.lab.local");

        let lease = Lease::from_ack(msg).unwrap();
        assert_eq!(lease.hostname(), ("worker-1".into(), "worker-1.lab.local".into()));
    }

    #[test]
    fn short_leases_are_rejected() {
        let mut msg = ack([10, 0, 0, 5]);
        msg.options.set(opt::LEASE_TIME, 30u32.to_be_bytes());
        assert!(matches!(Lease::from_ack(msg), Err(LeaseError::TooShort(30))));

        let mut msg = ack([10, 0, 0, 5]);
        msg.options.remove(opt::LEASE_TIME);
        assert_eq!(Lease::from_ack(msg).unwrap().lease_seconds, DEFAULT_LEASE_SECS);
    }

    #[test]
    fn address_must_fit_the_mask() {
        let mut msg = ack([10, 0, 0, 5]);
        msg.options.set(opt::SUBNET_MASK, [255, 0, 255, 0]);
        assert!(matches!(Lease::from_ack(msg), Err(LeaseError::BadMask(_))));

        let msg = ack([192, 168, 1, 255]);
        assert!(matches!(
            Lease::from_ack(msg),
            Err(LeaseError::ReservedAddress { .. })
        ));

        let mut msg = ack([10, 0, 0, 1]);
        msg.options.set(opt::SUBNET_MASK, [255, 255, 255, 254]);
        assert!(Lease::from_ack(msg).is_ok());
    }

    #[test]
    fn missing_mask_falls_back_to_class() {
        let mut msg = ack([172, 20, 3, 4]);
        msg.options.remove(opt::SUBNET_MASK);
        assert_eq!(Lease::from_ack(msg).unwrap().subnet.prefix_len(), 16);
    }

    #[test]
    fn nak_is_not_a_lease() {
        let mut msg = ack([10, 0, 0, 5]);
        msg.options.set(opt::MESSAGE_TYPE, [6]);
        assert!(matches!(
            Lease::from_ack(msg),
            Err(LeaseError::NotAck(Some(MessageType::Nak)))
        ));
    }
}
