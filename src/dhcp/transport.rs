//! UDP transport bound to one link.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::Path;

use async_trait::async_trait;
use log::debug;
use nix::errno::Errno;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use super::client::{DhcpError, Destination, Transport};
use super::packet::{Message, CLIENT_PORT, SERVER_PORT};

const RECV_BUFFER: usize = 1500;

/// Broadcast-capable UDP socket on port 68, pinned to one interface.
pub struct UdpTransport {
    link: String,
    link_index: u32,
    mac: [u8; 6],
    socket: UdpSocket,
    buf: Vec<u8>,
}

impl UdpTransport {
    pub fn bind(link: &str) -> Result<Self, DhcpError> {
        let link_index = nix::net::if_::if_nametoindex(link).map_err(|_| DhcpError::LinkGone(link.to_owned()))?;
        let mac = read_hardware_addr(link)?;

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_broadcast(true)?;
        socket.bind_device(Some(link.as_bytes()))?;
        socket.set_nonblocking(true)?;
        socket.bind(&SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, CLIENT_PORT)).into())?;
        let socket = UdpSocket::from_std(socket.into())?;

        debug!(
            "{}: DHCP socket ready (index {}, hwaddr {})",
            link,
            link_index,
            hex::encode(mac)
        );
        Ok(Self {
            link: link.to_owned(),
            link_index,
            mac,
            socket,
            buf: vec![0; RECV_BUFFER],
        })
    }

    fn map_io(&self, e: io::Error) -> DhcpError {
        match e.raw_os_error().map(Errno::from_raw) {
            Some(Errno::ENODEV | Errno::ENXIO | Errno::ENETDOWN) => DhcpError::LinkGone(self.link.clone()),
            _ => DhcpError::Io(e),
        }
    }
}

#[async_trait]
impl Transport for UdpTransport {
    fn hardware_addr(&self) -> [u8; 6] {
        self.mac
    }

    fn link_index(&self) -> u32 {
        self.link_index
    }

    async fn send(&mut self, message: &Message, to: Destination) -> Result<(), DhcpError> {
        let ip = match to {
            Destination::Broadcast => Ipv4Addr::BROADCAST,
            Destination::Unicast(ip) => ip,
        };
        let encoded = message.encode();
        self.socket
            .send_to(&encoded, SocketAddrV4::new(ip, SERVER_PORT))
            .await
            .map_err(|e| self.map_io(e))?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Message, DhcpError> {
        loop {
            let (len, from) = match self.socket.recv_from(&mut self.buf).await {
                Ok(received) => received,
                Err(e) => return Err(self.map_io(e)),
            };
            match Message::decode(&self.buf[..len]) {
                Ok(message) if message.is_reply() => return Ok(message),
                Ok(_) => continue,
                Err(e) => {
                    debug!("{}: dropping undecodable packet from {}: {}", self.link, from, e);
                    continue;
                }
            }
        }
    }
}

/// Reads the interface's MAC address from sysfs.
fn read_hardware_addr(link: &str) -> Result<[u8; 6], DhcpError> {
    let path = Path::new("/sys/class/net").join(link).join("address");
    let text = std::fs::read_to_string(&path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => DhcpError::LinkGone(link.to_owned()),
        _ => DhcpError::Io(e),
    })?;
    parse_hardware_addr(&text).ok_or_else(|| {
        DhcpError::Io(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("{} has no ethernet address: {:?}", link, text.trim()),
        ))
    })
}

fn parse_hardware_addr(text: &str) -> Option<[u8; 6]> {
    let digits: String = text.trim().split(':').collect();
    hex::decode(digits).ok()?.try_into().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hardware_addr_is_parsed_from_sysfs_format() {
        assert_eq!(
            parse_hardware_addr("52:54:00:ab:cd:ef\n"),
            Some([0x52, 0x54, 0x00, 0xab, 0xcd, 0xef])
        );
        assert_eq!(parse_hardware_addr("00:00:00:00:00:00:00:00"), None);
        assert_eq!(parse_hardware_addr("not a mac"), None);
    }

    #[test]
    fn missing_link_is_reported_as_gone() {
        assert!(matches!(
            UdpTransport::bind("nodeproxy-test-missing0"),
            Err(DhcpError::LinkGone(_))
        ));
    }
}
