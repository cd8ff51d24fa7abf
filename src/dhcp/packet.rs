//! DHCPv4 message codec (RFC 2131/2132) with the options this client uses.

use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;

use bytes::{Buf, BufMut, BytesMut};
use ipnet::Ipv4Net;

pub const SERVER_PORT: u16 = 67;
pub const CLIENT_PORT: u16 = 68;

const MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];
const FIXED_LEN: usize = 236;
const BROADCAST_FLAG: u16 = 0x8000;
const OP_REQUEST: u8 = 1;
const OP_REPLY: u8 = 2;
const HTYPE_ETHERNET: u8 = 1;
/// Smallest message most servers accept (RFC 2131 section 2).
const MIN_MESSAGE_LEN: usize = 300;
/// Advertised in option 57.
pub const MAX_MESSAGE_SIZE: u16 = 1500;

/// Option codes.
pub mod opt {
    pub const PAD: u8 = 0;
    pub const SUBNET_MASK: u8 = 1;
    pub const ROUTER: u8 = 3;
    pub const DNS_SERVERS: u8 = 6;
    pub const HOST_NAME: u8 = 12;
    pub const DOMAIN_NAME: u8 = 15;
    pub const INTERFACE_MTU: u8 = 26;
    pub const NTP_SERVERS: u8 = 42;
    pub const REQUESTED_IP: u8 = 50;
    pub const LEASE_TIME: u8 = 51;
    pub const MESSAGE_TYPE: u8 = 53;
    pub const SERVER_ID: u8 = 54;
    pub const PARAMETER_REQUEST: u8 = 55;
    pub const MAX_MESSAGE_SIZE: u8 = 57;
    pub const CLIENT_ID: u8 = 61;
    pub const DOMAIN_SEARCH: u8 = 119;
    pub const CLASSLESS_ROUTE: u8 = 121;
    pub const END: u8 = 255;
}

#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    #[error("message truncated")]
    Truncated,
    #[error("missing magic cookie")]
    BadCookie,
    #[error("option {code} is malformed")]
    BadOption { code: u8 },
    #[error("not a reply")]
    NotReply,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Discover,
    Offer,
    Request,
    Decline,
    Ack,
    Nak,
    Release,
    Inform,
}

impl MessageType {
    fn code(self) -> u8 {
        match self {
            MessageType::Discover => 1,
            MessageType::Offer => 2,
            MessageType::Request => 3,
            MessageType::Decline => 4,
            MessageType::Ack => 5,
            MessageType::Nak => 6,
            MessageType::Release => 7,
            MessageType::Inform => 8,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            1 => MessageType::Discover,
            2 => MessageType::Offer,
            3 => MessageType::Request,
            4 => MessageType::Decline,
            5 => MessageType::Ack,
            6 => MessageType::Nak,
            7 => MessageType::Release,
            8 => MessageType::Inform,
            _ => return None,
        })
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::Discover => "DISCOVER",
            MessageType::Offer => "OFFER",
            MessageType::Request => "REQUEST",
            MessageType::Decline => "DECLINE",
            MessageType::Ack => "ACK",
            MessageType::Nak => "NAK",
            MessageType::Release => "RELEASE",
            MessageType::Inform => "INFORM",
        };
        f.write_str(name)
    }
}

/// Raw option values keyed by code. Repeated options are concatenated
/// (RFC 3396).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Options(BTreeMap<u8, Vec<u8>>);

impl Options {
    pub fn get(&self, code: u8) -> Option<&[u8]> {
        self.0.get(&code).map(Vec::as_slice)
    }

    pub fn set(&mut self, code: u8, value: impl Into<Vec<u8>>) {
        self.0.insert(code, value.into());
    }

    pub fn remove(&mut self, code: u8) {
        self.0.remove(&code);
    }

    pub fn contains(&self, code: u8) -> bool {
        self.0.contains_key(&code)
    }

    fn extend(&mut self, code: u8, value: &[u8]) {
        self.0.entry(code).or_default().extend_from_slice(value);
    }

    fn encode(&self, buf: &mut BytesMut) {
        // Message type goes first; some servers insist on it.
        let ordered = self
            .0
            .get_key_value(&opt::MESSAGE_TYPE)
            .into_iter()
            .chain(self.0.iter().filter(|(code, _)| **code != opt::MESSAGE_TYPE));
        for (code, value) in ordered {
            if value.is_empty() {
                buf.put_u8(*code);
                buf.put_u8(0);
                continue;
            }
            for chunk in value.chunks(255) {
                buf.put_u8(*code);
                buf.put_u8(chunk.len() as u8);
                buf.put_slice(chunk);
            }
        }
        buf.put_u8(opt::END);
    }

    fn decode(mut data: &[u8]) -> Result<Self, PacketError> {
        let mut options = Options::default();
        while data.has_remaining() {
            let code = data.get_u8();
            match code {
                opt::PAD => continue,
                opt::END => break,
                _ => {}
            }
            if !data.has_remaining() {
                return Err(PacketError::BadOption { code });
            }
            let len = data.get_u8() as usize;
            if data.remaining() < len {
                return Err(PacketError::BadOption { code });
            }
            options.extend(code, &data[..len]);
            data.advance(len);
        }
        Ok(options)
    }

    fn addr(&self, code: u8) -> Result<Option<Ipv4Addr>, PacketError> {
        match self.get(code) {
            None => Ok(None),
            Some([a, b, c, d]) => Ok(Some(Ipv4Addr::new(*a, *b, *c, *d))),
            Some(_) => Err(PacketError::BadOption { code }),
        }
    }

    fn addrs(&self, code: u8) -> Result<Vec<Ipv4Addr>, PacketError> {
        match self.get(code) {
            None => Ok(Vec::new()),
            Some(value) if value.len() % 4 == 0 => Ok(value
                .chunks_exact(4)
                .map(|c| Ipv4Addr::new(c[0], c[1], c[2], c[3]))
                .collect()),
            Some(_) => Err(PacketError::BadOption { code }),
        }
    }

    fn string(&self, code: u8) -> Option<String> {
        self.get(code).map(|value| {
            String::from_utf8_lossy(value)
                .trim_end_matches('\0')
                .trim()
                .to_owned()
        })
    }
}

/// A DHCPv4 message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub op: u8,
    pub xid: u32,
    pub secs: u16,
    pub flags: u16,
    pub ciaddr: Ipv4Addr,
    pub yiaddr: Ipv4Addr,
    pub siaddr: Ipv4Addr,
    pub giaddr: Ipv4Addr,
    pub chaddr: [u8; 6],
    pub options: Options,
}

/// What a client asks for in DISCOVER and REQUEST messages.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Parameters {
    /// Option codes for the parameter request list.
    pub requested: Vec<u8>,
    /// Host name published with option 12.
    pub host_name: Option<String>,
    /// Domain published with option 15 alongside the host name.
    pub domain_name: Option<String>,
}

impl Message {
    fn client(kind: MessageType, xid: u32, chaddr: [u8; 6], params: &Parameters) -> Self {
        let mut options = Options::default();
        options.set(opt::MESSAGE_TYPE, [kind.code()]);

        let mut client_id = vec![HTYPE_ETHERNET];
        client_id.extend_from_slice(&chaddr);
        options.set(opt::CLIENT_ID, client_id);
        options.set(opt::MAX_MESSAGE_SIZE, MAX_MESSAGE_SIZE.to_be_bytes());
        if !params.requested.is_empty() {
            options.set(opt::PARAMETER_REQUEST, params.requested.clone());
        }
        if let Some(name) = params.host_name.as_deref().filter(|n| !n.is_empty()) {
            options.set(opt::HOST_NAME, name.as_bytes());
        }
        if let Some(domain) = params.domain_name.as_deref().filter(|d| !d.is_empty()) {
            options.set(opt::DOMAIN_NAME, domain.as_bytes());
        }

        Self {
            op: OP_REQUEST,
            xid,
            secs: 0,
            flags: BROADCAST_FLAG,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: Ipv4Addr::UNSPECIFIED,
            chaddr,
            options,
        }
    }

    pub fn discover(xid: u32, chaddr: [u8; 6], params: &Parameters) -> Self {
        Self::client(MessageType::Discover, xid, chaddr, params)
    }

    /// REQUEST in the SELECTING state, answering `offer`.
    pub fn request(xid: u32, chaddr: [u8; 6], offer: &Message, params: &Parameters) -> Self {
        let mut msg = Self::client(MessageType::Request, xid, chaddr, params);
        msg.options.set(opt::REQUESTED_IP, offer.yiaddr.octets());
        if let Ok(Some(server)) = offer.server_id() {
            msg.options.set(opt::SERVER_ID, server.octets());
        }
        msg
    }

    /// REQUEST in the RENEWING/REBINDING state: `ciaddr` carries the leased
    /// address and no server identifier is sent (RFC 2131 section 4.3.2).
    pub fn renew(xid: u32, chaddr: [u8; 6], leased: Ipv4Addr, params: &Parameters) -> Self {
        let mut msg = Self::client(MessageType::Request, xid, chaddr, params);
        msg.ciaddr = leased;
        msg.flags = 0;
        msg
    }

    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(MIN_MESSAGE_LEN);
        buf.put_u8(self.op);
        buf.put_u8(HTYPE_ETHERNET);
        buf.put_u8(self.chaddr.len() as u8);
        buf.put_u8(0);
        buf.put_u32(self.xid);
        buf.put_u16(self.secs);
        buf.put_u16(self.flags);
        buf.put_slice(&self.ciaddr.octets());
        buf.put_slice(&self.yiaddr.octets());
        buf.put_slice(&self.siaddr.octets());
        buf.put_slice(&self.giaddr.octets());
        buf.put_slice(&self.chaddr);
        buf.put_bytes(0, 16 - self.chaddr.len());
        // sname and file
        buf.put_bytes(0, 64 + 128);
        buf.put_slice(&MAGIC_COOKIE);
        self.options.encode(&mut buf);
        if buf.len() < MIN_MESSAGE_LEN {
            let pad = MIN_MESSAGE_LEN - buf.len();
            buf.put_bytes(opt::PAD, pad);
        }
        buf
    }

    pub fn decode(mut data: &[u8]) -> Result<Self, PacketError> {
        if data.len() < FIXED_LEN + MAGIC_COOKIE.len() {
            return Err(PacketError::Truncated);
        }
        let op = data.get_u8();
        let _htype = data.get_u8();
        let hlen = data.get_u8() as usize;
        let _hops = data.get_u8();
        let xid = data.get_u32();
        let secs = data.get_u16();
        let flags = data.get_u16();
        let ciaddr = Ipv4Addr::from(data.get_u32());
        let yiaddr = Ipv4Addr::from(data.get_u32());
        let siaddr = Ipv4Addr::from(data.get_u32());
        let giaddr = Ipv4Addr::from(data.get_u32());

        let mut chaddr = [0u8; 6];
        if hlen >= chaddr.len() {
            chaddr.copy_from_slice(&data[..6]);
        }
        data.advance(16 + 64 + 128);

        if data[..4] != MAGIC_COOKIE {
            return Err(PacketError::BadCookie);
        }
        data.advance(4);

        Ok(Self {
            op,
            xid,
            secs,
            flags,
            ciaddr,
            yiaddr,
            siaddr,
            giaddr,
            chaddr,
            options: Options::decode(data)?,
        })
    }

    pub fn is_reply(&self) -> bool {
        self.op == OP_REPLY
    }

    pub fn is_broadcast(&self) -> bool {
        self.flags & BROADCAST_FLAG != 0
    }

    pub fn message_type(&self) -> Option<MessageType> {
        match self.options.get(opt::MESSAGE_TYPE) {
            Some([code]) => MessageType::from_code(*code),
            _ => None,
        }
    }

    pub fn subnet_mask(&self) -> Result<Option<Ipv4Addr>, PacketError> {
        self.options.addr(opt::SUBNET_MASK)
    }

    pub fn server_id(&self) -> Result<Option<Ipv4Addr>, PacketError> {
        self.options.addr(opt::SERVER_ID)
    }

    pub fn routers(&self) -> Result<Vec<Ipv4Addr>, PacketError> {
        self.options.addrs(opt::ROUTER)
    }

    pub fn dns_servers(&self) -> Result<Vec<Ipv4Addr>, PacketError> {
        self.options.addrs(opt::DNS_SERVERS)
    }

    pub fn ntp_servers(&self) -> Result<Vec<Ipv4Addr>, PacketError> {
        self.options.addrs(opt::NTP_SERVERS)
    }

    pub fn host_name(&self) -> Option<String> {
        self.options.string(opt::HOST_NAME)
    }

    pub fn domain_name(&self) -> Option<String> {
        self.options.string(opt::DOMAIN_NAME)
    }

    pub fn lease_time(&self) -> Result<Option<u32>, PacketError> {
        match self.options.get(opt::LEASE_TIME) {
            None => Ok(None),
            Some([a, b, c, d]) => Ok(Some(u32::from_be_bytes([*a, *b, *c, *d]))),
            Some(_) => Err(PacketError::BadOption { code: opt::LEASE_TIME }),
        }
    }

    pub fn mtu(&self) -> Result<Option<u16>, PacketError> {
        match self.options.get(opt::INTERFACE_MTU) {
            None => Ok(None),
            Some([a, b]) => Ok(Some(u16::from_be_bytes([*a, *b]))),
            Some(_) => Err(PacketError::BadOption {
                code: opt::INTERFACE_MTU,
            }),
        }
    }

    pub fn classless_routes(&self) -> Result<Vec<(Ipv4Net, Ipv4Addr)>, PacketError> {
        match self.options.get(opt::CLASSLESS_ROUTE) {
            None => Ok(Vec::new()),
            Some(data) => parse_classless_routes(data),
        }
    }

    pub fn search_domains(&self) -> Result<Vec<String>, PacketError> {
        match self.options.get(opt::DOMAIN_SEARCH) {
            None => Ok(Vec::new()),
            Some(data) => parse_domain_search(data),
        }
    }
}

/// Decodes option 121: `width, significant destination octets, gateway`
/// repeated (RFC 3442).
pub fn parse_classless_routes(mut data: &[u8]) -> Result<Vec<(Ipv4Net, Ipv4Addr)>, PacketError> {
    let bad = PacketError::BadOption {
        code: opt::CLASSLESS_ROUTE,
    };
    let mut routes = Vec::new();
    while data.has_remaining() {
        let width = data.get_u8();
        if width > 32 {
            return Err(bad);
        }
        let significant = (width as usize).div_ceil(8);
        if data.remaining() < significant + 4 {
            return Err(bad);
        }

        let mut dest = [0u8; 4];
        dest[..significant].copy_from_slice(&data[..significant]);
        data.advance(significant);
        let gateway = Ipv4Addr::from(data.get_u32());

        let net = Ipv4Net::new(Ipv4Addr::from(dest), width).map_err(|_| PacketError::BadOption {
            code: opt::CLASSLESS_ROUTE,
        })?;
        routes.push((net.trunc(), gateway));
    }
    Ok(routes)
}

/// Encodes routes as option 121.
pub fn encode_classless_routes(routes: &[(Ipv4Net, Ipv4Addr)]) -> Vec<u8> {
    let mut out = Vec::new();
    for (net, gateway) in routes {
        let width = net.prefix_len();
        out.push(width);
        out.extend_from_slice(&net.network().octets()[..(width as usize).div_ceil(8)]);
        out.extend_from_slice(&gateway.octets());
    }
    out
}

/// Decodes option 119, a list of DNS names with RFC 1035 compression.
fn parse_domain_search(data: &[u8]) -> Result<Vec<String>, PacketError> {
    let bad = || PacketError::BadOption {
        code: opt::DOMAIN_SEARCH,
    };
    let mut names = Vec::new();
    let mut pos = 0;
    while pos < data.len() {
        let mut labels: Vec<String> = Vec::new();
        let mut cursor = pos;
        let mut next = None;
        let mut jumps = 0;
        loop {
            let len = *data.get(cursor).ok_or_else(bad)? as usize;
            if len == 0 {
                cursor += 1;
                break;
            }
            if len & 0xC0 == 0xC0 {
                let low = *data.get(cursor + 1).ok_or_else(bad)? as usize;
                next.get_or_insert(cursor + 2);
                cursor = ((len & 0x3F) << 8) | low;
                jumps += 1;
                if jumps > data.len() {
                    return Err(bad());
                }
                continue;
            }
            let label = data.get(cursor + 1..cursor + 1 + len).ok_or_else(bad)?;
            labels.push(String::from_utf8_lossy(label).into_owned());
            cursor += 1 + len;
        }
        pos = next.unwrap_or(cursor);
        if !labels.is_empty() {
            names.push(labels.join("."));
        }
    }
    Ok(names)
}
