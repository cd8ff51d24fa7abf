//! DHCPv4 client state machine for one link.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use super::lease::{Lease, LeaseError, RouteTarget, StaticRoute};
use super::packet::{opt, Message, MessageType, PacketError, Parameters};
use crate::cancel::Context;
use crate::types::NodeEvent;

/// Attempts per discovery before giving up for this cycle.
pub const MAX_ATTEMPTS: u32 = 10;
/// Never wait less than this between cycles.
pub const MIN_RETRY_WAIT: Duration = Duration::from_secs(5);

const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(32);

pub const DEFAULT_ROUTE_METRIC: u32 = 1024;
pub const DEFAULT_STATIC_METRIC: u32 = 2048;

#[derive(Debug, thiserror::Error)]
pub enum DhcpError {
    #[error("no reply within {0:?}")]
    Timeout(Duration),
    #[error("server declined the request")]
    Nak,
    #[error("malformed reply: {0}")]
    Malformed(#[from] PacketError),
    #[error("lease rejected: {0}")]
    Rejected(#[from] LeaseError),
    #[error("link {0} is gone")]
    LinkGone(String),
    #[error("no lease to renew")]
    NoLease,
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: Box<DhcpError> },
    #[error("cancelled")]
    Cancelled,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl DhcpError {
    /// Errors the client cannot recover from by retrying.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DhcpError::LinkGone(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Init,
    Selecting,
    Requesting,
    Bound,
    Renewing,
    Rebinding,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    Broadcast,
    Unicast(Ipv4Addr),
}

/// Moves DHCP messages on one link.
#[async_trait]
pub trait Transport: Send {
    fn hardware_addr(&self) -> [u8; 6];

    fn link_index(&self) -> u32;

    async fn send(&mut self, message: &Message, to: Destination) -> Result<(), DhcpError>;

    /// Waits for the next message; the client applies its own timeout.
    async fn recv(&mut self) -> Result<Message, DhcpError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientOptions {
    pub link: String,
    pub platform: Option<String>,
    /// Platforms whose servers misbehave when the interface MTU is requested.
    pub mtu_suppressed_platforms: Vec<String>,
    pub route_metric: u32,
    pub static_metric: u32,
    pub static_routes: Vec<StaticRoute>,
    /// Host name to publish. When set, names are not requested from the server.
    pub hostname: Option<String>,
    pub skip_hostname_request: bool,
}

impl ClientOptions {
    pub fn new(link: impl Into<String>) -> Self {
        Self {
            link: link.into(),
            platform: None,
            mtu_suppressed_platforms: vec!["azure".into()],
            route_metric: DEFAULT_ROUTE_METRIC,
            static_metric: DEFAULT_STATIC_METRIC,
            static_routes: Vec::new(),
            hostname: None,
            skip_hostname_request: false,
        }
    }

    fn requests_mtu(&self) -> bool {
        match &self.platform {
            Some(platform) => !self
                .mtu_suppressed_platforms
                .iter()
                .any(|suppressed| suppressed.eq_ignore_ascii_case(platform)),
            None => true,
        }
    }

    /// A server asked for a name while one is sent back may just echo it,
    /// so the two never happen in the same exchange.
    fn requests_hostname(&self) -> bool {
        !self.skip_hostname_request && self.published_hostname().is_none()
    }

    fn published_hostname(&self) -> Option<&str> {
        self.hostname.as_deref().filter(|name| !name.is_empty())
    }

    fn parameters(&self) -> Parameters {
        let mut requested = vec![
            opt::SUBNET_MASK,
            opt::ROUTER,
            opt::CLASSLESS_ROUTE,
            opt::DNS_SERVERS,
            opt::DOMAIN_SEARCH,
            opt::NTP_SERVERS,
            opt::LEASE_TIME,
        ];
        if self.requests_mtu() {
            requested.push(opt::INTERFACE_MTU);
        }
        if self.requests_hostname() {
            requested.extend([opt::HOST_NAME, opt::DOMAIN_NAME]);
        }

        let (host_name, domain_name) = match self.published_hostname() {
            Some(name) => match name.split_once('.') {
                Some((short, domain)) => (Some(short.to_owned()), Some(domain.to_owned())),
                None => (Some(name.to_owned()), None),
            },
            None => (None, None),
        };

        Parameters {
            requested,
            host_name,
            domain_name,
        }
    }
}

/// Wait before the next cycle after a failure: half the previous wait, but
/// never below [`MIN_RETRY_WAIT`].
pub fn retry_wait(previous: Duration) -> Duration {
    (previous / 2).max(MIN_RETRY_WAIT)
}

pub struct Client<T> {
    options: ClientOptions,
    transport: T,
    state: watch::Sender<State>,
    lease: Option<Lease>,
    offer: Option<Message>,
    response_timeout: Duration,
}

impl<T: Transport> Client<T> {
    pub fn new(options: ClientOptions, transport: T) -> Self {
        let (state, _) = watch::channel(State::Init);
        Self {
            options,
            transport,
            state,
            lease: None,
            offer: None,
            response_timeout: RESPONSE_TIMEOUT,
        }
    }

    pub fn link(&self) -> &str {
        &self.options.link
    }

    pub fn state(&self) -> State {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<State> {
        self.state.subscribe()
    }

    pub fn lease(&self) -> Option<&Lease> {
        self.lease.as_ref()
    }

    fn set_state(&self, state: State) {
        self.state.send_replace(state);
    }

    /// Acquires a fresh lease: DISCOVER, OFFER, REQUEST, ACK.
    pub async fn discover(&mut self, ctx: &Context) -> Result<Lease, DhcpError> {
        let mut backoff = INITIAL_BACKOFF;
        let mut last = DhcpError::Timeout(self.response_timeout);

        for attempt in 1..=MAX_ATTEMPTS {
            match self.attempt(ctx).await {
                Ok(lease) => return Ok(lease),
                Err(e @ DhcpError::Cancelled) => return Err(e),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    debug!("{}: attempt {} failed: {}", self.options.link, attempt, e);
                    last = e;
                }
            }
            if attempt == MAX_ATTEMPTS {
                break;
            }
            tokio::select! {
                _ = ctx.cancelled() => return Err(DhcpError::Cancelled),
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }

        self.set_state(State::Init);
        Err(DhcpError::Exhausted {
            attempts: MAX_ATTEMPTS,
            last: Box::new(last),
        })
    }

    async fn attempt(&mut self, ctx: &Context) -> Result<Lease, DhcpError> {
        let xid = rand::random::<u32>();
        let mac = self.transport.hardware_addr();
        let params = self.options.parameters();

        let offer = match self.offer.take() {
            Some(offer) => {
                debug!("{}: re-requesting offer of {}", self.options.link, offer.yiaddr);
                offer
            }
            None => {
                self.set_state(State::Selecting);
                self.transport
                    .send(&Message::discover(xid, mac, &params), Destination::Broadcast)
                    .await?;
                debug!("{}: DHCP DISCOVER", self.options.link);
                self.await_reply(ctx, xid, &[MessageType::Offer]).await?
            }
        };
        debug!("{}: DHCP OFFER {}", self.options.link, offer.yiaddr);

        self.set_state(State::Requesting);
        let request = Message::request(xid, mac, &offer, &params);
        if let Err(e) = self.transport.send(&request, Destination::Broadcast).await {
            self.offer = Some(offer);
            return Err(e);
        }
        debug!("{}: DHCP REQUEST {}", self.options.link, offer.yiaddr);

        let reply = match self.await_reply(ctx, xid, &[MessageType::Ack, MessageType::Nak]).await {
            Ok(reply) => reply,
            Err(e @ DhcpError::Timeout(_)) => {
                self.offer = Some(offer);
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        self.bind(reply)
    }

    /// Extends the current lease with a unicast REQUEST to the server that
    /// granted it, falling back to a broadcast. On failure the lease is
    /// dropped so the next cycle starts over with a DISCOVER.
    pub async fn renew(&mut self, ctx: &Context) -> Result<Lease, DhcpError> {
        let Some(lease) = self.lease.clone() else {
            return Err(DhcpError::NoLease);
        };

        let result = self.renew_lease(ctx, &lease).await;
        if result.is_err() {
            self.lease = None;
            self.offer = None;
            self.set_state(State::Init);
        }
        result
    }

    async fn renew_lease(&mut self, ctx: &Context, lease: &Lease) -> Result<Lease, DhcpError> {
        let xid = rand::random::<u32>();
        let mac = self.transport.hardware_addr();
        let request = Message::renew(xid, mac, lease.your_ip, &self.options.parameters());
        let expected = [MessageType::Ack, MessageType::Nak];

        self.set_state(State::Renewing);
        let server = if lease.server_ip.is_unspecified() {
            Destination::Broadcast
        } else {
            Destination::Unicast(lease.server_ip)
        };
        self.transport.send(&request, server).await?;
        debug!("{}: DHCP RENEW {} via {:?}", self.options.link, lease.your_ip, server);

        let reply = match self.await_reply(ctx, xid, &expected).await {
            Err(DhcpError::Timeout(_)) if server != Destination::Broadcast => {
                self.set_state(State::Rebinding);
                self.transport.send(&request, Destination::Broadcast).await?;
                debug!("{}: DHCP REBIND {}", self.options.link, lease.your_ip);
                self.await_reply(ctx, xid, &expected).await?
            }
            reply => reply?,
        };
        self.bind(reply)
    }

    fn bind(&mut self, reply: Message) -> Result<Lease, DhcpError> {
        if reply.message_type() == Some(MessageType::Nak) {
            self.set_state(State::Init);
            return Err(DhcpError::Nak);
        }
        match Lease::from_ack(reply) {
            Ok(lease) => {
                self.set_state(State::Bound);
                self.lease = Some(lease.clone());
                Ok(lease)
            }
            Err(e) => {
                self.set_state(State::Init);
                Err(e.into())
            }
        }
    }

    async fn await_reply(&mut self, ctx: &Context, xid: u32, expected: &[MessageType]) -> Result<Message, DhcpError> {
        let deadline = Instant::now() + self.response_timeout;
        let mac = self.transport.hardware_addr();

        loop {
            let received = tokio::select! {
                _ = ctx.cancelled() => return Err(DhcpError::Cancelled),
                received = tokio::time::timeout_at(deadline, self.transport.recv()) => received,
            };
            let message = match received {
                Ok(message) => message?,
                Err(_) => return Err(DhcpError::Timeout(self.response_timeout)),
            };

            if !message.is_reply() || message.xid != xid || message.chaddr != mac {
                continue;
            }
            match message.message_type() {
                Some(kind) if expected.contains(&kind) => return Ok(message),
                other => debug!("{}: ignoring {:?} reply", self.options.link, other),
            }
        }
    }

    /// Keeps a lease on the link until `ctx` is cancelled, publishing every
    /// new lease on `events`. Returns an error only when the link is gone.
    pub async fn run(&mut self, ctx: &Context, events: &mpsc::Sender<NodeEvent>) -> Result<(), DhcpError> {
        let mut wait = Duration::ZERO;
        loop {
            let result = if self.lease.is_some() {
                self.renew(ctx).await
            } else {
                self.discover(ctx).await
            };

            match result {
                Ok(lease) => {
                    info!(
                        "{}: leased {} from {} for {}s",
                        self.options.link, lease.subnet, lease.server_ip, lease.lease_seconds
                    );
                    self.publish(&lease, events).await;
                    wait = lease.duration() / 2;
                }
                Err(DhcpError::Cancelled) => return Ok(()),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    wait = retry_wait(wait);
                    warn!("{}: {}; retrying in {:?}", self.options.link, e, wait);
                }
            }

            tokio::select! {
                _ = ctx.cancelled() => return Ok(()),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    async fn publish(&self, lease: &Lease, events: &mpsc::Sender<NodeEvent>) {
        let link = &self.options.link;
        let target = RouteTarget {
            link: link.as_str(),
            link_index: self.transport.link_index(),
            metric: self.options.route_metric,
            static_metric: self.options.static_metric,
        };

        let mut batch = vec![NodeEvent::Addresses {
            source: link.clone(),
            addresses: vec![IpAddr::V4(lease.your_ip)],
        }];
        if self.options.requests_hostname() {
            let (hostname, fqdn) = lease.hostname();
            batch.push(NodeEvent::Hostname { hostname, fqdn });
        }
        batch.push(NodeEvent::Network {
            link: link.clone(),
            config: Box::new(lease.network_config(target, &self.options.static_routes)),
        });

        for event in batch {
            if events.send(event).await.is_err() {
                debug!("{}: nobody is listening for lease events", link);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::dhcp::lease::tests::ack;
    use crate::types::NetworkConfig;

    const MAC: [u8; 6] = [0x52, 0x54, 0x00, 0xaa, 0xbb, 0xcc];

    type Server = Box<dyn FnMut(&Message, Destination) -> Option<Message> + Send + Sync>;

    struct MockTransport {
        sent: Arc<Mutex<Vec<(Message, Destination)>>>,
        replies: VecDeque<Message>,
        server: Server,
        gone: bool,
    }

    #[async_trait]
    impl Transport for MockTransport {
        fn hardware_addr(&self) -> [u8; 6] {
            MAC
        }

        fn link_index(&self) -> u32 {
            2
        }

        async fn send(&mut self, message: &Message, to: Destination) -> Result<(), DhcpError> {
            if self.gone {
                return Err(DhcpError::LinkGone("eth0".into()));
            }
            self.sent.lock().unwrap().push((message.clone(), to));
            if let Some(reply) = (self.server)(message, to) {
                self.replies.push_back(reply);
            }
            Ok(())
        }

        async fn recv(&mut self) -> Result<Message, DhcpError> {
            match self.replies.pop_front() {
                Some(reply) => Ok(reply),
                None => std::future::pending().await,
            }
        }
    }

    fn reply_to(request: &Message, kind: u8, your_ip: [u8; 4]) -> Message {
        let mut reply = ack(your_ip);
        reply.xid = request.xid;
        reply.chaddr = request.chaddr;
        reply.options.set(opt::MESSAGE_TYPE, [kind]);
        reply
    }

    /// Offers and acknowledges `your_ip`; `tweak` edits every ACK.
    fn server(your_ip: [u8; 4], tweak: impl Fn(&mut Message) + Send + Sync + 'static) -> Server {
        Box::new(move |msg: &Message, _: Destination| match msg.message_type() {
            Some(MessageType::Discover) => Some(reply_to(msg, 2, your_ip)),
            Some(MessageType::Request) => {
                let mut reply = reply_to(msg, 5, your_ip);
                tweak(&mut reply);
                Some(reply)
            }
            _ => None,
        })
    }

    fn new_client(options: ClientOptions, server: Server) -> (Client<MockTransport>, Arc<Mutex<Vec<(Message, Destination)>>>) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let transport = MockTransport {
            sent: Arc::clone(&sent),
            replies: VecDeque::new(),
            server,
            gone: false,
        };
        (Client::new(options, transport), sent)
    }

    fn requested(msg: &Message) -> Vec<u8> {
        msg.options.get(opt::PARAMETER_REQUEST).unwrap_or_default().to_vec()
    }

    #[tokio::test(start_paused = true)]
    async fn discover_binds_a_lease() {
        let (mut client, sent) = new_client(ClientOptions::new("eth0"), server([10, 0, 0, 5], |_| {}));

        let lease = client.discover(&Context::new()).await.unwrap();

        assert_eq!(lease.your_ip, Ipv4Addr::new(10, 0, 0, 5));
        assert_eq!(client.state(), State::Bound);
        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].0.message_type(), Some(MessageType::Discover));
        assert!(sent[0].0.is_broadcast());
        assert_eq!(sent[1].0.message_type(), Some(MessageType::Request));
        assert_eq!(sent[1].1, Destination::Broadcast);
    }

    #[tokio::test(start_paused = true)]
    async fn run_publishes_address_hostname_and_network() {
        let (mut client, _) = new_client(
            ClientOptions::new("eth0"),
            server([192, 168, 5, 7], |ack| {
                ack.options.set(opt::HOST_NAME, "");
                ack.options.set(opt::DOMAIN_NAME, "corp.lan");
                ack.options.set(opt::ROUTER, [192, 168, 5, 1]);
            }),
        );
        let ctx = Context::new();
        let (tx, mut rx) = mpsc::channel(8);

        let task_ctx = ctx.clone();
        let task = tokio::spawn(async move { client.run(&task_ctx, &tx).await });

        let addresses = rx.recv().await.unwrap();
        assert_eq!(
            addresses,
            NodeEvent::Addresses {
                source: "eth0".into(),
                addresses: vec!["192.168.5.7".parse().unwrap()],
            }
        );
        let hostname = rx.recv().await.unwrap();
        assert_eq!(
            hostname,
            NodeEvent::Hostname {
                hostname: "talos-192-168-5-7".into(),
                fqdn: "talos-192-168-5-7.corp.lan".into(),
            }
        );
        match rx.recv().await.unwrap() {
            NodeEvent::Network { link, config } => {
                assert_eq!(link, "eth0");
                let NetworkConfig { address, routes, .. } = *config;
                assert_eq!(address, Some("192.168.5.7/24".parse::<ipnet::Ipv4Net>().unwrap()));
                assert_eq!(routes.len(), 1);
                assert_eq!(routes[0].link_index, 2);
            }
            other => panic!("unexpected event {:?}", other),
        }

        ctx.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn mtu_is_not_requested_on_suppressed_platforms() {
        let mut options = ClientOptions::new("eth0");
        options.platform = Some("Azure".into());
        let (mut client, sent) = new_client(options, server([10, 0, 0, 5], |_| {}));
        client.discover(&Context::new()).await.unwrap();
        assert!(!requested(&sent.lock().unwrap()[0].0).contains(&opt::INTERFACE_MTU));

        let mut options = ClientOptions::new("eth0");
        options.platform = Some("metal".into());
        let (mut client, sent) = new_client(options, server([10, 0, 0, 5], |_| {}));
        client.discover(&Context::new()).await.unwrap();
        assert!(requested(&sent.lock().unwrap()[0].0).contains(&opt::INTERFACE_MTU));
    }

    #[tokio::test(start_paused = true)]
    async fn published_hostname_is_not_requested_back() {
        let mut options = ClientOptions::new("eth0");
        options.hostname = Some("node-a.lab.local".into());
        let (mut client, sent) = new_client(options, server([10, 0, 0, 5], |_| {}));
        client.discover(&Context::new()).await.unwrap();

        let sent = sent.lock().unwrap();
        let discover = &sent[0].0;
        assert_eq!(discover.host_name().as_deref(), Some("node-a"));
        assert_eq!(discover.domain_name().as_deref(), Some("lab.local"));
        assert!(!requested(discover).contains(&opt::HOST_NAME));
        assert!(!requested(discover).contains(&opt::DOMAIN_NAME));
    }

    #[tokio::test(start_paused = true)]
    async fn hostname_is_requested_when_none_is_published() {
        let (mut client, sent) = new_client(ClientOptions::new("eth0"), server([10, 0, 0, 5], |_| {}));
        client.discover(&Context::new()).await.unwrap();

        let sent = sent.lock().unwrap();
        assert!(sent[0].0.host_name().is_none());
        assert!(requested(&sent[0].0).contains(&opt::HOST_NAME));
    }

    #[tokio::test(start_paused = true)]
    async fn nak_starts_over_with_discover() {
        let mut naked = false;
        let (mut client, sent) = new_client(
            ClientOptions::new("eth0"),
            Box::new(move |msg: &Message, _: Destination| match msg.message_type() {
                Some(MessageType::Discover) => Some(reply_to(msg, 2, [10, 0, 0, 5])),
                Some(MessageType::Request) if !naked => {
                    naked = true;
                    Some(reply_to(msg, 6, [10, 0, 0, 5]))
                }
                Some(MessageType::Request) => Some(reply_to(msg, 5, [10, 0, 0, 5])),
                _ => None,
            }),
        );

        client.discover(&Context::new()).await.unwrap();

        let kinds: Vec<_> = sent.lock().unwrap().iter().map(|(m, _)| m.message_type()).collect();
        assert_eq!(
            kinds,
            [
                Some(MessageType::Discover),
                Some(MessageType::Request),
                Some(MessageType::Discover),
                Some(MessageType::Request),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_request_keeps_the_offer() {
        let mut requests = 0;
        let (mut client, sent) = new_client(
            ClientOptions::new("eth0"),
            Box::new(move |msg: &Message, _: Destination| match msg.message_type() {
                Some(MessageType::Discover) => Some(reply_to(msg, 2, [10, 0, 0, 5])),
                Some(MessageType::Request) => {
                    requests += 1;
                    (requests > 1).then(|| reply_to(msg, 5, [10, 0, 0, 5]))
                }
                _ => None,
            }),
        );

        client.discover(&Context::new()).await.unwrap();

        let discovers = sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, _)| m.message_type() == Some(MessageType::Discover))
            .count();
        assert_eq!(discovers, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn silence_exhausts_the_attempts() {
        let (mut client, sent) = new_client(ClientOptions::new("eth0"), Box::new(|_: &Message, _: Destination| None));

        let err = client.discover(&Context::new()).await.unwrap_err();

        assert!(matches!(err, DhcpError::Exhausted { attempts: MAX_ATTEMPTS, .. }));
        assert_eq!(sent.lock().unwrap().len(), MAX_ATTEMPTS as usize);
        assert_eq!(client.state(), State::Init);
    }

    #[tokio::test(start_paused = true)]
    async fn short_lease_is_rejected() {
        let (mut client, _) = new_client(
            ClientOptions::new("eth0"),
            server([10, 0, 0, 5], |ack| ack.options.set(opt::LEASE_TIME, 10u32.to_be_bytes())),
        );

        let err = client.discover(&Context::new()).await.unwrap_err();
        match err {
            DhcpError::Exhausted { last, .. } => assert!(matches!(*last, DhcpError::Rejected(_))),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn renew_is_unicast_to_the_server() {
        let (mut client, sent) = new_client(ClientOptions::new("eth0"), server([10, 0, 0, 5], |_| {}));
        let ctx = Context::new();
        client.discover(&ctx).await.unwrap();

        let lease = client.renew(&ctx).await.unwrap();

        assert_eq!(lease.your_ip, Ipv4Addr::new(10, 0, 0, 5));
        let sent = sent.lock().unwrap();
        let (renew, to) = sent.last().unwrap();
        assert_eq!(*to, Destination::Unicast(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(renew.ciaddr, Ipv4Addr::new(10, 0, 0, 5));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_renew_drops_the_lease() {
        let mut bound = false;
        let (mut client, sent) = new_client(
            ClientOptions::new("eth0"),
            Box::new(move |msg: &Message, _: Destination| match msg.message_type() {
                Some(MessageType::Discover) => Some(reply_to(msg, 2, [10, 0, 0, 5])),
                Some(MessageType::Request) if !bound => {
                    bound = true;
                    Some(reply_to(msg, 5, [10, 0, 0, 5]))
                }
                _ => None,
            }),
        );
        let ctx = Context::new();
        client.discover(&ctx).await.unwrap();

        let err = client.renew(&ctx).await.unwrap_err();

        assert!(matches!(err, DhcpError::Timeout(_)));
        assert!(client.lease().is_none());
        assert_eq!(client.state(), State::Init);
        // unicast renew, then broadcast rebind
        let sent = sent.lock().unwrap();
        let tail: Vec<_> = sent.iter().rev().take(2).map(|(_, to)| *to).collect();
        assert_eq!(tail, [Destination::Broadcast, Destination::Unicast(Ipv4Addr::new(10, 0, 0, 1))]);
    }

    #[tokio::test(start_paused = true)]
    async fn vanished_link_stops_the_loop() {
        let (mut client, _) = new_client(ClientOptions::new("eth0"), Box::new(|_: &Message, _: Destination| None));
        client.transport.gone = true;
        let (tx, _rx) = mpsc::channel(8);

        let err = client.run(&Context::new(), &tx).await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_ends_discovery() {
        let (mut client, _) = new_client(ClientOptions::new("eth0"), Box::new(|_: &Message, _: Destination| None));
        let ctx = Context::new();
        ctx.cancel();

        assert!(matches!(client.discover(&ctx).await, Err(DhcpError::Cancelled)));
    }

    #[test]
    fn retry_wait_halves_down_to_the_floor() {
        assert_eq!(retry_wait(Duration::from_secs(1800)), Duration::from_secs(900));
        assert_eq!(retry_wait(Duration::from_secs(8)), MIN_RETRY_WAIT);
        assert_eq!(retry_wait(Duration::ZERO), MIN_RETRY_WAIT);
    }
}
