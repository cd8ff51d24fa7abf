//! Upstreams a proxied call can be sent to.
//!
//! The set is closed: a local backend on a Unix socket, a remote peer proxy
//! reached over (m)TLS, and the loopback backend, which is the local backend
//! acting as one peer of a fan-out call. Each backend lazily dials one
//! multiplexed connection and shares it between callers.

use std::fmt;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use log::{debug, info};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::Mutex;

use crate::transport::tls::server_name;
use crate::transport::{Connection, TlsMaterial};
use crate::wire::metadata::{AUTHORITY, NODE, NODES, PROXY_FROM};
use crate::wire::{Metadata, PeerTag, Status};

/// Fixed dial timeout for every backend.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Builds the metadata forwarded upstream: routing headers are stripped and
/// `proxyfrom` marks the call as already proxied.
pub fn outgoing_metadata(incoming: &Metadata, node_id: &str) -> Metadata {
    let mut md = incoming.clone();
    let from = md
        .get(AUTHORITY)
        .filter(|authority| !authority.is_empty())
        .unwrap_or(node_id)
        .to_owned();

    md.remove(AUTHORITY);
    md.remove(NODES);
    md.remove(NODE);
    md.set(PROXY_FROM, [from]);
    md
}

#[derive(Default)]
struct SharedConnection {
    conn: Mutex<Option<Connection>>,
}

impl SharedConnection {
    async fn get_or_dial<F, Fut>(&self, dial: F) -> Result<Connection, Status>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Connection, Status>>,
    {
        let mut slot = self.conn.lock().await;
        if let Some(conn) = slot.as_ref() {
            if !conn.is_closed() {
                return Ok(conn.clone());
            }
        }
        let conn = dial().await?;
        *slot = Some(conn.clone());
        Ok(conn)
    }

    async fn close_if_idle(&self, idle: Duration) -> bool {
        let mut slot = self.conn.lock().await;
        match slot.as_ref() {
            Some(conn) if conn.is_closed() || conn.is_idle_for(idle) => {
                conn.close();
                *slot = None;
                true
            }
            _ => false,
        }
    }

    async fn close(&self) {
        if let Some(conn) = self.conn.lock().await.take() {
            conn.close();
        }
    }
}

async fn with_dial_timeout<T, F>(what: &str, timeout: Duration, connect: F) -> Result<T, Status>
where
    F: Future<Output = std::io::Result<T>>,
{
    match tokio::time::timeout(timeout, connect).await {
        Ok(Ok(io)) => Ok(io),
        Ok(Err(e)) => Err(Status::unavailable(format!("failed to dial {}: {}", what, e))),
        Err(_) => Err(Status::unavailable(format!(
            "failed to dial {}: timed out after {:?}",
            what, timeout
        ))),
    }
}

/// Serves every method under one service prefix from a Unix socket.
pub struct LocalBackend {
    prefix: String,
    socket_path: PathBuf,
    node_id: String,
    dial_timeout: Duration,
    shared: SharedConnection,
}

impl LocalBackend {
    pub fn new(prefix: impl Into<String>, socket_path: impl Into<PathBuf>, node_id: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            socket_path: socket_path.into(),
            node_id: node_id.into(),
            dial_timeout: DIAL_TIMEOUT,
            shared: SharedConnection::default(),
        }
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn handles(&self, method: &str) -> bool {
        method.starts_with(&self.prefix)
    }

    async fn connection(&self) -> Result<Connection, Status> {
        self.shared
            .get_or_dial(|| async {
                let what = self.socket_path.display().to_string();
                let stream = with_dial_timeout(&what, self.dial_timeout, UnixStream::connect(&self.socket_path)).await?;
                debug!("connected to local backend {} at {}", self.prefix, what);
                Ok(Connection::new(stream, what))
            })
            .await
    }
}

/// A peer proxy on another node.
pub struct RemoteBackend {
    target: String,
    host: String,
    port: u16,
    node_id: String,
    tls: Option<TlsMaterial>,
    dial_timeout: Duration,
    shared: Arc<SharedConnection>,
}

impl std::fmt::Debug for RemoteBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteBackend")
            .field("target", &self.target)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("node_id", &self.node_id)
            .finish_non_exhaustive()
    }
}

impl RemoteBackend {
    /// Validates `target` (`host`, `ip`, `host:port`, `[ipv6]:port`) and
    /// prepares a backend for it. Nothing is dialled yet.
    pub fn new(
        target: &str,
        default_port: u16,
        tls: Option<TlsMaterial>,
        node_id: impl Into<String>,
    ) -> Result<Self, Status> {
        let (host, port) = split_target(target, default_port)
            .ok_or_else(|| Status::invalid_argument(format!("invalid target {:?}", target)))?;

        Ok(Self {
            target: target.to_owned(),
            host,
            port,
            node_id: node_id.into(),
            tls,
            dial_timeout: DIAL_TIMEOUT,
            shared: Arc::default(),
        })
    }

    /// The same peer under the name `target`, sharing its connection.
    pub fn renamed(&self, target: &str) -> Self {
        Self {
            target: target.to_owned(),
            host: self.host.clone(),
            port: self.port,
            node_id: self.node_id.clone(),
            tls: self.tls.clone(),
            dial_timeout: self.dial_timeout,
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub(crate) async fn is_connected(&self) -> bool {
        self.shared
            .conn
            .lock()
            .await
            .as_ref()
            .is_some_and(|conn| !conn.is_closed())
    }

    /// No call holds this backend or a renamed copy of it.
    pub(crate) fn is_unused(self: &Arc<Self>) -> bool {
        Arc::strong_count(self) == 1 && Arc::strong_count(&self.shared) == 1
    }

    async fn connection(&self) -> Result<Connection, Status> {
        self.shared
            .get_or_dial(|| async {
                let what = format!("{}:{}", self.host, self.port);
                let stream = with_dial_timeout(
                    &what,
                    self.dial_timeout,
                    TcpStream::connect((self.host.as_str(), self.port)),
                )
                .await?;
                let _ = stream.set_nodelay(true);

                let conn = match &self.tls {
                    Some(tls) => {
                        let name = server_name(&self.host).map_err(|e| Status::invalid_argument(e.to_string()))?;
                        let stream = with_dial_timeout(&what, self.dial_timeout, tls.connector().connect(name, stream)).await?;
                        Connection::new(stream, self.target.clone())
                    }
                    None => Connection::new(stream, self.target.clone()),
                };
                info!("connected to peer {}", self.target);
                Ok(conn)
            })
            .await
    }
}

pub(crate) fn split_target(target: &str, default_port: u16) -> Option<(String, u16)> {
    let target = target.trim();
    if target.is_empty() || target.contains(char::is_whitespace) || target.contains('/') {
        return None;
    }
    if let Ok(ip) = target.parse::<IpAddr>() {
        return Some((ip.to_string(), default_port));
    }
    if let Ok(addr) = target.parse::<SocketAddr>() {
        return Some((addr.ip().to_string(), addr.port()));
    }
    if let Some(inner) = target.strip_prefix('[').and_then(|rest| rest.strip_suffix(']')) {
        return inner.parse::<IpAddr>().ok().map(|ip| (ip.to_string(), default_port));
    }
    match target.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && !host.contains(':') => {
            port.parse().ok().map(|port| (host.to_owned(), port))
        }
        Some(_) => None,
        None => Some((target.to_owned(), default_port)),
    }
}

/// The local backend reached as one peer of a fan-out call. Responses are
/// tagged with the target name the caller used.
#[derive(Clone)]
pub struct LoopbackBackend {
    target: String,
    local: Option<Arc<LocalBackend>>,
}

impl LoopbackBackend {
    pub fn new(target: impl Into<String>, local: Option<Arc<LocalBackend>>) -> Self {
        Self {
            target: target.into(),
            local,
        }
    }
}

#[derive(Clone)]
pub enum Backend {
    Local(Arc<LocalBackend>),
    Remote(Arc<RemoteBackend>),
    Loopback(LoopbackBackend),
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Local(local) => write!(f, "Local({})", local.prefix),
            Backend::Remote(remote) => write!(f, "Remote({})", remote.target),
            Backend::Loopback(loopback) => write!(f, "Loopback({})", loopback.target),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.target())
    }
}

impl Backend {
    /// Identity reported in peer tags.
    pub fn target(&self) -> &str {
        match self {
            Backend::Local(local) => &local.node_id,
            Backend::Remote(remote) => &remote.target,
            Backend::Loopback(loopback) => &loopback.target,
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Backend::Local(_))
    }

    /// Returns outgoing metadata and a live connection for one call.
    pub async fn get_connection(&self, incoming: &Metadata) -> Result<(Metadata, Connection), Status> {
        match self {
            Backend::Local(local) => {
                let md = outgoing_metadata(incoming, &local.node_id);
                Ok((md, local.connection().await?))
            }
            Backend::Remote(remote) => {
                let md = outgoing_metadata(incoming, &remote.node_id);
                Ok((md, remote.connection().await?))
            }
            Backend::Loopback(loopback) => {
                let local = loopback.local.as_ref().ok_or_else(|| {
                    Status::unimplemented(format!("no local backend on {}", loopback.target))
                })?;
                let md = outgoing_metadata(incoming, &local.node_id);
                Ok((md, local.connection().await?))
            }
        }
    }

    /// Tags a response frame with this backend's identity. Local backends
    /// only serve one-to-one calls, whose responses pass through untouched.
    pub fn append_info(&self, streaming: bool, frame: Bytes) -> Bytes {
        match self {
            Backend::Local(_) => frame,
            Backend::Remote(_) | Backend::Loopback(_) => PeerTag::new(self.target(), streaming).append_to(&frame),
        }
    }

    /// Builds an in-band error message for this backend.
    pub fn build_error(&self, streaming: bool, status: &Status) -> Bytes {
        PeerTag::failed(self.target(), streaming, status).append_to(&[])
    }

    /// Closes the connection if it has been idle for `idle`.
    pub async fn reap_idle(&self, idle: Duration) -> bool {
        match self {
            Backend::Local(local) => local.shared.close_if_idle(idle).await,
            Backend::Remote(remote) => remote.shared.close_if_idle(idle).await,
            Backend::Loopback(_) => false,
        }
    }

    pub async fn close(&self) {
        match self {
            Backend::Local(local) => local.shared.close().await,
            Backend::Remote(remote) => remote.shared.close().await,
            Backend::Loopback(_) => {}
        }
    }
}
