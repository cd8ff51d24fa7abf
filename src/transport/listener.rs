//! Accept loops feeding connections into [`serve_connection`].

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::net::{TcpListener, UnixListener};

use super::mux::{serve_connection, CallHandler, ConnInfo};
use super::tls::TlsMaterial;
use crate::cancel::Context;

/// Pause after a failed accept, e.g. while the process is out of descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum ListenError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("listener I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Waits for the next connection, logging and riding out accept errors.
/// `None` once `shutdown` is cancelled.
async fn next_conn<T, F, Fut>(mut accept: F, what: &str, shutdown: &Context) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<T>>,
{
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => return None,
            accepted = accept() => accepted,
        };
        match accepted {
            Ok(conn) => return Some(conn),
            Err(e) => {
                warn!("accept on {} failed: {}", what, e);
                tokio::select! {
                    _ = shutdown.cancelled() => return None,
                    _ = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                }
            }
        }
    }
}

/// TCP listener, optionally wrapped in mutual TLS.
pub struct NetworkListener {
    listener: TcpListener,
    tls: Option<TlsMaterial>,
}

impl NetworkListener {
    pub async fn bind(addr: SocketAddr, tls: Option<TlsMaterial>) -> Result<Self, ListenError> {
        let listener = TcpListener::bind(addr).await.map_err(|source| ListenError::Bind {
            addr: addr.to_string(),
            source,
        })?;
        Ok(Self { listener, tls })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until `shutdown` is cancelled.
    pub async fn serve(self, handler: Arc<dyn CallHandler>, shutdown: Context) -> Result<(), ListenError> {
        let local = self.listener.local_addr()?.to_string();
        info!(
            "listening on {} ({})",
            local,
            if self.tls.is_some() { "mTLS" } else { "plaintext" }
        );
        let acceptor = self.tls.as_ref().map(TlsMaterial::acceptor);

        while let Some((stream, remote_addr)) = next_conn(|| self.listener.accept(), &local, &shutdown).await {
            let _ = stream.set_nodelay(true);

            let conn = ConnInfo {
                remote_addr: Some(remote_addr),
                authority: stream.local_addr().ok().map(|addr| addr.ip().to_string()),
            };
            let handler = Arc::clone(&handler);
            let shutdown = shutdown.clone();
            let acceptor = acceptor.clone();

            tokio::spawn(async move {
                match acceptor {
                    Some(acceptor) => match acceptor.accept(stream).await {
                        Ok(stream) => serve_connection(stream, handler, conn, &shutdown).await,
                        Err(e) => warn!("TLS handshake with {} failed: {}", remote_addr, e),
                    },
                    None => serve_connection(stream, handler, conn, &shutdown).await,
                }
                debug!("connection from {} closed", remote_addr);
            });
        }
        Ok(())
    }
}

/// Unix socket listener for node-local callers and local backends.
pub struct SocketListener {
    listener: UnixListener,
    path: PathBuf,
}

impl SocketListener {
    /// Binds `path`, replacing a stale socket file left by a previous run.
    pub fn bind(path: &Path) -> Result<Self, ListenError> {
        if path.exists() {
            let _ = std::fs::remove_file(path);
        }
        let listener = UnixListener::bind(path).map_err(|source| ListenError::Bind {
            addr: path.display().to_string(),
            source,
        })?;
        Ok(Self {
            listener,
            path: path.to_owned(),
        })
    }

    pub async fn serve(self, handler: Arc<dyn CallHandler>, shutdown: Context) -> Result<(), ListenError> {
        let local = self.path.display().to_string();
        info!("listening on {}", local);
        while let Some((stream, _)) = next_conn(|| self.listener.accept(), &local, &shutdown).await {
            let handler = Arc::clone(&handler);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                serve_connection(stream, handler, ConnInfo::default(), &shutdown).await;
            });
        }
        let _ = std::fs::remove_file(&self.path);
        Ok(())
    }
}
