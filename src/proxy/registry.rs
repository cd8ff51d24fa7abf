//! Process-wide table of backends.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use tokio::sync::RwLock;

use super::backend::{split_target, Backend, LocalBackend, RemoteBackend, DIAL_TIMEOUT};
use crate::transport::TlsMaterial;
use crate::wire::Status;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("a local backend is already registered for prefix {0:?}")]
    DuplicatePrefix(String),
    #[error("local backend prefix must not be empty")]
    EmptyPrefix,
}

/// Local backends by service prefix plus remote backends created on demand.
pub struct BackendRegistry {
    node_id: String,
    peer_port: u16,
    tls: Option<TlsMaterial>,
    dial_timeout: Duration,
    locals: Vec<Arc<LocalBackend>>,
    /// Keyed by the `(host, port)` a target resolves to.
    remotes: RwLock<HashMap<(String, u16), Arc<RemoteBackend>>>,
}

impl BackendRegistry {
    /// `node_id` is reported as `proxyfrom` when a caller's authority is
    /// unknown; `peer_port` is used for targets named without a port.
    pub fn new(node_id: impl Into<String>, peer_port: u16, tls: Option<TlsMaterial>) -> Self {
        Self {
            node_id: node_id.into(),
            peer_port,
            tls,
            dial_timeout: DIAL_TIMEOUT,
            locals: Vec::new(),
            remotes: RwLock::new(HashMap::new()),
        }
    }

    /// Applies to backends created afterwards.
    pub fn set_dial_timeout(&mut self, timeout: Duration) {
        self.dial_timeout = timeout;
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Registers the backend for every method starting with `prefix`.
    pub fn register_local(&mut self, prefix: &str, socket_path: impl Into<PathBuf>) -> Result<(), RegistryError> {
        if prefix.is_empty() {
            return Err(RegistryError::EmptyPrefix);
        }
        if self.locals.iter().any(|local| local.prefix() == prefix) {
            return Err(RegistryError::DuplicatePrefix(prefix.to_owned()));
        }

        let backend = LocalBackend::new(prefix, socket_path, self.node_id.clone()).with_dial_timeout(self.dial_timeout);
        info!(
            "local backend {} -> {}",
            backend.prefix(),
            backend.socket_path().display()
        );
        self.locals.push(Arc::new(backend));
        // Longest prefix first so lookups take the most specific match.
        self.locals.sort_by(|a, b| b.prefix().len().cmp(&a.prefix().len()));
        Ok(())
    }

    /// Local backend serving `method`, if any.
    pub fn local_backend(&self, method: &str) -> Option<Arc<LocalBackend>> {
        self.locals.iter().find(|local| local.handles(method)).cloned()
    }

    /// Remote backend for `target`, named as the caller named it. Targets
    /// that resolve to the same host and port share one connection.
    pub async fn remote_backend(&self, target: &str) -> Result<Arc<RemoteBackend>, Status> {
        let key = split_target(target, self.peer_port)
            .ok_or_else(|| Status::invalid_argument(format!("invalid target {:?}", target)))?;

        let existing = self.remotes.read().await.get(&key).cloned();
        let backend = match existing {
            Some(backend) => backend,
            None => {
                let mut remotes = self.remotes.write().await;
                match remotes.get(&key) {
                    Some(backend) => Arc::clone(backend),
                    None => {
                        let backend = Arc::new(
                            RemoteBackend::new(target, self.peer_port, self.tls.clone(), self.node_id.clone())?
                                .with_dial_timeout(self.dial_timeout),
                        );
                        debug!("created remote backend for {}:{}", key.0, key.1);
                        remotes.insert(key, Arc::clone(&backend));
                        backend
                    }
                }
            }
        };

        if backend.target() == target {
            Ok(backend)
        } else {
            Ok(Arc::new(backend.renamed(target)))
        }
    }

    pub async fn remote_count(&self) -> usize {
        self.remotes.read().await.len()
    }

    /// Drops every remote backend and closes its connection.
    pub async fn flush(&self) {
        let remotes: Vec<_> = self.remotes.write().await.drain().map(|(_, b)| b).collect();
        for remote in remotes {
            Backend::Remote(remote).close().await;
        }
    }

    /// Closes connections idle for at least `idle` and forgets remote
    /// backends left without a connection or a caller. Returns how many
    /// connections were closed.
    pub async fn reap_idle(&self, idle: Duration) -> usize {
        let mut backends: Vec<Backend> = self.locals.iter().cloned().map(Backend::Local).collect();
        backends.extend(self.remotes.read().await.values().cloned().map(Backend::Remote));

        let mut closed = 0;
        let mut unconnected = Vec::new();
        for backend in backends {
            if backend.reap_idle(idle).await {
                debug!("closed idle connection to {:?}", backend);
                closed += 1;
            }
            if let Backend::Remote(remote) = &backend {
                if !remote.is_connected().await {
                    unconnected.push(remote.target().to_owned());
                }
            }
        }

        if !unconnected.is_empty() {
            let mut remotes = self.remotes.write().await;
            remotes.retain(|_, remote| {
                let forget = remote.is_unused() && unconnected.iter().any(|target| target == remote.target());
                if forget {
                    debug!("forgot remote backend {}", remote.target());
                }
                !forget
            });
        }
        closed
    }

    /// Runs [`reap_idle`](Self::reap_idle) every `idle / 2` until `ctx` is cancelled.
    pub async fn run_reaper(self: Arc<Self>, idle: Duration, ctx: crate::cancel::Context) {
        let period = (idle / 2).max(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = ctx.cancelled() => return,
                _ = tokio::time::sleep(period) => {}
            }
            self.reap_idle(idle).await;
        }
    }

    pub async fn close(&self) {
        for local in &self.locals {
            Backend::Local(Arc::clone(local)).close().await;
        }
        self.flush().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_prefix_is_rejected() {
        let mut registry = BackendRegistry::new("self", 50000, None);
        registry.register_local("/machine.", "/run/machined.sock").unwrap();

        assert!(matches!(
            registry.register_local("/machine.", "/run/other.sock"),
            Err(RegistryError::DuplicatePrefix(_))
        ));
        assert!(matches!(
            registry.register_local("", "/run/other.sock"),
            Err(RegistryError::EmptyPrefix)
        ));
    }

    #[test]
    fn longest_prefix_wins() {
        let mut registry = BackendRegistry::new("self", 50000, None);
        registry.register_local("/machine.", "/run/machined.sock").unwrap();
        registry
            .register_local("/machine.MachineService/Etcd", "/run/etcd.sock")
            .unwrap();

        let etcd = registry.local_backend("/machine.MachineService/EtcdMembers").unwrap();
        assert_eq!(etcd.prefix(), "/machine.MachineService/Etcd");

        let other = registry.local_backend("/machine.MachineService/Version").unwrap();
        assert_eq!(other.prefix(), "/machine.");

        assert!(registry.local_backend("/storage.StorageService/Disks").is_none());
    }

    #[tokio::test]
    async fn remote_backends_are_shared_per_target() {
        let registry = BackendRegistry::new("self", 50000, None);

        let a = registry.remote_backend("10.0.0.1").await.unwrap();
        let b = registry.remote_backend("10.0.0.1").await.unwrap();
        let c = registry.remote_backend("10.0.0.2").await.unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(registry.remote_count().await, 2);

        registry.flush().await;
        assert_eq!(registry.remote_count().await, 0);
    }

    #[tokio::test]
    async fn spellings_of_one_peer_share_an_entry() {
        let registry = BackendRegistry::new("self", 50000, None);

        let bare = registry.remote_backend("10.0.0.1").await.unwrap();
        let with_port = registry.remote_backend("10.0.0.1:50000").await.unwrap();
        let other_port = registry.remote_backend("10.0.0.1:50001").await.unwrap();

        assert_eq!(registry.remote_count().await, 2);
        // Each keeps the name the caller used.
        assert_eq!(bare.target(), "10.0.0.1");
        assert_eq!(with_port.target(), "10.0.0.1:50000");
        assert_eq!(other_port.port(), 50001);
    }

    #[tokio::test]
    async fn reaper_forgets_unused_remotes() {
        let registry = BackendRegistry::new("self", 50000, None);

        let held = registry.remote_backend("10.0.0.1").await.unwrap();
        registry.remote_backend("10.0.0.2").await.unwrap();
        registry.remote_backend("10.0.0.3:6000").await.unwrap();
        assert_eq!(registry.remote_count().await, 3);

        assert_eq!(registry.reap_idle(Duration::ZERO).await, 0);
        assert_eq!(registry.remote_count().await, 1);

        drop(held);
        registry.reap_idle(Duration::ZERO).await;
        assert_eq!(registry.remote_count().await, 0);
    }

    #[tokio::test]
    async fn invalid_target_is_rejected() {
        let registry = BackendRegistry::new("self", 50000, None);
        let err = registry.remote_backend("not a host").await.unwrap_err();
        assert_eq!(err.code, crate::wire::Code::InvalidArgument);
    }
}
