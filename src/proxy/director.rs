//! Decides where a call goes.

use std::sync::Arc;

use log::debug;

use super::backend::{Backend, LoopbackBackend};
use super::registry::BackendRegistry;
use crate::observer::LocalAddresses;
use crate::wire::metadata::{NODE, PROXY_FROM};
use crate::wire::{Metadata, Status};

/// How responses are relayed back to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Exactly one upstream; frames and status pass through untouched.
    OneToOne,
    /// One upstream per target; every returned message carries a peer tag.
    OneToMany,
}

pub struct Director {
    registry: Arc<BackendRegistry>,
    observer: LocalAddresses,
}

impl Director {
    pub fn new(registry: Arc<BackendRegistry>, observer: LocalAddresses) -> Self {
        Self { registry, observer }
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    /// Returns the relay mode and the backends for a call.
    pub async fn direct(&self, method: &str, metadata: &Metadata) -> Result<(Mode, Vec<Backend>), Status> {
        // Calls forwarded by another proxy never leave this node again.
        if metadata.contains_key(PROXY_FROM) {
            return self.local(method);
        }

        let nodes = metadata.nodes();
        if nodes.is_empty() {
            return match metadata.get(NODE).map(str::trim).filter(|node| !node.is_empty()) {
                None => self.local(method),
                Some(node) if self.observer.is_local_target(node) => self.local(method),
                Some(node) => {
                    let remote = self.registry.remote_backend(node).await?;
                    debug!("{} -> {} (one-to-one)", method, node);
                    Ok((Mode::OneToOne, vec![Backend::Remote(remote)]))
                }
            };
        }

        if let [target] = nodes.as_slice() {
            if self.observer.is_local_target(target) {
                return self.local(method);
            }
        }

        let local = self.registry.local_backend(method);
        let mut backends = Vec::with_capacity(nodes.len());
        for target in &nodes {
            if self.observer.is_local_target(target) {
                backends.push(Backend::Loopback(LoopbackBackend::new(target.as_str(), local.clone())));
            } else {
                backends.push(Backend::Remote(self.registry.remote_backend(target).await?));
            }
        }
        debug!("{} -> {:?} (one-to-many)", method, nodes);
        Ok((Mode::OneToMany, backends))
    }

    fn local(&self, method: &str) -> Result<(Mode, Vec<Backend>), Status> {
        let local = self
            .registry
            .local_backend(method)
            .ok_or_else(|| Status::unimplemented(format!("unknown method {}", method)))?;
        Ok((Mode::OneToOne, vec![Backend::Local(local)]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::metadata::NODES;
    use crate::wire::Code;

    const METHOD: &str = "/machine.MachineService/Version";

    fn director(addresses: &[&str]) -> Director {
        let mut registry = BackendRegistry::new("self", 50000, None);
        registry.register_local("/machine.", "/run/machined.sock").unwrap();

        let observer = LocalAddresses::new();
        observer.set_addresses("eth0", addresses.iter().map(|a| a.parse().unwrap()));
        Director::new(Arc::new(registry), observer)
    }

    fn with_nodes(nodes: &[&str]) -> Metadata {
        let mut md = Metadata::new();
        md.set(NODES, nodes.iter().copied());
        md
    }

    fn targets(backends: &[Backend]) -> Vec<&str> {
        backends.iter().map(Backend::target).collect()
    }

    #[tokio::test]
    async fn no_nodes_is_local() {
        let (mode, backends) = director(&[]).direct(METHOD, &Metadata::new()).await.unwrap();
        assert_eq!(mode, Mode::OneToOne);
        assert_eq!(backends.len(), 1);
        assert!(backends[0].is_local());
    }

    #[tokio::test]
    async fn local_target_collapses_to_local_backend() {
        let d = director(&["10.0.0.1"]);
        for target in ["10.0.0.1", "10.0.0.1:50000"] {
            let (mode, backends) = d.direct(METHOD, &with_nodes(&[target])).await.unwrap();
            assert_eq!(mode, Mode::OneToOne);
            assert!(backends[0].is_local(), "{} should be local", target);
        }
        assert_eq!(d.registry().remote_count().await, 0);
    }

    #[tokio::test]
    async fn proxied_calls_stay_local() {
        let mut md = with_nodes(&["10.0.0.1", "10.0.0.2"]);
        md.set(PROXY_FROM, ["10.0.0.9"]);

        let (mode, backends) = director(&[]).direct(METHOD, &md).await.unwrap();
        assert_eq!(mode, Mode::OneToOne);
        assert!(backends[0].is_local());
    }

    #[tokio::test]
    async fn several_nodes_fan_out_in_order() {
        let md = with_nodes(&["10.0.0.1", "10.0.0.2"]);
        let (mode, backends) = director(&[]).direct(METHOD, &md).await.unwrap();

        assert_eq!(mode, Mode::OneToMany);
        assert_eq!(targets(&backends), ["10.0.0.1", "10.0.0.2"]);
    }

    #[tokio::test]
    async fn single_remote_node_is_still_tagged() {
        let (mode, backends) = director(&[]).direct(METHOD, &with_nodes(&["10.0.0.2"])).await.unwrap();
        assert_eq!(mode, Mode::OneToMany);
        assert_eq!(targets(&backends), ["10.0.0.2"]);
    }

    #[tokio::test]
    async fn mixed_targets_use_loopback_for_self() {
        let md = with_nodes(&["10.0.0.1", "10.0.0.2"]);
        let (mode, backends) = director(&["10.0.0.1"]).direct(METHOD, &md).await.unwrap();

        assert_eq!(mode, Mode::OneToMany);
        assert!(matches!(backends[0], Backend::Loopback(_)));
        assert!(matches!(backends[1], Backend::Remote(_)));
        assert_eq!(targets(&backends), ["10.0.0.1", "10.0.0.2"]);
    }

    #[tokio::test]
    async fn legacy_node_header_is_one_to_one() {
        let d = director(&["10.0.0.1"]);

        let mut md = Metadata::new();
        md.set(NODE, ["10.0.0.2"]);
        let (mode, backends) = d.direct(METHOD, &md).await.unwrap();
        assert_eq!(mode, Mode::OneToOne);
        assert!(matches!(backends[0], Backend::Remote(_)));

        md.set(NODE, ["10.0.0.1"]);
        let (_, backends) = d.direct(METHOD, &md).await.unwrap();
        assert!(backends[0].is_local());
    }

    #[tokio::test]
    async fn unknown_local_method_is_unimplemented() {
        let err = director(&[])
            .direct("/storage.StorageService/Disks", &Metadata::new())
            .await
            .unwrap_err();
        assert_eq!(err.code, Code::Unimplemented);
    }

    #[tokio::test]
    async fn invalid_target_is_rejected() {
        let err = director(&[])
            .direct(METHOD, &with_nodes(&["10.0.0.1", "bad host"]))
            .await
            .unwrap_err();
        assert_eq!(err.code, Code::InvalidArgument);
    }
}
