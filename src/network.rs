//! Hands lease-derived link configuration to the OS.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, error, info};
use tokio::sync::mpsc;

use crate::observer::LocalAddresses;
use crate::types::{NetworkConfig, NodeEvent, RouteScope};

#[async_trait]
pub trait NetworkAdapter: Send + Sync {
    /// Applies the configuration a lease produced for `link`.
    async fn apply(&self, link: &str, config: &NetworkConfig) -> Result<()>;
}

/// Logs what would be configured. Address and route installation is left to
/// the host's network manager.
#[derive(Debug, Default)]
pub struct LoggingAdapter;

#[async_trait]
impl NetworkAdapter for LoggingAdapter {
    async fn apply(&self, link: &str, config: &NetworkConfig) -> Result<()> {
        if let Some(address) = config.address {
            info!("{}: address {}", link, address);
        }
        if let Some(mtu) = config.mtu {
            info!("{}: mtu {}", link, mtu);
        }
        for route in &config.routes {
            match (route.scope, route.gateway) {
                (RouteScope::Global, Some(gateway)) => info!(
                    "{}: route {} via {} metric {}",
                    link, route.destination, gateway, route.metric
                ),
                _ => info!(
                    "{}: route {} scope link metric {}",
                    link, route.destination, route.metric
                ),
            }
        }
        if !config.dns_servers.is_empty() {
            info!(
                "{}: resolvers {:?} search {:?}",
                link, config.dns_servers, config.search_domains
            );
        }
        if !config.ntp_servers.is_empty() {
            info!("{}: time servers {:?}", link, config.ntp_servers);
        }
        Ok(())
    }
}

/// Routes address-source events until every sender is gone: identity events
/// update the observer, link configuration goes to the adapter.
pub async fn dispatch(
    mut events: mpsc::Receiver<NodeEvent>,
    observer: LocalAddresses,
    adapter: Arc<dyn NetworkAdapter>,
) {
    while let Some(event) = events.recv().await {
        observer.apply(&event);
        if let NodeEvent::Network { link, config } = &event {
            if let Err(e) = adapter.apply(link, config).await {
                error!("{}: failed to apply network config: {:#}", link, e);
            }
        }
    }
    debug!("address event channel closed");
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        applied: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl NetworkAdapter for Recorder {
        async fn apply(&self, link: &str, _config: &NetworkConfig) -> Result<()> {
            self.applied.lock().unwrap().push(link.to_owned());
            Ok(())
        }
    }

    #[tokio::test]
    async fn identity_goes_to_observer_and_config_to_adapter() {
        let observer = LocalAddresses::new();
        let recorder = Arc::new(Recorder::default());
        let (tx, rx) = mpsc::channel(4);

        tx.send(NodeEvent::Addresses {
            source: "eth0".into(),
            addresses: vec!["10.0.0.1".parse().unwrap()],
        })
        .await
        .unwrap();
        tx.send(NodeEvent::Network {
            link: "eth0".into(),
            config: Box::default(),
        })
        .await
        .unwrap();
        tx.send(NodeEvent::Hostname {
            hostname: "node-a".into(),
            fqdn: "node-a.corp.lan".into(),
        })
        .await
        .unwrap();
        drop(tx);

        dispatch(rx, observer.clone(), recorder.clone()).await;

        assert!(observer.is_local_target("10.0.0.1"));
        assert_eq!(observer.hostnames(), vec!["node-a", "node-a.corp.lan"]);
        assert_eq!(*recorder.applied.lock().unwrap(), vec!["eth0".to_owned()]);
    }

    #[tokio::test]
    async fn logging_adapter_accepts_everything() {
        let config = NetworkConfig {
            address: Some("10.0.0.5/24".parse().unwrap()),
            mtu: Some(1400),
            ..NetworkConfig::default()
        };
        LoggingAdapter.apply("eth0", &config).await.unwrap();
    }
}
