//! nodeproxy daemon entry point.

use std::process::ExitCode;
use std::sync::Arc;

use log::{error, info, warn};
use tokio::signal;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use nodeproxy::cancel::Context;
use nodeproxy::config::Config;
use nodeproxy::dhcp::{Client, UdpTransport};
use nodeproxy::network::{self, LoggingAdapter};
use nodeproxy::observer::{LocalAddresses, STATIC_SOURCE};
use nodeproxy::proxy::{BackendRegistry, Director, ProxyHandler};
use nodeproxy::transport::{CallHandler, NetworkListener, SocketListener, TlsMaterial};

const EVENT_QUEUE: usize = 64;

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    let cfg = match Config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("{:#}", e);
            return ExitCode::from(1);
        }
    };
    info!("Starting nodeproxy with config: {:?}", cfg);

    // Read once; rotated certificates take effect after a restart.
    let tls = match &cfg.tls {
        Some(paths) => match TlsMaterial::load(paths) {
            Ok(material) => Some(material),
            Err(e) => {
                error!("Failed to load TLS material: {}", e);
                return ExitCode::from(1);
            }
        },
        None => {
            warn!("No TLS configured; peer traffic is plaintext");
            None
        }
    };

    let mut registry = BackendRegistry::new(cfg.node_id.clone(), cfg.peer_port, tls.clone());
    registry.set_dial_timeout(cfg.dial_timeout());
    for backend in &cfg.local_backends {
        if let Err(e) = registry.register_local(&backend.prefix, backend.socket.clone()) {
            error!("Invalid local backend: {}", e);
            return ExitCode::from(1);
        }
    }
    let registry = Arc::new(registry);

    let observer = LocalAddresses::new();
    observer.set_addresses(STATIC_SOURCE, cfg.addresses.iter().copied());
    observer.set_hostnames(
        STATIC_SOURCE,
        cfg.hostnames.iter().chain(std::iter::once(&cfg.node_id)),
    );

    // Validated by Config::load.
    let detector = match cfg.detector() {
        Ok(detector) => detector,
        Err(e) => {
            error!("{}", e);
            return ExitCode::from(1);
        }
    };
    let handler: Arc<dyn CallHandler> = Arc::new(
        ProxyHandler::new(Director::new(Arc::clone(&registry), observer.clone()), detector)
            .with_unary_timeout(cfg.unary_timeout()),
    );

    let network = match NetworkListener::bind(cfg.listen, tls).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("{}", e);
            return ExitCode::from(2);
        }
    };
    let socket = match cfg.socket_path.as_deref().map(SocketListener::bind).transpose() {
        Ok(listener) => listener,
        Err(e) => {
            error!("{}", e);
            return ExitCode::from(2);
        }
    };

    let root = Context::new();
    // Cancelled when a listener stops before shutdown.
    let listener_down = Context::new();
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    tasks.push(tokio::spawn({
        let (handler, ctx, down) = (Arc::clone(&handler), root.child(), listener_down.clone());
        async move {
            if let Err(e) = network.serve(handler, ctx).await {
                error!("Network listener failed: {}", e);
                down.cancel();
            }
        }
    }));
    if let Some(socket) = socket {
        let (handler, ctx, down) = (Arc::clone(&handler), root.child(), listener_down.clone());
        tasks.push(tokio::spawn(async move {
            if let Err(e) = socket.serve(handler, ctx).await {
                error!("Socket listener failed: {}", e);
                down.cancel();
            }
        }));
    }

    tasks.push(tokio::spawn(
        Arc::clone(&registry).run_reaper(cfg.backend_idle(), root.child()),
    ));

    // Address sources
    let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
    let dispatcher = tokio::spawn(network::dispatch(events_rx, observer, Arc::new(LoggingAdapter)));

    for link in &cfg.dhcp.links {
        let transport = match UdpTransport::bind(link) {
            Ok(transport) => transport,
            Err(e) => {
                error!("{}: cannot start DHCP: {}", link, e);
                continue;
            }
        };
        let mut client = Client::new(cfg.dhcp_options(link), transport);
        let mut state = client.watch_state();
        let (events, ctx) = (events_tx.clone(), root.child());
        let link = link.clone();
        tasks.push(tokio::spawn(async move {
            let watcher = tokio::spawn({
                let link = link.clone();
                async move {
                    while state.changed().await.is_ok() {
                        info!("{}: DHCP state {:?}", link, *state.borrow());
                    }
                }
            });
            if let Err(e) = client.run(&ctx, &events).await {
                error!("{}: DHCP client stopped: {}", link, e);
            }
            drop(client);
            let _ = watcher.await;
        }));
    }
    drop(events_tx);

    // Graceful Shutdown
    let code = tokio::select! {
        signal = signal::ctrl_c() => {
            match signal {
                Ok(()) => info!("Received Ctrl+C, shutting down..."),
                Err(err) => error!("Unable to listen for shutdown signal: {}", err),
            }
            ExitCode::SUCCESS
        }
        _ = listener_down.cancelled() => {
            error!("A listener stopped, shutting down...");
            ExitCode::from(2)
        }
    };

    root.cancel();
    for task in tasks {
        let _ = task.await;
    }
    registry.close().await;
    let _ = dispatcher.await;

    info!("Shutdown complete.");
    code
}
