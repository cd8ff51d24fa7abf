use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use crate::dhcp::client::{ClientOptions, DEFAULT_ROUTE_METRIC, DEFAULT_STATIC_METRIC};
use crate::dhcp::StaticRoute;
use crate::proxy::{StreamingDetector, STREAM_SUFFIX_PATTERN};
use crate::transport::TlsPaths;

/// Well-known control-plane port.
pub const DEFAULT_PORT: u16 = 50000;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("local backend prefix {0:?} is listed twice")]
    DuplicatePrefix(String),
    #[error("local backend prefix must not be empty")]
    EmptyPrefix,
    #[error("invalid streamed method {method:?}: {source}")]
    BadPattern {
        method: String,
        #[source]
        source: regex::Error,
    },
    #[error("static route metric {static_metric} must be greater than the DHCP route metric {route_metric}")]
    MetricOrder { route_metric: u32, static_metric: u32 },
    #[error("TLS {what} file {} does not exist", .path.display())]
    MissingTls { what: &'static str, path: PathBuf },
    #[error("{0} must be greater than zero")]
    ZeroTimeout(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct LocalBackendConfig {
    /// Method prefix, e.g. `/machine.MachineService/`.
    pub prefix: String,
    pub socket: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct StaticRouteConfig {
    pub destination: Ipv4Net,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<Ipv4Addr>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct DhcpConfig {
    /// Links to run a DHCP client on. Empty disables DHCP.
    pub links: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    pub mtu_suppressed_platforms: Vec<String>,
    pub route_metric: u32,
    pub static_metric: u32,
    pub static_routes: Vec<StaticRouteConfig>,
    /// Host name to publish to the DHCP server.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    pub skip_hostname_request: bool,
}

impl Default for DhcpConfig {
    fn default() -> Self {
        Self {
            links: Vec::new(),
            platform: None,
            mtu_suppressed_platforms: vec!["azure".into()],
            route_metric: DEFAULT_ROUTE_METRIC,
            static_metric: DEFAULT_STATIC_METRIC,
            static_routes: Vec::new(),
            hostname: None,
            skip_hostname_request: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub listen: SocketAddr,
    /// Unix socket for node-local callers, served without TLS.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket_path: Option<PathBuf>,
    /// Reported as `proxyfrom` when a caller's authority is unknown.
    pub node_id: String,
    pub peer_port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsPaths>,
    pub local_backends: Vec<LocalBackendConfig>,
    pub streamed_methods: Vec<String>,
    pub unary_timeout_secs: u64,
    pub dial_timeout_secs: u64,
    pub backend_idle_secs: u64,
    /// Addresses and names that always mean this node.
    pub addresses: Vec<IpAddr>,
    pub hostnames: Vec<String>,
    pub dhcp: DhcpConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            socket_path: None,
            node_id: default_node_id(),
            peer_port: DEFAULT_PORT,
            tls: None,
            local_backends: Vec::new(),
            streamed_methods: Vec::new(),
            unary_timeout_secs: 30,
            dial_timeout_secs: 10,
            backend_idle_secs: 15 * 60,
            addresses: Vec::new(),
            hostnames: Vec::new(),
            dhcp: DhcpConfig::default(),
        }
    }
}

fn default_node_id() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "unknown".into())
}

impl Config {
    /// Defaults, then `nodeproxy.toml`, `nodeproxy.json` and `NODEPROXY_*`
    /// variables (`__` separates nested keys).
    pub fn figment() -> Figment {
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("nodeproxy.toml"))
            .merge(Json::file("nodeproxy.json"))
            .merge(Env::prefixed("NODEPROXY_").split("__"))
    }

    pub fn load() -> anyhow::Result<Self> {
        let config: Config = Self::figment()
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut prefixes = HashSet::new();
        for backend in &self.local_backends {
            if backend.prefix.is_empty() {
                return Err(ConfigError::EmptyPrefix);
            }
            if !prefixes.insert(backend.prefix.as_str()) {
                return Err(ConfigError::DuplicatePrefix(backend.prefix.clone()));
            }
        }

        self.detector()?;

        if self.dhcp.static_metric <= self.dhcp.route_metric {
            return Err(ConfigError::MetricOrder {
                route_metric: self.dhcp.route_metric,
                static_metric: self.dhcp.static_metric,
            });
        }

        if let Some(tls) = &self.tls {
            for (what, path) in [("CA", &tls.ca), ("certificate", &tls.cert), ("key", &tls.key)] {
                if !path.exists() {
                    return Err(ConfigError::MissingTls {
                        what,
                        path: path.clone(),
                    });
                }
            }
        }

        for (name, secs) in [
            ("unary_timeout_secs", self.unary_timeout_secs),
            ("dial_timeout_secs", self.dial_timeout_secs),
            ("backend_idle_secs", self.backend_idle_secs),
        ] {
            if secs == 0 {
                return Err(ConfigError::ZeroTimeout(name));
            }
        }
        Ok(())
    }

    /// Streaming detector for the configured methods plus the `Stream$` suffix.
    pub fn detector(&self) -> Result<StreamingDetector, ConfigError> {
        let mut detector = StreamingDetector::new();
        for method in &self.streamed_methods {
            detector
                .register_method(method)
                .map_err(|source| ConfigError::BadPattern {
                    method: method.clone(),
                    source,
                })?;
        }
        detector
            .register(STREAM_SUFFIX_PATTERN)
            .map_err(|source| ConfigError::BadPattern {
                method: STREAM_SUFFIX_PATTERN.into(),
                source,
            })?;
        Ok(detector)
    }

    pub fn dhcp_options(&self, link: &str) -> ClientOptions {
        ClientOptions {
            link: link.to_owned(),
            platform: self.dhcp.platform.clone(),
            mtu_suppressed_platforms: self.dhcp.mtu_suppressed_platforms.clone(),
            route_metric: self.dhcp.route_metric,
            static_metric: self.dhcp.static_metric,
            static_routes: self
                .dhcp
                .static_routes
                .iter()
                .map(|route| StaticRoute {
                    destination: route.destination,
                    gateway: route.gateway,
                })
                .collect(),
            hostname: self.dhcp.hostname.clone(),
            skip_hostname_request: self.dhcp.skip_hostname_request,
        }
    }

    pub fn unary_timeout(&self) -> Duration {
        Duration::from_secs(self.unary_timeout_secs)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    pub fn backend_idle(&self) -> Duration {
        Duration::from_secs(self.backend_idle_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn defaults_apply_without_any_source() {
        Jail::expect_with(|_jail| {
            let config = Config::load().map_err(|e| e.to_string())?;
            assert_eq!(config.listen, "0.0.0.0:50000".parse().unwrap());
            assert_eq!(config.peer_port, 50000);
            assert_eq!(config.unary_timeout(), Duration::from_secs(30));
            assert_eq!(config.dial_timeout(), Duration::from_secs(10));
            assert_eq!(config.backend_idle(), Duration::from_secs(900));
            assert_eq!(config.dhcp.mtu_suppressed_platforms, ["azure"]);
            assert!(!config.node_id.is_empty());
            Ok(())
        });
    }

    #[test]
    fn toml_then_env() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "nodeproxy.toml",
                r#"
                    node_id = "node-a"
                    streamed_methods = ["/machine.MachineService/Logs"]

                    [[local_backends]]
                    prefix = "/machine."
                    socket = "/run/machined.sock"

                    [dhcp]
                    links = ["eth0"]
                    platform = "azure"

                    [[dhcp.static_routes]]
                    destination = "10.10.0.0/16"
                    gateway = "192.168.1.254"
                "#,
            )?;
            jail.set_env("NODEPROXY_PEER_PORT", "6000");
            jail.set_env("NODEPROXY_DHCP__ROUTE_METRIC", "100");

            let config = Config::load().map_err(|e| e.to_string())?;
            assert_eq!(config.node_id, "node-a");
            assert_eq!(config.peer_port, 6000);
            assert_eq!(config.dhcp.route_metric, 100);
            assert_eq!(config.dhcp.static_metric, DEFAULT_STATIC_METRIC);
            assert_eq!(config.local_backends[0].prefix, "/machine.");

            let detector = config.detector().map_err(|e| e.to_string())?;
            assert!(detector.is_streamed("/machine.MachineService/Logs"));
            assert!(detector.is_streamed("/machine.MachineService/EventsStream"));

            let options = config.dhcp_options("eth0");
            assert_eq!(options.platform.as_deref(), Some("azure"));
            assert_eq!(options.static_routes[0].gateway, Some(Ipv4Addr::new(192, 168, 1, 254)));
            Ok(())
        });
    }

    #[test]
    fn duplicate_prefixes_are_rejected() {
        let mut config = Config::default();
        for _ in 0..2 {
            config.local_backends.push(LocalBackendConfig {
                prefix: "/machine.".into(),
                socket: "/run/machined.sock".into(),
            });
        }
        assert!(matches!(config.validate(), Err(ConfigError::DuplicatePrefix(_))));
    }

    #[test]
    fn static_metric_must_exceed_dynamic_metric() {
        let mut config = Config::default();
        config.dhcp.static_metric = config.dhcp.route_metric;
        assert!(matches!(config.validate(), Err(ConfigError::MetricOrder { .. })));
    }

    #[test]
    fn missing_tls_files_are_rejected() {
        let mut config = Config::default();
        config.tls = Some(TlsPaths {
            ca: "/nonexistent/ca.pem".into(),
            cert: "/nonexistent/node.pem".into(),
            key: "/nonexistent/node-key.pem".into(),
        });
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingTls { what: "CA", .. })
        ));
    }

    #[test]
    fn zero_timeouts_are_rejected() {
        let mut config = Config::default();
        config.dial_timeout_secs = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroTimeout("dial_timeout_secs"))
        ));
    }
}
