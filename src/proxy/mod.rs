//! The fan-out proxy: backends, routing decisions and the call relay.

pub mod backend;
pub mod director;
pub mod handler;
pub mod registry;
pub mod streaming;

pub use backend::{outgoing_metadata, Backend, LocalBackend, LoopbackBackend, RemoteBackend, DIAL_TIMEOUT};
pub use director::{Director, Mode};
pub use handler::{ProxyHandler, DEFAULT_UNARY_TIMEOUT};
pub use registry::{BackendRegistry, RegistryError};
pub use streaming::{StreamingDetector, STREAM_SUFFIX_PATTERN};
