//! DHCPv4 address acquisition.

pub mod client;
pub mod lease;
pub mod packet;
pub mod transport;

pub use client::{Client, ClientOptions, DhcpError, Destination, State, Transport};
pub use lease::{Lease, LeaseError, StaticRoute};
pub use transport::UdpTransport;
