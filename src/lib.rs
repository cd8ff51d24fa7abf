//! Node-local API proxy: fans control-plane calls out to peer nodes and keeps
//! the node's DHCP leases that decide which targets count as local.

pub mod cancel;
pub mod config;
pub mod dhcp;
pub mod network;
pub mod observer;
pub mod proxy;
pub mod transport;
pub mod types;
pub mod wire;
