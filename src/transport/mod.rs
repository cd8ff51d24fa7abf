pub mod listener;
pub mod mux;
pub mod tls;

pub use listener::{ListenError, NetworkListener, SocketListener};
pub use mux::{
    serve_connection, CallHandler, CallInbound, CallReceiver, CallSender, ConnInfo, Connection, Responder, ServerCall,
};
pub use tls::{TlsError, TlsMaterial, TlsPaths};
