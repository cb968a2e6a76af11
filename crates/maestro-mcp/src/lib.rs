mod client;
mod connection;
mod handler;
mod manager;
pub mod rate_limit;

pub use client::{RmcpConnector, RmcpTransport};
pub use connection::{CapabilityConnection, ConnectionState};
pub use handler::MaestroClientHandler;
pub use manager::ConnectionManager;
