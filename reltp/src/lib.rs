//! reltp - Reliable Transport over a best-effort link
//!
//! The transport runtime: connection registry, the dispatcher, sender and
//! timeout-monitor workers, the connection-establishment API and a small
//! syscall-style process layer on top of it.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod ports;
pub mod process;
pub mod registry;
pub mod sender;
pub mod stats;
pub mod timeout;
pub mod transport;

pub use reltp_io as io;
pub use reltp_protocol as protocol;

// Re-export commonly used types
pub use config::TransportConfig;
pub use error::TransportError;
pub use process::{NetProcess, MAX_OPEN_FILES};
pub use protocol::{ConnectionKey, NetworkAddress, Packet, Socket, SocketState};
pub use registry::Registry;
pub use stats::TransportStats;
pub use transport::Transport;
