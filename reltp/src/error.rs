//! Transport errors

use reltp_io::LinkError;
use reltp_protocol::socket::SocketError;
use reltp_protocol::{PacketError, Port};
use thiserror::Error;

/// Errors visible to callers of the transport API
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Connection refused: nothing pending on port {0}")]
    ConnectionRefused(Port),

    #[error("Handshake timed out after {retries} retries")]
    HandshakeTimeout { retries: u32 },

    #[error("Resource exhausted: {0}")]
    ResourceExhaustion(&'static str),

    #[error("Port {0} out of range")]
    InvalidPort(i64),

    #[error(transparent)]
    InvalidState(#[from] SocketError),

    #[error("Packet error: {0}")]
    Packet(#[from] PacketError),

    #[error("Link error: {0}")]
    Link(#[from] LinkError),

    #[error("Transport is shut down")]
    Shutdown,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
