//! reltp Protocol Core Implementation
//!
//! This crate implements the core of the reltp transport: network addresses
//! and connection keys, the packet wire format, and the per-connection socket
//! state machine (handshake, retransmission bookkeeping, teardown and the
//! inbound FIFO buffer).
//!
//! Nothing in here performs I/O. Socket transitions hand back the packets the
//! caller must put on the wire.

pub mod address;
pub mod packet;
pub mod socket;

use std::time::Duration;

/// Time after which an unacknowledged control packet is resent
pub const RETRANSMISSION_INTERVAL: Duration = Duration::from_millis(200);

/// Number of expired retransmission deadlines tolerated before a handshake
/// or close attempt is abandoned
pub const MAX_RETRY: u32 = 3;

/// Number of ports on every host; valid ports are `0..PORT_LIMIT`
pub const PORT_LIMIT: u8 = 128;

pub use address::{ConnectionKey, LinkId, NetworkAddress, Port};
pub use packet::{
    frame_destination, Flags, Packet, PacketError, PacketKind, HEADER_SIZE, LINK_HEADER_SIZE,
    LINK_MTU, MAX_PAYLOAD_SIZE,
};
pub use socket::{
    CloseOutcome, HandshakeOutcome, PacketOutcome, RetransmitPolicy, Socket, SocketError,
    SocketState, TimeoutAction,
};
