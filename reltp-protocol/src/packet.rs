//! reltp Packet Structures and Serialization
//!
//! A packet travels as a single link frame of at most [`LINK_MTU`] bytes: a
//! 6-byte header followed by the payload. The first two header bytes are the
//! link-layer addresses, which the link reads to deliver the frame; the rest
//! belongs to the transport.
//!
//! ```text
//!  0          1          2          3          4          5          6 ..
//! +----------+----------+----------+----------+----------+----------+---------+
//! | dst link | src link | dst port | src port |  flags   |  length  | payload |
//! +----------+----------+----------+----------+----------+----------+---------+
//! ```

use crate::address::{ConnectionKey, LinkId, NetworkAddress};
use crate::PORT_LIMIT;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use thiserror::Error;

/// Largest frame the link carries
pub const LINK_MTU: usize = 32;

/// Bytes of the header owned by the link layer (dst link, src link)
pub const LINK_HEADER_SIZE: usize = 2;

/// Size of the full packet header in bytes
pub const HEADER_SIZE: usize = 6;

/// Maximum payload carried by one packet
pub const MAX_PAYLOAD_SIZE: usize = LINK_MTU - HEADER_SIZE;

/// Header fields, by byte offset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HeaderField {
    DstLink = 0,
    SrcLink = 1,
    DstPort = 2,
    SrcPort = 3,
    Flags = 4,
    Length = 5,
}

/// Control flag bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Flags {
    pub syn: bool,
    pub ack: bool,
    pub fin: bool,
}

impl Flags {
    pub const SYN: u8 = 0x01;
    pub const ACK: u8 = 0x02;
    pub const FIN: u8 = 0x04;

    const KNOWN: u8 = Self::SYN | Self::ACK | Self::FIN;

    /// No flags set: a data packet
    pub const NONE: Flags = Flags {
        syn: false,
        ack: false,
        fin: false,
    };

    /// Parse flags from the raw header byte
    ///
    /// Fails on unknown bits and on the one combination that cannot mean
    /// anything (`SYN` together with `FIN`).
    pub fn from_raw(raw: u8) -> Result<Self, PacketError> {
        if raw & !Self::KNOWN != 0 {
            return Err(PacketError::InvalidFlags(raw));
        }

        let flags = Flags {
            syn: raw & Self::SYN != 0,
            ack: raw & Self::ACK != 0,
            fin: raw & Self::FIN != 0,
        };

        if flags.syn && flags.fin {
            return Err(PacketError::InvalidFlags(raw));
        }

        Ok(flags)
    }

    /// Convert to the raw header byte
    pub fn to_raw(self) -> u8 {
        let mut raw = 0;
        if self.syn {
            raw |= Self::SYN;
        }
        if self.ack {
            raw |= Self::ACK;
        }
        if self.fin {
            raw |= Self::FIN;
        }
        raw
    }

    /// Any of SYN/ACK/FIN set
    #[inline]
    pub fn is_control(self) -> bool {
        self.syn || self.ack || self.fin
    }
}

/// What a packet means, decided once from its flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    /// Payload-carrying packet
    Data,
    /// Connection request
    Syn,
    /// Connection accepted
    SynAck,
    /// Bare acknowledgment
    Ack,
    /// Termination request
    Fin,
    /// Termination acknowledged
    FinAck,
}

impl PacketKind {
    pub fn flags(self) -> Flags {
        match self {
            PacketKind::Data => Flags::NONE,
            PacketKind::Syn => Flags {
                syn: true,
                ..Flags::NONE
            },
            PacketKind::SynAck => Flags {
                syn: true,
                ack: true,
                ..Flags::NONE
            },
            PacketKind::Ack => Flags {
                ack: true,
                ..Flags::NONE
            },
            PacketKind::Fin => Flags {
                fin: true,
                ..Flags::NONE
            },
            PacketKind::FinAck => Flags {
                fin: true,
                ack: true,
                ..Flags::NONE
            },
        }
    }

    fn from_flags(flags: Flags) -> Self {
        match (flags.syn, flags.ack, flags.fin) {
            (true, false, _) => PacketKind::Syn,
            (true, true, _) => PacketKind::SynAck,
            (false, true, false) => PacketKind::Ack,
            (false, false, true) => PacketKind::Fin,
            (false, true, true) => PacketKind::FinAck,
            (false, false, false) => PacketKind::Data,
        }
    }
}

impl fmt::Display for PacketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PacketKind::Data => "DATA",
            PacketKind::Syn => "SYN",
            PacketKind::SynAck => "SYN-ACK",
            PacketKind::Ack => "ACK",
            PacketKind::Fin => "FIN",
            PacketKind::FinAck => "FIN-ACK",
        };
        f.write_str(name)
    }
}

/// A transport packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Sending endpoint
    pub src: NetworkAddress,
    /// Receiving endpoint
    pub dst: NetworkAddress,
    /// Control flags
    pub flags: Flags,
    /// Payload data (empty for control packets)
    pub payload: Bytes,
}

impl Packet {
    fn control(src: NetworkAddress, dst: NetworkAddress, kind: PacketKind) -> Self {
        Packet {
            src,
            dst,
            flags: kind.flags(),
            payload: Bytes::new(),
        }
    }

    /// Connection request
    pub fn syn(src: NetworkAddress, dst: NetworkAddress) -> Self {
        Self::control(src, dst, PacketKind::Syn)
    }

    /// Connection acceptance
    pub fn syn_ack(src: NetworkAddress, dst: NetworkAddress) -> Self {
        Self::control(src, dst, PacketKind::SynAck)
    }

    /// Termination request
    pub fn fin(src: NetworkAddress, dst: NetworkAddress) -> Self {
        Self::control(src, dst, PacketKind::Fin)
    }

    /// Termination acknowledgment
    pub fn fin_ack(src: NetworkAddress, dst: NetworkAddress) -> Self {
        Self::control(src, dst, PacketKind::FinAck)
    }

    /// Data packet; the payload must fit in one frame
    pub fn data(
        src: NetworkAddress,
        dst: NetworkAddress,
        payload: Bytes,
    ) -> Result<Self, PacketError> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(PacketError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }

        Ok(Packet {
            src,
            dst,
            flags: Flags::NONE,
            payload,
        })
    }

    /// Classify this packet for dispatch
    pub fn kind(&self) -> PacketKind {
        PacketKind::from_flags(self.flags)
    }

    /// Key of the connection this packet belongs to, from the receiver's side
    pub fn connection_key(&self) -> ConnectionKey {
        ConnectionKey::new(self.dst, self.src)
    }

    /// Total size of the packet on the wire
    pub fn size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Serialize the packet into one link frame
    ///
    /// The payload must fit the one-byte length field; build data packets
    /// through [`Packet::data`] to have that checked.
    pub fn to_bytes(&self) -> Bytes {
        debug_assert!(
            self.payload.len() <= MAX_PAYLOAD_SIZE,
            "payload of {} bytes does not fit a frame",
            self.payload.len()
        );
        let mut buf = BytesMut::with_capacity(self.size());
        buf.put_u8(self.dst.link);
        buf.put_u8(self.src.link);
        buf.put_u8(self.dst.port);
        buf.put_u8(self.src.port);
        buf.put_u8(self.flags.to_raw());
        buf.put_u8(self.payload.len() as u8);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Parse a packet from one link frame
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PacketError> {
        if bytes.len() < HEADER_SIZE {
            return Err(PacketError::Truncated {
                expected: HEADER_SIZE,
                actual: bytes.len(),
            });
        }
        if bytes.len() > LINK_MTU {
            return Err(PacketError::Oversized {
                size: bytes.len(),
                max: LINK_MTU,
            });
        }

        let mut buf = bytes;
        let dst_link = buf.get_u8();
        let src_link = buf.get_u8();
        let dst_port = buf.get_u8();
        let src_port = buf.get_u8();
        let flags = Flags::from_raw(buf.get_u8())?;
        let length = buf.get_u8() as usize;

        if length != buf.remaining() {
            return Err(PacketError::LengthMismatch {
                declared: length,
                actual: buf.remaining(),
            });
        }
        for port in [dst_port, src_port] {
            if port >= PORT_LIMIT {
                return Err(PacketError::InvalidPort(port));
            }
        }
        if flags.is_control() && length > 0 {
            return Err(PacketError::UnexpectedPayload(length));
        }

        Ok(Packet {
            src: NetworkAddress::new(src_link, src_port),
            dst: NetworkAddress::new(dst_link, dst_port),
            flags,
            payload: Bytes::copy_from_slice(buf),
        })
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} -> {} ({} bytes)",
            self.kind(),
            self.src,
            self.dst,
            self.payload.len()
        )
    }
}

/// Link address a raw frame is destined for, without decoding the rest
pub fn frame_destination(frame: &[u8]) -> Option<LinkId> {
    frame.get(HeaderField::DstLink as usize).copied()
}

/// Packet parsing and validation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("Truncated frame: expected at least {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("Frame of {size} bytes exceeds link MTU {max}")]
    Oversized { size: usize, max: usize },

    #[error("Length field says {declared} bytes but {actual} follow")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("Invalid flags: {0:#04x}")]
    InvalidFlags(u8),

    #[error("Control packet carries {0} bytes of payload")]
    UnexpectedPayload(usize),

    #[error("Port {0} out of range")]
    InvalidPort(u8),

    #[error("Payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },
}
