//! Network addresses and connection keys

use crate::PORT_LIMIT;
use std::fmt;

/// Link-layer address of a host
pub type LinkId = u8;

/// Transport port number
pub type Port = u8;

/// A transport endpoint: host link address plus port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NetworkAddress {
    pub link: LinkId,
    pub port: Port,
}

impl NetworkAddress {
    pub const fn new(link: LinkId, port: Port) -> Self {
        NetworkAddress { link, port }
    }

    /// Check whether the port is inside `0..PORT_LIMIT`
    #[inline]
    pub fn has_valid_port(&self) -> bool {
        is_valid_port(self.port as i64)
    }
}

impl fmt::Display for NetworkAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.link, self.port)
    }
}

/// Check a (possibly user-supplied) port number against `0..PORT_LIMIT`
#[inline]
pub fn is_valid_port(port: i64) -> bool {
    (0..PORT_LIMIT as i64).contains(&port)
}

/// Identifies one connection as seen from the host that owns it
///
/// The key is the ordered pair `(local, remote)`. Two connections that share
/// a local endpoint but talk to different peers, or the reverse, never
/// collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionKey {
    pub local: NetworkAddress,
    pub remote: NetworkAddress,
}

impl ConnectionKey {
    pub const fn new(local: NetworkAddress, remote: NetworkAddress) -> Self {
        ConnectionKey { local, remote }
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <-> {}", self.local, self.remote)
    }
}
