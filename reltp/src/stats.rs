//! Transport statistics

/// Transport-wide counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// Packets handed to the link
    pub packets_sent: u64,
    /// Well-formed packets received
    pub packets_received: u64,
    /// Frames that failed to decode
    pub malformed_dropped: u64,
    /// Packets with no socket to deliver to
    pub unroutable_dropped: u64,
    /// Control packets resent after a deadline expired
    pub retransmissions: u64,
    /// Handshakes and closes abandoned after the retry budget
    pub handshake_timeouts: u64,
    /// Connection requests dropped from a pending queue before `accept`
    pub requests_expired: u64,
    /// Connections that reached ESTABLISHED
    pub connections_established: u64,
    /// Connections that reached CLOSED through FIN/FIN-ACK
    pub connections_closed: u64,
    /// Payload bytes queued for sending
    pub bytes_sent: u64,
    /// Payload bytes buffered for readers
    pub bytes_received: u64,
}
