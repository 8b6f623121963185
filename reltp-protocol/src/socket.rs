//! reltp Socket State Machine
//!
//! A [`Socket`] tracks one connection: its state, the peer, the inbound FIFO
//! buffer and the retransmission bookkeeping for the single control packet
//! that may be awaiting acknowledgment.
//!
//! ```text
//!            begin_connect             SYN-ACK
//!  Closed ----------------> SynSent -----------> Established
//!                              |                   |  ^
//!                  retries out |       begin_close |  | accept
//!                              v                   v  |
//!                            Closed <-- FIN-ACK -- Closing   SynReceived
//! ```
//!
//! The socket never touches the network. Every transition returns the packet
//! (if any) the caller has to enqueue, and the transport decides what to do
//! with the socket afterwards.

use crate::address::{ConnectionKey, NetworkAddress};
use crate::packet::{Packet, PacketKind};
use crate::{MAX_RETRY, RETRANSMISSION_INTERVAL};
use bytes::{Buf, Bytes};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Socket state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketState {
    /// No connection; both the initial and the terminal state
    Closed,
    /// SYN sent, waiting for SYN-ACK
    SynSent,
    /// SYN received from a peer, queued until accepted
    SynReceived,
    /// Handshake complete, data may flow
    Established,
    /// FIN sent, waiting for FIN-ACK
    Closing,
}

impl fmt::Display for SocketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SocketState::Closed => "CLOSED",
            SocketState::SynSent => "SYN_SENT",
            SocketState::SynReceived => "SYN_RECEIVED",
            SocketState::Established => "ESTABLISHED",
            SocketState::Closing => "CLOSING",
        };
        f.write_str(name)
    }
}

/// Socket errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SocketError {
    #[error("Operation not valid in state {0}")]
    InvalidState(SocketState),
}

/// Retransmission timing shared by every socket of a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetransmitPolicy {
    /// Time after which an unacknowledged control packet is resent
    pub interval: Duration,
    /// Expired deadlines tolerated before the attempt is abandoned
    pub max_retry: u32,
}

impl Default for RetransmitPolicy {
    fn default() -> Self {
        RetransmitPolicy {
            interval: RETRANSMISSION_INTERVAL,
            max_retry: MAX_RETRY,
        }
    }
}

/// How a connection attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeOutcome {
    Established,
    TimedOut,
}

/// How a close attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    /// Peer acknowledged the FIN
    Completed,
    /// Retry budget exhausted, or the socket was torn down underneath
    TimedOut,
}

/// Result of feeding one inbound packet to a socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketOutcome {
    /// Not meaningful in the current state
    Ignored,
    /// Payload appended to the inbound buffer
    Buffered(usize),
    /// No state change, but the peer must be answered
    Reply(Packet),
    /// Handshake completed
    Established,
    /// Connection ended; the socket is now `Closed`
    Closed { reply: Option<Packet> },
}

/// Result of a retransmission check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeoutAction {
    /// Nothing outstanding, or deadline not reached
    Idle,
    /// Deadline passed; resend this packet
    Retransmit(Packet),
    /// Retry budget exhausted; the socket is now `Closed`
    Aborted,
}

struct SocketInner {
    state: SocketState,
    remote: Option<NetworkAddress>,
    /// Control packet awaiting acknowledgment
    unacked: Option<Packet>,
    deadline: Option<Instant>,
    retry_count: u32,
    close_outcome: Option<CloseOutcome>,
}

#[derive(Default)]
struct Inbound {
    chunks: VecDeque<Bytes>,
    buffered: usize,
    end_of_stream: bool,
}

/// One endpoint of a connection
pub struct Socket {
    local: NetworkAddress,
    policy: RetransmitPolicy,
    inner: Mutex<SocketInner>,
    /// Signaled whenever the socket leaves `SynSent` or `Closing`
    settled: Condvar,
    inbound: Mutex<Inbound>,
    readable: Condvar,
}

impl Socket {
    /// Create a closed socket bound to `local`
    pub fn new(local: NetworkAddress, policy: RetransmitPolicy) -> Self {
        Self::with_state(local, None, SocketState::Closed, policy)
    }

    /// Create the passive half of a connection requested by `remote`
    ///
    /// The request lapses once the connector would have given up, that is
    /// `max_retry` intervals after `now`.
    pub fn passive(
        local: NetworkAddress,
        remote: NetworkAddress,
        policy: RetransmitPolicy,
        now: Instant,
    ) -> Self {
        let socket = Self::with_state(local, Some(remote), SocketState::SynReceived, policy);
        socket.inner.lock().deadline = Some(now + policy.interval * policy.max_retry);
        socket
    }

    fn with_state(
        local: NetworkAddress,
        remote: Option<NetworkAddress>,
        state: SocketState,
        policy: RetransmitPolicy,
    ) -> Self {
        Socket {
            local,
            policy,
            inner: Mutex::new(SocketInner {
                state,
                remote,
                unacked: None,
                deadline: None,
                retry_count: 0,
                close_outcome: None,
            }),
            settled: Condvar::new(),
            inbound: Mutex::new(Inbound::default()),
            readable: Condvar::new(),
        }
    }

    pub fn local(&self) -> NetworkAddress {
        self.local
    }

    pub fn remote(&self) -> Option<NetworkAddress> {
        self.inner.lock().remote
    }

    /// Connection key, once the peer is known
    pub fn key(&self) -> Option<ConnectionKey> {
        self.remote()
            .map(|remote| ConnectionKey::new(self.local, remote))
    }

    pub fn state(&self) -> SocketState {
        self.inner.lock().state
    }

    /// Expired deadlines counted against the current handshake or close
    pub fn retry_count(&self) -> u32 {
        self.inner.lock().retry_count
    }

    pub fn policy(&self) -> RetransmitPolicy {
        self.policy
    }

    pub fn is_established(&self) -> bool {
        self.state() == SocketState::Established
    }

    /// Start an active open towards `remote`
    ///
    /// Returns the SYN to transmit. The retransmission deadline is armed at
    /// `now + interval`.
    pub fn begin_connect(
        &self,
        remote: NetworkAddress,
        now: Instant,
    ) -> Result<Packet, SocketError> {
        let mut inner = self.inner.lock();
        if inner.state != SocketState::Closed {
            return Err(SocketError::InvalidState(inner.state));
        }

        let syn = Packet::syn(self.local, remote);
        inner.remote = Some(remote);
        inner.state = SocketState::SynSent;
        inner.retry_count = 0;
        inner.close_outcome = None;
        inner.unacked = Some(syn.clone());
        inner.deadline = Some(now + self.policy.interval);
        self.inbound.lock().end_of_stream = false;

        tracing::debug!("{} -> {}: SYN_SENT", self.local, remote);
        Ok(syn)
    }

    /// Complete a passive open
    ///
    /// Returns the SYN-ACK to transmit.
    pub fn accept(&self) -> Result<Packet, SocketError> {
        let mut inner = self.inner.lock();
        let remote = match (inner.state, inner.remote) {
            (SocketState::SynReceived, Some(remote)) => remote,
            (state, _) => return Err(SocketError::InvalidState(state)),
        };

        inner.state = SocketState::Established;
        inner.deadline = None;
        tracing::debug!("{} <- {}: ESTABLISHED (accepted)", self.local, remote);
        Ok(Packet::syn_ack(self.local, remote))
    }

    /// Start a graceful close
    ///
    /// Returns the FIN to transmit, or `None` when the connection is already
    /// closed (for instance because the peer closed first).
    pub fn begin_close(&self, now: Instant) -> Result<Option<Packet>, SocketError> {
        let mut inner = self.inner.lock();
        match (inner.state, inner.remote) {
            (SocketState::Established, Some(remote)) => {
                let fin = Packet::fin(self.local, remote);
                inner.state = SocketState::Closing;
                inner.retry_count = 0;
                inner.close_outcome = None;
                inner.unacked = Some(fin.clone());
                inner.deadline = Some(now + self.policy.interval);
                tracing::debug!("{} -> {}: CLOSING", self.local, remote);
                Ok(Some(fin))
            }
            (SocketState::Closed, _) => Ok(None),
            (state, _) => Err(SocketError::InvalidState(state)),
        }
    }

    /// Feed one inbound packet addressed to this connection
    pub fn on_packet(&self, packet: &Packet) -> PacketOutcome {
        let mut inner = self.inner.lock();
        if inner.remote != Some(packet.src) {
            return PacketOutcome::Ignored;
        }

        match (inner.state, packet.kind()) {
            (SocketState::SynSent, PacketKind::SynAck) => {
                inner.state = SocketState::Established;
                inner.unacked = None;
                inner.deadline = None;
                self.settled.notify_all();
                tracing::debug!("{} -> {}: ESTABLISHED", self.local, packet.src);
                PacketOutcome::Established
            }
            (SocketState::Established, PacketKind::Syn) => {
                // Our SYN-ACK was lost; answer again without restarting
                PacketOutcome::Reply(Packet::syn_ack(self.local, packet.src))
            }
            (SocketState::Established | SocketState::Closing, PacketKind::Data) => {
                PacketOutcome::Buffered(self.push_inbound(packet.payload.clone()))
            }
            (SocketState::Established, PacketKind::Fin) => {
                self.finish(&mut inner, None);
                tracing::debug!("{} <- {}: peer closed", self.local, packet.src);
                PacketOutcome::Closed {
                    reply: Some(Packet::fin_ack(self.local, packet.src)),
                }
            }
            (SocketState::Closing, PacketKind::FinAck) => {
                self.finish(&mut inner, Some(CloseOutcome::Completed));
                tracing::debug!("{} -> {}: CLOSED", self.local, packet.src);
                PacketOutcome::Closed { reply: None }
            }
            (SocketState::Closing, PacketKind::Fin) => {
                // Both sides closing at once; keep waiting for our own FIN-ACK
                PacketOutcome::Reply(Packet::fin_ack(self.local, packet.src))
            }
            _ => PacketOutcome::Ignored,
        }
    }

    /// Retransmission check, called once per timeout sweep
    ///
    /// Every expired deadline counts one retry. The attempt is abandoned on
    /// the sweep that brings the count to `max_retry`; otherwise the pending
    /// control packet is resent and the deadline re-armed.
    pub fn on_timeout(&self, now: Instant) -> TimeoutAction {
        let mut inner = self.inner.lock();
        if !matches!(inner.state, SocketState::SynSent | SocketState::Closing) {
            return TimeoutAction::Idle;
        }
        match inner.deadline {
            Some(deadline) if now >= deadline => {}
            _ => return TimeoutAction::Idle,
        }

        inner.retry_count += 1;
        if inner.retry_count >= self.policy.max_retry {
            tracing::debug!(
                "{}: giving up in {} after {} retries",
                self.local,
                inner.state,
                inner.retry_count
            );
            self.finish(&mut inner, Some(CloseOutcome::TimedOut));
            return TimeoutAction::Aborted;
        }

        inner.deadline = Some(now + self.policy.interval);
        match inner.unacked.clone() {
            Some(packet) => TimeoutAction::Retransmit(packet),
            None => TimeoutAction::Idle,
        }
    }

    /// Drop the pending control packet of a connect attempt that must stay
    /// off the wire
    ///
    /// The deadline stays armed, so retries are still counted and the attempt
    /// still fails once the budget is spent.
    pub fn park(&self) {
        let mut inner = self.inner.lock();
        if inner.state == SocketState::SynSent {
            inner.unacked = None;
        }
    }

    /// Restart the lapse deadline of a connection request whose connector is
    /// still retrying
    pub fn renew(&self, now: Instant) {
        let mut inner = self.inner.lock();
        if inner.state == SocketState::SynReceived {
            inner.deadline = Some(now + self.policy.interval * self.policy.max_retry);
        }
    }

    /// Close a connection request that was never accepted in time
    ///
    /// Returns true if the socket was in `SynReceived` with its deadline
    /// passed; it is `Closed` afterwards.
    pub fn expire(&self, now: Instant) -> bool {
        let mut inner = self.inner.lock();
        match (inner.state, inner.deadline) {
            (SocketState::SynReceived, Some(deadline)) if now >= deadline => {
                self.finish(&mut inner, Some(CloseOutcome::TimedOut));
                true
            }
            _ => false,
        }
    }

    /// Tear the socket down immediately, waking every waiter
    pub fn abort(&self) {
        let mut inner = self.inner.lock();
        if inner.state != SocketState::Closed {
            self.finish(&mut inner, Some(CloseOutcome::TimedOut));
        }
    }

    /// Block until a pending connect attempt settles
    pub fn wait_handshake(&self) -> HandshakeOutcome {
        let mut inner = self.inner.lock();
        while inner.state == SocketState::SynSent {
            self.settled.wait(&mut inner);
        }
        if inner.state == SocketState::Established {
            HandshakeOutcome::Established
        } else {
            HandshakeOutcome::TimedOut
        }
    }

    /// Block until a pending close attempt settles
    pub fn wait_close(&self) -> CloseOutcome {
        let mut inner = self.inner.lock();
        while inner.state == SocketState::Closing {
            self.settled.wait(&mut inner);
        }
        inner.close_outcome.unwrap_or(CloseOutcome::Completed)
    }

    /// Move to `Closed`; caller holds the state lock
    fn finish(&self, inner: &mut SocketInner, outcome: Option<CloseOutcome>) {
        let was_closing = inner.state == SocketState::Closing;
        inner.state = SocketState::Closed;
        inner.unacked = None;
        inner.deadline = None;
        if was_closing || outcome.is_some() {
            inner.close_outcome = outcome;
        }
        self.settled.notify_all();

        self.inbound.lock().end_of_stream = true;
        self.readable.notify_all();
    }

    fn push_inbound(&self, payload: Bytes) -> usize {
        let len = payload.len();
        if len == 0 {
            return 0;
        }
        let mut inbound = self.inbound.lock();
        inbound.buffered += len;
        inbound.chunks.push_back(payload);
        self.readable.notify_all();
        len
    }

    /// Bytes waiting in the inbound buffer
    pub fn available(&self) -> usize {
        self.inbound.lock().buffered
    }

    /// Read buffered bytes in arrival order, blocking while the buffer is
    /// empty and the connection is still open
    ///
    /// Returns 0 only at end of stream.
    pub fn read(&self, buf: &mut [u8]) -> usize {
        if buf.is_empty() {
            return 0;
        }
        let mut inbound = self.inbound.lock();
        while inbound.chunks.is_empty() && !inbound.end_of_stream {
            self.readable.wait(&mut inbound);
        }
        Self::drain(&mut inbound, buf)
    }

    /// Read whatever is buffered without blocking
    pub fn try_read(&self, buf: &mut [u8]) -> usize {
        let mut inbound = self.inbound.lock();
        Self::drain(&mut inbound, buf)
    }

    /// Whether the peer has ended the stream and everything has been read
    pub fn is_drained(&self) -> bool {
        let inbound = self.inbound.lock();
        inbound.end_of_stream && inbound.chunks.is_empty()
    }

    fn drain(inbound: &mut Inbound, buf: &mut [u8]) -> usize {
        let mut copied = 0;
        while copied < buf.len() {
            let Some(chunk) = inbound.chunks.front_mut() else {
                break;
            };
            let n = chunk.len().min(buf.len() - copied);
            buf[copied..copied + n].copy_from_slice(&chunk[..n]);
            chunk.advance(n);
            copied += n;
            if chunk.is_empty() {
                inbound.chunks.pop_front();
            }
        }
        inbound.buffered -= copied;
        copied
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Socket")
            .field("local", &self.local)
            .field("remote", &inner.remote)
            .field("state", &inner.state)
            .field("retry_count", &inner.retry_count)
            .finish()
    }
}
