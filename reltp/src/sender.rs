//! Outbound queue and the Sender worker
//!
//! Packets leave in exactly the order they were enqueued, and only one frame
//! is ever on the link: the Sender waits for the link's send-completion token
//! before it transmits the next packet.

use crate::stats::TransportStats;
use crossbeam::channel::{self, select, Receiver, Sender};
use parking_lot::RwLock;
use reltp_io::NetworkLink;
use reltp_protocol::Packet;
use std::sync::Arc;

/// Producer side of the outbound queue
#[derive(Clone)]
pub struct OutboundQueue {
    tx: Sender<Packet>,
}

impl OutboundQueue {
    /// Create the queue and the receiving end handed to the Sender
    pub fn channel() -> (Self, Receiver<Packet>) {
        let (tx, rx) = channel::unbounded();
        (OutboundQueue { tx }, rx)
    }

    /// Append a packet; dropped silently once the Sender is gone
    pub fn enqueue(&self, packet: Packet) {
        tracing::trace!("enqueue {}", packet);
        if self.tx.send(packet).is_err() {
            tracing::debug!("outbound queue closed, packet dropped");
        }
    }

    /// Packets waiting to be transmitted
    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }
}

/// Sender worker loop; returns when `shutdown` disconnects
pub fn run(
    link: Arc<dyn NetworkLink>,
    queue: Receiver<Packet>,
    shutdown: Receiver<()>,
    stats: Arc<RwLock<TransportStats>>,
) {
    tracing::debug!("sender started on link {}", link.address());

    loop {
        let packet = select! {
            recv(queue) -> packet => match packet {
                Ok(packet) => packet,
                Err(_) => break,
            },
            recv(shutdown) -> _ => break,
        };

        if let Err(e) = link.transmit(packet.to_bytes()) {
            tracing::warn!("link rejected {}: {}", packet, e);
            continue;
        }

        select! {
            recv(link.send_complete()) -> done => {
                if done.is_err() {
                    break;
                }
            }
            recv(shutdown) -> _ => break,
        }

        stats.write().packets_sent += 1;
        tracing::trace!("sent {}", packet);
    }

    tracing::debug!("sender on link {} stopped", link.address());
}
