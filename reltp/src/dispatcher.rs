//! Inbound packet Dispatcher
//!
//! Pulls one frame at a time off the link, decodes it and routes it. Routing
//! is a tagged dispatch: packets for a registered connection go to that
//! socket's state machine, and the few kinds that are meaningful without a
//! connection (a fresh SYN, a late FIN) are handled here.

use crate::transport::Shared;
use crossbeam::channel::{select, Receiver};
use reltp_io::NetworkLink;
use reltp_protocol::{Packet, PacketKind, PacketOutcome, Socket};
use std::sync::Arc;
use std::time::Instant;

/// Dispatcher worker loop; returns when `shutdown` disconnects
pub(crate) fn run(shared: Arc<Shared>, link: Arc<dyn NetworkLink>, shutdown: Receiver<()>) {
    tracing::debug!("dispatcher started on link {}", link.address());

    loop {
        select! {
            recv(link.inbound()) -> frame => match frame {
                Ok(frame) => dispatch(&shared, &frame),
                Err(_) => break,
            },
            recv(shutdown) -> _ => break,
        }
    }

    tracing::debug!("dispatcher on link {} stopped", link.address());
}

/// Decode and route one raw frame
pub(crate) fn dispatch(shared: &Shared, frame: &[u8]) {
    let packet = match Packet::from_bytes(frame) {
        Ok(packet) => packet,
        Err(e) => {
            tracing::debug!("dropping malformed frame: {}", e);
            shared.stats.write().malformed_dropped += 1;
            return;
        }
    };
    shared.stats.write().packets_received += 1;

    if packet.dst.link != shared.link_id {
        tracing::debug!("dropping {} addressed to another host", packet);
        shared.stats.write().unroutable_dropped += 1;
        return;
    }

    let key = packet.connection_key();
    match shared.registry.lookup(&key) {
        Some(socket) => deliver(shared, &socket, &packet),
        None => unconnected(shared, packet),
    }
}

fn deliver(shared: &Shared, socket: &Arc<Socket>, packet: &Packet) {
    match socket.on_packet(packet) {
        PacketOutcome::Ignored => {
            tracing::debug!("{} ignored in state {}", packet, socket.state());
        }
        PacketOutcome::Buffered(len) => {
            shared.stats.write().bytes_received += len as u64;
        }
        PacketOutcome::Reply(reply) => shared.outbound.enqueue(reply),
        PacketOutcome::Established => {
            tracing::info!("connection {} established", packet.connection_key());
            shared.stats.write().connections_established += 1;
        }
        PacketOutcome::Closed { reply } => {
            let key = packet.connection_key();
            tracing::info!("connection {} closed", key);
            shared.registry.unregister_socket(&key, socket);
            shared.stats.write().connections_closed += 1;
            if let Some(reply) = reply {
                shared.outbound.enqueue(reply);
            }
        }
    }
}

fn unconnected(shared: &Shared, packet: Packet) {
    let key = packet.connection_key();
    match packet.kind() {
        PacketKind::Syn => {
            let port = packet.dst.port;
            let now = Instant::now();
            if shared.registry.renew_pending(port, &key, now) {
                tracing::debug!("duplicate SYN for pending {}", key);
                return;
            }

            let socket = Arc::new(Socket::passive(
                packet.dst,
                packet.src,
                shared.config.policy(),
                now,
            ));
            match shared.registry.enqueue_passive(port, socket) {
                Ok(()) => tracing::info!("connection request {} queued on port {}", key, port),
                Err(e) => tracing::debug!("cannot queue {}: {}", key, e),
            }
        }
        PacketKind::Fin => {
            // Our FIN-ACK got lost after we already closed; answer again
            shared
                .outbound
                .enqueue(Packet::fin_ack(packet.dst, packet.src));
        }
        _ => {
            tracing::debug!("no connection for {}", packet);
            shared.stats.write().unroutable_dropped += 1;
        }
    }
}
