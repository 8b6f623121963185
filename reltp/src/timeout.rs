//! Timeout Monitor
//!
//! Wakes every retransmission interval and runs each socket's retransmission
//! check in turn. The sweep is synchronous, so one slow socket delays the
//! rest.

use crate::transport::Shared;
use crossbeam::channel::{select, Receiver};
use reltp_protocol::TimeoutAction;
use std::sync::Arc;
use std::time::Instant;

/// Timeout Monitor loop; returns when `shutdown` disconnects
pub(crate) fn run(shared: Arc<Shared>, shutdown: Receiver<()>) {
    let interval = shared.config.retransmission_interval;
    tracing::debug!("timeout monitor started, interval {:?}", interval);

    loop {
        select! {
            recv(shutdown) -> _ => break,
            default(interval) => sweep(&shared, Instant::now()),
        }
    }

    tracing::debug!("timeout monitor stopped");
}

/// Visit every registered socket once, then drop lapsed connection requests
pub(crate) fn sweep(shared: &Shared, now: Instant) {
    for socket in shared.registry.sweep_targets() {
        match socket.on_timeout(now) {
            TimeoutAction::Idle => {}
            TimeoutAction::Retransmit(packet) => {
                tracing::debug!("retransmitting {} (retry {})", packet, socket.retry_count());
                shared.stats.write().retransmissions += 1;
                shared.outbound.enqueue(packet);
            }
            TimeoutAction::Aborted => {
                tracing::warn!(
                    "{:?} gave up after {} retries",
                    socket.key(),
                    socket.retry_count()
                );
                shared.stats.write().handshake_timeouts += 1;
                if let Some(key) = socket.key() {
                    shared.registry.unregister_socket(&key, &socket);
                }
                shared.registry.remove_contender(&socket);
            }
        }
    }

    let expired = shared.registry.expire_pending(now);
    if !expired.is_empty() {
        for socket in &expired {
            tracing::debug!("connection request {:?} lapsed before accept", socket.key());
        }
        shared.stats.write().requests_expired += expired.len() as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportConfig;
    use crate::sender::OutboundQueue;
    use reltp_protocol::{NetworkAddress, PacketKind, Socket, SocketState};
    use std::time::Duration;

    #[test]
    fn test_sweep_retransmits_then_aborts() {
        let (outbound, rx) = OutboundQueue::channel();
        let config = TransportConfig {
            retransmission_interval: Duration::from_millis(50),
            max_retry: 3,
        };
        let shared = Shared::new(1, config, outbound);

        let socket = Arc::new(Socket::new(NetworkAddress::new(1, 3), config.policy()));
        let start = Instant::now();
        socket
            .begin_connect(NetworkAddress::new(2, 7), start)
            .unwrap();
        let key = socket.key().unwrap();
        shared.registry.register(key, socket.clone());

        for step in 1..=4 {
            sweep(&shared, start + Duration::from_millis(50 * step));
        }

        let resent: Vec<_> = rx.try_iter().collect();
        assert_eq!(resent.len(), 2);
        assert!(resent.iter().all(|p| p.kind() == PacketKind::Syn));
        assert_eq!(socket.state(), SocketState::Closed);
        assert_eq!(socket.retry_count(), 3);
        assert!(shared.registry.lookup(&key).is_none());

        let stats = shared.stats.read();
        assert_eq!(stats.retransmissions, 2);
        assert_eq!(stats.handshake_timeouts, 1);
    }

    #[test]
    fn test_sweep_ignores_idle_sockets() {
        let (outbound, rx) = OutboundQueue::channel();
        let shared = Shared::new(1, TransportConfig::default(), outbound);
        let socket = Arc::new(Socket::passive(
            NetworkAddress::new(1, 3),
            NetworkAddress::new(2, 7),
            TransportConfig::default().policy(),
            Instant::now(),
        ));
        socket.accept().unwrap();
        shared.registry.register(socket.key().unwrap(), socket.clone());

        sweep(&shared, Instant::now() + Duration::from_secs(60));

        assert!(rx.try_recv().is_err());
        assert!(socket.is_established());
    }

    #[test]
    fn test_sweep_drops_lapsed_requests() {
        let (outbound, rx) = OutboundQueue::channel();
        let config = TransportConfig {
            retransmission_interval: Duration::from_millis(50),
            max_retry: 3,
        };
        let shared = Shared::new(1, config, outbound);
        let start = Instant::now();
        let request = Arc::new(Socket::passive(
            NetworkAddress::new(1, 3),
            NetworkAddress::new(2, 7),
            config.policy(),
            start,
        ));
        shared.registry.enqueue_passive(3, request.clone()).unwrap();

        sweep(&shared, start + Duration::from_millis(100));
        assert_eq!(shared.registry.pending_count(3), 1);

        sweep(&shared, start + Duration::from_millis(150));
        assert_eq!(shared.registry.pending_count(3), 0);
        assert_eq!(request.state(), SocketState::Closed);
        assert_eq!(shared.stats.read().requests_expired, 1);
        assert!(rx.try_recv().is_err());
    }
}
