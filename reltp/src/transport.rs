//! The transport runtime of one host
//!
//! A [`Transport`] owns the registry and the outbound queue of a host and runs
//! three workers against its link: the dispatcher, the sender and the timeout
//! monitor. The connection-establishment API blocks the calling thread on the
//! socket's condition variable while the workers drive the handshake.

use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::ports::PortAllocator;
use crate::registry::Registry;
use crate::sender::OutboundQueue;
use crate::stats::TransportStats;
use crate::{dispatcher, sender, timeout};
use bytes::Bytes;
use crossbeam::channel::{self, Sender};
use parking_lot::{Mutex, RwLock};
use reltp_io::{LinkStats, NetworkLink};
use reltp_protocol::socket::SocketError;
use reltp_protocol::{
    CloseOutcome, ConnectionKey, HandshakeOutcome, LinkId, NetworkAddress, Packet, Port, Socket,
    SocketState, MAX_PAYLOAD_SIZE,
};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

/// State shared between the API and the workers
pub(crate) struct Shared {
    pub(crate) config: TransportConfig,
    pub(crate) link_id: LinkId,
    pub(crate) registry: Registry,
    pub(crate) outbound: OutboundQueue,
    pub(crate) ports: PortAllocator,
    pub(crate) stats: Arc<RwLock<TransportStats>>,
}

impl Shared {
    pub(crate) fn new(link_id: LinkId, config: TransportConfig, outbound: OutboundQueue) -> Self {
        Shared {
            config,
            link_id,
            registry: Registry::new(),
            outbound,
            ports: PortAllocator::new(),
            stats: Arc::new(RwLock::new(TransportStats::default())),
        }
    }
}

/// Reliable transport bound to one link
pub struct Transport {
    shared: Arc<Shared>,
    link: Arc<dyn NetworkLink>,
    shutdown_tx: Mutex<Option<Sender<()>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Transport {
    /// Start the transport on `link`
    pub fn new(link: Arc<dyn NetworkLink>, config: TransportConfig) -> Result<Self, TransportError> {
        let link_id = link.address();
        let (outbound, queue) = OutboundQueue::channel();
        let shared = Arc::new(Shared::new(link_id, config, outbound));
        let (shutdown_tx, shutdown_rx) = channel::bounded::<()>(0);

        let mut workers = Vec::with_capacity(3);

        let dispatch = {
            let shared = shared.clone();
            let link = link.clone();
            let shutdown = shutdown_rx.clone();
            thread::Builder::new()
                .name(format!("reltp-dispatch-{}", link_id))
                .spawn(move || dispatcher::run(shared, link, shutdown))?
        };
        workers.push(dispatch);

        let send = {
            let link = link.clone();
            let stats = shared.stats.clone();
            let shutdown = shutdown_rx.clone();
            thread::Builder::new()
                .name(format!("reltp-send-{}", link_id))
                .spawn(move || sender::run(link, queue, shutdown, stats))?
        };
        workers.push(send);

        let sweep = {
            let shared = shared.clone();
            thread::Builder::new()
                .name(format!("reltp-timeout-{}", link_id))
                .spawn(move || timeout::run(shared, shutdown_rx))?
        };
        workers.push(sweep);

        tracing::info!(
            "transport started on link {} (interval {:?}, max retry {})",
            link_id,
            config.retransmission_interval,
            config.max_retry
        );

        Ok(Transport {
            shared,
            link,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            workers: Mutex::new(workers),
        })
    }

    /// Actively open a connection from `socket` to `remote`
    ///
    /// Blocks until the handshake completes or the retry budget runs out. If
    /// another live socket already holds the connection key, `socket` never
    /// takes it over and never sends: it is tracked only so the timeout
    /// monitor can fail it.
    pub fn create_connection(
        &self,
        remote: NetworkAddress,
        socket: &Arc<Socket>,
    ) -> Result<(), TransportError> {
        self.check_running()?;
        if !remote.has_valid_port() {
            return Err(TransportError::InvalidPort(remote.port as i64));
        }
        if !socket.local().has_valid_port() {
            return Err(TransportError::InvalidPort(socket.local().port as i64));
        }

        let key = ConnectionKey::new(socket.local(), remote);
        let syn = socket.begin_connect(remote, Instant::now())?;

        if let Err(e) = self.admit(key, socket, syn) {
            socket.abort();
            return Err(e);
        }

        match socket.wait_handshake() {
            HandshakeOutcome::Established => Ok(()),
            HandshakeOutcome::TimedOut => {
                self.shared.registry.unregister_socket(&key, socket);
                self.shared.registry.remove_contender(socket);
                self.check_running()?;
                Err(TransportError::HandshakeTimeout {
                    retries: socket.retry_count(),
                })
            }
        }
    }

    fn admit(
        &self,
        key: ConnectionKey,
        socket: &Arc<Socket>,
        syn: Packet,
    ) -> Result<(), TransportError> {
        if self.shared.registry.register_if_vacant(key, socket.clone())? {
            self.shared.outbound.enqueue(syn);
        } else {
            tracing::warn!("{} already in use, connect attempt parked", key);
            socket.park();
            self.shared.registry.park_contender(socket.clone())?;
        }
        Ok(())
    }

    /// Complete the passive open of a socket taken from a pending queue
    pub fn accept_connection(&self, socket: &Arc<Socket>) -> Result<(), TransportError> {
        self.check_running()?;
        let key = socket
            .key()
            .ok_or_else(|| SocketError::InvalidState(socket.state()))?;

        let syn_ack = socket.accept()?;
        self.shared.registry.register(key, socket.clone());
        self.shared.outbound.enqueue(syn_ack);
        self.shared.stats.write().connections_established += 1;
        tracing::info!("connection {} accepted", key);
        Ok(())
    }

    /// Accept the oldest connection request queued on `port`
    ///
    /// Never waits: an empty queue is refused immediately. Requests whose
    /// connector has already given up are discarded on the way.
    pub fn accept_pending(&self, port: Port) -> Result<Arc<Socket>, TransportError> {
        loop {
            let socket = self
                .shared
                .registry
                .dequeue_passive(port)?
                .ok_or(TransportError::ConnectionRefused(port))?;
            if socket.expire(Instant::now()) || socket.state() != SocketState::SynReceived {
                tracing::debug!("skipping lapsed connection request {:?}", socket.key());
                self.shared.stats.write().requests_expired += 1;
                continue;
            }
            self.accept_connection(&socket)?;
            return Ok(socket);
        }
    }

    /// Gracefully close an established connection
    ///
    /// The socket is `Closed` and unregistered when this returns, whether or
    /// not the peer acknowledged.
    pub fn close_connection(&self, socket: &Arc<Socket>) -> Result<(), TransportError> {
        let key = socket.key();
        let result = match socket.begin_close(Instant::now())? {
            None => Ok(()),
            Some(fin) => {
                self.shared.outbound.enqueue(fin);
                match socket.wait_close() {
                    CloseOutcome::Completed => Ok(()),
                    CloseOutcome::TimedOut => self.check_running().and(Err(
                        TransportError::HandshakeTimeout {
                            retries: socket.retry_count(),
                        },
                    )),
                }
            }
        };

        if let Some(key) = key {
            self.shared.registry.unregister_socket(&key, socket);
        }
        result
    }

    /// Queue `data` on an established connection
    ///
    /// Data is cut into packets of at most [`MAX_PAYLOAD_SIZE`] bytes.
    /// Returns the number of bytes queued.
    pub fn send(&self, socket: &Socket, data: &[u8]) -> Result<usize, TransportError> {
        self.check_running()?;
        let remote = match socket.remote() {
            Some(remote) if socket.is_established() => remote,
            _ => return Err(SocketError::InvalidState(socket.state()).into()),
        };

        for chunk in data.chunks(MAX_PAYLOAD_SIZE) {
            let packet = Packet::data(socket.local(), remote, Bytes::copy_from_slice(chunk))?;
            self.shared.outbound.enqueue(packet);
        }
        self.shared.stats.write().bytes_sent += data.len() as u64;
        Ok(data.len())
    }

    pub fn link_id(&self) -> LinkId {
        self.shared.link_id
    }

    pub fn config(&self) -> TransportConfig {
        self.shared.config
    }

    pub fn registry(&self) -> &Registry {
        &self.shared.registry
    }

    pub fn ports(&self) -> &PortAllocator {
        &self.shared.ports
    }

    pub fn stats(&self) -> TransportStats {
        self.shared.stats.read().clone()
    }

    pub fn link_stats(&self) -> LinkStats {
        self.link.stats()
    }

    pub fn is_running(&self) -> bool {
        self.shutdown_tx.lock().is_some()
    }

    /// Stop the workers and abort every socket
    ///
    /// Threads blocked in the API wake up with [`TransportError::Shutdown`].
    pub fn shutdown(&self) {
        let Some(shutdown_tx) = self.shutdown_tx.lock().take() else {
            return;
        };
        drop(shutdown_tx);

        for worker in self.workers.lock().drain(..) {
            if worker.join().is_err() {
                tracing::warn!("transport worker panicked");
            }
        }

        for socket in self.shared.registry.drain() {
            socket.abort();
        }
        tracing::info!("transport on link {} shut down", self.shared.link_id);
    }

    fn check_running(&self) -> Result<(), TransportError> {
        if self.is_running() {
            Ok(())
        } else {
            Err(TransportError::Shutdown)
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reltp_io::SimulatedNetwork;
    use std::time::Duration;

    fn fast_config() -> TransportConfig {
        TransportConfig {
            retransmission_interval: Duration::from_millis(20),
            max_retry: 3,
        }
    }

    fn host(network: &SimulatedNetwork, link: LinkId) -> Transport {
        let link: Arc<dyn NetworkLink> = Arc::new(network.attach(link).unwrap());
        Transport::new(link, fast_config()).unwrap()
    }

    fn wait_pending(transport: &Transport, port: Port) {
        for _ in 0..200 {
            if transport.registry().pending_count(port) > 0 {
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("no connection request arrived on port {}", port);
    }

    #[test]
    fn test_connect_and_accept() {
        let network = SimulatedNetwork::new(1.0);
        let client = Arc::new(host(&network, 1));
        let server = host(&network, 2);

        let socket = Arc::new(Socket::new(NetworkAddress::new(1, 9), fast_config().policy()));
        let connector = {
            let client = client.clone();
            let socket = socket.clone();
            thread::spawn(move || client.create_connection(NetworkAddress::new(2, 4), &socket))
        };

        wait_pending(&server, 4);
        let accepted = server.accept_pending(4).unwrap();
        assert!(accepted.is_established());

        connector.join().unwrap().unwrap();
        assert!(socket.is_established());
        let key = socket.key().unwrap();
        assert!(Arc::ptr_eq(&client.registry().lookup(&key).unwrap(), &socket));
    }

    #[test]
    fn test_connect_without_peer_times_out() {
        let network = SimulatedNetwork::new(1.0);
        let client = host(&network, 1);
        let socket = Arc::new(Socket::new(NetworkAddress::new(1, 3), fast_config().policy()));

        let err = client
            .create_connection(NetworkAddress::new(7, 3), &socket)
            .unwrap_err();

        assert!(matches!(err, TransportError::HandshakeTimeout { retries: 3 }));
        assert_eq!(socket.state(), SocketState::Closed);
        assert_eq!(client.registry().active_count(), 0);
        assert_eq!(client.stats().retransmissions, 2);
    }

    #[test]
    fn test_accept_pending_empty_is_refused() {
        let network = SimulatedNetwork::new(1.0);
        let server = host(&network, 2);
        assert!(matches!(
            server.accept_pending(5),
            Err(TransportError::ConnectionRefused(5))
        ));
        assert!(matches!(
            server.accept_pending(200),
            Err(TransportError::InvalidPort(200))
        ));
    }

    #[test]
    fn test_send_requires_established_socket() {
        let network = SimulatedNetwork::new(1.0);
        let client = host(&network, 1);
        let socket = Socket::new(NetworkAddress::new(1, 3), fast_config().policy());
        assert!(matches!(
            client.send(&socket, b"hello"),
            Err(TransportError::InvalidState(_))
        ));
    }

    #[test]
    fn test_shutdown_rejects_new_work() {
        let network = SimulatedNetwork::new(1.0);
        let client = host(&network, 1);
        client.shutdown();
        client.shutdown();

        let socket = Arc::new(Socket::new(NetworkAddress::new(1, 3), fast_config().policy()));
        assert!(matches!(
            client.create_connection(NetworkAddress::new(2, 3), &socket),
            Err(TransportError::Shutdown)
        ));
        assert_eq!(socket.state(), SocketState::Closed);
    }

    #[test]
    fn test_connect_racing_shutdown_fails_fast() {
        let network = SimulatedNetwork::new(1.0);
        let client = host(&network, 1);
        // Shutdown has drained the registry but not yet been observed here
        client.shared.registry.drain();

        let socket = Arc::new(Socket::new(NetworkAddress::new(1, 3), fast_config().policy()));
        assert!(matches!(
            client.create_connection(NetworkAddress::new(2, 3), &socket),
            Err(TransportError::Shutdown)
        ));
        assert_eq!(socket.state(), SocketState::Closed);
        assert!(client.registry().sweep_targets().is_empty());
    }

    #[test]
    fn test_accept_after_connector_gave_up_is_refused() {
        let network = SimulatedNetwork::new(1.0);
        let client = host(&network, 1);
        let server = host(&network, 2);

        let socket = Arc::new(Socket::new(NetworkAddress::new(1, 9), fast_config().policy()));
        let err = client
            .create_connection(NetworkAddress::new(2, 4), &socket)
            .unwrap_err();
        assert!(matches!(err, TransportError::HandshakeTimeout { .. }));

        for _ in 0..200 {
            if server.registry().pending_count(4) == 0 {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert!(matches!(
            server.accept_pending(4),
            Err(TransportError::ConnectionRefused(4))
        ));
        assert_eq!(server.stats().requests_expired, 1);
        assert_eq!(server.stats().connections_established, 0);
    }

    #[test]
    fn test_close_interrupted_by_shutdown() {
        let network = SimulatedNetwork::new(1.0);
        let slow = TransportConfig {
            retransmission_interval: Duration::from_secs(5),
            max_retry: 3,
        };
        let link: Arc<dyn NetworkLink> = Arc::new(network.attach(1).unwrap());
        let client = Arc::new(Transport::new(link, slow).unwrap());
        let server = host(&network, 2);

        let socket = Arc::new(Socket::new(NetworkAddress::new(1, 9), slow.policy()));
        let connector = {
            let client = client.clone();
            let socket = socket.clone();
            thread::spawn(move || client.create_connection(NetworkAddress::new(2, 4), &socket))
        };
        wait_pending(&server, 4);
        server.accept_pending(4).unwrap();
        connector.join().unwrap().unwrap();

        // The FIN never arrives, so only shutdown can end the wait
        network.set_reliability(0.0);
        let closer = {
            let client = client.clone();
            let socket = socket.clone();
            thread::spawn(move || client.close_connection(&socket))
        };
        thread::sleep(Duration::from_millis(50));
        client.shutdown();

        assert!(matches!(closer.join().unwrap(), Err(TransportError::Shutdown)));
        assert_eq!(socket.state(), SocketState::Closed);
    }
}
