//! Connection establishment and teardown between simulated hosts

use reltp::io::SimulatedNetwork;
use reltp::protocol::{NetworkAddress, Packet, PacketKind, SocketState};
use reltp::{ConnectionKey, Socket, TransportError};
use reltp_tests::{fast_config, start_host, wait_until};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const CLIENT: NetworkAddress = NetworkAddress::new(1, 9);
const SERVER: NetworkAddress = NetworkAddress::new(2, 4);
const WAIT: Duration = Duration::from_secs(2);

#[test]
fn test_handshake_registers_both_ends() {
    let network = SimulatedNetwork::new(1.0);
    let client = start_host(&network, 1, fast_config());
    let server = start_host(&network, 2, fast_config());

    let socket = Arc::new(Socket::new(CLIENT, fast_config().policy()));
    let connector = {
        let client = client.clone();
        let socket = socket.clone();
        thread::spawn(move || client.create_connection(SERVER, &socket))
    };

    assert!(wait_until(WAIT, || server.registry().pending_count(4) == 1));
    let accepted = server.accept_pending(4).unwrap();
    connector.join().unwrap().unwrap();

    assert_eq!(socket.state(), SocketState::Established);
    assert_eq!(accepted.state(), SocketState::Established);

    let key = ConnectionKey::new(CLIENT, SERVER);
    assert_eq!(socket.key(), Some(key));
    assert_eq!(accepted.key(), Some(ConnectionKey::new(SERVER, CLIENT)));
    assert!(client.registry().lookup(&key).is_some());
    assert!(server.registry().lookup(&ConnectionKey::new(SERVER, CLIENT)).is_some());
    assert_eq!(client.stats().connections_established, 1);
    assert_eq!(server.stats().connections_established, 1);
}

#[test]
fn test_duplicate_syn_does_not_restart_handshake() {
    let network = SimulatedNetwork::new(1.0);
    let client = start_host(&network, 1, fast_config());
    let server = start_host(&network, 2, fast_config());

    let socket = Arc::new(Socket::new(CLIENT, fast_config().policy()));
    let connector = {
        let client = client.clone();
        let socket = socket.clone();
        thread::spawn(move || client.create_connection(SERVER, &socket))
    };
    assert!(wait_until(WAIT, || server.registry().pending_count(4) == 1));
    let accepted = server.accept_pending(4).unwrap();
    connector.join().unwrap().unwrap();

    let tap = network.tap();
    network
        .inject(2, Packet::syn(CLIENT, SERVER).to_bytes())
        .unwrap();

    let answered = wait_until(WAIT, || {
        tap.try_iter()
            .filter_map(|frame| Packet::from_bytes(&frame).ok())
            .any(|packet| packet.kind() == PacketKind::SynAck && packet.src == SERVER)
    });
    assert!(answered);
    assert_eq!(accepted.state(), SocketState::Established);
    assert_eq!(server.registry().pending_count(4), 0);
    assert_eq!(server.stats().connections_established, 1);
    assert!(socket.is_established());
}

#[test]
fn test_connect_to_absent_host_times_out() {
    let network = SimulatedNetwork::new(1.0);
    let client = start_host(&network, 1, fast_config());
    let socket = Arc::new(Socket::new(CLIENT, fast_config().policy()));

    let err = client
        .create_connection(NetworkAddress::new(7, 4), &socket)
        .unwrap_err();

    assert!(matches!(err, TransportError::HandshakeTimeout { retries: 3 }));
    assert_eq!(socket.retry_count(), fast_config().max_retry);
    assert_eq!(client.registry().active_count(), 0);
    assert_eq!(client.stats().handshake_timeouts, 1);
}

#[test]
fn test_racing_connects_share_no_slot() {
    let network = SimulatedNetwork::new(1.0);
    let client = start_host(&network, 1, fast_config());
    let server = start_host(&network, 2, fast_config());
    let key = ConnectionKey::new(CLIENT, SERVER);

    let first = Arc::new(Socket::new(CLIENT, fast_config().policy()));
    let first_connect = {
        let client = client.clone();
        let socket = first.clone();
        thread::spawn(move || client.create_connection(SERVER, &socket))
    };
    assert!(wait_until(WAIT, || client.registry().lookup(&key).is_some()));

    let second = Arc::new(Socket::new(CLIENT, fast_config().policy()));
    let second_connect = {
        let client = client.clone();
        let socket = second.clone();
        thread::spawn(move || client.create_connection(SERVER, &socket))
    };

    assert!(wait_until(WAIT, || server.registry().pending_count(4) == 1));
    server.accept_pending(4).unwrap();

    first_connect.join().unwrap().unwrap();
    let err = second_connect.join().unwrap().unwrap_err();
    assert!(matches!(err, TransportError::HandshakeTimeout { .. }));

    assert!(first.is_established());
    assert_eq!(second.state(), SocketState::Closed);
    let owner = client.registry().lookup(&key).unwrap();
    assert!(Arc::ptr_eq(&owner, &first));
    assert_eq!(server.registry().pending_count(4), 0);
}

#[test]
fn test_graceful_close() {
    let network = SimulatedNetwork::new(1.0);
    let client = start_host(&network, 1, fast_config());
    let server = start_host(&network, 2, fast_config());

    let socket = Arc::new(Socket::new(CLIENT, fast_config().policy()));
    let connector = {
        let client = client.clone();
        let socket = socket.clone();
        thread::spawn(move || client.create_connection(SERVER, &socket))
    };
    assert!(wait_until(WAIT, || server.registry().pending_count(4) == 1));
    let accepted = server.accept_pending(4).unwrap();
    connector.join().unwrap().unwrap();

    client.close_connection(&socket).unwrap();

    let key = ConnectionKey::new(CLIENT, SERVER);
    assert_eq!(socket.state(), SocketState::Closed);
    assert!(client.registry().lookup(&key).is_none());
    assert!(wait_until(WAIT, || accepted.state() == SocketState::Closed));
    assert!(server.registry().lookup(&ConnectionKey::new(SERVER, CLIENT)).is_none());

    // The passive side sees end of stream
    let mut buf = [0u8; 8];
    assert_eq!(accepted.read(&mut buf), 0);
    server.close_connection(&accepted).unwrap();
}

#[test]
fn test_close_without_peer_ends_closed() {
    let network = SimulatedNetwork::new(1.0);
    let client = start_host(&network, 1, fast_config());
    let server = start_host(&network, 2, fast_config());

    let socket = Arc::new(Socket::new(CLIENT, fast_config().policy()));
    let connector = {
        let client = client.clone();
        let socket = socket.clone();
        thread::spawn(move || client.create_connection(SERVER, &socket))
    };
    assert!(wait_until(WAIT, || server.registry().pending_count(4) == 1));
    server.accept_pending(4).unwrap();
    connector.join().unwrap().unwrap();

    // Every FIN is lost from now on
    network.set_reliability(0.0);
    let err = client.close_connection(&socket).unwrap_err();

    assert!(matches!(err, TransportError::HandshakeTimeout { retries: 3 }));
    assert_eq!(socket.state(), SocketState::Closed);
    assert_eq!(client.registry().active_count(), 0);
}
