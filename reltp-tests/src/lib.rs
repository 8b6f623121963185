//! Shared helpers for the reltp integration tests

use reltp::io::{NetworkLink, SimulatedNetwork};
use reltp::{NetProcess, Transport, TransportConfig};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Short interval so timeouts resolve quickly in tests
pub fn fast_config() -> TransportConfig {
    TransportConfig {
        retransmission_interval: Duration::from_millis(20),
        max_retry: 3,
    }
}

/// Attach a host at `link` and start its transport
pub fn start_host(network: &SimulatedNetwork, link: u8, config: TransportConfig) -> Arc<Transport> {
    let link: Arc<dyn NetworkLink> = Arc::new(network.attach(link).expect("attach link"));
    Arc::new(Transport::new(link, config).expect("start transport"))
}

pub fn start_process(network: &SimulatedNetwork, link: u8) -> Arc<NetProcess> {
    Arc::new(NetProcess::new(start_host(network, link, fast_config())))
}

/// Poll `condition` until it holds or `timeout` passes
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Keep calling `accept` until a connection comes in
pub fn accept_blocking(process: &NetProcess, port: i32, timeout: Duration) -> i32 {
    let mut fd = -1;
    wait_until(timeout, || {
        fd = process.accept(port);
        fd >= 0
    });
    fd
}

/// Read until `len` bytes arrived, the stream ended or `timeout` passed
pub fn read_exact(process: &NetProcess, fd: i32, len: usize, timeout: Duration) -> Vec<u8> {
    let mut received = Vec::new();
    let mut buf = [0u8; 64];
    wait_until(timeout, || {
        loop {
            let n = process.read(fd, &mut buf);
            if n <= 0 {
                return n < 0 || received.len() >= len;
            }
            received.extend_from_slice(&buf[..n as usize]);
        }
    });
    received
}
