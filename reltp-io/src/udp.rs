//! UDP loopback link
//!
//! Lets hosts run as separate processes on one machine. Host `n` listens on
//! `127.0.0.1:(base_port + n)` and a frame for link `m` is sent to
//! `base_port + m`. The same [`LossModel`] as the simulated network decides
//! which frames are actually put on the socket.

use crate::link::{check_frame, LinkError, LinkStats, LossModel, NetworkLink};
use bytes::Bytes;
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use reltp_protocol::{frame_destination, LinkId, LINK_MTU};
use socket2::{Domain, Protocol, Socket, Type};
use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// How often the reader thread checks for shutdown
const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Socket buffer size requested from the OS
const SOCKET_BUFFER_SIZE: usize = 64 * 1024;

/// A link backed by a UDP socket on the loopback interface
pub struct UdpLink {
    address: LinkId,
    base_port: u16,
    socket: UdpSocket,
    loss: Mutex<LossModel>,
    complete_tx: Sender<()>,
    complete_rx: Receiver<()>,
    inbound_rx: Receiver<Bytes>,
    stats: Arc<Mutex<LinkStats>>,
    shutdown: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

fn link_addr(base_port: u16, link: LinkId) -> Result<SocketAddr, LinkError> {
    let port = base_port
        .checked_add(link as u16)
        .ok_or(LinkError::UnknownLink(link))?;
    Ok(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)))
}

impl UdpLink {
    /// Bind host `address` on `127.0.0.1:(base_port + address)`
    pub fn bind(address: LinkId, base_port: u16, reliability: f64) -> Result<Self, LinkError> {
        let local = link_addr(base_port, address)?;

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_recv_buffer_size(SOCKET_BUFFER_SIZE)?;
        socket.set_send_buffer_size(SOCKET_BUFFER_SIZE)?;
        socket.bind(&local.into())?;
        socket.set_read_timeout(Some(READ_TIMEOUT))?;
        let socket: UdpSocket = socket.into();

        let (inbound_tx, inbound_rx) = channel::unbounded();
        let (complete_tx, complete_rx) = channel::unbounded();
        let stats = Arc::new(Mutex::new(LinkStats::default()));
        let shutdown = Arc::new(AtomicBool::new(false));

        let reader = {
            let socket = socket.try_clone()?;
            let stats = stats.clone();
            let shutdown = shutdown.clone();
            thread::Builder::new()
                .name(format!("reltp-udp-{}", address))
                .spawn(move || read_loop(socket, inbound_tx, stats, shutdown))?
        };

        tracing::info!("UDP link {} bound to {}", address, local);

        Ok(UdpLink {
            address,
            base_port,
            socket,
            loss: Mutex::new(LossModel::new(reliability)),
            complete_tx,
            complete_rx,
            inbound_rx,
            stats,
            shutdown,
            reader: Some(reader),
        })
    }

    /// Local socket address
    pub fn local_addr(&self) -> Result<SocketAddr, LinkError> {
        Ok(self.socket.local_addr()?)
    }
}

fn read_loop(
    socket: UdpSocket,
    inbound: Sender<Bytes>,
    stats: Arc<Mutex<LinkStats>>,
    shutdown: Arc<AtomicBool>,
) {
    // One spare byte so oversized datagrams are detectable
    let mut buf = [0u8; LINK_MTU + 1];

    while !shutdown.load(Ordering::Relaxed) {
        match socket.recv_from(&mut buf) {
            Ok((n, from)) => {
                if n > LINK_MTU {
                    tracing::debug!("oversized datagram ({} bytes) from {} dropped", n, from);
                    continue;
                }
                stats.lock().frames_received += 1;
                if inbound.send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                    break;
                }
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => continue,
            Err(e) => {
                tracing::warn!("UDP receive error: {}", e);
                thread::sleep(READ_TIMEOUT);
            }
        }
    }
}

impl NetworkLink for UdpLink {
    fn address(&self) -> LinkId {
        self.address
    }

    fn transmit(&self, frame: Bytes) -> Result<(), LinkError> {
        check_frame(&frame)?;
        let dst = frame_destination(&frame).ok_or(LinkError::Disconnected)?;
        let target = link_addr(self.base_port, dst)?;

        self.stats.lock().frames_transmitted += 1;
        if self.loss.lock().deliver() {
            match self.socket.send_to(&frame, target) {
                Ok(_) => self.stats.lock().frames_delivered += 1,
                // Nobody listening is just another lost frame
                Err(e) if e.kind() == ErrorKind::ConnectionRefused => {
                    self.stats.lock().frames_lost += 1
                }
                Err(e) => return Err(LinkError::Io(e)),
            }
        } else {
            self.stats.lock().frames_lost += 1;
        }

        self.complete_tx
            .send(())
            .map_err(|_| LinkError::Disconnected)
    }

    fn send_complete(&self) -> &Receiver<()> {
        &self.complete_rx
    }

    fn inbound(&self) -> &Receiver<Bytes> {
        &self.inbound_rx
    }

    fn stats(&self) -> LinkStats {
        self.stats.lock().clone()
    }
}

impl Drop for UdpLink {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Each test uses its own base port range to avoid cross-test collisions
    #[test]
    fn test_udp_frames_between_links() {
        let base = 47100;
        let a = UdpLink::bind(1, base, 1.0).unwrap();
        let b = UdpLink::bind(2, base, 1.0).unwrap();

        a.transmit(Bytes::from(vec![2, 1, 0, 0, 0, 1, 42])).unwrap();
        a.send_complete()
            .recv_timeout(Duration::from_secs(1))
            .unwrap();

        let frame = b.inbound().recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(frame[6], 42);
        assert_eq!(b.stats().frames_received, 1);
    }

    #[test]
    fn test_udp_local_addr() {
        let link = UdpLink::bind(3, 47200, 1.0).unwrap();
        assert_eq!(link.local_addr().unwrap().port(), 47203);
    }

    #[test]
    fn test_udp_oversized_frame_rejected() {
        let link = UdpLink::bind(1, 47300, 1.0).unwrap();
        assert!(matches!(
            link.transmit(Bytes::from(vec![0u8; LINK_MTU + 1])),
            Err(LinkError::FrameTooLarge { .. })
        ));
    }
}
