//! Syscall-style process layer
//!
//! A [`NetProcess`] gives a process a small descriptor table over one
//! [`Transport`]. Every call returns an `i32`: a descriptor or byte count on
//! success and `-1` on any failure, with the cause logged.

use crate::error::TransportError;
use crate::transport::Transport;
use parking_lot::Mutex;
use reltp_protocol::address::is_valid_port;
use reltp_protocol::{LinkId, NetworkAddress, Port, Socket};
use std::sync::Arc;

/// Descriptor table size
pub const MAX_OPEN_FILES: usize = 16;

enum Descriptor {
    /// Claimed by a connect or accept that has not finished yet
    Reserved,
    Open {
        socket: Arc<Socket>,
        /// Local port allocated by `connect`, released on close
        owned_port: Option<Port>,
    },
}

/// Network syscalls of one process
pub struct NetProcess {
    transport: Arc<Transport>,
    files: Mutex<Vec<Option<Descriptor>>>,
}

impl NetProcess {
    pub fn new(transport: Arc<Transport>) -> Self {
        let mut files = Vec::with_capacity(MAX_OPEN_FILES);
        files.resize_with(MAX_OPEN_FILES, || None);
        NetProcess {
            transport,
            files: Mutex::new(files),
        }
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    /// Number of descriptors in use
    pub fn open_files(&self) -> usize {
        self.files.lock().iter().filter(|slot| slot.is_some()).count()
    }

    /// Connect to `port` on host `host`, blocking for the handshake
    pub fn connect(&self, host: i32, port: i32) -> i32 {
        let Ok(host) = LinkId::try_from(host) else {
            tracing::debug!("connect: no such host {}", host);
            return -1;
        };
        if !is_valid_port(port as i64) {
            tracing::debug!("connect: port {} out of range", port);
            return -1;
        }
        let Some(fd) = self.reserve_slot() else {
            tracing::debug!("connect: descriptor table full");
            return -1;
        };
        let Some(local_port) = self.transport.ports().allocate() else {
            tracing::debug!("connect: no free local port");
            self.release_slot(fd);
            return -1;
        };

        let local = NetworkAddress::new(self.transport.link_id(), local_port);
        let remote = NetworkAddress::new(host, port as Port);
        let socket = Arc::new(Socket::new(local, self.transport.config().policy()));

        match self.transport.create_connection(remote, &socket) {
            Ok(()) => {
                self.install(fd, socket, Some(local_port));
                fd as i32
            }
            Err(e) => {
                tracing::debug!("connect to {} failed: {}", remote, e);
                self.transport.ports().release(local_port);
                self.release_slot(fd);
                -1
            }
        }
    }

    /// Accept the oldest connection request on `port` without waiting
    pub fn accept(&self, port: i32) -> i32 {
        if !is_valid_port(port as i64) {
            tracing::debug!("accept: port {} out of range", port);
            return -1;
        }
        let Some(fd) = self.reserve_slot() else {
            tracing::debug!("accept: descriptor table full");
            return -1;
        };

        match self.transport.accept_pending(port as Port) {
            Ok(socket) => {
                self.install(fd, socket, None);
                fd as i32
            }
            Err(e) => {
                if !matches!(e, TransportError::ConnectionRefused(_)) {
                    tracing::debug!("accept on port {} failed: {}", port, e);
                }
                self.release_slot(fd);
                -1
            }
        }
    }

    /// Copy already-received bytes into `buf` without blocking
    ///
    /// Returns 0 when nothing is buffered yet and -1 once the peer has closed
    /// and everything has been read.
    pub fn read(&self, fd: i32, buf: &mut [u8]) -> i32 {
        let Some(socket) = self.socket(fd) else {
            return -1;
        };
        let n = socket.try_read(buf);
        if n == 0 && !buf.is_empty() && socket.is_drained() {
            return -1;
        }
        n as i32
    }

    /// Queue `data` on the connection
    pub fn write(&self, fd: i32, data: &[u8]) -> i32 {
        let Some(socket) = self.socket(fd) else {
            return -1;
        };
        match self.transport.send(&socket, data) {
            Ok(n) => n as i32,
            Err(e) => {
                tracing::debug!("write on fd {} failed: {}", fd, e);
                -1
            }
        }
    }

    /// Close the connection and free the descriptor
    ///
    /// The descriptor is freed even when the peer never acknowledges.
    pub fn close(&self, fd: i32) -> i32 {
        let Some(index) = fd_index(fd) else {
            return -1;
        };
        let descriptor = {
            let mut files = self.files.lock();
            match files[index] {
                Some(Descriptor::Open { .. }) => files[index].take(),
                _ => None,
            }
        };
        let Some(Descriptor::Open { socket, owned_port }) = descriptor else {
            return -1;
        };

        let result = self.transport.close_connection(&socket);
        if let Some(port) = owned_port {
            self.transport.ports().release(port);
        }
        match result {
            Ok(()) => 0,
            Err(e) => {
                tracing::debug!("close of fd {} failed: {}", fd, e);
                -1
            }
        }
    }

    fn reserve_slot(&self) -> Option<usize> {
        let mut files = self.files.lock();
        let fd = files.iter().position(Option::is_none)?;
        files[fd] = Some(Descriptor::Reserved);
        Some(fd)
    }

    fn release_slot(&self, fd: usize) {
        self.files.lock()[fd] = None;
    }

    fn install(&self, fd: usize, socket: Arc<Socket>, owned_port: Option<Port>) {
        self.files.lock()[fd] = Some(Descriptor::Open { socket, owned_port });
    }

    fn socket(&self, fd: i32) -> Option<Arc<Socket>> {
        let files = self.files.lock();
        match files.get(fd_index(fd)?) {
            Some(Some(Descriptor::Open { socket, .. })) => Some(socket.clone()),
            _ => None,
        }
    }
}

fn fd_index(fd: i32) -> Option<usize> {
    usize::try_from(fd).ok().filter(|&fd| fd < MAX_OPEN_FILES)
}
