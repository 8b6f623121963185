//! In-process simulated network
//!
//! Every attached [`SimulatedLink`] owns a wire thread that carries one frame
//! at a time: it takes the frame from a depth-1 handoff, rolls the shared
//! [`LossModel`], delivers the frame to the destination host's inbound queue
//! and then posts the send-completion token.

use crate::link::{check_frame, LinkError, LinkStats, LossModel, NetworkLink};
use bytes::Bytes;
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use reltp_protocol::{frame_destination, LinkId};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

struct Host {
    inbound: Sender<Bytes>,
    stats: Arc<Mutex<LinkStats>>,
}

struct NetworkInner {
    hosts: Mutex<HashMap<LinkId, Host>>,
    loss: Mutex<LossModel>,
    latency: Mutex<Duration>,
    taps: Mutex<Vec<Sender<Bytes>>>,
}

impl NetworkInner {
    fn deliver(&self, frame: Bytes) -> bool {
        self.taps
            .lock()
            .retain(|tap| tap.send(frame.clone()).is_ok());

        if !self.loss.lock().deliver() {
            return false;
        }

        let Some(dst) = frame_destination(&frame) else {
            return false;
        };
        let hosts = self.hosts.lock();
        match hosts.get(&dst) {
            Some(host) => {
                host.stats.lock().frames_received += 1;
                // A host that is shutting down simply stops listening
                let _ = host.inbound.send(frame);
                true
            }
            None => {
                tracing::trace!("no host at link {}, frame dropped", dst);
                true
            }
        }
    }
}

/// A shared medium connecting simulated hosts
#[derive(Clone)]
pub struct SimulatedNetwork {
    inner: Arc<NetworkInner>,
}

impl SimulatedNetwork {
    /// Create a network that delivers each frame with probability
    /// `reliability`
    pub fn new(reliability: f64) -> Self {
        Self::with_loss(LossModel::new(reliability))
    }

    /// Create a network with a reproducible loss pattern
    pub fn with_seed(reliability: f64, seed: u64) -> Self {
        Self::with_loss(LossModel::with_seed(reliability, seed))
    }

    fn with_loss(loss: LossModel) -> Self {
        SimulatedNetwork {
            inner: Arc::new(NetworkInner {
                hosts: Mutex::new(HashMap::new()),
                loss: Mutex::new(loss),
                latency: Mutex::new(Duration::ZERO),
                taps: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn set_reliability(&self, reliability: f64) {
        self.inner.loss.lock().set_reliability(reliability);
    }

    /// Time each frame spends on the wire before completion
    pub fn set_latency(&self, latency: Duration) {
        *self.inner.latency.lock() = latency;
    }

    /// Observe every frame put on the wire, in wire order, lost or not
    pub fn tap(&self) -> Receiver<Bytes> {
        let (tx, rx) = channel::unbounded();
        self.inner.taps.lock().push(tx);
        rx
    }

    /// Place a raw frame directly into a host's inbound queue
    pub fn inject(&self, dst: LinkId, frame: Bytes) -> Result<(), LinkError> {
        let hosts = self.inner.hosts.lock();
        let host = hosts.get(&dst).ok_or(LinkError::UnknownLink(dst))?;
        host.stats.lock().frames_received += 1;
        host.inbound
            .send(frame)
            .map_err(|_| LinkError::Disconnected)
    }

    /// Attach a host at `address`
    pub fn attach(&self, address: LinkId) -> Result<SimulatedLink, LinkError> {
        let (inbound_tx, inbound_rx) = channel::unbounded();
        let stats = Arc::new(Mutex::new(LinkStats::default()));

        {
            let mut hosts = self.inner.hosts.lock();
            if hosts.contains_key(&address) {
                return Err(LinkError::AddressInUse(address));
            }
            hosts.insert(
                address,
                Host {
                    inbound: inbound_tx,
                    stats: stats.clone(),
                },
            );
        }

        let (wire_tx, wire_rx) = channel::bounded::<Bytes>(1);
        let (complete_tx, complete_rx) = channel::unbounded();

        let network = self.inner.clone();
        let wire_stats = stats.clone();
        let wire = thread::Builder::new()
            .name(format!("reltp-wire-{}", address))
            .spawn(move || {
                for frame in wire_rx.iter() {
                    let latency = *network.latency.lock();
                    if !latency.is_zero() {
                        thread::sleep(latency);
                    }

                    let delivered = network.deliver(frame);
                    {
                        let mut stats = wire_stats.lock();
                        if delivered {
                            stats.frames_delivered += 1;
                        } else {
                            stats.frames_lost += 1;
                        }
                    }

                    if complete_tx.send(()).is_err() {
                        break;
                    }
                }
            })?;

        tracing::debug!("attached simulated link {}", address);

        Ok(SimulatedLink {
            address,
            network: self.clone(),
            wire_tx: Some(wire_tx),
            complete_rx,
            inbound_rx,
            stats,
            wire: Some(wire),
        })
    }
}

/// One host's attachment to a [`SimulatedNetwork`]
pub struct SimulatedLink {
    address: LinkId,
    network: SimulatedNetwork,
    wire_tx: Option<Sender<Bytes>>,
    complete_rx: Receiver<()>,
    inbound_rx: Receiver<Bytes>,
    stats: Arc<Mutex<LinkStats>>,
    wire: Option<JoinHandle<()>>,
}

impl NetworkLink for SimulatedLink {
    fn address(&self) -> LinkId {
        self.address
    }

    fn transmit(&self, frame: Bytes) -> Result<(), LinkError> {
        check_frame(&frame)?;
        let wire = self.wire_tx.as_ref().ok_or(LinkError::Disconnected)?;
        self.stats.lock().frames_transmitted += 1;
        wire.send(frame).map_err(|_| LinkError::Disconnected)
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

impl Drop for SimulatedLink {
    fn drop(&mut self) {
        self.network.inner.hosts.lock().remove(&self.address);
        // Closing the handoff ends the wire thread
        self.wire_tx.take();
        if let Some(wire) = self.wire.take() {
            let _ = wire.join();
        }
    }
}
