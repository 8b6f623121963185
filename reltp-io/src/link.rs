//! Link abstraction shared by every link implementation
//!
//! A link moves whole frames of at most [`LINK_MTU`] bytes to the host named
//! in the frame's first byte. Delivery is best-effort. Transmission is
//! interrupt-style: [`NetworkLink::transmit`] starts sending one frame and the
//! link posts one token on [`NetworkLink::send_complete`] when the frame has
//! left. Callers keep a single frame in flight by waiting for that token
//! before the next transmit.

use bytes::Bytes;
use crossbeam::channel::Receiver;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use reltp_protocol::{LinkId, LINK_MTU};
use std::io;
use thiserror::Error;

/// Link errors
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Link is disconnected")]
    Disconnected,

    #[error("Link address {0} is not usable")]
    UnknownLink(LinkId),

    #[error("Link address {0} is already attached")]
    AddressInUse(LinkId),

    #[error("Frame of {size} bytes exceeds link MTU {max}")]
    FrameTooLarge { size: usize, max: usize },
}

/// Per-link frame counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkStats {
    /// Frames handed to `transmit`
    pub frames_transmitted: u64,
    /// Frames that made it onto the wire
    pub frames_delivered: u64,
    /// Frames dropped by the loss model
    pub frames_lost: u64,
    /// Frames received from the wire
    pub frames_received: u64,
}

/// A single-hop, best-effort link
pub trait NetworkLink: Send + Sync {
    /// This host's link address
    fn address(&self) -> LinkId;

    /// Start transmitting one frame
    ///
    /// A token is posted on [`send_complete`](Self::send_complete) once the
    /// frame has left, whether or not it reaches its destination.
    fn transmit(&self, frame: Bytes) -> Result<(), LinkError>;

    /// One token per completed transmission
    fn send_complete(&self) -> &Receiver<()>;

    /// Frames received for this host, in arrival order
    fn inbound(&self) -> &Receiver<Bytes>;

    /// Snapshot of the link counters
    fn stats(&self) -> LinkStats;
}

pub(crate) fn check_frame(frame: &Bytes) -> Result<(), LinkError> {
    if frame.len() > LINK_MTU {
        return Err(LinkError::FrameTooLarge {
            size: frame.len(),
            max: LINK_MTU,
        });
    }
    Ok(())
}

/// Decides which frames survive the wire
///
/// `reliability` is the probability that one frame is delivered, clamped to
/// `[0.0, 1.0]`.
pub struct LossModel {
    reliability: f64,
    rng: StdRng,
}

impl LossModel {
    pub fn new(reliability: f64) -> Self {
        LossModel {
            reliability: reliability.clamp(0.0, 1.0),
            rng: StdRng::from_entropy(),
        }
    }

    /// Reproducible loss pattern
    pub fn with_seed(reliability: f64, seed: u64) -> Self {
        LossModel {
            reliability: reliability.clamp(0.0, 1.0),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn reliability(&self) -> f64 {
        self.reliability
    }

    pub fn set_reliability(&mut self, reliability: f64) {
        self.reliability = reliability.clamp(0.0, 1.0);
    }

    /// Roll for one frame
    pub fn deliver(&mut self) -> bool {
        if self.reliability >= 1.0 {
            true
        } else {
            self.rng.gen_bool(self.reliability)
        }
    }
}
