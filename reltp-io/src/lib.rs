//! reltp Link Layer
//!
//! This crate provides the network links the transport runs on: the
//! [`NetworkLink`] abstraction, an in-process simulated network with
//! best-effort delivery, and a UDP loopback link for running hosts as
//! separate processes.

pub mod link;
pub mod simulated;
pub mod udp;

pub use link::{LinkError, LinkStats, LossModel, NetworkLink};
pub use simulated::{SimulatedLink, SimulatedNetwork};
pub use udp::UdpLink;
