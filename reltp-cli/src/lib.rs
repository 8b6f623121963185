//! reltp CLI Library
//!
//! Shared functionality for the reltp command-line tools.

pub mod config;
pub mod stats;

pub use config::{Config, ConfigError, NodeConfig, RetransmitSection, SimConfig};
pub use stats::{compact_stats, display_host_stats, format_bytes, format_duration};
