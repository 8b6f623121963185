//! Transport configuration
//!
//! Values are fixed for the lifetime of a [`Transport`](crate::Transport);
//! the defaults are the protocol constants.

use reltp_protocol::socket::RetransmitPolicy;
use reltp_protocol::{MAX_RETRY, RETRANSMISSION_INTERVAL};
use std::time::Duration;

/// Transport configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportConfig {
    /// Retransmission deadline, and the period of the timeout sweep
    pub retransmission_interval: Duration,
    /// Expired deadlines tolerated before a handshake or close fails
    pub max_retry: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            retransmission_interval: RETRANSMISSION_INTERVAL,
            max_retry: MAX_RETRY,
        }
    }
}

impl TransportConfig {
    /// Policy handed to every socket of this transport
    pub fn policy(&self) -> RetransmitPolicy {
        RetransmitPolicy {
            interval: self.retransmission_interval,
            max_retry: self.max_retry,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_protocol_constants() {
        let config = TransportConfig::default();
        assert_eq!(config.policy(), RetransmitPolicy::default());
    }
}
