//! Configuration file support for reltp CLI tools

use reltp::TransportConfig;
use reltp_protocol::{LinkId, Port, MAX_RETRY, PORT_LIMIT, RETRANSMISSION_INTERVAL};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Retransmission settings shared by both tools
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetransmitSection {
    /// Retransmission interval in milliseconds
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Expired deadlines tolerated before giving up
    #[serde(default = "default_max_retry")]
    pub max_retry: u32,
}

impl Default for RetransmitSection {
    fn default() -> Self {
        RetransmitSection {
            interval_ms: default_interval_ms(),
            max_retry: default_max_retry(),
        }
    }
}

fn default_interval_ms() -> u64 {
    RETRANSMISSION_INTERVAL.as_millis() as u64
}

fn default_max_retry() -> u32 {
    MAX_RETRY
}

impl RetransmitSection {
    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            retransmission_interval: Duration::from_millis(self.interval_ms),
            max_retry: self.max_retry,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "retransmission interval must be positive".to_string(),
            ));
        }
        if self.max_retry == 0 {
            return Err(ConfigError::Invalid("max_retry must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Configuration of one UDP-backed host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// This host's link address
    pub link: LinkId,
    /// UDP port of link 0; link `n` listens on `base_port + n`
    #[serde(default = "default_base_port")]
    pub base_port: u16,
    /// Probability that a frame is delivered (0.0 to 1.0)
    #[serde(default = "default_reliability")]
    pub reliability: f64,
    /// Transport port used by `listen` and as the default `connect` target
    #[serde(default = "default_service_port")]
    pub port: Port,
    #[serde(default)]
    pub retransmit: RetransmitSection,
}

fn default_base_port() -> u16 {
    47000
}

fn default_reliability() -> f64 {
    1.0
}

fn default_service_port() -> Port {
    15
}

/// Configuration of an in-process simulation run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimConfig {
    /// Number of client hosts connecting to the server
    #[serde(default = "default_clients")]
    pub clients: u8,
    /// Probability that a frame is delivered (0.0 to 1.0)
    #[serde(default = "default_reliability")]
    pub reliability: f64,
    /// Seed for a reproducible loss pattern
    pub seed: Option<u64>,
    /// Per-frame wire latency in milliseconds
    #[serde(default)]
    pub latency_ms: u64,
    /// Port the server accepts on
    #[serde(default = "default_service_port")]
    pub port: Port,
    /// Message each client sends
    #[serde(default = "default_message")]
    pub message: String,
    #[serde(default)]
    pub retransmit: RetransmitSection,
}

fn default_clients() -> u8 {
    3
}

fn default_message() -> String {
    "hello over an unreliable link".to_string()
}

impl NodeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_reliability(self.reliability)?;
        validate_port(self.port)?;
        if u32::from(self.base_port) + u32::from(LinkId::MAX) > u32::from(u16::MAX) {
            return Err(ConfigError::Invalid(format!(
                "base_port {} leaves no room for every link",
                self.base_port
            )));
        }
        self.retransmit.validate()
    }
}

impl SimConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_reliability(self.reliability)?;
        validate_port(self.port)?;
        if self.clients == 0 || self.clients == LinkId::MAX {
            return Err(ConfigError::Invalid(format!(
                "clients must be between 1 and {}",
                LinkId::MAX - 1
            )));
        }
        self.retransmit.validate()
    }

    pub fn latency(&self) -> Duration {
        Duration::from_millis(self.latency_ms)
    }
}

fn validate_reliability(reliability: f64) -> Result<(), ConfigError> {
    if !(0.0..=1.0).contains(&reliability) {
        return Err(ConfigError::Invalid(format!(
            "reliability {} outside 0.0..=1.0",
            reliability
        )));
    }
    Ok(())
}

fn validate_port(port: Port) -> Result<(), ConfigError> {
    if port >= PORT_LIMIT {
        return Err(ConfigError::Invalid(format!(
            "port {} outside 0..{}",
            port, PORT_LIMIT
        )));
    }
    Ok(())
}

/// Combined configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub node: Option<NodeConfig>,
    pub sim: Option<SimConfig>,
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(node) = &self.node {
            node.validate()?;
        }
        if let Some(sim) = &self.sim {
            sim.validate()?;
        }
        Ok(())
    }

    /// Example configuration for one node
    pub fn example_node() -> Self {
        Config {
            node: Some(NodeConfig {
                link: 1,
                base_port: default_base_port(),
                reliability: 0.9,
                port: default_service_port(),
                retransmit: RetransmitSection::default(),
            }),
            sim: None,
        }
    }

    /// Example configuration for a simulation run
    pub fn example_sim() -> Self {
        Config {
            node: None,
            sim: Some(SimConfig {
                clients: default_clients(),
                reliability: 0.8,
                seed: Some(7),
                latency_ms: 1,
                port: default_service_port(),
                message: default_message(),
                retransmit: RetransmitSection::default(),
            }),
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
