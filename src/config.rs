use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::directory::NodeDescriptor;
use crate::logging::LogLevel;
use crate::mix::MixStrategy;
use crate::reassembly::ReassemblyLimits;
use crate::transport::driver::Timeouts;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid configuration file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Node configuration, read from a TOML file. Every field has a default.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NodeConfig {
    pub node: NodeSection,
    pub mix: MixSection,
    pub transport: TransportSection,
    pub keys: KeySection,
    pub reassembly: ReassemblySection,
    pub delivery: DeliverySection,
    pub peers: Vec<NodeDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NodeSection {
    /// Holds keys, replay logs, pools, the pid file, and statistics.
    pub home: PathBuf,
    pub listen: SocketAddr,
    /// Name other nodes use to reach this one.
    pub hostname: String,
    pub log_level: LogLevel,
    pub log_json: bool,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            home: PathBuf::from("/var/lib/mixnode"),
            listen: SocketAddr::from(([0, 0, 0, 0], 48099)),
            hostname: "localhost".to_string(),
            log_level: LogLevel::Info,
            log_json: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MixSection {
    pub tick_interval_secs: u64,
    pub min_residency_secs: u64,
    pub strategy: MixStrategy,
}

impl Default for MixSection {
    fn default() -> Self {
        Self {
            tick_interval_secs: 30,
            min_residency_secs: 60,
            strategy: MixStrategy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransportSection {
    pub handshake_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub max_outgoing_connections: usize,
    /// Outgoing packets older than this are dropped as unretriable.
    pub max_relay_age_secs: u64,
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            handshake_timeout_secs: 30,
            idle_timeout_secs: 120,
            max_outgoing_connections: 16,
            max_relay_age_secs: 3 * 24 * 3600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KeySection {
    pub epoch_lifetime_secs: u64,
    /// How long a superseded epoch still decrypts packets.
    pub grace_secs: u64,
}

impl Default for KeySection {
    fn default() -> Self {
        Self {
            epoch_lifetime_secs: 30 * 24 * 3600,
            grace_secs: 24 * 3600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReassemblySection {
    pub timeout_secs: u64,
    pub max_fragments: u32,
    pub max_messages: usize,
}

impl Default for ReassemblySection {
    fn default() -> Self {
        let limits = ReassemblyLimits::default();
        Self {
            timeout_secs: limits.timeout.as_secs(),
            max_fragments: limits.max_fragments,
            max_messages: limits.max_messages,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeliverySection {
    /// Defaults to `<home>/maildir`.
    pub maildir: Option<PathBuf>,
    pub max_retry_age_secs: u64,
}

impl Default for DeliverySection {
    fn default() -> Self {
        Self {
            maildir: None,
            max_retry_age_secs: 2 * 24 * 3600,
        }
    }
}

impl NodeConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));
        if self.mix.tick_interval_secs == 0 {
            return invalid("mix.tick_interval_secs must be positive");
        }
        if let Err(msg) = self.mix.strategy.validate() {
            return Err(ConfigError::Invalid(format!("mix.strategy: {msg}")));
        }
        if self.transport.handshake_timeout_secs == 0 || self.transport.idle_timeout_secs == 0 {
            return invalid("transport timeouts must be positive");
        }
        if self.transport.max_outgoing_connections == 0 {
            return invalid("transport.max_outgoing_connections must be positive");
        }
        if self.keys.epoch_lifetime_secs == 0 {
            return invalid("keys.epoch_lifetime_secs must be positive");
        }
        if self.keys.grace_secs >= self.keys.epoch_lifetime_secs {
            return invalid("keys.grace_secs must be shorter than the epoch lifetime");
        }
        if self.reassembly.max_fragments == 0 || self.reassembly.max_messages == 0 {
            return invalid("reassembly limits must be positive");
        }
        if self.node.hostname.is_empty() {
            return invalid("node.hostname must not be empty");
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.mix.tick_interval_secs)
    }

    pub fn min_residency(&self) -> Duration {
        Duration::from_secs(self.mix.min_residency_secs)
    }

    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            handshake: Duration::from_secs(self.transport.handshake_timeout_secs),
            idle: Duration::from_secs(self.transport.idle_timeout_secs),
        }
    }

    pub fn max_relay_age(&self) -> Duration {
        Duration::from_secs(self.transport.max_relay_age_secs)
    }

    pub fn epoch_lifetime(&self) -> Duration {
        Duration::from_secs(self.keys.epoch_lifetime_secs)
    }

    pub fn epoch_grace(&self) -> Duration {
        Duration::from_secs(self.keys.grace_secs)
    }

    pub fn reassembly_limits(&self) -> ReassemblyLimits {
        ReassemblyLimits {
            timeout: Duration::from_secs(self.reassembly.timeout_secs),
            max_fragments: self.reassembly.max_fragments,
            max_messages: self.reassembly.max_messages,
        }
    }

    pub fn max_retry_age(&self) -> Duration {
        Duration::from_secs(self.delivery.max_retry_age_secs)
    }

    pub fn maildir(&self) -> PathBuf {
        self.delivery
            .maildir
            .clone()
            .unwrap_or_else(|| self.node.home.join("maildir"))
    }

    pub fn pid_file(&self) -> PathBuf {
        self.node.home.join("mixnode.pid")
    }

    pub fn stats_file(&self) -> PathBuf {
        self.node.home.join("stats.json")
    }
}
