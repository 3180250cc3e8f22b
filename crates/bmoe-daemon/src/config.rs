//! Server configuration.
//!
//! [`DaemonConfig`] maps directly to the TOML config file. Every field has a
//! default, so an empty file (or no file at all) gives a server listening on
//! `127.0.0.1:7890` with no outbound links.

use bmoe_core::{Endpoint, EndpointParseError, RouterConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Why a configuration could not be used.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid server address {address:?}: {source}")]
    Endpoint {
        address: String,
        #[source]
        source: EndpointParseError,
    },
    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),
}

/// Server settings, read from TOML. Every field has a default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Name announced to other servers. Defaults to the listen address.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Servers to dial at startup, as `host:port`.
    #[serde(default)]
    pub connect: Vec<String>,
    #[serde(default = "default_announce_interval_secs")]
    pub announce_interval_secs: u64,
    #[serde(default = "default_keepalive_interval_secs")]
    pub keepalive_interval_secs: u64,
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,
    /// How long a stopping server waits for connections to close.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    #[serde(default = "default_server_idle_ping_secs")]
    pub server_idle_ping_secs: u64,
    #[serde(default = "default_client_idle_ping_secs")]
    pub client_idle_ping_secs: u64,
    #[serde(default = "default_annotate_checksums")]
    pub annotate_checksums: bool,
}

fn default_listen() -> String {
    "127.0.0.1:7890".to_string()
}

fn default_announce_interval_secs() -> u64 {
    180
}

fn default_keepalive_interval_secs() -> u64 {
    60
}

fn default_reconnect_delay_secs() -> u64 {
    5
}

fn default_shutdown_grace_secs() -> u64 {
    10
}

fn default_server_idle_ping_secs() -> u64 {
    100
}

fn default_client_idle_ping_secs() -> u64 {
    170
}

fn default_annotate_checksums() -> bool {
    true
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            name: None,
            listen: default_listen(),
            connect: Vec::new(),
            announce_interval_secs: default_announce_interval_secs(),
            keepalive_interval_secs: default_keepalive_interval_secs(),
            reconnect_delay_secs: default_reconnect_delay_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            server_idle_ping_secs: default_server_idle_ping_secs(),
            client_idle_ping_secs: default_client_idle_ping_secs(),
            annotate_checksums: default_annotate_checksums(),
        }
    }
}

impl DaemonConfig {
    /// Read and validate a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    /// Parse and validate TOML text.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject intervals of zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let intervals = [
            ("announce_interval_secs", self.announce_interval_secs),
            ("keepalive_interval_secs", self.keepalive_interval_secs),
        ];
        for (field, value) in intervals {
            if value == 0 {
                return Err(ConfigError::ZeroInterval(field));
            }
        }
        Ok(())
    }

    /// Parsed `connect` entries.
    pub fn endpoints(&self) -> Result<Vec<Endpoint>, ConfigError> {
        self.connect
            .iter()
            .map(|address| {
                address
                    .trim()
                    .parse()
                    .map_err(|source| ConfigError::Endpoint {
                        address: address.clone(),
                        source,
                    })
            })
            .collect()
    }

    /// Settings for the routing engine.
    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            server_idle_ping: Duration::from_secs(self.server_idle_ping_secs),
            client_idle_ping: Duration::from_secs(self.client_idle_ping_secs),
            annotate_checksums: self.annotate_checksums,
        }
    }

    pub fn announce_interval(&self) -> Duration {
        Duration::from_secs(self.announce_interval_secs)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    /// How long [`crate::Daemon::run`] waits for connections to close.
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}
