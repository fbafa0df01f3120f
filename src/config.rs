//! Service configuration loaded from TOML.
//!
//! ```toml
//! [server]
//! listen_address = "127.0.0.1:8080"
//!
//! [default_policy]
//! capacity = 5
//! refill_rate = 1.0
//!
//! [[clients]]
//! id = "1"
//! capacity = 5
//! refill_rate = 0.5
//!
//! [eviction]
//! idle_timeout_secs = 600
//! ```
//!
//! Every section is optional. The `PORT` environment variable, when set,
//! replaces the port of `server.listen_address`.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::identity::ClientIdentity;
use crate::policy::{Policy, PolicyError, PolicyTable};

const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read configuration file {path}: {source}")]
    Read {
        /// File that was requested.
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// The file is not valid TOML or does not match the schema.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    /// `[default_policy]` holds invalid values.
    #[error("invalid default_policy: {0}")]
    DefaultPolicy(#[source] PolicyError),
    /// A `[[clients]]` entry holds invalid values.
    #[error("invalid policy for client '{client}': {source}")]
    ClientPolicy {
        /// Offending client id.
        client: String,
        #[source]
        source: PolicyError,
    },
    /// A `[[clients]]` entry has an empty id.
    #[error("client id must not be empty")]
    EmptyClientId,
    /// Two `[[clients]]` entries share an id.
    #[error("client '{0}' is configured more than once")]
    DuplicateClient(String),
    /// `PORT` is set but is not a port number.
    #[error("PORT must be a number between 0 and 65535 (got '{0}')")]
    InvalidPort(String),
    /// Eviction timings must be non-zero.
    #[error("eviction.{0} must be > 0")]
    InvalidEviction(&'static str),
}

/// HTTP server settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Socket address to bind.
    pub listen_address: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { listen_address: default_listen_address() }
    }
}

fn default_listen_address() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Idle bucket eviction settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictionConfig {
    /// Buckets untouched for this long (and already full) are dropped.
    pub idle_timeout: Duration,
    /// How often the sweeper runs.
    pub sweep_interval: Duration,
}

/// Validated configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// HTTP server settings.
    pub server: ServerConfig,
    /// Policy for clients without an override.
    pub default_policy: Policy,
    /// Per-client overrides, in file order.
    pub clients: Vec<(ClientIdentity, Policy)>,
    /// Idle eviction; `None` keeps buckets for the process lifetime.
    pub eviction: Option<EvictionConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    server: ServerConfig,
    #[serde(default)]
    default_policy: Option<RawPolicy>,
    #[serde(default)]
    clients: Vec<RawClient>,
    #[serde(default)]
    eviction: Option<RawEviction>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPolicy {
    capacity: u32,
    refill_rate: f64,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawClient {
    id: String,
    capacity: u32,
    refill_rate: f64,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawEviction {
    idle_timeout_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    sweep_interval_secs: u64,
}

fn default_sweep_interval_secs() -> u64 {
    DEFAULT_SWEEP_INTERVAL_SECS
}

impl Config {
    /// Read, parse and validate `path`, then apply the `PORT` override.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        let mut config = Self::from_toml_str(&content)?;
        config.apply_port_override(std::env::var("PORT").ok().as_deref())?;
        Ok(config)
    }

    /// Parse and validate TOML without touching the environment.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = toml::from_str(content)?;
        raw.validate()
    }

    /// Replace the listen port, as cloud platforms hand it over in `PORT`.
    pub fn apply_port_override(&mut self, port: Option<&str>) -> Result<(), ConfigError> {
        let Some(port) = port.map(str::trim).filter(|p| !p.is_empty()) else {
            return Ok(());
        };
        let port: u16 = port.parse().map_err(|_| ConfigError::InvalidPort(port.to_string()))?;
        self.server.listen_address.set_port(port);
        Ok(())
    }

    /// Resolver holding the default policy and every client override.
    pub fn policy_resolver(&self) -> PolicyTable {
        self.clients
            .iter()
            .fold(PolicyTable::new(self.default_policy), |table, (id, policy)| {
                table.with_override(id.clone(), *policy)
            })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            default_policy: Policy::default(),
            clients: Vec::new(),
            eviction: None,
        }
    }
}

impl RawConfig {
    fn validate(self) -> Result<Config, ConfigError> {
        let default_policy = match self.default_policy {
            Some(raw) => {
                Policy::new(raw.capacity, raw.refill_rate).map_err(ConfigError::DefaultPolicy)?
            }
            None => Policy::default(),
        };

        let mut seen = HashSet::new();
        let mut clients = Vec::with_capacity(self.clients.len());
        for client in self.clients {
            let id = ClientIdentity::new(&client.id).map_err(|_| ConfigError::EmptyClientId)?;
            if !seen.insert(id.clone()) {
                return Err(ConfigError::DuplicateClient(client.id));
            }
            let policy = Policy::new(client.capacity, client.refill_rate)
                .map_err(|source| ConfigError::ClientPolicy { client: client.id, source })?;
            clients.push((id, policy));
        }

        let eviction = match self.eviction {
            Some(raw) => {
                if raw.idle_timeout_secs == 0 {
                    return Err(ConfigError::InvalidEviction("idle_timeout_secs"));
                }
                if raw.sweep_interval_secs == 0 {
                    return Err(ConfigError::InvalidEviction("sweep_interval_secs"));
                }
                Some(EvictionConfig {
                    idle_timeout: Duration::from_secs(raw.idle_timeout_secs),
                    sweep_interval: Duration::from_secs(raw.sweep_interval_secs),
                })
            }
            None => None,
        };

        Ok(Config { server: self.server, default_policy, clients, eviction })
    }
}
