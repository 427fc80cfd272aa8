//! Mapper Configuration
//!
//! Recognized options and their defaults. The mapper's final identity is
//! always `mapper-<identity>`, so two mappers with distinct prefixes can
//! drain the same fabric side by side.
//!
//! `from_env` mirrors how the agent binaries are configured in
//! deployment: every option has a `MAPPER_*` (or `BROKER_*`) variable
//! and an unset variable falls back to the default. Daemonization,
//! console, and log-file plumbing are wrapper concerns and have no
//! options here.

use std::time::Duration;

use uuid::Uuid;
use workfabric_core::Format;

use crate::error::{MapperError, Result};

/// Connection parameters handed to the broker transport. The in-memory
/// broker ignores them; a networked adaptor consumes them as-is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerSettings {
    pub host: String,
    pub port: u16,
    pub vhost: String,
    pub user: String,
    pub pass: String,
    /// Restrict agents to addressing only their own direct queue.
    /// Enforced by the broker, not by the mapper core.
    pub secure: bool,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5672,
            vhost: "/".to_string(),
            user: "guest".to_string(),
            pass: "guest".to_string(),
            secure: false,
        }
    }
}

/// All options the mapper recognizes.
#[derive(Debug, Clone)]
pub struct MapperConfig {
    /// Identity prefix; the running mapper is `mapper-<identity>`.
    pub identity: String,

    /// Cluster-wide serialization scheme.
    pub format: Format,

    /// Agents unseen for longer than this are reaped.
    pub agent_timeout: Duration,

    /// Cadence of the offline-queue recover sweep.
    pub offline_redelivery_frequency: Duration,

    /// Default broker-durability flag for outgoing envelopes.
    pub persistent: bool,

    /// Broker connection parameters.
    pub broker: BrokerSettings,
}

pub const DEFAULT_AGENT_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_OFFLINE_REDELIVERY_FREQUENCY: Duration = Duration::from_secs(10);

impl Default for MapperConfig {
    fn default() -> Self {
        Self {
            identity: Uuid::new_v4().simple().to_string(),
            format: Format::Json,
            agent_timeout: DEFAULT_AGENT_TIMEOUT,
            offline_redelivery_frequency: DEFAULT_OFFLINE_REDELIVERY_FREQUENCY,
            persistent: false,
            broker: BrokerSettings::default(),
        }
    }
}

impl MapperConfig {
    /// Load configuration from the environment, falling back to
    /// defaults for anything unset.
    ///
    /// Recognized variables: `MAPPER_IDENTITY`, `MAPPER_FORMAT`,
    /// `MAPPER_AGENT_TIMEOUT` (seconds),
    /// `MAPPER_OFFLINE_REDELIVERY_FREQUENCY` (seconds),
    /// `MAPPER_PERSISTENT`, `BROKER_HOST`, `BROKER_PORT`,
    /// `BROKER_VHOST`, `BROKER_USER`, `BROKER_PASS`, `BROKER_SECURE`.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let format = match std::env::var("MAPPER_FORMAT") {
            Ok(raw) => raw
                .parse::<Format>()
                .map_err(|e| MapperError::InvalidConfig(e.to_string()))?,
            Err(_) => defaults.format,
        };

        Ok(Self {
            identity: std::env::var("MAPPER_IDENTITY").unwrap_or(defaults.identity),
            format,
            agent_timeout: env_secs("MAPPER_AGENT_TIMEOUT", defaults.agent_timeout)?,
            offline_redelivery_frequency: env_secs(
                "MAPPER_OFFLINE_REDELIVERY_FREQUENCY",
                defaults.offline_redelivery_frequency,
            )?,
            persistent: env_bool("MAPPER_PERSISTENT", defaults.persistent)?,
            broker: BrokerSettings {
                host: std::env::var("BROKER_HOST").unwrap_or(defaults.broker.host),
                port: env_parse("BROKER_PORT", defaults.broker.port)?,
                vhost: std::env::var("BROKER_VHOST").unwrap_or(defaults.broker.vhost),
                user: std::env::var("BROKER_USER").unwrap_or(defaults.broker.user),
                pass: std::env::var("BROKER_PASS").unwrap_or(defaults.broker.pass),
                secure: env_bool("BROKER_SECURE", defaults.broker.secure)?,
            },
        })
    }

    /// The identity this mapper runs under on the fabric.
    pub fn mapper_identity(&self) -> String {
        format!("mapper-{}", self.identity)
    }
}

fn env_secs(var: &str, default: Duration) -> Result<Duration> {
    env_parse::<u64>(var, default.as_secs()).map(Duration::from_secs)
}

fn env_bool(var: &str, default: bool) -> Result<bool> {
    env_parse(var, default)
}

fn env_parse<T: std::str::FromStr>(var: &str, default: T) -> Result<T> {
    match std::env::var(var) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|_| MapperError::InvalidConfig(format!("unparseable {var}: {raw}"))),
        Err(_) => Ok(default),
    }
}
