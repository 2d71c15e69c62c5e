//! Node configuration
//!
//! Loaded from a JSON document, then patched from environment variables:
//! - `DQUERY_CONFIG` path of the JSON document (default: dquery.json)
//! - `DQUERY_LOCAL_PARTY` overrides `local_party`
//! - `DQUERY_MAX_SESSION_SECS` overrides `max_session_lifetime_secs`

use crate::party::Party;
use crate::transport::backpressure::OutputBufferLimits;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::env;
use std::path::Path;

const DEFAULT_CONFIG_PATH: &str = "dquery.json";
const DEFAULT_CONNECT_HOST: &str = "127.0.0.1";
const DEFAULT_LISTEN_HOST: &str = "0.0.0.0";
const FIRST_INTERSERVER_PORT: u16 = 19501;
const DEFAULT_FRONT_LISTEN: &str = "0.0.0.0:8080";

#[derive(Debug)]
pub enum ConfigError {
    MissingVariable(String),
    InvalidValue { key: String, message: String },
    Io(std::io::Error),
    Parse(serde_json::Error),
}

impl ConfigError {
    pub fn invalid(key: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            key: key.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::MissingVariable(var) => write!(f, "Missing configuration value: {}", var),
            ConfigError::InvalidValue { key, message } => {
                write!(f, "Invalid configuration value at {}: {}", key, message)
            }
            ConfigError::Io(e) => write!(f, "Cannot read configuration: {}", e),
            ConfigError::Parse(e) => write!(f, "Cannot parse configuration: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::Io(err)
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        ConfigError::Parse(err)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HostPort {
    pub host: String,
    pub port: u16,
}

impl HostPort {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub local_party: Party,
    /// Where each party accepts interserver connections.
    pub connections: BTreeMap<Party, HostPort>,
    /// Where this node accepts interserver connections.
    pub interserver_listen: HostPort,
    /// Where this node accepts client connections.
    pub front_listen: String,
    pub output_buffer_limits: OutputBufferLimits,
    /// Connection attempts per party before a session is failed.
    pub connect_retry_budget: u32,
    pub connect_retry_delay_ms: u64,
    pub connect_retry_max_delay_ms: u64,
    pub max_session_lifetime_secs: u64,
    pub result_update_cooldown_ms: u64,
    pub zombie_check_cooldown_secs: u64,
    /// Decimal places kept in finalized result values.
    pub result_scale: u32,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    local_party: Option<String>,
    #[serde(default)]
    interserver_connections: RawConnections,
    front_listen: Option<String>,
    channel_output_buffer_limit: Option<RawBufferLimit>,
    connect_retry_budget: Option<u32>,
    connect_retry_delay_ms: Option<u64>,
    connect_retry_max_delay_ms: Option<u64>,
    max_session_lifetime_secs: Option<u64>,
    result_update_cooldown_ms: Option<u64>,
    zombie_check_cooldown_secs: Option<u64>,
    result_scale: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConnections {
    ph: Option<RawHostPort>,
    db1: Option<RawHostPort>,
    db2: Option<RawHostPort>,
    listen: Option<RawHostPort>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawHostPort {
    host: Option<String>,
    port: Option<u16>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawBufferLimit {
    All(i64),
    PerParty(BTreeMap<String, i64>),
}

impl Config {
    /// Load the JSON document named by `DQUERY_CONFIG` and apply env overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let path = env::var("DQUERY_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let mut config = Self::from_file(&path)?;
        config.apply_overrides(|key| env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = serde_json::from_str(text)?;
        Self::from_raw(raw)
    }

    /// Defaults for every key, with the given local party.
    pub fn for_party(local_party: Party) -> Self {
        let connections = Party::all()
            .into_iter()
            .map(|party| (party, default_connect(party)))
            .collect();

        Self {
            local_party,
            connections,
            interserver_listen: default_listen(local_party),
            front_listen: DEFAULT_FRONT_LISTEN.to_string(),
            output_buffer_limits: OutputBufferLimits::default(),
            connect_retry_budget: 3,
            connect_retry_delay_ms: 250,
            connect_retry_max_delay_ms: 5_000,
            max_session_lifetime_secs: 3_600,
            result_update_cooldown_ms: 1_000,
            zombie_check_cooldown_secs: 300,
            result_scale: 6,
        }
    }

    fn from_raw(raw: RawConfig) -> Result<Self, ConfigError> {
        let local_name = raw
            .local_party
            .ok_or_else(|| ConfigError::MissingVariable("local_party".to_string()))?;
        let local_party = parse_party("local_party", &local_name)?;

        let mut config = Self::for_party(local_party);

        let connections = raw.interserver_connections;
        for (party, entry) in [
            (Party::Ph, connections.ph),
            (Party::Db1, connections.db1),
            (Party::Db2, connections.db2),
        ] {
            let key = format!("interserver_connections.{}", party);
            let resolved = resolve_host_port(&key, entry, default_connect(party))?;
            config.connections.insert(party, resolved);
        }
        config.interserver_listen = resolve_host_port(
            "interserver_connections.listen",
            connections.listen,
            default_listen(local_party),
        )?;

        if let Some(front_listen) = raw.front_listen {
            config.front_listen = front_listen;
        }

        config.output_buffer_limits = match raw.channel_output_buffer_limit {
            None => OutputBufferLimits::default(),
            Some(RawBufferLimit::All(kib)) => OutputBufferLimits::uniform_kib(kib)?,
            Some(RawBufferLimit::PerParty(entries)) => {
                let mut per_party = BTreeMap::new();
                for (name, kib) in entries {
                    let key = format!("channel_output_buffer_limit.{}", name);
                    let party = parse_party(&key, &name)?;
                    per_party.insert(party, kib);
                }
                OutputBufferLimits::from_kib(&per_party)?
            }
        };

        if let Some(budget) = raw.connect_retry_budget {
            config.connect_retry_budget = budget;
        }
        if let Some(delay) = raw.connect_retry_delay_ms {
            config.connect_retry_delay_ms = delay;
        }
        if let Some(max_delay) = raw.connect_retry_max_delay_ms {
            config.connect_retry_max_delay_ms = max_delay;
        }
        if let Some(lifetime) = raw.max_session_lifetime_secs {
            config.max_session_lifetime_secs = lifetime;
        }
        if let Some(cooldown) = raw.result_update_cooldown_ms {
            config.result_update_cooldown_ms = cooldown;
        }
        if let Some(cooldown) = raw.zombie_check_cooldown_secs {
            config.zombie_check_cooldown_secs = cooldown;
        }
        if let Some(scale) = raw.result_scale {
            config.result_scale = scale;
        }

        config.validate()?;
        Ok(config)
    }

    /// Apply `DQUERY_*` overrides from `lookup` (the process environment in production).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(name) = lookup("DQUERY_LOCAL_PARTY") {
            let party = parse_party("DQUERY_LOCAL_PARTY", &name)?;
            // a listen address left at the old party's default follows the party
            if self.interserver_listen == default_listen(self.local_party) {
                self.interserver_listen = default_listen(party);
            }
            self.local_party = party;
        }

        if let Some(secs) = lookup("DQUERY_MAX_SESSION_SECS") {
            self.max_session_lifetime_secs = secs.trim().parse::<u64>().map_err(|_| {
                ConfigError::invalid("DQUERY_MAX_SESSION_SECS", "value must be a positive integer")
            })?;
        }

        self.validate()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connect_retry_budget == 0 {
            return Err(ConfigError::invalid(
                "connect_retry_budget",
                "value must be a positive integer",
            ));
        }

        if self.max_session_lifetime_secs == 0 {
            return Err(ConfigError::invalid(
                "max_session_lifetime_secs",
                "value must be a positive integer",
            ));
        }

        if self.zombie_check_cooldown_secs == 0 {
            return Err(ConfigError::invalid(
                "zombie_check_cooldown_secs",
                "value must be a positive integer",
            ));
        }

        if self.result_update_cooldown_ms == 0 {
            return Err(ConfigError::invalid(
                "result_update_cooldown_ms",
                "value must be a positive integer",
            ));
        }

        if self.connect_retry_max_delay_ms < self.connect_retry_delay_ms {
            return Err(ConfigError::invalid(
                "connect_retry_max_delay_ms",
                "value must not be below connect_retry_delay_ms",
            ));
        }

        Ok(())
    }

    pub fn connect_address(&self, party: Party) -> HostPort {
        self.connections
            .get(&party)
            .cloned()
            .unwrap_or_else(|| default_connect(party))
    }
}

fn parse_party(key: &str, name: &str) -> Result<Party, ConfigError> {
    Party::from_str(name)
        .ok_or_else(|| ConfigError::invalid(key, format!("unknown party '{}'", name)))
}

fn default_connect(party: Party) -> HostPort {
    HostPort {
        host: DEFAULT_CONNECT_HOST.to_string(),
        port: FIRST_INTERSERVER_PORT + party.index() as u16,
    }
}

fn default_listen(local_party: Party) -> HostPort {
    HostPort {
        host: DEFAULT_LISTEN_HOST.to_string(),
        port: FIRST_INTERSERVER_PORT + local_party.index() as u16,
    }
}

fn resolve_host_port(
    key: &str,
    raw: Option<RawHostPort>,
    default: HostPort,
) -> Result<HostPort, ConfigError> {
    let raw = raw.unwrap_or_default();
    let resolved = HostPort {
        host: raw.host.unwrap_or(default.host),
        port: raw.port.unwrap_or(default.port),
    };

    if resolved.port == 0 {
        return Err(ConfigError::invalid(key, "port number must not be zero"));
    }

    Ok(resolved)
}
