//! Server configuration.
//!
//! A [`Config`] is assembled by the binary (flags + environment) and
//! validated once before startup. Defaults follow the protocol
//! contract: 30 s heartbeat interval, 60 s heartbeat timeout, 1 MiB
//! frame cap, 1024-message outbound queues, 10 s drain deadline.

use std::time::Duration;

/// Storage backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageProvider {
    Memory,
    Relational,
}

impl std::str::FromStr for StorageProvider {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "memory" => Ok(StorageProvider::Memory),
            "relational" => Ok(StorageProvider::Relational),
            other => Err(ConfigError::UnknownProvider {
                field: "storage.provider",
                value: other.to_string(),
            }),
        }
    }
}

/// Awareness backend selection. `External` is accepted but presence is
/// kept node-local; cross-node presence flows over the pub/sub bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AwarenessProvider {
    Memory,
    External,
}

impl std::str::FromStr for AwarenessProvider {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "memory" => Ok(AwarenessProvider::Memory),
            "external" => Ok(AwarenessProvider::External),
            other => Err(ConfigError::UnknownProvider {
                field: "awareness.provider",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub provider: StorageProvider,
    /// Postgres connection string for the relational provider.
    pub connection_string: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            provider: StorageProvider::Memory,
            connection_string: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PubSubConfig {
    pub enabled: bool,
    pub provider: String,
    pub connection_string: Option<String>,
    pub channel_prefix: String,
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: "redis".to_string(),
            connection_string: None,
            channel_prefix: "synckit:".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AwarenessConfig {
    pub provider: AwarenessProvider,
    pub connection_string: Option<String>,
    /// Entries idle longer than this are evicted.
    pub ttl: Duration,
    pub sweep_interval: Duration,
}

impl Default for AwarenessConfig {
    fn default() -> Self {
        Self {
            provider: AwarenessProvider::Memory,
            connection_string: None,
            ttl: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(10),
        }
    }
}

/// Full server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Port for the HTTP health endpoints.
    pub http_port: u16,

    pub jwt_secret: Option<String>,
    pub jwt_issuer: Option<String>,
    pub jwt_audience: Option<String>,
    pub jwt_access_expires_in: Duration,
    pub jwt_refresh_expires_in: Duration,
    pub api_keys: Vec<String>,
    pub auth_required: bool,

    pub ws_heartbeat_interval: Duration,
    pub ws_heartbeat_timeout: Duration,
    pub ws_max_connections: usize,
    pub ws_max_frame_bytes: usize,
    pub send_timeout: Duration,
    pub auth_timeout: Duration,
    pub outbound_queue_size: usize,

    /// Client hints only; the hub sends deltas individually.
    pub sync_batch_size: usize,
    pub sync_batch_delay: Duration,

    pub storage: StorageConfig,
    pub pubsub: PubSubConfig,
    pub awareness: AwarenessConfig,

    pub drain_deadline: Duration,
    pub session_max_idle: Duration,
    pub session_refresh_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9090,
            http_port: 9091,
            jwt_secret: None,
            jwt_issuer: None,
            jwt_audience: None,
            jwt_access_expires_in: Duration::from_secs(24 * 3600),
            jwt_refresh_expires_in: Duration::from_secs(7 * 24 * 3600),
            api_keys: Vec::new(),
            auth_required: true,
            ws_heartbeat_interval: Duration::from_secs(30),
            ws_heartbeat_timeout: Duration::from_secs(60),
            ws_max_connections: 1024,
            ws_max_frame_bytes: 1024 * 1024,
            send_timeout: Duration::from_secs(5),
            auth_timeout: Duration::from_secs(10),
            outbound_queue_size: 1024,
            sync_batch_size: 100,
            sync_batch_delay: Duration::from_millis(50),
            storage: StorageConfig::default(),
            pubsub: PubSubConfig::default(),
            awareness: AwarenessConfig::default(),
            drain_deadline: Duration::from_secs(10),
            session_max_idle: Duration::from_secs(24 * 3600),
            session_refresh_interval: Duration::from_secs(60),
        }
    }
}

impl Config {
    /// Config for tests: auth disabled, tight timeouts.
    pub fn for_testing() -> Self {
        Self {
            auth_required: false,
            ws_heartbeat_interval: Duration::from_millis(200),
            ws_heartbeat_timeout: Duration::from_millis(500),
            auth_timeout: Duration::from_secs(2),
            drain_deadline: Duration::from_secs(1),
            ..Default::default()
        }
    }

    /// The WebSocket bind address.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Validate cross-field requirements.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.auth_required {
            match &self.jwt_secret {
                None if self.api_keys.is_empty() => {
                    return Err(ConfigError::MissingJwtSecret);
                }
                Some(secret) if secret.len() < 32 => {
                    return Err(ConfigError::JwtSecretTooShort(secret.len()));
                }
                _ => {}
            }
        }
        if self.storage.provider == StorageProvider::Relational
            && self.storage.connection_string.is_none()
        {
            return Err(ConfigError::MissingConnectionString("storage"));
        }
        if self.pubsub.enabled && self.pubsub.connection_string.is_none() {
            return Err(ConfigError::MissingConnectionString("pubsub"));
        }
        if self.ws_heartbeat_timeout < self.ws_heartbeat_interval {
            return Err(ConfigError::HeartbeatTimeoutTooShort);
        }
        if self.outbound_queue_size == 0 || self.ws_max_connections == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        Ok(())
    }
}

/// Parse a duration like `500ms`, `30s`, `15m`, `24h`, `7d`.
pub fn parse_duration(s: &str) -> Result<Duration, ConfigError> {
    let s = s.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| ConfigError::BadDuration(s.to_string()))?;
    let (num, unit) = s.split_at(split);
    let value: u64 = num
        .parse()
        .map_err(|_| ConfigError::BadDuration(s.to_string()))?;
    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        "d" => Ok(Duration::from_secs(value * 86_400)),
        _ => Err(ConfigError::BadDuration(s.to_string())),
    }
}

/// Configuration faults, reported before the server starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    MissingJwtSecret,
    JwtSecretTooShort(usize),
    MissingConnectionString(&'static str),
    UnknownProvider { field: &'static str, value: String },
    HeartbeatTimeoutTooShort,
    ZeroCapacity,
    BadDuration(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::MissingJwtSecret => {
                write!(f, "auth is required but no jwt secret or api keys configured")
            }
            ConfigError::JwtSecretTooShort(n) => {
                write!(f, "jwt secret must be at least 32 chars, got {n}")
            }
            ConfigError::MissingConnectionString(which) => {
                write!(f, "{which} provider requires a connection string")
            }
            ConfigError::UnknownProvider { field, value } => {
                write!(f, "unknown {field}: {value}")
            }
            ConfigError::HeartbeatTimeoutTooShort => {
                write!(f, "heartbeat timeout must be >= heartbeat interval")
            }
            ConfigError::ZeroCapacity => {
                write!(f, "queue and connection capacities must be non-zero")
            }
            ConfigError::BadDuration(s) => write!(f, "cannot parse duration: {s}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_contract() {
        let config = Config::default();
        assert_eq!(config.ws_heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.ws_heartbeat_timeout, Duration::from_secs(60));
        assert_eq!(config.ws_max_frame_bytes, 1024 * 1024);
        assert_eq!(config.outbound_queue_size, 1024);
        assert_eq!(config.send_timeout, Duration::from_secs(5));
        assert_eq!(config.auth_timeout, Duration::from_secs(10));
        assert_eq!(config.drain_deadline, Duration::from_secs(10));
        assert_eq!(config.pubsub.channel_prefix, "synckit:");
    }

    #[test]
    fn test_auth_required_needs_secret() {
        let config = Config::default();
        assert_eq!(config.validate(), Err(ConfigError::MissingJwtSecret));

        let mut with_secret = Config::default();
        with_secret.jwt_secret = Some("x".repeat(32));
        assert!(with_secret.validate().is_ok());

        let mut short = Config::default();
        short.jwt_secret = Some("too-short".to_string());
        assert_eq!(short.validate(), Err(ConfigError::JwtSecretTooShort(9)));
    }

    #[test]
    fn test_auth_disabled_skips_secret() {
        let mut config = Config::default();
        config.auth_required = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_relational_needs_connection_string() {
        let mut config = Config::for_testing();
        config.storage.provider = StorageProvider::Relational;
        assert_eq!(
            config.validate(),
            Err(ConfigError::MissingConnectionString("storage"))
        );
    }

    #[test]
    fn test_provider_parsing() {
        assert_eq!(
            "memory".parse::<StorageProvider>().unwrap(),
            StorageProvider::Memory
        );
        assert_eq!(
            "relational".parse::<StorageProvider>().unwrap(),
            StorageProvider::Relational
        );
        assert!("rocksdb".parse::<StorageProvider>().is_err());
        assert_eq!(
            "external".parse::<AwarenessProvider>().unwrap(),
            AwarenessProvider::External
        );
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("24h").unwrap(), Duration::from_secs(86_400));
        assert_eq!(parse_duration("7d").unwrap(), Duration::from_secs(604_800));
        assert!(parse_duration("nope").is_err());
        assert!(parse_duration("10").is_err());
    }
}
