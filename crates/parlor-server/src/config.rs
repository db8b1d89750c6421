//! Server configuration.
//!
//! Configuration is layered:
//! - Built-in defaults
//! - The first TOML file found on the search path, or an explicit file
//! - Environment variables (`PARLOR_PORT`, `PARLOR_AUTH__JWT_SECRET`, ...)

use anyhow::{Context, Result};
use parlor_core::{
    CoreConfig, DedupConfig, DispatcherConfig, RoomConfig, RouterConfig, SessionConfig,
};
use parlor_protocol::{GroupId, UserId};
use parlor_transport::HubConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Files consulted, in order, when no explicit path is given.
const SEARCH_PATH: [&str; 3] = [
    "parlor.toml",
    "/etc/parlor/parlor.toml",
    "~/.config/parlor/parlor.toml",
];

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub limits: LimitsConfig,

    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub dispatcher: DispatchSection,

    #[serde(default)]
    pub dedup: DedupSection,

    /// Seed records for the in-memory directory.
    #[serde(default)]
    pub directory: DirectorySeed,
}

/// WebSocket transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for the WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,

    /// How long a client without a `token` query parameter has to send its
    /// `connect` frame.
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,

    /// Frames buffered per connection before sends start waiting.
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,

    /// How long a send may wait on a full buffer.
    #[serde(default = "default_send_timeout")]
    pub send_timeout_ms: u64,
}

/// Resource limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    #[serde(default = "default_max_rooms")]
    pub max_rooms: usize,

    #[serde(default = "default_max_rooms_per_connection")]
    pub max_rooms_per_connection: usize,

    /// Maximum WebSocket message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Maximum chat content length in bytes.
    #[serde(default = "default_max_content_length")]
    pub max_content_length: usize,

    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    #[serde(default = "default_max_history_limit")]
    pub max_history_limit: usize,

    /// Rooms without members are forgotten after this many idle seconds.
    #[serde(default = "default_room_idle_secs")]
    pub room_idle_secs: u64,

    /// How often idle rooms are swept, in seconds.
    #[serde(default = "default_room_sweep_secs")]
    pub room_sweep_secs: u64,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Interval between server pings in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,

    /// A connection silent for this long is closed.
    #[serde(default = "default_heartbeat_timeout")]
    pub timeout_ms: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

/// Token configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// HMAC secret for HS256 tokens.
    #[serde(default = "default_jwt_secret")]
    pub jwt_secret: String,

    /// Lifetime of issued and reissued tokens.
    #[serde(default = "default_token_ttl")]
    pub token_ttl_secs: u64,

    /// Clock skew tolerated on expiry.
    #[serde(default = "default_leeway")]
    pub leeway_secs: u64,

    /// How long after expiry a token may still be exchanged.
    #[serde(default = "default_refresh_window")]
    pub refresh_window_secs: u64,
}

/// Dispatcher configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchSection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_backoff")]
    pub backoff_ms: u64,

    #[serde(default = "default_attempt_timeout")]
    pub attempt_timeout_ms: u64,

    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default = "default_max_attempts")]
    pub emit_attempts: u32,

    #[serde(default = "default_emit_delay")]
    pub emit_delay_ms: u64,
}

/// Message deduplication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupSection {
    #[serde(default = "default_dedup_window")]
    pub window_secs: u64,

    #[serde(default = "default_dedup_capacity")]
    pub capacity: usize,
}

/// Users and groups loaded into the in-memory directory at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DirectorySeed {
    #[serde(default)]
    pub users: Vec<UserSeed>,

    #[serde(default)]
    pub groups: Vec<GroupSeed>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSeed {
    pub id: UserId,
    pub username: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupSeed {
    pub id: GroupId,
    #[serde(default)]
    pub members: Vec<UserId>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_handshake_timeout() -> u64 {
    5_000
}

fn default_outbound_buffer() -> usize {
    256
}

fn default_send_timeout() -> u64 {
    1_000
}

fn default_max_connections() -> usize {
    100_000
}

fn default_max_rooms() -> usize {
    100_000
}

fn default_max_rooms_per_connection() -> usize {
    1_000
}

fn default_max_message_size() -> usize {
    128 * 1024
}

fn default_max_content_length() -> usize {
    64 * 1024
}

fn default_history_limit() -> usize {
    50
}

fn default_max_history_limit() -> usize {
    200
}

fn default_room_idle_secs() -> u64 {
    3600
}

fn default_room_sweep_secs() -> u64 {
    300
}

fn default_heartbeat_interval() -> u64 {
    30_000
}

fn default_heartbeat_timeout() -> u64 {
    90_000
}

fn default_metrics_port() -> u16 {
    9090
}

pub(crate) fn default_jwt_secret() -> String {
    "parlor-development-secret".to_string()
}

fn default_token_ttl() -> u64 {
    24 * 60 * 60
}

fn default_leeway() -> u64 {
    5
}

fn default_refresh_window() -> u64 {
    7 * 24 * 60 * 60
}

fn default_max_attempts() -> u32 {
    2
}

fn default_backoff() -> u64 {
    100
}

fn default_attempt_timeout() -> u64 {
    5_000
}

fn default_queue_capacity() -> usize {
    10_000
}

fn default_emit_delay() -> u64 {
    50
}

fn default_dedup_window() -> u64 {
    300
}

fn default_dedup_capacity() -> usize {
    10_000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            metrics: MetricsConfig::default(),
            auth: AuthConfig::default(),
            dispatcher: DispatchSection::default(),
            dedup: DedupSection::default(),
            directory: DirectorySeed::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
            handshake_timeout_ms: default_handshake_timeout(),
            outbound_buffer: default_outbound_buffer(),
            send_timeout_ms: default_send_timeout(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_rooms: default_max_rooms(),
            max_rooms_per_connection: default_max_rooms_per_connection(),
            max_message_size: default_max_message_size(),
            max_content_length: default_max_content_length(),
            history_limit: default_history_limit(),
            max_history_limit: default_max_history_limit(),
            room_idle_secs: default_room_idle_secs(),
            room_sweep_secs: default_room_sweep_secs(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
            timeout_ms: default_heartbeat_timeout(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: default_jwt_secret(),
            token_ttl_secs: default_token_ttl(),
            leeway_secs: default_leeway(),
            refresh_window_secs: default_refresh_window(),
        }
    }
}

impl Default for DispatchSection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff(),
            attempt_timeout_ms: default_attempt_timeout(),
            queue_capacity: default_queue_capacity(),
            emit_attempts: default_max_attempts(),
            emit_delay_ms: default_emit_delay(),
        }
    }
}

impl Default for DedupSection {
    fn default() -> Self {
        Self {
            window_secs: default_dedup_window(),
            capacity: default_dedup_capacity(),
        }
    }
}

impl Config {
    /// Load configuration from the search path, with environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or an
    /// environment override has the wrong type.
    pub fn load() -> Result<Self> {
        let found = SEARCH_PATH
            .iter()
            .map(|path| PathBuf::from(shellexpand::tilde(path).as_ref()))
            .find(|path| path.exists());
        Self::load_from(found.as_deref())
    }

    /// Load configuration from `path` if given, with environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or an
    /// environment override has the wrong type.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            let expanded = shellexpand::tilde(&path.to_string_lossy()).into_owned();
            builder = builder.add_source(
                config::File::new(&expanded, config::FileFormat::Toml).required(true),
            );
        }

        builder
            .add_source(
                config::Environment::with_prefix("PARLOR")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Load configuration from a specific file, without environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if `host:port` is not a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    #[must_use]
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.transport.handshake_timeout_ms)
    }

    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat.timeout_ms)
    }

    #[must_use]
    pub fn room_idle(&self) -> Duration {
        Duration::from_secs(self.limits.room_idle_secs)
    }

    #[must_use]
    pub fn room_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.limits.room_sweep_secs.max(1))
    }

    #[must_use]
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat.interval_ms.max(1))
    }

    #[must_use]
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            buffer: self.transport.outbound_buffer,
            send_timeout: Duration::from_millis(self.transport.send_timeout_ms),
        }
    }

    /// Translate into the core component configuration.
    #[must_use]
    pub fn core_config(&self) -> CoreConfig {
        let dispatcher = &self.dispatcher;
        CoreConfig {
            sessions: SessionConfig {
                max_connections: self.limits.max_connections,
            },
            rooms: RoomConfig {
                max_rooms: self.limits.max_rooms,
                max_rooms_per_connection: self.limits.max_rooms_per_connection,
            },
            dispatcher: DispatcherConfig {
                max_attempts: dispatcher.max_attempts,
                backoff: Duration::from_millis(dispatcher.backoff_ms),
                attempt_timeout: Duration::from_millis(dispatcher.attempt_timeout_ms),
                queue_capacity: dispatcher.queue_capacity,
                emit_attempts: dispatcher.emit_attempts,
                emit_delay: Duration::from_millis(dispatcher.emit_delay_ms),
            },
            dedup: DedupConfig {
                window: Duration::from_secs(self.dedup.window_secs),
                capacity: self.dedup.capacity,
            },
            router: RouterConfig {
                max_content_length: self.limits.max_content_length,
                default_history_limit: self.limits.history_limit,
                max_history_limit: self.limits.max_history_limit,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.transport.websocket_path, "/ws");
        assert_eq!(config.dispatcher.max_attempts, 2);
        assert!(config.directory.users.is_empty());
    }

    #[test]
    fn test_config_bind_addr() {
        let config = Config::default();
        assert_eq!(config.bind_addr().unwrap().port(), 8080);

        let bad = Config {
            host: "not a host".into(),
            ..Config::default()
        };
        assert!(bad.bind_addr().is_err());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "0.0.0.0"
            port = 9000

            [limits]
            max_connections = 50000

            [auth]
            jwt_secret = "s3cret"

            [dispatcher]
            max_attempts = 4

            [[directory.users]]
            id = 1
            username = "alice"

            [[directory.groups]]
            id = 7
            members = [1]
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.limits.max_connections, 50000);
        assert_eq!(config.limits.max_rooms, default_max_rooms());
        assert_eq!(config.room_idle(), Duration::from_secs(3600));
        assert_eq!(config.auth.jwt_secret, "s3cret");
        assert_eq!(config.dispatcher.max_attempts, 4);
        assert_eq!(config.dispatcher.backoff_ms, 100);
        assert_eq!(config.directory.users[0].username, "alice");
        assert_eq!(config.directory.groups[0].members, vec![1]);
    }

    #[test]
    fn test_core_config_conversion() {
        let mut config = Config::default();
        config.limits.max_connections = 10;
        config.dispatcher.backoff_ms = 250;
        config.dedup.window_secs = 60;
        config.limits.room_sweep_secs = 0;

        let core = config.core_config();
        assert_eq!(core.sessions.max_connections, 10);
        assert_eq!(core.dispatcher.backoff, Duration::from_millis(250));
        assert_eq!(core.dedup.window, Duration::from_secs(60));
        assert_eq!(core.router.max_history_limit, 200);
        assert_eq!(config.room_sweep_interval(), Duration::from_secs(1));
    }
}
