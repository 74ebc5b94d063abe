use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub redis: RedisConfig,
    pub jwt: JwtConfig,
    pub logging: LoggingConfig,
    pub connection: ConnectionConfig,
    pub relay: RelayConfig,
    pub directory: DirectoryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub http_port: u16,
    /// How long shutdown waits for live connections to drain
    pub drain_timeout_seconds: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            http_port: 8080,
            drain_timeout_seconds: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Empty selects single-node mode with the in-process broker
    pub url: String,
    /// Pub/sub channel carrying relay envelopes
    pub channel: String,
    /// Approximate cap on the catch-up stream
    pub stream_max_len: usize,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            channel: "chatrelay:messages".to_string(),
            stream_max_len: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JwtConfig {
    pub secret: String,
    pub leeway_seconds: u64,
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            leeway_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// `json` or `pretty`
    pub format: String,
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl LoggingConfig {
    #[must_use]
    pub fn is_json(&self) -> bool {
        self.format.eq_ignore_ascii_case("json")
    }
}

/// Per-connection limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub queue_capacity: usize,
    pub keepalive_seconds: u64,
    /// A session with no inbound frame or pong for this long is closed
    pub idle_timeout_seconds: u64,
    pub write_timeout_seconds: u64,
    pub auth_timeout_seconds: u64,
    pub max_message_bytes: usize,
    pub max_text_length: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            keepalive_seconds: 54,
            idle_timeout_seconds: 60,
            write_timeout_seconds: 10,
            auth_timeout_seconds: 10,
            max_message_bytes: 512 * 1024,
            max_text_length: 4096,
        }
    }
}

impl ConnectionConfig {
    #[must_use]
    pub const fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_seconds)
    }

    #[must_use]
    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_seconds)
    }

    #[must_use]
    pub const fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_seconds)
    }

    #[must_use]
    pub const fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub dedup_window_seconds: u64,
    pub cleanup_interval_seconds: u64,
    pub publish_channel_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            dedup_window_seconds: 30,
            cleanup_interval_seconds: 30,
            publish_channel_capacity: 10_000,
        }
    }
}

/// Seed data for the in-memory membership directory
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    /// Treat every authenticated principal as a known user
    pub open: bool,
    pub users: Vec<String>,
    pub conversations: HashMap<String, Vec<String>>,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            open: true,
            users: Vec::new(),
            conversations: HashMap::new(),
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // CHATRELAY_SERVER__HTTP_PORT, CHATRELAY_REDIS__URL, ...
        builder = builder.add_source(
            Environment::with_prefix("CHATRELAY")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    /// Load from environment variables only (for Docker/K8s)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Whether a Redis broker is configured; otherwise the process runs alone
    #[must_use]
    pub fn is_clustered(&self) -> bool {
        !self.redis.url.trim().is_empty()
    }

    #[must_use]
    pub fn http_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.http_port)
    }

    /// Check the whole configuration, reporting every problem at once
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.server.http_port == 0 {
            errors.push("server.http_port must be non-zero".to_string());
        }
        if self.jwt.secret.is_empty() {
            errors.push("jwt.secret must be set".to_string());
        }
        if self.is_clustered() && !self.redis.url.starts_with("redis") {
            errors.push(format!(
                "redis.url must be a redis:// or rediss:// URL, got {}",
                self.redis.url
            ));
        }
        if self.redis.channel.is_empty() {
            errors.push("redis.channel must not be empty".to_string());
        }
        if self.connection.queue_capacity == 0 {
            errors.push("connection.queue_capacity must be at least 1".to_string());
        }
        if self.connection.keepalive_seconds == 0 {
            errors.push("connection.keepalive_seconds must be at least 1".to_string());
        }
        if self.connection.idle_timeout_seconds <= self.connection.keepalive_seconds {
            errors.push(format!(
                "connection.idle_timeout_seconds must exceed keepalive_seconds ({})",
                self.connection.keepalive_seconds
            ));
        }
        if self.connection.write_timeout_seconds == 0 {
            errors.push("connection.write_timeout_seconds must be at least 1".to_string());
        }
        if self.connection.auth_timeout_seconds == 0 {
            errors.push("connection.auth_timeout_seconds must be at least 1".to_string());
        }
        if self.connection.max_text_length == 0 {
            errors.push("connection.max_text_length must be at least 1".to_string());
        }
        if self.relay.publish_channel_capacity == 0 {
            errors.push("relay.publish_channel_capacity must be at least 1".to_string());
        }
        if self.relay.cleanup_interval_seconds == 0 {
            errors.push("relay.cleanup_interval_seconds must be at least 1".to_string());
        }
        if !matches!(
            self.logging.format.to_lowercase().as_str(),
            "json" | "pretty"
        ) {
            errors.push(format!(
                "logging.format must be json or pretty, got {}",
                self.logging.format
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
