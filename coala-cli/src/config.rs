//! Configuration file support for the Coala CLI tools

use coala::layers::ArqConfig;
use coala::{EndpointConfig, PoolConfig};
use coala_protocol::MessageCode;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Socket and engine tuning shared by both tools
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointSection {
    /// Local bind address
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
    /// Allow broadcast destinations
    #[serde(default)]
    pub broadcast: bool,
    /// Sends before a message is given up
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Wait for an ACK before resending, in milliseconds
    #[serde(default = "default_resend_ms")]
    pub resend_ms: u64,
    /// Lifetime of a queued message, in seconds
    #[serde(default = "default_expiration_secs")]
    pub expiration_secs: u64,
    /// Lifetime of a sent but unacknowledged message, in seconds
    #[serde(default = "default_garbage_secs")]
    pub garbage_secs: u64,
    /// Upper bound on queued messages
    #[serde(default = "default_pool_capacity")]
    pub pool_capacity: usize,
    /// Blocks in flight per block-wise transfer
    #[serde(default = "default_window_size")]
    pub window_size: usize,
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 5683))
}

fn default_max_attempts() -> u32 {
    coala::pool::MAX_ATTEMPTS
}

fn default_resend_ms() -> u64 {
    coala::pool::RESEND_PERIOD.as_millis() as u64
}

fn default_expiration_secs() -> u64 {
    coala::pool::EXPIRATION_PERIOD.as_secs()
}

fn default_garbage_secs() -> u64 {
    coala::pool::GARBAGE_PERIOD.as_secs()
}

fn default_pool_capacity() -> usize {
    coala::pool::POOL_CAPACITY
}

fn default_window_size() -> usize {
    coala::layers::arq::WINDOW_SIZE
}

impl Default for EndpointSection {
    fn default() -> Self {
        EndpointSection {
            bind: default_bind(),
            broadcast: false,
            max_attempts: default_max_attempts(),
            resend_ms: default_resend_ms(),
            expiration_secs: default_expiration_secs(),
            garbage_secs: default_garbage_secs(),
            pool_capacity: default_pool_capacity(),
            window_size: default_window_size(),
        }
    }
}

impl EndpointSection {
    /// Engine configuration for these settings
    pub fn endpoint_config(&self) -> EndpointConfig {
        EndpointConfig {
            bind_addr: self.bind,
            broadcast: self.broadcast,
            pool: PoolConfig {
                max_attempts: self.max_attempts,
                resend_period: Duration::from_millis(self.resend_ms),
                expiration_period: Duration::from_secs(self.expiration_secs),
                garbage_period: Duration::from_secs(self.garbage_secs),
                capacity: self.pool_capacity,
                ..PoolConfig::default()
            },
            arq: ArqConfig {
                window_size: self.window_size,
                ..ArqConfig::default()
            },
            ..EndpointConfig::default()
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.window_size == 0 {
            return Err(ConfigError::Invalid("window_size must be positive".to_string()));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid("max_attempts must be positive".to_string()));
        }
        if self.pool_capacity == 0 {
            return Err(ConfigError::Invalid("pool_capacity must be positive".to_string()));
        }
        Ok(())
    }
}

/// Request method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl Method {
    pub fn code(self) -> MessageCode {
        match self {
            Method::Get => MessageCode::Get,
            Method::Post => MessageCode::Post,
            Method::Put => MessageCode::Put,
            Method::Delete => MessageCode::Delete,
        }
    }
}

/// Sender configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendConfig {
    /// Destination endpoint
    pub peer: SocketAddr,
    /// Resource path
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default = "default_method")]
    pub method: Method,
    /// Input source (file path or "-" for stdin)
    #[serde(default = "default_input")]
    pub input: String,
    /// Optional proxy every datagram is routed through
    pub proxy: Option<SocketAddr>,
    /// How long to wait for the response, in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_path() -> String {
    "/upload".to_string()
}

fn default_method() -> Method {
    Method::Post
}

fn default_input() -> String {
    "-".to_string()
}

fn default_timeout_secs() -> u64 {
    90
}

impl SendConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Listener configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenConfig {
    /// Directory received payloads are written to
    pub output_dir: Option<PathBuf>,
    /// Payload of every reply
    #[serde(default = "default_reply")]
    pub reply: String,
}

fn default_reply() -> String {
    "ok".to_string()
}

impl Default for ListenConfig {
    fn default() -> Self {
        ListenConfig {
            output_dir: None,
            reply: default_reply(),
        }
    }
}

/// Combined configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub endpoint: EndpointSection,
    pub send: Option<SendConfig>,
    pub listen: Option<ListenConfig>,
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Config::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(contents)?;
        config.endpoint.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Example configuration with both tools filled in
    pub fn example() -> Self {
        Config {
            endpoint: EndpointSection::default(),
            send: Some(SendConfig {
                peer: SocketAddr::from(([192, 168, 1, 10], 5683)),
                path: default_path(),
                method: Method::Post,
                input: default_input(),
                proxy: None,
                timeout_secs: default_timeout_secs(),
            }),
            listen: Some(ListenConfig {
                output_dir: Some(PathBuf::from("received")),
                reply: default_reply(),
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
