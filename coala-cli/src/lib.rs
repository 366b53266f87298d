//! Coala CLI Library
//!
//! Shared functionality for the Coala command-line tools.

pub mod config;
pub mod stats;

pub use config::{Config, ConfigError, EndpointSection, ListenConfig, Method, SendConfig};
pub use stats::{display_delivery, format_bytes, format_duration, format_speed, format_transfer};

/// Install the tracing subscriber, honouring `RUST_LOG` and defaulting to `info`
pub fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
