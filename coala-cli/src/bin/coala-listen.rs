//! Coala Listener - accepts requests and uploads
//!
//! Prints every inbound request, optionally stores its payload, and answers
//! with 2.04 Changed.

use bytes::Bytes;
use clap::Parser;
use coala::Endpoint;
use coala_cli::{format_bytes, format_transfer, Config, ListenConfig};
use coala_protocol::{Message, MessageCode, OptionNumber};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

/// How long queued replies get to leave before shutdown
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
#[command(name = "coala-listen")]
#[command(about = "Receive Coala requests and acknowledge them", long_about = None)]
struct Args {
    /// Local bind address
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Directory received payloads are written to
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Reply payload
    #[arg(short, long)]
    reply: Option<String>,

    /// Exit after this many requests
    #[arg(long)]
    count: Option<u64>,

    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

/// Requests, and uploads reassembled from Block1 transfers
fn is_incoming_request(message: &Message) -> bool {
    message.is_request() || message.has_option(OptionNumber::Block1)
}

fn store(dir: &Path, message: &Message) -> anyhow::Result<Option<PathBuf>> {
    let Some(payload) = message.payload.as_ref().filter(|payload| !payload.is_empty()) else {
        return Ok(None);
    };
    fs::create_dir_all(dir)?;
    let name = if message.token.is_some() {
        format!("{}.bin", message.hex_token())
    } else {
        format!("{}.bin", message.id)
    };
    let path = dir.join(name);
    fs::write(&path, payload)
        .map_err(|e| anyhow::anyhow!("Failed to write '{}': {}", path.display(), e))?;
    Ok(Some(path))
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    coala_cli::init_logging(args.verbose);

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    if let Some(bind) = args.bind {
        config.endpoint.bind = bind;
    }
    let mut listen = config.listen.clone().unwrap_or_default();
    if args.output.is_some() {
        listen.output_dir = args.output.clone();
    }
    if let Some(reply) = &args.reply {
        listen.reply = reply.clone();
    }
    let ListenConfig { output_dir, reply } = listen;

    let endpoint = Endpoint::bind(config.endpoint.endpoint_config())?;
    tracing::info!("Listening on {}", endpoint.local_addr()?);
    if let Some(dir) = &output_dir {
        tracing::info!("Writing payloads to {}", dir.display());
    }
    endpoint.start()?;

    let inbound = endpoint.inbound();
    let reply = Bytes::from(reply);
    let mut handled = 0u64;

    while let Ok(message) = inbound.recv() {
        if !is_incoming_request(&message) {
            tracing::debug!("Ignoring {}", message);
            continue;
        }

        tracing::info!(
            "{} {} from {:?}, {}",
            message.code,
            message.path(),
            message.address,
            format_bytes(message.payload_len() as u64)
        );
        if let Some(token) = &message.token {
            if let Some(report) = endpoint.delivery_info(token).and_then(|info| info.transfer) {
                tracing::info!("Transfer {}", format_transfer(&report));
            }
        }

        if let Some(dir) = &output_dir {
            match store(dir, &message) {
                Ok(Some(path)) => tracing::info!("Stored {}", path.display()),
                Ok(None) => {}
                Err(e) => tracing::error!("{}", e),
            }
        }

        if let Err(e) = endpoint.respond(&message, MessageCode::Changed, Some(reply.clone())) {
            tracing::warn!("Failed to answer {}: {}", message.id, e);
        }

        handled += 1;
        if args.count.map_or(false, |count| handled >= count) {
            break;
        }
    }

    let deadline = Instant::now() + DRAIN_TIMEOUT;
    while endpoint.pending() > 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(50));
    }
    endpoint.stop();
    tracing::info!("Handled {} requests", handled);
    Ok(())
}
