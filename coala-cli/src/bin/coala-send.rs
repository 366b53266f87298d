//! Coala Sender - one request, reliably delivered
//!
//! Reads a payload from stdin or a file and sends it as a confirmable
//! request. Payloads larger than one block go out as a block-wise transfer.

use bytes::Bytes;
use clap::Parser;
use coala::Endpoint;
use coala_cli::{display_delivery, format_bytes, Config, Method, SendConfig};
use coala_protocol::{Message, Token};
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Instant;

#[derive(Parser, Debug)]
#[command(name = "coala-send")]
#[command(about = "Send one Coala request and wait for the response", long_about = None)]
struct Args {
    /// Destination endpoint (host:port)
    #[arg(short, long)]
    peer: Option<SocketAddr>,

    /// Local bind address
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Input source: file path or '-' for stdin
    #[arg(short, long)]
    input: Option<String>,

    /// Resource path
    #[arg(long)]
    path: Option<String>,

    /// Request method (get, post, put, delete)
    #[arg(short, long)]
    method: Option<String>,

    /// Route through this proxy
    #[arg(long)]
    proxy: Option<SocketAddr>,

    /// Seconds to wait for the response
    #[arg(short, long)]
    timeout: Option<u64>,

    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn parse_method(method: &str) -> anyhow::Result<Method> {
    match method.to_ascii_lowercase().as_str() {
        "get" => Ok(Method::Get),
        "post" => Ok(Method::Post),
        "put" => Ok(Method::Put),
        "delete" => Ok(Method::Delete),
        _ => anyhow::bail!("Invalid method: {}", method),
    }
}

fn read_input(input: &str) -> anyhow::Result<Bytes> {
    let mut reader: Box<dyn Read> = if input == "-" {
        tracing::info!("Reading payload from stdin");
        Box::new(io::stdin())
    } else {
        tracing::info!("Reading payload from {}", input);
        let file = File::open(input)
            .map_err(|e| anyhow::anyhow!("Failed to open '{}': {}", input, e))?;
        Box::new(BufReader::new(file))
    };
    let mut data = Vec::new();
    reader.read_to_end(&mut data)?;
    Ok(Bytes::from(data))
}

/// Merge the config file's `[send]` table with command-line overrides
fn resolve(args: &Args, config: &Config) -> anyhow::Result<SendConfig> {
    let peer = args
        .peer
        .or_else(|| config.send.as_ref().map(|send| send.peer))
        .ok_or_else(|| anyhow::anyhow!("No peer given (use --peer or [send] peer)"))?;
    let mut send = config.send.clone().unwrap_or(SendConfig {
        peer,
        path: "/upload".to_string(),
        method: Method::Post,
        input: "-".to_string(),
        proxy: None,
        timeout_secs: 90,
    });
    send.peer = peer;
    if let Some(path) = &args.path {
        send.path = path.clone();
    }
    if let Some(method) = &args.method {
        send.method = parse_method(method)?;
    }
    if let Some(input) = &args.input {
        send.input = input.clone();
    }
    if args.proxy.is_some() {
        send.proxy = args.proxy;
    }
    if let Some(timeout) = args.timeout {
        send.timeout_secs = timeout;
    }
    Ok(send)
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    coala_cli::init_logging(args.verbose);

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    match args.bind {
        Some(bind) => config.endpoint.bind = bind,
        None if args.config.is_none() => config.endpoint.bind = SocketAddr::from(([0, 0, 0, 0], 0)),
        None => {}
    }
    let send = resolve(&args, &config)?;

    let payload = if send.method == Method::Get || send.method == Method::Delete {
        Bytes::new()
    } else {
        read_input(&send.input)?
    };

    let endpoint = Endpoint::bind(config.endpoint.endpoint_config())?;
    tracing::info!("Bound to {}", endpoint.local_addr()?);
    endpoint.start()?;

    let token = Token::random();
    let mut request = Message::request(send.method.code(), send.peer);
    request.token = Some(token.clone());
    request.set_path(&send.path);
    if let Some(proxy) = send.proxy {
        request.set_proxy(proxy);
    }
    if !payload.is_empty() {
        request.set_payload(payload.clone());
    }

    tracing::info!(
        "Sending {} {} ({}) to {}",
        send.method.code(),
        send.path,
        format_bytes(payload.len() as u64),
        send.peer
    );
    let start = Instant::now();
    let outcome = endpoint.request(request)?;

    let result = outcome.recv_timeout(send.timeout());
    let elapsed = start.elapsed();
    let delivery = endpoint.delivery_info(&token);
    endpoint.stop();

    match result {
        Ok(Ok(response)) => {
            println!("{} in {:.2?}", response.code, elapsed);
            if let Some(body) = response.payload.as_ref().filter(|body| !body.is_empty()) {
                println!("{}", String::from_utf8_lossy(body));
            }
        }
        Ok(Err(failure)) => {
            if let Some(info) = &failure.delivery {
                display_delivery(info);
            }
            anyhow::bail!("Request failed: {}", failure.reason);
        }
        Err(_) => anyhow::bail!("No response within {:?}", send.timeout()),
    }

    if let Some(info) = delivery {
        display_delivery(&info);
    }
    Ok(())
}
