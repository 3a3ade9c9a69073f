//! Myrok Tunnel Client
//!
//! A CLI tool that answers HTTP requests arriving at a relay's public
//! endpoint, over a single persistent WebSocket.
//!
//! The client connects to `<server>/proxy`, prints the public URL the relay
//! announces, and answers every proxied request either with a static
//! "Hello World" or by forwarding it to a local HTTP service.

#![deny(clippy::correctness)]
#![warn(clippy::suspicious)]
#![warn(clippy::style)]
#![warn(clippy::complexity)]
#![warn(clippy::perf)]

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod client;
mod config;
mod error;
mod protocol;

use client::{
    ConnectionStatus, ForwardHandler, HelloWorld, ReconnectPolicy, RequestHandler, SessionEvent,
    SessionOptions, TunnelClient,
};
use config::Config;

#[derive(Parser, Debug)]
#[command(name = "myrok")]
#[command(author, version, about = "Answer HTTP requests through a WebSocket relay")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Relay base URL, e.g. https://myrok.example.run.app
    #[arg(short, long, global = true, env = "MYROK_SERVER")]
    server: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Open a tunnel and start answering requests
    Start(StartArgs),

    /// Save the relay base URL to the config file
    SetServer {
        /// The relay base URL
        url: String,
    },
}

#[derive(Parser, Debug)]
struct StartArgs {
    /// Forward requests to this local service instead of answering "Hello World"
    #[arg(short, long, env = "MYROK_FORWARD")]
    forward: Option<String>,

    /// Reconnect with backoff when the tunnel drops
    #[arg(long)]
    reconnect: bool,

    /// Seconds a request may take before it is answered with 504
    #[arg(long)]
    timeout_secs: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let config = Config::load_or_default();

    match cli.command {
        Some(Commands::Start(args)) => run_start(cli.server, args, &config).await,
        Some(Commands::SetServer { url }) => run_set_server(&url, config),
        None => {
            eprintln!("No command specified. Use --help for usage information.");
            eprintln!();
            eprintln!("Quick start:");
            eprintln!("  myrok start -s <url>                  Open a tunnel");
            eprintln!("  myrok start -s <url> -f <local-url>   Forward requests to a local service");
            eprintln!("  myrok set-server <url>                Remember the relay URL");
            std::process::exit(1);
        }
    }
}

async fn run_start(cli_server: Option<String>, args: StartArgs, config: &Config) -> Result<()> {
    // Resolve server from CLI/env > config > error
    let base_url = cli_server
        .or(config.relay.base_url.clone())
        .ok_or_else(|| {
            anyhow::anyhow!(
                "Relay URL required. Use --server, set MYROK_SERVER, \n\
                 or run 'myrok set-server <url>' to save it to {:?}",
                Config::config_path().unwrap_or_default()
            )
        })?;

    let options = SessionOptions {
        header_style: config.relay.header_style,
        handler_timeout: Duration::from_secs(
            args.timeout_secs.unwrap_or(config.handler.timeout_secs),
        ),
    };
    let reconnect = (args.reconnect || config.reconnect.enabled).then(|| ReconnectPolicy {
        max_delay: Duration::from_secs(config.reconnect.max_delay_secs),
        ..ReconnectPolicy::default()
    });

    match args.forward.or(config.handler.forward_to.clone()) {
        Some(target) => {
            let handler = ForwardHandler::new(&target)?;
            info!("Forwarding requests to {}", handler.target());
            run_client(&base_url, handler, options, reconnect).await
        }
        None => run_client(&base_url, HelloWorld, options, reconnect).await,
    }
}

async fn run_client<H: RequestHandler>(
    base_url: &str,
    handler: H,
    options: SessionOptions,
    reconnect: Option<ReconnectPolicy>,
) -> Result<()> {
    let (event_tx, mut event_rx) = mpsc::channel::<SessionEvent>(256);

    let mut client = TunnelClient::new(base_url, handler, options, Some(event_tx))?;
    if let Some(policy) = reconnect {
        client = client.with_reconnect(policy);
    }
    info!("Tunnel endpoint: {}", client.tunnel_url());

    let printer = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            print_event(&event);
        }
    });

    let result = tokio::select! {
        result = client.run() => result.map_err(anyhow::Error::from),
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
            Ok(())
        }
    };

    printer.abort();
    result
}

fn print_event(event: &SessionEvent) {
    match event {
        SessionEvent::Announced { public_url } => {
            println!();
            println!("=== Tunnel Active ===");
            println!();
            println!("  Reach me at {}", public_url);
            println!();
            println!("Press Ctrl+C to stop.");
            println!();
        }
        SessionEvent::RequestReceived(req) => {
            println!(
                "[{}] {} {} ({})",
                req.timestamp.format("%H:%M:%S"),
                req.method,
                req.path,
                req.uuid
            );
        }
        SessionEvent::ResponseSent(resp) => {
            println!(
                "           {} -> {} ({} bytes, {}ms)",
                resp.uuid, resp.status, resp.body_len, resp.duration_ms
            );
        }
        SessionEvent::ConnectionStatus(status @ ConnectionStatus::Reconnecting { .. }) => {
            println!("{}", status);
        }
        SessionEvent::ConnectionStatus(_) => {}
        SessionEvent::Closed(reason) => {
            println!("Proxy closed: {}", reason);
        }
    }
}

fn run_set_server(url: &str, mut config: Config) -> Result<()> {
    // Reject URLs we couldn't derive a tunnel endpoint from
    client::tunnel_url(url)?;

    config.relay.base_url = Some(url.trim_end_matches('/').to_string());
    config.save()?;

    println!(
        "Relay URL saved to {:?}",
        Config::config_path().unwrap_or_default()
    );
    println!("You can now run: myrok start");

    Ok(())
}

fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
