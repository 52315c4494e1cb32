//! meshtun node
//!
//! Runs one tunnel node that:
//! - Listens for links from other nodes
//! - Keeps links to its seed nodes alive
//! - Optionally serves an echo channel or pings one

use anyhow::{Context, Result};
use clap::Parser;
use meshtun::config::{generate_example_config, Config};
use meshtun::{DialOptions, ListenOptions, Payload, Tunnel};
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// meshtun node - encrypted, multiplexed peer-to-peer tunnel
#[derive(Parser, Debug)]
#[command(name = "meshtun-node")]
#[command(about = "meshtun node - encrypted, multiplexed peer-to-peer tunnel")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "meshtun.toml")]
    config: String,

    /// Write an example configuration to the config path and exit
    #[arg(long)]
    generate_config: bool,

    /// Listen address (overrides config)
    #[arg(short, long)]
    listen: Option<String>,

    /// Seed node to keep a link to (repeatable, overrides config)
    #[arg(short, long = "node")]
    nodes: Vec<String>,

    /// Network token (overrides config)
    #[arg(long)]
    token: Option<String>,

    /// Serve an echo listener on this channel
    #[arg(long)]
    echo: Option<String>,

    /// Dial this channel, send a message and print the reply
    #[arg(long)]
    ping: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.generate_config {
        generate_example_config()
            .save(&args.config)
            .context("Failed to write example config")?;
        println!("Example configuration written to {}", args.config);
        return Ok(());
    }

    // A missing file means defaults plus flags
    let mut config = if Path::new(&args.config).exists() {
        Config::load(&args.config).context("Failed to load configuration")?
    } else {
        Config::default()
    };

    if let Some(listen) = args.listen {
        config.tunnel.address = listen;
    }
    if !args.nodes.is_empty() {
        config.tunnel.nodes = args.nodes;
    }
    if let Some(token) = args.token {
        config.tunnel.token = token;
    }

    // Initialize logging
    let level = args.log_level.unwrap_or_else(|| config.logging.level.clone());
    let subscriber = tracing_subscriber::fmt().with_env_filter(level.as_str());
    if config.logging.format == "compact" {
        subscriber.compact().init();
    } else {
        subscriber.init();
    }

    let options = config
        .tunnel_options()
        .context("Invalid tunnel configuration")?;
    let tunnel = Tunnel::new(options).context("Failed to create tunnel")?;
    tunnel.connect().await.context("Failed to connect tunnel")?;

    info!(
        "meshtun {} node {} on {}",
        meshtun::VERSION,
        tunnel.id(),
        tunnel.address()
    );

    if let Some(channel) = args.ping {
        let result = ping(&tunnel, &channel).await;
        tunnel.close().await.ok();
        return result;
    }

    if let Some(channel) = args.echo {
        let listener = tunnel
            .listen(&channel, ListenOptions::default())
            .await
            .context("Failed to listen")?;
        info!("Echoing on channel {}", channel);

        tokio::select! {
            _ = echo(&listener) => {}
            _ = tokio::signal::ctrl_c() => {}
        }
    } else {
        tokio::signal::ctrl_c().await?;
    }

    info!("Shutting down");
    tunnel.close().await?;
    Ok(())
}

async fn ping(tunnel: &Tunnel, channel: &str) -> Result<()> {
    // Give the seed links a moment to come up and announce
    for _ in 0..50 {
        if !tunnel.links().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let started = Instant::now();
    let session = tunnel
        .dial(channel, DialOptions::default())
        .await
        .with_context(|| format!("Failed to dial {}", channel))?;

    session
        .send(Payload::new("ping").with_header("sent-by", tunnel.id()))
        .await
        .context("Failed to send")?;
    let reply = session.recv().await.context("No reply")?;

    println!(
        "reply from {}: {} ({:?})",
        session.remote_tunnel_id().unwrap_or_default(),
        String::from_utf8_lossy(&reply.body),
        started.elapsed()
    );

    session.close().await?;
    Ok(())
}

async fn echo(listener: &meshtun::Listener) {
    loop {
        let session = match listener.accept().await {
            Ok(session) => session,
            Err(e) => {
                warn!("Echo listener stopped: {}", e);
                return;
            }
        };
        debug!("Echo session {} accepted", session.id());

        tokio::spawn(async move {
            while let Ok(payload) = session.recv().await {
                if let Err(e) = session.send(payload).await {
                    debug!("Echo session {} send failed: {}", session.id(), e);
                    break;
                }
            }
            session.close().await.ok();
        });
    }
}
