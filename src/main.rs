use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use topicmesh::{BootstrapPeer, Config, Node};

#[derive(Parser, Debug)]
#[command(name = "topicmesh")]
#[command(author, version, about = "Join a topic, find its peers and chat over flood pub/sub", long_about = None)]
struct Args {
    /// TOML configuration file. Flags below override its values.
    #[arg(short, long, value_name = "FILE")]
    config: Option<String>,

    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Seed peer as IP:PORT/PEER_ID. Repeatable.
    #[arg(short = 'B', long = "bootstrap", value_name = "PEER")]
    bootstrap: Vec<BootstrapPeer>,

    #[arg(short, long)]
    topic: Option<String>,

    #[arg(long, value_name = "MS")]
    provide_timeout_ms: Option<u64>,

    #[arg(long, value_name = "MS")]
    find_timeout_ms: Option<u64>,

    #[arg(long, value_name = "MS")]
    dial_timeout_ms: Option<u64>,

    /// Seconds between telemetry log lines.
    #[arg(long, value_name = "SECS", default_value = "300")]
    telemetry_interval: u64,
}

impl Args {
    fn into_config(self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::from_toml_file(path)?,
            None => Config::default(),
        };
        if let Some(bind) = self.bind {
            config.bind = bind.to_string();
        }
        if !self.bootstrap.is_empty() {
            config.bootstrap_peers = self.bootstrap.iter().map(ToString::to_string).collect();
        }
        if let Some(topic) = self.topic {
            config.topic_name = topic;
        }
        if let Some(ms) = self.provide_timeout_ms {
            config.provide_timeout_ms = ms;
        }
        if let Some(ms) = self.find_timeout_ms {
            config.find_timeout_ms = ms;
        }
        if let Some(ms) = self.dial_timeout_ms {
            config.dial_timeout_ms = ms;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let telemetry_interval = Duration::from_secs(args.telemetry_interval.max(1));
    let config = args.into_config()?;
    let node = tokio::select! {
        started = Node::start(config) => started.context("failed to start node")?,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted during startup");
            return Ok(());
        }
    };

    info!("Node identity: {}", node.identity());
    info!(topic = %node.topic(), peers = node.connected_peers().len(), "discovery complete");
    println!("Bootstrap string: {}", node.bootstrap_string());
    println!("Type something and hit enter to send:");

    let mut stream = node.messages().await?;
    let local_id = node.identity().to_hex();
    let printer = tokio::spawn(async move {
        while let Some(msg) = stream.recv().await {
            if msg.from == local_id {
                continue;
            }
            println!("{}: {}", msg.from, String::from_utf8_lossy(&msg.data));
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut interval = time::interval(telemetry_interval);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                break;
            }
            _ = interval.tick() => {
                let snapshot = node.telemetry().await;
                info!(
                    state = %snapshot.state,
                    known_peers = snapshot.known_peers,
                    connected_peers = snapshot.connected_peers,
                    failed_peers = snapshot.failed_peers,
                    stored_keys = snapshot.stored_keys,
                    seen_messages = snapshot.seen_messages,
                    subscriptions = ?snapshot.subscriptions,
                    "telemetry snapshot"
                );
            }
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    if line.is_empty() {
                        continue;
                    }
                    if let Err(e) = node.publish(line.into_bytes()).await {
                        warn!(error = %e, "publish failed");
                    }
                }
                Ok(None) => {
                    // Keep relaying until interrupted.
                    info!("stdin closed");
                    stdin_open = false;
                }
                Err(e) => {
                    warn!(error = %e, "failed to read stdin");
                    break;
                }
            }
        }
    }

    node.shutdown().await;
    printer.abort();
    Ok(())
}
