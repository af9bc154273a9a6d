//! `shardstore` server binary.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use shardstore::control::{serve_ready_socket, write_stdout_json, ReadyLine};
use shardstore::discovery::PeerSource;
use shardstore::error::Result;
use shardstore::protocol::ShardId;
use shardstore::{Server, ServerConfig};

/// Sharded in-memory object store server.
#[derive(Parser, Debug)]
#[command(name = "shardstore")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// JSON configuration file; flags override its values.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error). Overrides RUST_LOG.
    #[arg(long)]
    log_level: Option<String>,

    /// Own shard id.
    #[arg(long)]
    shard_id: Option<ShardId>,

    /// Client listener address.
    #[arg(long)]
    client_addr: Option<String>,

    /// Base of the peer port range.
    #[arg(long)]
    peer_port_base: Option<u16>,

    /// Ip the peer listener binds.
    #[arg(long)]
    peer_bind_ip: Option<String>,

    /// Readiness socket address.
    #[arg(long, conflicts_with = "no_ready")]
    ready_addr: Option<String>,

    /// Disable the readiness socket.
    #[arg(long)]
    no_ready: bool,

    /// Coordinator address for peer discovery.
    #[arg(long, requires = "block_dim", conflicts_with = "peer")]
    coordinator: Option<String>,

    /// Shard group size used with --coordinator.
    #[arg(long)]
    block_dim: Option<u32>,

    /// Static peer as ID=IP or ID=HOST:PORT. Repeatable.
    #[arg(long, value_parser = parse_peer)]
    peer: Vec<(ShardId, String)>,

    /// Object store capacity in bytes.
    #[arg(long)]
    max_store_bytes: Option<usize>,

    /// Maximum concurrently outstanding forwarded requests.
    #[arg(long)]
    tag_capacity: Option<usize>,

    /// Deadline of a forwarded request, in milliseconds.
    #[arg(long)]
    remote_timeout_ms: Option<u64>,
}

fn parse_peer(s: &str) -> std::result::Result<(ShardId, String), String> {
    let (id, addr) = s
        .split_once('=')
        .ok_or_else(|| format!("expected ID=ADDR, got {:?}", s))?;
    let id = id.parse().map_err(|_| format!("bad shard id {:?}", id))?;
    if addr.is_empty() {
        return Err("empty peer address".into());
    }
    Ok((id, addr.to_string()))
}

impl Cli {
    /// Config file (or defaults) with flags applied on top.
    fn into_config(self) -> Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::load(path)?,
            None => ServerConfig::default(),
        };

        if let Some(v) = self.shard_id {
            config.shard_id = v;
        }
        if let Some(v) = self.client_addr {
            config.client_addr = v;
        }
        if let Some(v) = self.peer_port_base {
            config.peer_port_base = v;
        }
        if let Some(v) = self.peer_bind_ip {
            config.peer_bind_ip = v;
        }
        if let Some(v) = self.ready_addr {
            config.ready_addr = Some(v);
        }
        if self.no_ready {
            config.ready_addr = None;
        }
        if let Some(v) = self.max_store_bytes {
            config.max_store_bytes = v;
        }
        if let Some(v) = self.tag_capacity {
            config.tag_capacity = v;
        }
        if let Some(v) = self.remote_timeout_ms {
            config.remote_timeout_ms = v;
        }

        if let Some(addr) = self.coordinator {
            config.peers = PeerSource::Coordinator {
                addr,
                block_dim: self.block_dim.unwrap_or(1),
            };
        } else if !self.peer.is_empty() {
            config.peers = PeerSource::Static(self.peer.into_iter().collect::<BTreeMap<_, _>>());
        }
        Ok(config)
    }
}

fn init_tracing(level: Option<&str>) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    // stdout is reserved for the ready line.
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
        .with(filter)
        .init();
}

async fn run(config: ServerConfig) -> Result<()> {
    let mut server = Server::bind(config).await?;

    let peers = server.discover_peers().await?;
    server.connect_peers(&peers).await?;

    let config = server.config().clone();
    let _ready = match &config.ready_addr {
        Some(addr) => Some(serve_ready_socket(addr).await?),
        None => None,
    };
    write_stdout_json(&ReadyLine::new(
        config.shard_id,
        server.client_addr()?.to_string(),
        server.peer_addr()?.to_string(),
        server.connected_peers(),
    ))?;

    server
        .run_until(shutdown_signal(tokio::signal::ctrl_c()))
        .await
}

/// Resolve once `signal` fires. If the handler cannot be installed, never
/// resolve: the server then runs until the process is killed.
async fn shutdown_signal<F>(signal: F)
where
    F: Future<Output = std::io::Result<()>>,
{
    if let Err(e) = signal.await {
        tracing::error!(error = %e, "ctrl-c handler unavailable");
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref());

    let config = match cli.into_config() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "server failed");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_shutdown_signal_fires() {
        shutdown_signal(async { Ok::<(), std::io::Error>(()) }).await;
    }

    #[tokio::test]
    async fn test_failed_signal_handler_keeps_running() {
        let failed = async { Err::<(), _>(std::io::Error::other("no signal driver")) };
        let waited = tokio::time::timeout(Duration::from_millis(50), shutdown_signal(failed)).await;
        assert!(waited.is_err(), "shutdown must not resolve");
    }

    #[test]
    fn test_peer_flag_parsing() {
        assert_eq!(parse_peer("2=10.0.0.3").unwrap(), (2, "10.0.0.3".to_string()));
        assert_eq!(parse_peer("1=host:9").unwrap(), (1, "host:9".to_string()));
        assert!(parse_peer("x=1.2.3.4").is_err());
        assert!(parse_peer("3=").is_err());
        assert!(parse_peer("nope").is_err());
    }
}
