//! Storage node daemon.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use strand_node::config::{BackendConfig, NodeConfig};

#[derive(Parser, Debug)]
#[command(name = "strand-node", about = "strand storage node")]
struct Args {
    /// JSON config file; flags below override nothing when this is set.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Command transport listen address.
    #[arg(long, default_value = "127.0.0.1:4150")]
    listen: SocketAddr,

    /// Streaming transport listen address.
    #[arg(long)]
    listen_stream: Option<SocketAddr>,

    /// Backends as backend_id:group pairs, e.g. 1:1,2:2.
    #[arg(long, default_value = "1:1", value_delimiter = ',')]
    backends: Vec<String>,

    /// Server queue timeout in seconds.
    #[arg(long, default_value_t = 5)]
    queue_timeout: u64,

    /// Peers to pull routing tables from.
    #[arg(long, value_delimiter = ',')]
    remotes: Vec<SocketAddr>,
}

fn parse_backends(specs: &[String]) -> anyhow::Result<Vec<BackendConfig>> {
    specs
        .iter()
        .map(|spec| {
            let (backend_id, group) = spec
                .split_once(':')
                .with_context(|| format!("backend spec {spec:?}, expected backend_id:group"))?;
            Ok(BackendConfig {
                backend_id: backend_id.parse()?,
                group: group.parse()?,
                enable: true,
                queue_timeout: None,
            })
        })
        .collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => NodeConfig::from_file(path)?,
        None => {
            let mut config = NodeConfig::for_groups(&[]);
            config.address = args.listen;
            config.stream_address = args.listen_stream;
            config.queue_timeout = args.queue_timeout;
            config.backends = parse_backends(&args.backends)?;
            config.remotes = args.remotes.clone();
            config
        }
    };

    let handle = strand_node::start_node(config).await?;
    tracing::info!(addr = %handle.addr, "serving; ctrl-c to stop");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    handle.shutdown();
    Ok(())
}
