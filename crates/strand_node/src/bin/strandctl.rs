//! Cluster administration tool: stats, status bits and backend control.

use std::net::SocketAddr;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use strand_client::{Cluster, Session};

#[derive(Parser, Debug)]
#[command(name = "strandctl", about = "strand cluster administration")]
struct Args {
    /// Any node of the cluster.
    #[arg(long)]
    remote: SocketAddr,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print per-node statistics.
    Stat,
    /// Print or set a node's status bits.
    Status {
        #[arg(long)]
        node: SocketAddr,
        #[arg(long)]
        set: Option<u64>,
    },
    /// Inject a service delay into one backend.
    SetDelay {
        #[arg(long)]
        node: SocketAddr,
        #[arg(long)]
        backend: u32,
        #[arg(long)]
        ms: u64,
    },
    /// Print the routing table as seen through the remote.
    Routes,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();

    let args = Args::parse();
    let cluster = Cluster::connect(&[args.remote])
        .await
        .map_err(|err| anyhow::anyhow!("connecting to {}: {err}", args.remote))?;
    let session = Session::new(cluster.clone());

    match args.command {
        Command::Stat => {
            let stats = session
                .stat_log()
                .await
                .get()
                .await
                .map_err(|err| anyhow::anyhow!("stat failed: {err}"))?;
            for entry in stats {
                let payload = entry.json().context("stat entry without payload")?;
                println!("{}", serde_json::to_string_pretty(&payload)?);
            }
        }
        Command::Status { node, set } => {
            let entries = session
                .update_status(node, set)
                .await
                .get()
                .await
                .map_err(|err| anyhow::anyhow!("status failed: {err}"))?;
            for entry in entries {
                let response: strand_proto::body::StatusResponse =
                    strand_proto::decode_body(&entry.data)
                        .context("malformed status response")?;
                println!("{node}: status {:#x}", response.status);
            }
        }
        Command::SetDelay { node, backend, ms } => {
            session
                .set_delay(node, backend, ms)
                .await
                .wait()
                .await
                .map_err(|err| anyhow::anyhow!("set-delay failed: {err}"))?;
            println!("{node}: backend {backend} delay {ms} ms");
        }
        Command::Routes => {
            for entry in cluster.route().dump() {
                println!(
                    "group {:>3}  backend {:>3}  {}  begin {}",
                    entry.group, entry.backend_id, entry.addr, entry.id_begin
                );
            }
        }
    }
    Ok(())
}
