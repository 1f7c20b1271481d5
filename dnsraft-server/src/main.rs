use anyhow::{Context, Result};
use clap::Parser;
use dnsraft_common::config::{load_config, ServerConfig};
use dnsraft_server::Server;
use std::path::PathBuf;
use tracing::{info, warn};

/// Raft-replicated record store node.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// JSON config file. Flags below override its values.
    #[arg(long)]
    config: Option<String>,

    /// Node id, unique within the cluster.
    #[arg(long)]
    id: Option<String>,

    /// Address the shared Raft/command listener binds to.
    #[arg(long)]
    raft_addr: Option<String>,

    /// Address peers should use to reach this node.
    #[arg(long)]
    advertise: Option<String>,

    /// Existing member to join through on first start.
    #[arg(long)]
    join: Option<String>,

    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Stop without asking the cluster to remove this node.
    #[arg(long)]
    no_leave: bool,
}

impl Cli {
    fn into_config(self) -> Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => load_config(path).with_context(|| format!("loading {}", path))?,
            None => ServerConfig::default(),
        };
        if let Some(id) = self.id {
            config.node_id = id;
        }
        if let Some(addr) = self.raft_addr {
            config.bind_addr = addr;
        }
        if self.advertise.is_some() {
            config.advertise_addr = self.advertise;
        }
        if self.join.is_some() {
            config.join = self.join;
        }
        if let Some(dir) = self.data_dir {
            config.data_dir = dir;
        }
        if self.no_leave {
            config.leave_on_shutdown = false;
        }
        Ok(config)
    }
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Cli::parse().into_config()?;
    let server = Server::bind(config)
        .await
        .context("failed to start node")?;
    info!("listening on {}", server.local_addr()?);

    server
        .run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await?;
    Ok(())
}
