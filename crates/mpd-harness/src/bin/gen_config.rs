//! Writes the downnode/upnode JSON configs for a given server count.
//!
//! ```bash
//! mpd-gen-config 3 --config-dir ./config
//! ```

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use mpd_harness::nodes::{default_clients, write_node_configs, Ports};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "mpd-gen-config", about = "Generate MPD node config files")]
struct Cli {
    /// Number of servers (upnodes).
    server_count: usize,

    /// Number of clients (downnodes).
    #[arg(long, default_value_t = 1)]
    clients: usize,

    /// Output directory.
    #[arg(long, default_value = "./config")]
    config_dir: PathBuf,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let clients = default_clients(cli.clients)?;
    for path in write_node_configs(&cli.config_dir, &clients, cli.server_count, Ports::default())? {
        println!("{}", path.display());
    }
    Ok(())
}
