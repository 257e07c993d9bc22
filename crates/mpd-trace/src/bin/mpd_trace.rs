//! Summarizes and charts an MPD client log.
//!
//! ```bash
//! mpd-trace ./client_stdout --out plots
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use mpd_trace::{extract, plot, Summary};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "mpd-trace", about = "Extract time series from an MPD client log")]
struct Cli {
    /// Client stdout capture.
    #[arg(default_value = "./client_stdout")]
    log: PathBuf,

    /// Directory for SVG charts.
    #[arg(long, default_value = ".")]
    out: PathBuf,

    /// Print the summary only.
    #[arg(long, default_value_t = false)]
    no_plots: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let text = std::fs::read_to_string(&cli.log)
        .with_context(|| format!("read {}", cli.log.display()))?;

    let extraction = extract(&text);
    println!("{}", Summary::new(&extraction));

    if !cli.no_plots {
        for path in plot::render_all(&extraction, &cli.out)? {
            println!("{}", path.display());
        }
    }
    Ok(())
}
