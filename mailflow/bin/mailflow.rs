#![deny(clippy::pedantic, clippy::all, clippy::nursery)]
#![allow(clippy::must_use_candidate)]

#[cfg(not(any(target_os = "macos", unix)))]
compile_error!("Only macos and unix are currently supported");

use std::path::PathBuf;

use clap::Parser;
use mailflow::Mailflow;

/// Durable mail queue and processor chains
#[derive(Parser, Debug)]
#[command(name = "mailflow", version, about, long_about = None)]
struct Cli {
    /// Configuration file (RON)
    #[arg(short, long, env = "MAILFLOW_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = find_config_file(cli.config)?;

    Mailflow::load(&config_path)?.run().await
}

/// Find the configuration file using the following precedence:
/// 1. `--config` (or the `MAILFLOW_CONFIG` environment variable)
/// 2. ./mailflow.config.ron (current working directory)
/// 3. /etc/mailflow/mailflow.config.ron (system-wide config)
fn find_config_file(explicit: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    if let Some(path) = explicit {
        if path.exists() {
            return Ok(path);
        }
        anyhow::bail!("Configuration file does not exist: {}", path.display());
    }

    let default_paths = [
        PathBuf::from("./mailflow.config.ron"),
        PathBuf::from("/etc/mailflow/mailflow.config.ron"),
    ];

    if let Some(path) = default_paths.iter().find(|p| p.exists()) {
        return Ok(path.clone());
    }

    let paths_tried = default_paths
        .iter()
        .map(|p| format!("  - {}", p.display()))
        .collect::<Vec<_>>()
        .join("\n");

    anyhow::bail!(
        "No configuration file found. Tried:\n  - --config / MAILFLOW_CONFIG\n{paths_tried}"
    )
}
