//! gridsyncd — replays recorded observer streams through the synchronizer.
//!
//! # Usage
//!
//! ```text
//! gridsyncd replay --events events.jsonl --config gridsync.toml --format tree
//! gridsyncd check-config gridsync.toml
//! ```

use std::io::{BufReader, IsTerminal};
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

use gridsync_core::{LogFormat, SyncConfig};
use gridsyncd::{render_tree, replay};

#[derive(Parser)]
#[command(name = "gridsyncd", about = "Deployment tree synchronizer")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply a JSON-lines stream of observation events and print the tree.
    Replay {
        /// Event file, or `-` for stdin.
        #[arg(long)]
        events: String,

        /// gridsync.toml to load.
        #[arg(long)]
        config: Option<PathBuf>,

        #[arg(long, value_enum, default_value = "tree")]
        format: OutputFormat,
    },
    /// Parse a config file and print the effective settings.
    CheckConfig { file: PathBuf },
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Tree,
    Json,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Replay {
            events,
            config,
            format,
        } => {
            let config = load_config(config.as_deref())?;
            init_tracing(&config);
            run_replay(&events, &config, format).await
        }
        Command::CheckConfig { file } => {
            let config = SyncConfig::from_file(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            print!("{}", config.to_toml_string()?);
            println!(
                "# effective: poll_interval = {}ms, event_buffer = {}, log_filter = \"{}\"",
                config.poll_interval().as_millis(),
                config.event_buffer(),
                config.log_filter()
            );
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<SyncConfig> {
    match path {
        Some(path) => SyncConfig::from_file(path)
            .with_context(|| format!("reading {}", path.display())),
        None => Ok(SyncConfig::default()),
    }
}

/// `RUST_LOG` wins over the configured filter. Logs go to stderr so the
/// rendered tree stays alone on stdout.
fn init_tracing(config: &SyncConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.log_filter()))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match config.log_format() {
        LogFormat::Text => builder.with_ansi(std::io::stderr().is_terminal()).init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn run_replay(
    events: &str,
    config: &SyncConfig,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let report = if events == "-" {
        replay(std::io::stdin().lock(), config).await?
    } else {
        let file = std::fs::File::open(events).with_context(|| format!("opening {events}"))?;
        replay(BufReader::new(file), config).await?
    };

    info!(
        servers = report.snapshot.server_count(),
        malformed = report.malformed.len(),
        applied = report.stats.applied,
        stale = report.stats.stale,
        "final tree"
    );

    match format {
        OutputFormat::Tree => print!("{}", render_tree(&report.snapshot)),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report.snapshot)?),
    }
    Ok(())
}
