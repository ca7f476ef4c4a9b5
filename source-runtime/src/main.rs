use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use source_runtime::{DeclarativeSource, Manifest, Source};
use std::io::Write;
use std::path::PathBuf;
use tracing::{error, info};
use tributary::config::{load_config, ConnectorConfig, RuntimeConfig};
use tributary::protocol::ConfiguredCatalog;
use tributary::state::StateManager;
use tributary::Message;

#[derive(Parser)]
#[command(name = "source-runtime", about = "Run a declarative source connector")]
struct Cli {
    /// Connector manifest (YAML)
    #[arg(long)]
    manifest: PathBuf,

    /// Runtime settings (TOML); TRIBUTARY_* env vars are applied on top
    #[arg(long)]
    runtime_config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate the config with one request per check stream
    Check {
        #[arg(long)]
        config: PathBuf,
    },
    /// Print the catalog
    Discover {
        #[arg(long)]
        config: PathBuf,
    },
    /// Sync the configured catalog
    Read {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        catalog: PathBuf,
        #[arg(long)]
        state: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr; stdout carries protocol messages only
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "source_runtime=info,tributary=info".into()),
        )
        .init();

    let cli = Cli::parse();

    let runtime = match &cli.runtime_config {
        Some(path) => load_config(path)?.with_env_overrides(),
        None => RuntimeConfig::from_env(),
    };
    let manifest = Manifest::load(&cli.manifest)?;
    let source = DeclarativeSource::new(manifest, runtime).context("Failed to build HTTP client")?;

    match cli.command {
        Command::Check { config } => {
            let config = ConnectorConfig::load(&config)?;
            let status = source.check(&config).await;
            write_message(&status)?;
        }
        Command::Discover { config } => {
            ConnectorConfig::load(&config)?;
            write_message(&Message::Catalog {
                catalog: source.discover(),
            })?;
        }
        Command::Read {
            config,
            catalog,
            state,
        } => {
            let config = ConnectorConfig::load(&config)?;
            let catalog = load_catalog(&catalog)?;
            let state = match state {
                Some(path) => StateManager::load(&path)?,
                None => StateManager::default(),
            };
            info!(
                streams = catalog.streams.len(),
                states = state.len(),
                "Starting read"
            );

            let mut messages = source.read(&config, catalog, state);
            let mut failure = None;
            while let Some(item) = messages.next().await {
                match item {
                    Ok(message) => write_message(&message)?,
                    Err(e) => {
                        error!(error = %e, "Read failed");
                        failure = Some(e);
                    }
                }
            }
            if let Some(e) = failure {
                bail!(e);
            }
            info!("Read complete");
        }
    }
    Ok(())
}

fn load_catalog(path: &PathBuf) -> Result<ConfiguredCatalog> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read catalog {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("Failed to parse catalog {}", path.display()))
}

fn write_message(message: &Message) -> Result<()> {
    let line = message.to_line().context("Failed to serialize message")?;
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{}", line).context("Failed to write to stdout")?;
    Ok(())
}
