//! CSP Manager - compile security headers and process violation reports.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use csp_manager::{CspManager, ManagerConfig};
use csp_security::{InMemoryPolicyStore, PolicySnapshot};
use reporting::SummaryQuery;

/// CSP Manager - security header management
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the response headers for a policy
    Compile {
        /// Policy snapshot (JSON)
        #[arg(long)]
        policy: PathBuf,
    },
    /// Feed a violation report through the report endpoint
    Ingest {
        /// Policy snapshot (JSON)
        #[arg(long)]
        policy: PathBuf,

        /// Content type the report was sent with
        #[arg(long, default_value = "application/csp-report")]
        content_type: String,

        /// Report body
        #[arg(long)]
        report: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => ManagerConfig::load(path)?,
        None => ManagerConfig::default(),
    };

    // Initialize logging
    let level = if args.verbose { "debug" } else { config.logging.level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("CSP Manager v{}", csp_manager::VERSION);

    match args.command {
        Command::Compile { policy } => {
            let manager = manager(config, &policy)?;
            print_headers(&manager).await;
        }
        Command::Ingest {
            policy,
            content_type,
            report,
        } => {
            let manager = manager(config, &policy)?;
            let body = std::fs::read(&report)
                .with_context(|| format!("failed to read report {}", report.display()))?;

            let receipt = manager.endpoint().handle(Some(&content_type), &body).await;
            manager.endpoint().drain().await;
            println!("{}", serde_json::to_string_pretty(&receipt)?);

            let purged = manager.reports().purge_expired().await?;
            info!(purged, "Purged expired violation records");

            let summary = manager.reports().summary(&SummaryQuery::new()).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);

            print_headers(&manager).await;
        }
    }

    Ok(())
}

fn manager(config: ManagerConfig, policy: &Path) -> Result<CspManager> {
    let text = std::fs::read_to_string(policy)
        .with_context(|| format!("failed to read policy {}", policy.display()))?;
    let snapshot: PolicySnapshot = serde_json::from_str(&text)
        .with_context(|| format!("invalid policy {}", policy.display()))?;

    CspManager::builder(config)
        .policy_store(Arc::new(InMemoryPolicyStore::from_snapshot(snapshot)))
        .build()
}

async fn print_headers(manager: &CspManager) {
    let response = manager.headers().headers().await;
    print!("{}", response.headers);
}
