//! Administrative entrypoint for the lab instrument gateway.
//!
//! Manages the database schema:
//!
//! ```bash
//! labgw up                 # apply pending migrations
//! labgw status             # report current version and pending list
//! labgw validate           # compare checksums against the database
//! ```
//!
//! Connection details come from `labgw.toml` / `LABGW_*` environment
//! variables, or `--database-url` to override both. Exit code is 0 on
//! success and 1 with a diagnostic on any failure.

mod logging;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use labgw_core::{GatewayConfig, OpContext};
use labgw_storage::{create_pool, MigrationRunner};

#[derive(Parser)]
#[command(name = "labgw")]
#[command(about = "Lab instrument gateway administration", long_about = None)]
struct Cli {
    /// Path to the configuration file.
    #[arg(long, default_value = "labgw.toml")]
    config: PathBuf,

    /// Override the database connection string from the configuration.
    #[arg(long)]
    database_url: Option<String>,

    /// Abort if the database is not reachable within this many seconds.
    #[arg(long, default_value = "30")]
    timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply all pending migrations.
    Up,
    /// Report the current schema version and pending migrations.
    Status,
    /// Verify recorded checksums against the embedded migration set.
    Validate,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = GatewayConfig::load_from(cli.config.clone())
        .context("failed to load configuration")?;
    logging::init(&config.logging)?;

    let pool = match &cli.database_url {
        Some(url) => tokio::time::timeout(
            Duration::from_secs(cli.timeout),
            sqlx::postgres::PgPoolOptions::new()
                .max_connections(2)
                .connect(url),
        )
        .await
        .context("database connection timed out")?
        .context("failed to connect to database")?,
        None => tokio::time::timeout(
            Duration::from_secs(cli.timeout),
            create_pool(&config.database),
        )
        .await
        .context("database connection timed out")?
        .context("failed to connect to database")?,
    };

    let runner = MigrationRunner::new(pool);
    let ctx = OpContext::with_timeout(Duration::from_secs(cli.timeout));

    match cli.command {
        Commands::Up => {
            let applied = runner.up(&ctx).await.context("migration up failed")?;
            println!("applied {applied} migration(s)");
        }
        Commands::Status => {
            let status = runner.status(&ctx).await.context("migration status failed")?;
            println!("Migration status:");
            println!("  current version: {}", status.current_version);
            println!("  applied: {}", status.applied_count);
            println!("  pending: {}", status.pending_count);
            println!();
            for migration in &status.migrations {
                let state = match &migration.applied_at {
                    Some(at) => format!("APPLIED ({})", at.format("%Y-%m-%d %H:%M:%S")),
                    None => "PENDING".to_string(),
                };
                println!("  {:03}_{}: {}", migration.version, migration.name, state);
            }
        }
        Commands::Validate => {
            runner
                .validate(&ctx)
                .await
                .context("migration validation failed")?;
            println!("migration integrity validation passed");
        }
    }
    Ok(())
}
