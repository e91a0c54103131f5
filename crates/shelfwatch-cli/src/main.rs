use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use shelfwatch_core::EntityKind;
use shelfwatch_ledger::PgLedger;
use shelfwatch_sync::SyncConfig;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "shelfwatch")]
#[command(about = "Track changes across scraped product listings and downloaded files")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one reconciliation pass per kind and export JSON snapshots.
    Sync {
        /// Restrict the run to `product` or `file`.
        #[arg(long)]
        kind: Option<EntityKind>,
    },
    /// Re-hash stored files and record local edits or deletions.
    AuditFiles,
    /// Apply database migrations.
    Migrate,
    /// Serve the read-only JSON API.
    Serve,
    /// Run syncs on the configured cron schedule until interrupted.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync { kind: None }) {
        Commands::Sync { kind } => {
            let summary = shelfwatch_sync::run_sync_once_from_env(kind).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            let failed = summary.failed();
            if failed > 0 {
                bail!("{failed} pass(es) failed in run {}", summary.run_id);
            }
        }
        Commands::AuditFiles => {
            let pipeline = shelfwatch_sync::pipeline_from_env().await?;
            let report = pipeline.run_local_file_audit().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            let ledger = PgLedger::connect(&config.database_url)
                .await
                .context("connecting to DATABASE_URL")?;
            ledger.migrate().await.context("running migrations")?;
            info!("migrations applied");
        }
        Commands::Serve => {
            shelfwatch_web::serve_from_env().await?;
        }
        Commands::Schedule => {
            let pipeline = Arc::new(shelfwatch_sync::pipeline_from_env().await?);
            let cron = pipeline.config().sync_cron.clone();
            let Some(sched) = pipeline.maybe_build_scheduler().await? else {
                bail!("scheduler disabled; set SHELFWATCH_SCHEDULER_ENABLED=true");
            };
            sched.start().await.context("starting scheduler")?;
            info!(%cron, "scheduler running");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            info!("shutting down scheduler");
        }
    }

    Ok(())
}
