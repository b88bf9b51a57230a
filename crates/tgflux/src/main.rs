use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tgflux::api::{self, AppState};
use tgflux_core::{
    analytics::PgAnalytics,
    config::{self, DatabaseSettings, PipelineConfig},
    db,
    detector::WorkerDetector,
    enrichment, loader, schedule, scraper,
    sources::connect_source,
    transform, Orchestrator, RunOutcome, Trigger,
};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Telegram channel ETL pipeline and analytics API", long_about = None)]
struct Cli {
    /// Pipeline settings file (defaults to ./tgflux.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the analytics API
    Serve,
    /// Run the full pipeline once
    Run,
    /// Run the pipeline on the configured cron schedule until Ctrl-C
    Schedule,
    /// Run database migrations
    Migrate,
    /// Scrape the configured channels
    Scrape,
    /// Load scraped channel files into the raw store
    Load,
    /// Run the transformation tool
    Transform,
    /// Detect objects in downloaded images
    Enrich,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    let cli = Cli::parse();
    config::load_dotenv();
    let settings = PipelineConfig::load(cli.config.as_deref())?;

    match cli.command {
        Command::Serve => serve(&settings).await,
        Command::Run => {
            let orchestrator = orchestrator(settings).await?;
            let receipt = orchestrator.run(Trigger::Manual).await?;
            println!("{}", serde_json::to_string_pretty(&receipt)?);
            match receipt.outcome {
                RunOutcome::Succeeded => Ok(()),
                RunOutcome::Skipped => bail!("pipeline run skipped: another run is in progress"),
                RunOutcome::Failed => bail!(
                    "pipeline run failed at {}: {}",
                    receipt
                        .failed_stage
                        .map(|stage| stage.as_str())
                        .unwrap_or("unknown stage"),
                    receipt.error.as_deref().unwrap_or("no error recorded")
                ),
            }
        }
        Command::Schedule => {
            let cron = settings.schedule.cron.clone();
            let orchestrator = Arc::new(orchestrator(settings).await?);
            schedule::run_schedule(orchestrator, &cron).await
        }
        Command::Migrate => {
            let pool = connect_pool().await?;
            db::run_migrations(&pool).await?;
            info!("Database migrations applied");
            Ok(())
        }
        Command::Scrape => {
            let source = connect_source(&settings).await?;
            let report = scraper::scrape_channels(
                source.as_ref(),
                &settings.layout(),
                &settings.scrape.channel_names()?,
                settings.scrape.message_limit,
            )
            .await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Load => {
            let pool = connect_pool().await?;
            let report = loader::load_raw_messages(&pool, &settings.layout()).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Transform => {
            let report = transform::run_transform(&settings.transform).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Enrich => {
            let pool = connect_pool().await?;
            let detector = WorkerDetector::new(settings.enrichment.detector_command.clone());
            let report = enrichment::enrich_images(
                &pool,
                &settings.layout(),
                &detector,
                &settings.enrichment,
            )
            .await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if let Some(err) = report.insert_error {
                bail!("failed to store detections: {err}");
            }
            Ok(())
        }
    }
}

async fn connect_pool() -> Result<db::DbPool> {
    let settings = DatabaseSettings::from_env()?;
    db::connect(&settings).await
}

async fn orchestrator(settings: PipelineConfig) -> Result<Orchestrator> {
    let pool = connect_pool().await?;
    let source = connect_source(&settings).await?;
    let detector = WorkerDetector::new(settings.enrichment.detector_command.clone());
    Orchestrator::new(pool, settings, source, Box::new(detector))
}

async fn serve(settings: &PipelineConfig) -> Result<()> {
    let pool = connect_pool().await?;
    let state = AppState::new(Arc::new(PgAnalytics::new(pool)));
    let router = api::router(state);

    let listener = TcpListener::bind(settings.api.bind.as_str())
        .await
        .with_context(|| format!("failed to bind {}", settings.api.bind))?;
    info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, router).await?;
    Ok(())
}
