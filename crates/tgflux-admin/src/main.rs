use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use comfy_table::Table;
use tgflux_core::{
    config::{self, DatabaseSettings, PipelineConfig},
    db, media_manifest,
    orchestrator::recent_runs,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Tgflux administrative tooling", long_about = None)]
struct Cli {
    /// Pipeline settings file (defaults to ./tgflux.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Inspect recorded pipeline runs
    #[command(subcommand)]
    Runs(RunsCommand),
    /// Regenerate the media manifest from the downloaded images
    RebuildManifest,
    /// Log in to Telegram interactively and save the session file
    TelegramLogin(TelegramLoginArgs),
}

#[derive(Subcommand, Debug)]
enum RunsCommand {
    /// List the most recent runs
    List(RunsListArgs),
}

#[derive(Args, Debug)]
struct RunsListArgs {
    /// Number of runs to show
    #[arg(long, default_value_t = 20)]
    limit: i64,
}

#[derive(Args, Debug, Default)]
struct TelegramLoginArgs {
    /// Phone number in international format (defaults to $PHONE)
    #[arg(long)]
    phone: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    let cli = Cli::parse();
    config::load_dotenv();

    match cli.command {
        Command::Runs(RunsCommand::List(args)) => handle_runs_list(args).await,
        Command::RebuildManifest => {
            let settings = PipelineConfig::load(cli.config.as_deref())?;
            handle_rebuild_manifest(&settings).await
        }
        Command::TelegramLogin(args) => handle_telegram_login(args).await,
    }
}

async fn handle_runs_list(args: RunsListArgs) -> Result<()> {
    let pool = db::connect(&DatabaseSettings::from_env()?).await?;
    let runs = recent_runs(&pool, args.limit.max(1)).await?;

    if runs.is_empty() {
        println!("No pipeline runs recorded yet.");
        return Ok(());
    }

    let mut table = Table::new();
    table.set_header(vec![
        "run_id", "trigger", "started_at", "finished_at", "outcome", "failed_stage", "error",
    ]);
    for run in runs {
        table.add_row(vec![
            run.run_id.to_string(),
            run.trigger,
            run.started_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            run.finished_at
                .map(|at| at.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_default(),
            run.outcome,
            run.failed_stage.unwrap_or_default(),
            run.error.map(|err| truncate(&err, 80)).unwrap_or_default(),
        ]);
    }
    println!("{table}");
    Ok(())
}

fn truncate(text: &str, max_chars: usize) -> String {
    let line = text.lines().next().unwrap_or_default();
    if line.chars().count() <= max_chars {
        return line.to_string();
    }
    let mut cut: String = line.chars().take(max_chars.saturating_sub(3)).collect();
    cut.push_str("...");
    cut
}

async fn handle_rebuild_manifest(settings: &PipelineConfig) -> Result<()> {
    let layout = settings.layout();
    let report =
        media_manifest::rebuild(&layout, &settings.enrichment.image_extensions).await?;
    info!(
        path = %layout.manifest_path().display(),
        entries = report.entries,
        kept = report.kept,
        unresolved = report.unresolved.len(),
        "Media manifest rebuilt"
    );
    println!(
        "Wrote {} entries to {} ({} kept from the previous manifest).",
        report.entries,
        layout.manifest_path().display(),
        report.kept
    );
    for path in &report.unresolved {
        println!("  not keyed: {path}");
    }
    Ok(())
}

#[cfg(feature = "telegram")]
async fn handle_telegram_login(args: TelegramLoginArgs) -> Result<()> {
    use std::io::{self, BufRead, Write};

    use anyhow::Context;
    use tgflux_core::{config::TelegramCredentials, sources::telegram};

    let credentials = TelegramCredentials::from_env()?;
    let phone = args
        .phone
        .or_else(|| credentials.phone.clone())
        .context("pass --phone or set PHONE")?;

    let prompt = |question: &str| -> Result<String> {
        print!("{question}");
        io::stdout().flush()?;
        let mut answer = String::new();
        io::stdin().lock().read_line(&mut answer)?;
        Ok(answer)
    };
    telegram::login(&credentials, &phone, prompt).await?;
    println!("Saved session {}", credentials.session_file().display());
    Ok(())
}

#[cfg(not(feature = "telegram"))]
async fn handle_telegram_login(_args: TelegramLoginArgs) -> Result<()> {
    anyhow::bail!("telegram-login requires a build with `--features telegram`")
}
