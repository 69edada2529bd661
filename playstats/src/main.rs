use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use playstats::{jobs, Config, RunContext};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "playstats")]
#[command(about = "recently played sync and stats snapshot", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Append plays newer than the stored watermark
    Ingest,

    /// Compute window stats and publish the snapshot
    Summarize,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("playstats=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::from_env().context("invalid configuration")?;
    let ctx = RunContext::new(config.call_timeout);

    let token = ctx.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, cancelling run");
            token.cancel();
        }
    });

    match cli.command {
        Commands::Ingest => handle_ingest(&config, &ctx).await,
        Commands::Summarize => handle_summarize(&config, &ctx).await,
    }
}

async fn handle_ingest(config: &Config, ctx: &RunContext) -> Result<()> {
    let report = jobs::run_ingest(config, ctx)
        .await
        .context("ingest failed")?;

    if report.written == 0 {
        tracing::info!("up to date (watermark {})", report.watermark);
    } else {
        tracing::info!(
            "ingested {} plays after {}",
            report.written,
            report.watermark
        );
    }
    Ok(())
}

async fn handle_summarize(config: &Config, ctx: &RunContext) -> Result<()> {
    let report = jobs::run_summary(config, ctx)
        .await
        .context("summary failed")?;

    tracing::info!(
        "wrote {} ({} bytes, last updated {})",
        report.object,
        report.bytes,
        report.last_updated
    );
    Ok(())
}
