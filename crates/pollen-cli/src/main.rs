use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use pollen_core::local_calendar_date;
use pollen_sync::{build_scheduler, IngestOutcome, IngestionPipeline, SyncConfig};
use pollen_web::{AppState, ForecastView};
use tracing::level_filters::LevelFilter;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "pollen-cli")]
#[command(about = "Pollen and thunderstorm-asthma forecast ingestor")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ingest today's forecast unless it is already stored.
    Ingest,
    /// Serve the read API.
    Serve {
        /// Also run the periodic ingestion ticker in this process.
        #[arg(long)]
        with_scheduler: bool,
    },
    /// Run the periodic ingestion ticker until interrupted.
    Schedule,
    /// Print a stored forecast as JSON. Defaults to the latest stored date.
    Show { date: Option<NaiveDate> },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env()?;
    let pipeline = Arc::new(IngestionPipeline::from_config(&config).await?);

    match cli.command.unwrap_or(Commands::Ingest) {
        Commands::Ingest => match pipeline.run_if_needed().await? {
            IngestOutcome::Skipped { latest } => {
                println!("forecast already stored for today (latest={latest})");
            }
            IngestOutcome::Ingested {
                run_id,
                date,
                sites,
                regions,
            } => {
                println!("ingest complete: run_id={run_id} date={date} sites={sites} regions={regions}");
            }
        },
        Commands::Serve { with_scheduler } => {
            let _sched = if with_scheduler {
                let sched = build_scheduler(pipeline.clone(), &config.schedule_cron).await?;
                sched.start().await.context("starting scheduler")?;
                Some(sched)
            } else {
                None
            };
            pollen_web::serve(AppState::new(pipeline), config.port).await?;
        }
        Commands::Schedule => {
            if let Err(err) = pipeline.run_if_needed().await {
                warn!(error = %err, "initial ingestion failed; waiting for the next tick");
            }
            let mut sched = build_scheduler(pipeline.clone(), &config.schedule_cron).await?;
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.schedule_cron, "scheduler running; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Show { date } => {
            let day = match date {
                Some(day) => day,
                None => local_calendar_date(&pipeline.latest_forecast_date().await?, pipeline.zone()),
            };
            let forecast = pipeline.forecast_for(day).await?;
            let view = ForecastView::new(forecast, day, &pipeline);
            println!("{}", serde_json::to_string_pretty(&view)?);
        }
    }

    Ok(())
}
