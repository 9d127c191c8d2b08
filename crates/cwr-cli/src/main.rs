use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cwr_adapters::{load_entity_ids, DEFAULT_ID_COLUMN};
use cwr_core::EntityId;
use cwr_sync::{run_reconcile, write_run_report, ReconcileConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "cwr-cli")]
#[command(about = "Reconcile first closed-won dates and deal types against the CRM")]
struct Cli {
    /// YAML config file (falls back to CWR_CONFIG).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the pipeline for every entity id in the input file.
    Reconcile {
        #[command(flatten)]
        input: InputArgs,
        /// Write the run summary as JSON to this path.
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Check config and input without contacting the CRM.
    Validate {
        #[command(flatten)]
        input: InputArgs,
    },
}

#[derive(Debug, clap::Args)]
struct InputArgs {
    /// CSV export holding the entity ids.
    #[arg(long)]
    input: PathBuf,
    /// Header of the id column.
    #[arg(long, default_value = DEFAULT_ID_COLUMN)]
    column: String,
}

impl InputArgs {
    fn load(&self) -> Result<Vec<EntityId>> {
        load_entity_ids(&self.input, &self.column)
            .with_context(|| format!("loading entity ids from {}", self.input.display()))
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json);

    let config = ReconcileConfig::load(cli.config.as_deref()).context("loading configuration")?;

    match cli.command {
        Commands::Reconcile { input, report } => {
            let entity_ids = input.load()?;
            info!(entities = entity_ids.len(), "loaded entity ids");
            let summary = run_reconcile(&config, &entity_ids).await?;
            if let Some(path) = report {
                write_run_report(&path, &summary).await?;
            }
            println!(
                "reconcile complete: run_id={} entities={} entities_updated={} deals_updated={} entities_with_failures={}",
                summary.run_id,
                summary.entities,
                summary.entities_updated(),
                summary.deals_updated(),
                summary.entities_with_failures()
            );
        }
        Commands::Validate { input } => {
            let entity_ids = input.load()?;
            println!(
                "config ok: closed_won_stages={} threshold_days={} entities={}",
                config.pipeline.closed_won_stages.len(),
                config.pipeline.threshold_days,
                entity_ids.len()
            );
        }
    }

    Ok(())
}
