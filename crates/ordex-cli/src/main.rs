//! 🚀 ordex-cli — the front door, the bouncer, the maitre d' of ordex.
//!
//! 🎬 *[narrator voice]* "It all started with a simple main() function..."
//! 📦 This binary crate is the thin CLI wrapper that loads config, wires up
//! the registry/store/downloader/extractor stack via `ordex::bootstrap`, and
//! dispatches to one of a handful of operator commands. Like a manager. 🦆

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use comfy_table::Table;
use tracing::error;
use tracing_subscriber::EnvFilter;

use ordex::config;
use ordex::domain::OrderStatus;

/// 🔧 ordex — watches government sports-rank portals, OCRs their PDFs, and
/// extracts structured award records into the store.
#[derive(Parser)]
#[command(name = "ordex", version, about)]
struct Cli {
    /// Path to a TOML config file (app settings + `[[source]]` entries).
    #[arg(short, long, default_value = "ordex.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one change-detection pass over every active source and print what it found.
    Check,
    /// Run the change-detection loop forever, sleeping between passes.
    Watch {
        /// Minutes to sleep between passes.
        #[arg(long, default_value_t = 30)]
        interval_minutes: u64,
    },
    /// Process a single URL end-to-end (download → OCR → extract → normalize → save).
    ProcessUrl {
        url: String,
        /// Code of the registered source this URL belongs to.
        source_code: String,
    },
    /// Process a file already on disk, skipping the download step.
    ProcessFile {
        path: PathBuf,
        source_code: String,
        order_number: String,
        /// Order date, `YYYY-MM-DD`.
        #[arg(long)]
        order_date: Option<chrono::NaiveDate>,
        #[arg(long)]
        title: Option<String>,
    },
    /// Drain up to `limit` pending orders through the pipeline.
    ProcessPending {
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
    /// Re-run the pipeline for one order from scratch.
    Reprocess { order_id: uuid::Uuid },
}

#[tokio::main]
async fn main() -> Result<()> {
    // 📡 Set up tracing — because println! debugging is a lifestyle choice
    // we're trying to move past, like flip phones and cargo shorts.
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let cli = Cli::parse();

    // 🔒 Only pass a config path down if the file is actually there — `load_config`
    // and `load_sources` both treat "missing" as "use defaults", not an error.
    let config_path = cli.config.try_exists().unwrap_or(false).then_some(cli.config.as_path());

    let app_config = config::load_config(config_path)
        .context("💀 couldn't load the config file — check that the TOML is valid")?;
    let sources = config::load_sources(config_path)
        .context("💀 couldn't load [[source]] entries from the config file")?;

    let app = ordex::bootstrap(app_config, sources).await.context("failed to bootstrap ordex")?;

    let result = run_command(&app, cli.command).await;

    if let Err(err) = result {
        error!("error: {}", err);
        for cause in err.chain().skip(1) {
            error!("  caused by: {}", cause);
        }
        std::process::exit(1);
    }

    Ok(())
}

async fn run_command(app: &ordex::App, command: Command) -> Result<()> {
    match command {
        Command::Check => {
            let results = ordex::check_sources(app).await;
            print_check_results(&results);
        }
        Command::Watch { interval_minutes } => {
            ordex::run_change_detection_loop(app, interval_minutes).await;
        }
        Command::ProcessUrl { url, source_code } => {
            let outcome = app.orchestrator.process_url(&url, &source_code).await?;
            print_outcome(&outcome);
        }
        Command::ProcessFile { path, source_code, order_number, order_date, title } => {
            let outcome = app
                .orchestrator
                .process_file(&path, &source_code, &order_number, order_date, title.as_deref())
                .await?;
            print_outcome(&outcome);
        }
        Command::ProcessPending { limit } => {
            let outcomes = app.orchestrator.process_pending(limit).await?;
            for outcome in &outcomes {
                print_outcome(outcome);
            }
            println!("processed {} order(s)", outcomes.len());
        }
        Command::Reprocess { order_id } => {
            let outcome = app.orchestrator.reprocess(order_id).await?;
            print_outcome(&outcome);
        }
    }
    Ok(())
}

fn print_check_results(results: &[ordex::change_detector::CheckResult]) {
    let mut table = Table::new();
    table.set_header(vec!["source", "status", "new_orders", "error"]);
    for r in results {
        table.add_row(vec![
            r.source_code.clone(),
            format!("{:?}", r.status),
            r.new_orders.to_string(),
            r.error.clone().unwrap_or_default(),
        ]);
    }
    println!("{table}");
}

fn print_outcome(outcome: &ordex::orchestrator::ProcessingOutcome) {
    let mut table = Table::new();
    table.set_header(vec!["stage", "status", "duration_ms", "message"]);
    for step in &outcome.steps {
        table.add_row(vec![
            step.stage.to_string(),
            step.status.to_string(),
            step.duration_ms.to_string(),
            step.message.clone(),
        ]);
    }
    println!("{table}");

    let verb = if outcome.status == OrderStatus::Failed { "failed" } else { "ok" };
    println!(
        "order {} {verb}: {} assignment(s) saved{}",
        outcome.order_id,
        outcome.assignments_saved,
        outcome.error.as_ref().map(|e| format!(" — {e}")).unwrap_or_default(),
    );
}
