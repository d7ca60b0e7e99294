//! radiolytics-matcher - station fingerprint matching service
//!
//! Modes:
//! - `--serve`: poll the work queue and match client recordings until Ctrl-C
//! - `--analyze <match_log>`: summarise a match log
//! - `--index <dir>`: write a CSV index of a fingerprint directory

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use radiolytics_common::config::LoggingConfig;
use radiolytics_common::logging::init_logging;
use radiolytics_matcher::analysis::analyze_match_log;
use radiolytics_matcher::config::ServiceConfig;
use radiolytics_matcher::indexer::{write_csv, FingerprintIndexer};
use radiolytics_matcher::storage::fs::{FsResultSink, FsWorkQueue};
use radiolytics_matcher::MatcherService;
use tokio::signal;
use tracing::info;

/// Command-line arguments for radiolytics-matcher
#[derive(Parser, Debug)]
#[command(name = "radiolytics-matcher")]
#[command(about = "Match client audio fingerprints against live station references")]
#[command(version)]
struct Args {
    /// Bootstrap config file (TOML)
    #[arg(short, long, env = "RADIOLYTICS_CONFIG")]
    config: Option<PathBuf>,

    /// Root folder holding the work queue and results
    #[arg(short, long, env = "RADIOLYTICS_ROOT_FOLDER")]
    root: Option<PathBuf>,

    /// Run the matching service until interrupted
    #[arg(long)]
    serve: bool,

    /// Analyze a match log and print the best configurations
    #[arg(long, value_name = "MATCH_LOG")]
    analyze: Option<PathBuf>,

    /// Index all fingerprint records below a directory
    #[arg(long, value_name = "DIR")]
    index: Option<PathBuf>,

    /// CSV output for --index
    #[arg(long, value_name = "FILE", default_value = "fingerprint_index.csv")]
    csv: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if let Some(log_path) = &args.analyze {
        init_logging(&LoggingConfig::default())?;
        let report = analyze_match_log(log_path)
            .await
            .with_context(|| format!("Failed to read match log {}", log_path.display()))?;
        print!("{}", report);
        return Ok(());
    }

    if let Some(dir) = &args.index {
        init_logging(&LoggingConfig::default())?;
        let report = FingerprintIndexer::new().index(dir)?;
        if report.rows.is_empty() {
            println!("No fingerprints found.");
            return Ok(());
        }
        write_csv(&report.rows, &args.csv)?;
        println!("Wrote {} with {} fingerprints.", args.csv.display(), report.rows.len());
        return Ok(());
    }

    if !args.serve {
        bail!("Nothing to do: pass --serve, --analyze <match_log> or --index <dir>");
    }

    serve(&args).await
}

async fn serve(args: &Args) -> Result<()> {
    // Step 1: Configuration (fails fast on invalid matcher settings)
    let config = ServiceConfig::load(args.config.as_deref(), args.root.as_deref())
        .context("Failed to load configuration")?;
    init_logging(&config.logging)?;

    info!("Starting radiolytics-matcher v{}", env!("CARGO_PKG_VERSION"));
    info!("Root folder: {}", config.root_folder.display());
    info!(
        "Stations: {} (threshold {:.2}, policy {:?})",
        config.matcher.stations.join(", "),
        config.matcher.match_threshold,
        config.matcher.policy
    );

    // Step 2: Collaborators
    let queue_dir = config.queue_dir();
    let results_dir = config.results_dir();
    std::fs::create_dir_all(&queue_dir)
        .with_context(|| format!("Failed to create {}", queue_dir.display()))?;
    std::fs::create_dir_all(&results_dir)
        .with_context(|| format!("Failed to create {}", results_dir.display()))?;

    let service = MatcherService::new(
        config.matcher.clone(),
        Arc::new(FsWorkQueue::new(queue_dir)),
        Arc::new(FsResultSink::new(results_dir)),
    );

    // Step 3: Run until Ctrl-C
    service.start();
    signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;
    info!("Shutting down...");
    service.stop().await;

    Ok(())
}
