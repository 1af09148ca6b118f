mod archive;
mod cleanup;
mod config;
mod error;
mod fetcher;
mod ledger;
mod orchestrator;
#[cfg(test)]
mod test_helpers;

use anyhow::{Context, Result};
use archive::IaClient;
use chrono::Local;
use clap::{ArgAction, Parser};
use orchestrator::RunRequest;
use std::convert::Infallible;
use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const SCRIPT_NAME: &str = "IADownload";
const DEFAULT_MAX_WORKERS: usize = 3;

#[derive(Parser, Debug)]
#[command(author, version = VERSION, about = "Download every item of an Internet Archive collection", long_about = None)]
struct Args {
    /// Collection name, e.g. classicpcgames
    #[arg(short, long)]
    collection: String,

    /// Destination root; one folder per item is created below it
    #[arg(short, long)]
    output: PathBuf,

    /// Only download the .torrent file of each item
    #[arg(short, long)]
    torrent_only: bool,

    #[arg(short, long)]
    verbose: bool,

    /// Delete the staging area of an item that failed or was skipped
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    remove_unfinished: bool,

    /// Number of simultaneous item downloads
    #[arg(short = 'p', long, default_value = "3", value_parser = parse_workers)]
    max_workers: usize,

    /// Remove torrent, image and metadata files once downloads finish
    #[arg(long)]
    cleanup: bool,

    /// Where items are staged before being moved into place
    #[arg(long)]
    staging_dir: Option<PathBuf>,

    #[arg(short, long, default_value = "IADownload.yaml")]
    yaml: PathBuf,
}

/// Anything that is not a number falls back to the default; zero becomes one.
fn parse_workers(value: &str) -> Result<usize, Infallible> {
    Ok(value
        .trim()
        .parse::<usize>()
        .map(|n| n.max(1))
        .unwrap_or(DEFAULT_MAX_WORKERS))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging()?;
    print_banner();

    let config = config::load_config(&args.yaml).context("Failed to load YAML configuration")?;
    let client = IaClient::new(&config.archive).context("Failed to build archive client")?;

    let request = RunRequest {
        collection: args.collection.clone(),
        destination_root: args.output.clone(),
        staging_root: args
            .staging_dir
            .clone()
            .unwrap_or_else(|| config.setting.staging_dir.clone()),
        torrent_only: args.torrent_only,
        verbose: args.verbose,
        max_workers: args.max_workers,
        remove_unfinished: args.remove_unfinished,
    };
    info!("📁 Output directory: {}", request.destination_root.display());
    info!("📦 Staging directory: {}", request.staging_root.display());

    let summary = orchestrator::download_collection(Arc::new(client), &request)
        .await
        .context("Collection download aborted")?;

    if args.cleanup {
        let extensions = cleanup::normalize_extensions(config.cleanup.extensions.as_slice());
        let root = request.destination_root.clone();
        let verbose = args.verbose;
        tokio::task::spawn_blocking(move || cleanup::sweep(&root, &extensions, verbose))
            .await
            .context("Cleanup sweep did not finish")?;
    }

    info!(
        "🏁 {} finished: {} of {} items downloaded this run.",
        SCRIPT_NAME, summary.downloaded, summary.total
    );
    Ok(())
}

fn print_banner() {
    println!("\n{}", "=".repeat(60));
    println!(
        "  🏛️  {} - Internet Archive Collection Downloader v{}",
        SCRIPT_NAME, VERSION
    );
    println!("{}\n", "=".repeat(60));
}

fn setup_logging() -> Result<()> {
    let timestamp = Local::now().format("%Y-%m-%d_%H-%M-%S");
    let log_file = format!("{}_{}.log", SCRIPT_NAME, timestamp);

    let file = File::create(&log_file)?;

    let file_layer = fmt::layer()
        .with_writer(file)
        .with_ansi(false)
        .with_target(false)
        .with_thread_ids(false)
        .with_timer(fmt::time::LocalTime::rfc_3339())
        .compact();

    let stdout_layer = fmt::layer()
        .with_writer(std::io::stdout)
        .with_ansi(true)
        .with_target(false)
        .with_thread_ids(false)
        .with_timer(fmt::time::LocalTime::rfc_3339())
        .compact();

    use tracing_subscriber::layer::SubscriberExt;
    let subscriber = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(file_layer)
        .with(stdout_layer);

    tracing::subscriber::set_global_default(subscriber).context("Failed to set subscriber")?;
    info!("📝 Log file created: {}", log_file);
    Ok(())
}
