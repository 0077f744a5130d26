use std::process::ExitCode;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use sral_ingest::catalog::{HttpCatalogClient, TokenProvider};
use sral_ingest::config::{ConfigLoader, Credentials};
use sral_ingest::domain::TimeRange;
use sral_ingest::error::IngestError;
use sral_ingest::fetcher::HttpProductDownloader;
use sral_ingest::frame::NetcdfFrameReader;
use sral_ingest::pipeline::{IngestJob, RunOptions, RunSummary};

const API_BASE_URL: &str = "https://api.eumetsat.int";

#[derive(Parser)]
#[command(name = "sral-ingest")]
#[command(about = "Ingest Sentinel-3 SRAL products into a month-partitioned Zarr collection")]
#[command(version, author)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Run one search → download → assemble → insert pass")]
    Run(RunArgs),
}

#[derive(Args)]
struct RunArgs {
    #[arg(long)]
    config: Option<String>,

    /// Sensing time range start (RFC 3339), overrides the config file.
    #[arg(long)]
    start: Option<DateTime<Utc>>,

    /// Sensing time range end (RFC 3339), overrides the config file.
    #[arg(long)]
    end: Option<DateTime<Utc>>,

    #[arg(long)]
    max_parallel: Option<usize>,

    /// Keep the download scratch directory after the run.
    #[arg(long)]
    keep_downloads: bool,
}

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(report) => {
            eprintln!("{report:?}");
            if let Some(ingest) = report.downcast_ref::<IngestError>() {
                return ExitCode::from(map_exit_code(ingest));
            }
            ExitCode::from(1)
        }
    }
}

fn map_exit_code(error: &IngestError) -> u8 {
    match error {
        IngestError::MissingConfig
        | IngestError::ConfigRead(_)
        | IngestError::ConfigParse(_)
        | IngestError::MissingCredentials(_)
        | IngestError::CredentialsParse(_)
        | IngestError::InvalidCollectionId(_)
        | IngestError::InvalidProductId(_)
        | IngestError::InvalidRange { .. } => 2,
        IngestError::AuthHttp(_)
        | IngestError::AuthStatus { .. }
        | IngestError::CatalogHttp(_)
        | IngestError::CatalogStatus { .. }
        | IngestError::CatalogPayload(_) => 3,
        IngestError::StoreWrite { .. } => 4,
        _ => 1,
    }
}

fn run() -> miette::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => run_ingest(args),
    }
}

fn run_ingest(args: RunArgs) -> miette::Result<ExitCode> {
    let range_override = match (args.start, args.end) {
        (Some(start), Some(end)) => Some(TimeRange::new(start, end)?),
        (None, None) => None,
        _ => {
            return Err(miette::miette!(
                "--start and --end must be provided together"
            ));
        }
    };

    let mut config = ConfigLoader::resolve(args.config.as_deref(), range_override)?;
    if let Some(max_parallel) = args.max_parallel {
        config.max_parallel = max_parallel.max(1);
    }

    let credentials = Credentials::load(&config.credentials_path)?;
    let tokens = Arc::new(TokenProvider::new(API_BASE_URL, credentials)?);
    let catalog = HttpCatalogClient::new(API_BASE_URL, tokens.clone())?;
    let downloader = HttpProductDownloader::new(
        API_BASE_URL,
        config.collection_id.clone(),
        tokens,
        config.download_timeout_secs,
    )?;

    let job = IngestJob::new(config, catalog, downloader, NetcdfFrameReader);
    let summary = job.run(RunOptions {
        keep_downloads: args.keep_downloads,
    })?;

    print_summary(&summary).into_diagnostic()?;
    if summary.partitions_failed > 0 {
        eprintln!(
            "{} of {} partitions failed to write",
            summary.partitions_failed,
            summary.partitions_failed + summary.partitions_written
        );
        return Ok(ExitCode::from(4));
    }
    Ok(ExitCode::SUCCESS)
}

fn print_summary(summary: &RunSummary) -> std::io::Result<()> {
    use std::io::Write;

    let json = serde_json::to_string_pretty(summary)
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))?;
    let mut stdout = std::io::stdout();
    stdout.write_all(json.as_bytes())?;
    stdout.write_all(b"\n")
}
