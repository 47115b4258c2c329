mod db;
mod error;
mod fetch;
mod mapper;
mod pipeline;
mod text;

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use crate::db::SqliteStore;
use crate::fetch::{GraphqlFetcher, ANILIST_URL};
use crate::pipeline::progress::{BarProgress, NoProgress, ProgressObserver};
use crate::pipeline::retry::RetryPolicy;
use crate::pipeline::{Driver, DriverConfig, RunOutcome};

#[derive(Parser)]
#[command(name = "anilist_harvest", about = "Fetch AniList popular anime -> SQLite")]
struct Cli {
    /// Number of pages to fetch (each page has up to --per-page items)
    #[arg(long, default_value_t = 10)]
    pages: u32,
    /// Items per page (AniList max is 50)
    #[arg(long, default_value_t = 50, value_parser = clap::value_parser!(u32).range(1..=50))]
    per_page: u32,
    /// SQLite database filename
    #[arg(long, default_value = "anilist.db")]
    db: PathBuf,
    /// Seconds to sleep between pages (stay friendly to the API)
    #[arg(long, default_value_t = 0.5)]
    sleep: f64,
    /// GraphQL endpoint
    #[arg(long, default_value = ANILIST_URL)]
    endpoint: String,
    /// Per-request timeout in seconds
    #[arg(long, default_value_t = 30, value_parser = clap::value_parser!(u64).range(1..))]
    timeout: u64,
    /// Give up on a page after this many consecutive failures (0 = never)
    #[arg(long, default_value_t = 0)]
    max_retries: u32,
    /// Upper bound on a single retry wait, in seconds
    #[arg(long, default_value_t = 60)]
    max_backoff: u64,
    /// Hide the progress bar
    #[arg(short, long)]
    quiet: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();

    let pacing = Duration::try_from_secs_f64(cli.sleep)
        .context("--sleep must be a non-negative number of seconds")?;

    let mut store = SqliteStore::open(&cli.db)
        .with_context(|| format!("Failed to open database {}", cli.db.display()))?;

    let timeout = Duration::from_secs(cli.timeout);
    let client = reqwest::Client::builder()
        .connect_timeout(timeout)
        .build()
        .context("Failed to build HTTP client")?;
    let mut fetcher = GraphqlFetcher::new(client, cli.endpoint.clone(), timeout);

    let driver = Driver::new(
        DriverConfig {
            max_pages: cli.pages,
            per_page: cli.per_page,
            pacing,
        },
        RetryPolicy {
            max_delay: Duration::from_secs(cli.max_backoff),
            max_attempts: (cli.max_retries > 0).then_some(cli.max_retries),
            ..RetryPolicy::default()
        },
    );

    info!(
        "Harvesting up to {} pages of {} from {} into {}",
        cli.pages,
        cli.per_page,
        cli.endpoint,
        cli.db.display()
    );
    let outcome = {
        let mut progress: Box<dyn ProgressObserver> = if cli.quiet {
            Box::new(NoProgress)
        } else {
            Box::new(BarProgress::new(cli.pages)?)
        };
        driver.run(&mut fetcher, &mut store, progress.as_mut()).await
    };

    let summary = outcome.summary().clone();
    let result = match outcome {
        RunOutcome::Done(_) => {
            let total = store.count_records()?;
            println!(
                "Done. Inserted/updated {} rows into {} ({} pages, {} rows in table).",
                summary.records_upserted,
                cli.db.display(),
                summary.pages_attempted,
                total
            );
            Ok(())
        }
        RunOutcome::Aborted { error, .. } => {
            println!(
                "Aborted. {} rows already committed to {} remain.",
                summary.records_upserted,
                cli.db.display()
            );
            let err = anyhow::Error::from(error).context(format!(
                "harvest aborted on page {} after {} requests",
                summary.pages_attempted, summary.fetch_attempts
            ));
            error!("{:#}", err);
            Err(err)
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nFinished in {}", format_duration(elapsed));
    }

    result
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
