//! Resumable ingestion example for the ingest-jobs library.
//!
//! Ingests a synthetic paginated catalog into an in-memory store. Press
//! Ctrl-C while it runs to pause the job at the next page boundary, then run
//! again with `--resume <id>` to pick up where it stopped:
//!
//! ```bash
//! cargo run --example paged_ingest -- --pages 50
//! cargo run --example paged_ingest -- --resume 1
//! ```

use anyhow::Result;
use clap::Parser;
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use ingest_jobs::source::paged::{FetchError, PageFetcher, paginate};
use ingest_jobs::{
    Checkpoint, EntityType, JobRegistry, JobStatus, NormalizedRecord, Page, RawRecord, RunOptions,
    Runner, Sink, Source, connect, setup_database,
};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Parser)]
struct Args {
    /// SQLite database holding jobs and the journal
    #[arg(long, default_value = "sqlite://ingest.db")]
    database_url: String,

    /// Number of pages the synthetic upstream serves
    #[arg(long, default_value_t = 20)]
    pages: u64,

    /// Resume this paused job instead of starting a new one
    #[arg(long)]
    resume: Option<i64>,
}

/// Query parameters of the `synthetic_plants` job type
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct SyntheticParams {
    pages: u64,
    #[serde(default = "default_page_size")]
    page_size: usize,
}

fn default_page_size() -> usize {
    25
}

/// Upstream serving `pages` pages of made-up plant records, slowly.
struct SyntheticPlants {
    pages: u64,
    page_size: usize,
}

impl PageFetcher for SyntheticPlants {
    fn estimate_total(&self) -> BoxFuture<'_, Result<u64, FetchError>> {
        let total = self.pages * self.page_size as u64;
        Box::pin(async move { Ok(total) })
    }

    fn fetch_page(&self, page: u64) -> BoxFuture<'_, Result<Vec<RawRecord>, FetchError>> {
        Box::pin(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            if page >= self.pages {
                return Ok(Vec::new());
            }
            if page % 7 == 6 {
                return Err(FetchError::Recoverable("502 Bad Gateway".into()));
            }
            let first = page * self.page_size as u64;
            Ok((first..first + self.page_size as u64)
                .map(|id| json!({ "id": id, "scientific_name": format!("Plantae {id}") }))
                .collect())
        })
    }

    fn page_size(&self) -> Option<usize> {
        Some(self.page_size)
    }
}

impl Source for SyntheticPlants {
    fn produce(
        &self,
        resume_from: Option<Checkpoint>,
        stop: CancellationToken,
    ) -> BoxStream<'_, anyhow::Result<Page>> {
        paginate(self, resume_from, stop)
    }

    fn normalize(&self, raw: RawRecord) -> Option<NormalizedRecord> {
        let name = raw.get("scientific_name")?.as_str()?;
        let data = json!({ "source_id": raw.get("id")?, "scientific_name": name });
        Some(NormalizedRecord::new(EntityType::Plant, data))
    }
}

/// Counts saved records instead of storing them.
#[derive(Default)]
struct CountingSink {
    saved: AtomicI64,
}

impl Sink for CountingSink {
    fn save(&self, _data: Value, _entity_type: EntityType) -> BoxFuture<'_, Result<i64>> {
        Box::pin(async move { Ok(self.saved.fetch_add(1, Ordering::Relaxed) + 1) })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,ingest_jobs=debug".into()),
        )
        .init();

    let args = Args::parse();

    let pool = connect(&args.database_url).await?;
    setup_database(&pool).await?;

    let mut registry = JobRegistry::new();
    registry.register_with_params("synthetic_plants", |params: SyntheticParams| {
        anyhow::ensure!(params.page_size > 0, "page_size must be positive");
        Ok(SyntheticPlants {
            pages: params.pages,
            page_size: params.page_size,
        })
    });

    let runner = Runner::new(pool, Arc::new(registry), Arc::new(CountingSink::default()));
    for job_id in runner.recover_orphaned_jobs().await? {
        info!(job.id = job_id, "Paused job left running by a previous process");
    }
    let cleaner = runner.start_cleaner();

    let stop = CancellationToken::new();
    tokio::spawn({
        let stop = stop.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                println!("Stopping at the next page boundary...");
                stop.cancel();
            }
        }
    });

    let options = RunOptions::new()
        .stop_token(stop)
        .on_progress(|checkpoint, results_count| {
            let percent = checkpoint.fraction_done().unwrap_or_default() * 100.0;
            println!(
                "page {:>3}  {:>5.1}%  {results_count} saved  {} page errors",
                checkpoint.current_page,
                percent,
                checkpoint.errors.len()
            );
        });

    let job = match args.resume {
        Some(job_id) => runner.spawn_resume(job_id, options).await?,
        None => {
            let job = runner
                .create_job("synthetic_plants", json!({ "pages": args.pages }))
                .await?;
            println!("Created job {}", job.id);
            runner.spawn_job(job.id, options).await?
        }
    };

    let job = job.wait_for_completion().await?;
    cleaner.abort();

    match job.status {
        JobStatus::Paused => println!(
            "Job {} paused; run again with --resume {} to continue",
            job.id, job.id
        ),
        status => println!("Job {} {status}: {} records saved", job.id, job.results_count),
    }

    let summary = runner.journal().summarize_job(job.id).await?;
    println!(
        "{} journal entries, {} interruptions, {} resumes",
        summary.total_events, summary.interrupt_count, summary.resume_count
    );

    Ok(())
}
