//! Shared fixtures: a scripted paginated source and an in-memory sink.

#![allow(dead_code)]

use anyhow::anyhow;
use futures_util::future::BoxFuture;
use futures_util::stream::{self, BoxStream, StreamExt};
use ingest_jobs::source::paged::{FetchError, PageFetcher, paginate};
use ingest_jobs::{
    Checkpoint, EntityType, EventType, JobId, JobRegistry, NormalizedRecord, Page, RawRecord,
    Runner, Sink, Source, connect, setup_database,
};
use serde::Deserialize;
use serde_json::{Value, json};
use sqlx::SqlitePool;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Parameters of the `catalog` job type.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CatalogParams {
    pub pages: Vec<Vec<String>>,
    /// Zero-based page that fails fatally
    #[serde(default)]
    pub fail_on: Option<u64>,
    /// Id of a record whose normalization panics
    #[serde(default)]
    pub panic_on: Option<String>,
}

/// Serves fixed pages of `{"id": ..}` records.
pub struct Catalog {
    pages: Vec<Vec<RawRecord>>,
    fail_on: Option<u64>,
    panic_on: Option<String>,
    hold: Option<CancellationToken>,
}

impl Catalog {
    pub fn new(params: CatalogParams) -> Self {
        let pages = params
            .pages
            .into_iter()
            .map(|page| page.into_iter().map(|id| json!({ "id": id })).collect())
            .collect();
        Self {
            pages,
            fail_on: params.fail_on,
            panic_on: params.panic_on,
            hold: None,
        }
    }

    /// Block every page fetch until `release` is cancelled.
    pub fn held_by(mut self, release: CancellationToken) -> Self {
        self.hold = Some(release);
        self
    }
}

impl PageFetcher for Catalog {
    fn estimate_total(&self) -> BoxFuture<'_, Result<u64, FetchError>> {
        let total = self.pages.iter().map(Vec::len).sum::<usize>() as u64;
        Box::pin(async move { Ok(total) })
    }

    fn fetch_page(&self, page: u64) -> BoxFuture<'_, Result<Vec<RawRecord>, FetchError>> {
        Box::pin(async move {
            if let Some(release) = &self.hold {
                release.cancelled().await;
            }
            if self.fail_on == Some(page) {
                return Err(FetchError::Fatal(anyhow!("401 Unauthorized")));
            }
            let records = usize::try_from(page)
                .ok()
                .and_then(|page| self.pages.get(page))
                .cloned()
                .unwrap_or_default();
            Ok(records)
        })
    }
}

impl Source for Catalog {
    fn produce(
        &self,
        resume_from: Option<Checkpoint>,
        stop: CancellationToken,
    ) -> BoxStream<'_, anyhow::Result<Page>> {
        paginate(self, resume_from, stop)
    }

    fn normalize(&self, raw: RawRecord) -> Option<NormalizedRecord> {
        let id = raw.get("id")?.as_str()?;
        if id.starts_with('_') {
            return None;
        }
        if self.panic_on.as_deref() == Some(id) {
            panic!("bad record shape");
        }
        Some(NormalizedRecord::new(EntityType::Plant, raw))
    }
}

/// Keeps every saved record in memory.
#[derive(Default)]
pub struct MemorySink {
    saved: Mutex<Vec<Value>>,
    reject: Option<String>,
}

impl MemorySink {
    /// A sink that fails when asked to save the record with this id.
    pub fn rejecting(id: &str) -> Self {
        Self {
            reject: Some(id.to_string()),
            ..Self::default()
        }
    }

    pub fn ids(&self) -> Vec<String> {
        self.saved
            .lock()
            .unwrap()
            .iter()
            .map(|record| record["id"].as_str().unwrap().to_string())
            .collect()
    }
}

impl Sink for MemorySink {
    fn save(&self, data: Value, _entity_type: EntityType) -> BoxFuture<'_, anyhow::Result<i64>> {
        Box::pin(async move {
            if data["id"].as_str() == self.reject.as_deref() {
                anyhow::bail!("constraint violation");
            }
            let mut saved = self.saved.lock().unwrap();
            saved.push(data);
            Ok(saved.len() as i64)
        })
    }
}

/// A runner over a fresh database file.
pub struct TestEnv {
    pub runner: Runner,
    pub sink: Arc<MemorySink>,
    pub pool: SqlitePool,
    /// Releases fetches of `held_catalog` jobs.
    pub release: CancellationToken,
    url: String,
    _dir: TempDir,
}

impl TestEnv {
    pub async fn new() -> anyhow::Result<Self> {
        Self::with_sink(MemorySink::default()).await
    }

    pub async fn with_sink(sink: MemorySink) -> anyhow::Result<Self> {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let dir = tempfile::tempdir()?;
        let url = format!("sqlite://{}", dir.path().join("ingest.db").display());
        let pool = connect(&url).await?;
        setup_database(&pool).await?;

        let release = CancellationToken::new();
        let sink = Arc::new(sink);
        let runner = Runner::new(pool.clone(), Arc::new(registry(release.clone())), sink.clone());

        Ok(Self {
            runner,
            sink,
            pool,
            release,
            url,
            _dir: dir,
        })
    }

    /// A second runner over the same database file, as a restarted process would build it.
    pub async fn restart(&self) -> anyhow::Result<Runner> {
        let pool = connect(&self.url).await?;
        setup_database(&pool).await?;
        Ok(Runner::new(pool, Arc::new(registry(self.release.clone())), self.sink.clone()))
    }

    pub async fn event_types(&self, job_id: JobId) -> anyhow::Result<Vec<EventType>> {
        let timeline = self.runner.journal().get_job_timeline(job_id).await?;
        Ok(timeline.into_iter().map(|entry| entry.event_type).collect())
    }

    /// `processed_items` of every journaled checkpoint, oldest first.
    pub async fn processed_history(&self, job_id: JobId) -> anyhow::Result<Vec<u64>> {
        let timeline = self.runner.journal().get_job_timeline(job_id).await?;
        Ok(timeline
            .into_iter()
            .filter(|entry| entry.event_type == EventType::Progress)
            .map(|entry| entry.event_data["checkpoint"]["processed_items"].as_u64().unwrap())
            .collect())
    }
}

/// Panics as soon as it is polled.
pub struct Exploding;

impl Source for Exploding {
    fn produce(
        &self,
        _resume_from: Option<Checkpoint>,
        _stop: CancellationToken,
    ) -> BoxStream<'_, anyhow::Result<Page>> {
        stream::once(async { explode() }).boxed()
    }

    fn normalize(&self, raw: RawRecord) -> Option<NormalizedRecord> {
        Some(NormalizedRecord::new(EntityType::Plant, raw))
    }
}

fn explode() -> anyhow::Result<Page> {
    panic!("upstream exploded")
}

pub fn registry(release: CancellationToken) -> JobRegistry {
    let mut registry = JobRegistry::new();
    registry
        .register_with_params("catalog", |params: CatalogParams| Ok(Catalog::new(params)))
        .register_with_params("held_catalog", move |params: CatalogParams| {
            Ok(Catalog::new(params).held_by(release.clone()))
        })
        .register("exploding", |_| Ok(Box::new(Exploding)));
    registry
}

/// Query for a `catalog` job serving `pages`.
pub fn pages(pages: &[&[&str]]) -> Value {
    json!({ "pages": pages })
}
