use crate::checkpoint::Checkpoint;
use crate::errors::{JournalError, RunnerError};
use crate::journal;
use crate::runner::ProgressCallback;
use crate::schema::{EventType, Job, JobId, JobStatus, ProgressRecord};
use crate::sink::Sink;
use crate::source::{RawRecord, Source};
use crate::storage;
use crate::util::try_to_extract_panic_info;
use anyhow::{Context, anyhow};
use futures_util::{FutureExt, StreamExt};
use serde_json::{Value, json};
use sqlx::SqlitePool;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How a run ended, before the outcome is written down.
enum Outcome {
    Exhausted,
    Stopped,
    Failed(anyhow::Error),
    Unrecorded(JournalError),
    /// The job row left `running` underneath this run.
    Displaced,
}

/// Drives a single run of a job's source until it is exhausted, stopped or fails.
pub(crate) struct Worker {
    pub(crate) connection_pool: SqlitePool,
    pub(crate) sink: Arc<dyn Sink>,
    pub(crate) job_id: JobId,
    pub(crate) source: Box<dyn Source>,
    pub(crate) stop: CancellationToken,
    pub(crate) on_progress: Option<ProgressCallback>,
    /// Latest durable checkpoint, `None` for a fresh start
    pub(crate) checkpoint: Option<Checkpoint>,
    pub(crate) results_count: u64,
}

impl Worker {
    /// Run the job's source and record how the run ended.
    ///
    /// The job must already be `running`.
    pub(crate) async fn run(mut self) -> Result<Job, RunnerError> {
        let outcome = self.drive().await;
        let processed_items = self.processed_items();

        match outcome {
            Outcome::Exhausted => {
                info!(processed_items, results_count = self.results_count, "Job completed");
                let data = json!({
                    "results_count": self.results_count,
                    "processed_items": processed_items,
                });
                self.conclude(JobStatus::Completed, None, &[(EventType::Complete, data)])
                    .await
            }
            Outcome::Stopped => {
                warn!(processed_items, "Job interrupted");
                let reason = "stop requested";
                let events = [
                    (EventType::InterruptRequested, json!({ "reason": reason })),
                    (
                        EventType::Interrupted,
                        json!({ "reason": reason, "processed_items": processed_items }),
                    ),
                ];
                self.conclude(JobStatus::Paused, None, &events).await
            }
            Outcome::Failed(source) => {
                let message = format!("{source:#}");
                error!(error = %message, "Job failed");
                let events = [
                    (EventType::Error, json!({ "error": message })),
                    (EventType::Failed, json!({ "error": message })),
                ];
                if let Err(conclude_error) = self
                    .conclude(JobStatus::Failed, Some(&message), &events)
                    .await
                {
                    error!(error = %message, %conclude_error, "Failed to record job failure");
                    return Err(conclude_error);
                }
                Err(RunnerError::Source {
                    job_id: self.job_id,
                    source,
                })
            }
            Outcome::Unrecorded(source) => {
                error!(error = %source, "Failed to record checkpoint, parking job");
                let events = [(
                    EventType::Interrupted,
                    json!({ "reason": "journal write failed", "processed_items": processed_items }),
                )];
                if let Err(error) = self.conclude(JobStatus::Paused, None, &events).await {
                    warn!(%error, "Failed to park job after journal failure");
                }
                Err(RunnerError::journal(self.job_id, source))
            }
            Outcome::Displaced => {
                warn!(processed_items, "Job is no longer running, abandoning run");
                Err(self.displaced().await)
            }
        }
    }

    async fn drive(&mut self) -> Outcome {
        let source = &*self.source;
        let mut pages = source.produce(self.checkpoint.clone(), self.stop.clone());

        loop {
            if self.stop.is_cancelled() {
                return Outcome::Stopped;
            }

            let page = match AssertUnwindSafe(pages.next()).catch_unwind().await {
                Ok(Some(Ok(page))) => page,
                Ok(Some(Err(error))) => return Outcome::Failed(error),
                Ok(None) if self.stop.is_cancelled() => return Outcome::Stopped,
                Ok(None) => return Outcome::Exhausted,
                Err(panic) => return Outcome::Failed(try_to_extract_panic_info(&*panic)),
            };

            let previous = self.processed_items();
            if page.checkpoint.processed_items < previous {
                return Outcome::Failed(anyhow!(
                    "checkpoint went backwards: processed_items {} after {previous}",
                    page.checkpoint.processed_items
                ));
            }

            let delivery = self.deliver(source, page.records);
            let saved = match AssertUnwindSafe(delivery).catch_unwind().await {
                Ok(Ok(saved)) => saved,
                Ok(Err(error)) => return Outcome::Failed(error),
                Err(panic) => return Outcome::Failed(try_to_extract_panic_info(&*panic)),
            };
            let results_count = self.results_count + saved;

            match self.record_progress(&page.checkpoint, results_count).await {
                Ok(true) => {}
                Ok(false) => return Outcome::Displaced,
                Err(error) => return Outcome::Unrecorded(error),
            }
            debug!(
                processed_items = page.checkpoint.processed_items,
                current_page = page.checkpoint.current_page,
                results_count,
                "Checkpoint recorded"
            );

            if let Some(on_progress) = &self.on_progress {
                on_progress(&page.checkpoint, results_count);
            }
            self.results_count = results_count;
            self.checkpoint = Some(page.checkpoint);
        }
    }

    fn processed_items(&self) -> u64 {
        self.checkpoint
            .as_ref()
            .map_or(0, |checkpoint| checkpoint.processed_items)
    }

    /// Normalizes one page and hands its records to the sink, returning how many were saved.
    async fn deliver(&self, source: &dyn Source, records: Vec<RawRecord>) -> anyhow::Result<u64> {
        let mut saved = 0;
        for raw in records {
            let Some(record) = source.normalize(raw) else {
                continue;
            };
            self.sink
                .save(record.data, record.entity_type)
                .await
                .context("sink failed to save record")?;
            saved += 1;
        }
        Ok(saved)
    }

    /// Caches the checkpoint on the job row and journals it, atomically.
    ///
    /// Returns `false`, recording nothing, if the job is no longer `running`.
    async fn record_progress(
        &self,
        checkpoint: &Checkpoint,
        results_count: u64,
    ) -> Result<bool, JournalError> {
        let record = ProgressRecord {
            checkpoint: checkpoint.clone(),
            results_count,
        };
        let cached = serde_json::to_string(checkpoint)?;
        let data = serde_json::to_value(&record)?;

        let mut tx = self.connection_pool.begin().await?;
        if !storage::update_progress(&mut tx, self.job_id, &cached, results_count).await? {
            return Ok(false);
        }
        journal::append(&mut tx, Some(self.job_id), EventType::Progress, &data).await?;
        tx.commit().await?;
        Ok(true)
    }

    /// Moves the job to `status` and journals `events` in one transaction.
    async fn conclude(
        &self,
        status: JobStatus,
        error: Option<&str>,
        events: &[(EventType, Value)],
    ) -> Result<Job, RunnerError> {
        let job_id = self.job_id;
        let journal_error = move |error: sqlx::Error| RunnerError::journal(job_id, error);

        let mut tx = self.connection_pool.begin().await.map_err(journal_error)?;
        if !storage::finish_job(&mut tx, job_id, status, error)
            .await
            .map_err(journal_error)?
        {
            tx.rollback().await.map_err(journal_error)?;
            return Err(self.displaced().await);
        }
        for (event_type, data) in events {
            journal::append(&mut tx, Some(job_id), *event_type, data)
                .await
                .map_err(journal_error)?;
        }
        let job = storage::find_job_tx(&mut tx, job_id)
            .await
            .map_err(journal_error)?
            .ok_or(RunnerError::JobNotFound(job_id))?;
        tx.commit().await.map_err(journal_error)?;
        Ok(job)
    }

    /// The error reported when another writer moved the job out of `running`.
    async fn displaced(&self) -> RunnerError {
        match storage::find_job(&self.connection_pool, self.job_id).await {
            Ok(Some(job)) => RunnerError::InvalidState {
                job_id: self.job_id,
                expected: JobStatus::Running,
                actual: job.status,
            },
            Ok(None) => RunnerError::JobNotFound(self.job_id),
            Err(error) => RunnerError::Database(error),
        }
    }
}
