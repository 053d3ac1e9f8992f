//! Append-only event log that backs job recovery.
//!
//! Every lifecycle change of a job is recorded here in the same transaction
//! as the change to its `jobs` row. The newest decodable `progress` entry of
//! a job is the authoritative resume point; the copy cached on the job row
//! is only a convenience for status displays.

use crate::checkpoint::Checkpoint;
use crate::errors::JournalError;
use crate::schema::{EventType, JobId, JobStatus, JournalEntry, ProgressRecord};
use crate::util::{format_timestamp, now_timestamp};
use chrono::{DateTime, Utc};
use futures_util::TryStreamExt;
use serde::Serialize;
use serde_json::Value;
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::time::Duration;
use tracing::{debug, warn};

const ENTRY_COLUMNS: &str = "id, job_id, event_type, event_data, created_at";

/// Handle to the `journal` table.
#[derive(Debug, Clone)]
pub struct Journal {
    pool: SqlitePool,
}

/// Aggregate view over the timeline of one job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSummary {
    /// Job the summary describes.
    pub job_id: JobId,
    /// Number of journal entries recorded for the job.
    pub total_events: usize,
    /// Time of the first `start` entry.
    pub started_at: Option<DateTime<Utc>>,
    /// Time of the entry that ended the latest run, unless a run is ongoing.
    pub ended_at: Option<DateTime<Utc>>,
    /// `ended_at - started_at`, when both are known.
    pub duration: Option<chrono::Duration>,
    /// Number of `interrupted` entries.
    pub interrupt_count: usize,
    /// Number of `resumed` entries.
    pub resume_count: usize,
    /// Messages of all `error` entries, oldest first.
    pub errors: Vec<String>,
    /// Status implied by the latest lifecycle entry.
    pub final_status: Option<JobStatus>,
}

impl Journal {
    /// Wrap a pool whose database has been set up with
    /// [`setup_database`](crate::setup_database).
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Append a single entry in its own transaction.
    pub async fn log(
        &self,
        event_type: EventType,
        data: impl Serialize,
        job_id: Option<JobId>,
    ) -> Result<JournalEntry, JournalError> {
        let data = serde_json::to_value(data)?;
        let mut tx = self.pool.begin().await?;
        let entry = append(&mut tx, job_id, event_type, &data).await?;
        tx.commit().await?;
        Ok(entry)
    }

    /// The checkpoint of the newest readable `progress` entry of a job.
    pub async fn get_recovery_point(
        &self,
        job_id: JobId,
    ) -> Result<Option<Checkpoint>, JournalError> {
        let state = self.get_recovery_state(job_id).await?;
        Ok(state.map(|record| record.checkpoint))
    }

    /// The newest readable `progress` payload of a job.
    ///
    /// Entries that fail to decode are skipped with a warning and the scan
    /// continues with the next older one.
    pub async fn get_recovery_state(
        &self,
        job_id: JobId,
    ) -> Result<Option<ProgressRecord>, JournalError> {
        let mut rows = sqlx::query_as::<_, (i64, String)>(
            r"
            SELECT id, event_data FROM journal
            WHERE job_id = ?1 AND event_type = ?2
            ORDER BY id DESC
            ",
        )
        .bind(job_id)
        .bind(EventType::Progress.as_str())
        .fetch(&self.pool);

        while let Some((entry_id, raw)) = rows.try_next().await? {
            match serde_json::from_str::<ProgressRecord>(&raw) {
                Ok(record) => return Ok(Some(record)),
                Err(error) => {
                    warn!(job.id = job_id, entry.id = entry_id, %error, "Skipping unreadable progress entry");
                }
            }
        }

        Ok(None)
    }

    /// All entries of a job in append order.
    pub async fn get_job_timeline(&self, job_id: JobId) -> Result<Vec<JournalEntry>, JournalError> {
        let entries = sqlx::query_as::<_, JournalEntry>(&format!(
            "SELECT {ENTRY_COLUMNS} FROM journal WHERE job_id = ?1 ORDER BY id"
        ))
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(entries)
    }

    /// The newest `limit` entries across all jobs, newest first.
    pub async fn recent_entries(&self, limit: u32) -> Result<Vec<JournalEntry>, JournalError> {
        let entries = sqlx::query_as::<_, JournalEntry>(&format!(
            "SELECT {ENTRY_COLUMNS} FROM journal ORDER BY id DESC LIMIT ?1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(entries)
    }

    /// Summarize the timeline of a job.
    pub async fn summarize_job(&self, job_id: JobId) -> Result<JobSummary, JournalError> {
        let timeline = self.get_job_timeline(job_id).await?;
        Ok(summarize(job_id, &timeline))
    }

    /// Delete entries older than `older_than`, returning how many were removed.
    ///
    /// The newest `progress` entry and the newest run-ending entry of each
    /// job are kept regardless of age so that paused jobs stay resumable.
    pub async fn clear_old_entries(&self, older_than: Duration) -> Result<u64, JournalError> {
        let Some(cutoff) = chrono::Duration::from_std(older_than)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
        else {
            return Ok(0);
        };

        let result = sqlx::query(
            r"
            DELETE FROM journal
            WHERE created_at < ?1
              AND id NOT IN (
                  SELECT MAX(id) FROM journal
                  WHERE job_id IS NOT NULL AND event_type = 'progress'
                  GROUP BY job_id
              )
              AND id NOT IN (
                  SELECT MAX(id) FROM journal
                  WHERE job_id IS NOT NULL AND event_type IN ('complete', 'failed', 'interrupted')
                  GROUP BY job_id
              )
            ",
        )
        .bind(format_timestamp(cutoff))
        .execute(&self.pool)
        .await?;

        let deleted = result.rows_affected();
        debug!(deleted, "Cleared old journal entries");
        Ok(deleted)
    }
}

/// Appends an entry inside `tx`.
///
/// The timestamp is clamped so it never precedes an earlier entry of the
/// same job, even if the wall clock stepped backwards.
pub(crate) async fn append(
    tx: &mut Transaction<'_, Sqlite>,
    job_id: Option<JobId>,
    event_type: EventType,
    data: &Value,
) -> Result<JournalEntry, sqlx::Error> {
    sqlx::query_as::<_, JournalEntry>(&format!(
        r"
        INSERT INTO journal (job_id, event_type, event_data, created_at)
        VALUES (
            ?1, ?2, ?3,
            MAX(?4, COALESCE((SELECT MAX(created_at) FROM journal WHERE job_id = ?1), ?4))
        )
        RETURNING {ENTRY_COLUMNS}
        "
    ))
    .bind(job_id)
    .bind(event_type.as_str())
    .bind(data.to_string())
    .bind(now_timestamp())
    .fetch_one(&mut **tx)
    .await
}

fn summarize(job_id: JobId, timeline: &[JournalEntry]) -> JobSummary {
    let mut summary = JobSummary {
        job_id,
        total_events: timeline.len(),
        started_at: None,
        ended_at: None,
        duration: None,
        interrupt_count: 0,
        resume_count: 0,
        errors: Vec::new(),
        final_status: None,
    };

    for entry in timeline {
        match entry.event_type {
            EventType::Start => {
                summary.started_at.get_or_insert(entry.created_at);
                summary.final_status = Some(JobStatus::Running);
            }
            EventType::Resumed => {
                summary.resume_count += 1;
                summary.ended_at = None;
                summary.final_status = Some(JobStatus::Running);
            }
            EventType::Interrupted => {
                summary.interrupt_count += 1;
                summary.ended_at = Some(entry.created_at);
                summary.final_status = Some(JobStatus::Paused);
            }
            EventType::Complete => {
                summary.ended_at = Some(entry.created_at);
                summary.final_status = Some(JobStatus::Completed);
            }
            EventType::Failed => {
                summary.ended_at = Some(entry.created_at);
                summary.final_status = Some(JobStatus::Failed);
            }
            EventType::Error => {
                let message = match entry.event_data.get("error") {
                    Some(Value::String(message)) => message.clone(),
                    _ => entry.event_data.to_string(),
                };
                summary.errors.push(message);
            }
            EventType::Progress | EventType::InterruptRequested | EventType::ResumeRequested => {}
        }
    }

    if let (Some(started_at), Some(ended_at)) = (summary.started_at, summary.ended_at) {
        summary.duration = Some(ended_at - started_at);
    }

    summary
}
