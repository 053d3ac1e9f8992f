//! Database schema definitions for SQLx.
//!
//! This module contains the row types of the `jobs` and `journal` tables
//! together with the status and event enums stored in them.

use crate::checkpoint::Checkpoint;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use tracing::warn;

/// Identifier of a job row. Assigned by the database and never reused.
pub type JobId = i64;

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created, never started.
    Pending,
    /// A run is driving the job's source.
    Running,
    /// Interrupted at a checkpoint; may be resumed.
    Paused,
    /// The source was exhausted. Terminal.
    Completed,
    /// The source failed fatally. Terminal.
    Failed,
}

impl JobStatus {
    /// Completed and failed jobs never change status again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Stored text representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Represents a job record in the database
#[derive(Debug, Clone, FromRow)]
pub struct Job {
    /// Unique identifier for the job
    pub id: JobId,
    /// Registry name of the source that runs this job
    pub job_type: String,
    /// Current lifecycle status
    pub status: JobStatus,
    /// Parameters handed to the source factory
    pub query: Value,
    /// Cached copy of the latest journaled checkpoint, as stored
    pub progress: Option<String>,
    /// Records successfully handed to the sink, across all runs
    pub results_count: i64,
    /// Fatal error message, set only when the job failed
    pub error: Option<String>,
    /// Timestamp when the job was created
    pub created_at: DateTime<Utc>,
    /// Timestamp of the last change to this row
    pub updated_at: DateTime<Utc>,
    /// Timestamp when the job first started running
    pub started_at: Option<DateTime<Utc>>,
    /// Timestamp when the job reached a terminal status
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// The cached checkpoint, or `None` if absent or unreadable.
    ///
    /// The journal is authoritative; see
    /// [`Journal::get_recovery_point`](crate::Journal::get_recovery_point).
    pub fn cached_checkpoint(&self) -> Option<Checkpoint> {
        let raw = self.progress.as_deref()?;
        match serde_json::from_str(raw) {
            Ok(checkpoint) => Some(checkpoint),
            Err(error) => {
                warn!(job.id = self.id, %error, "Ignoring unreadable cached progress");
                None
            }
        }
    }
}

/// Kind of a journal entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum EventType {
    /// A pending job started running.
    Start,
    /// A unit of work was checkpointed.
    Progress,
    /// A stop was observed by the runner.
    InterruptRequested,
    /// The run stopped at a checkpoint; the job is paused.
    Interrupted,
    /// The source failed fatally.
    Error,
    /// A resume was requested for a paused job.
    ResumeRequested,
    /// The paused job is running again.
    Resumed,
    /// The source was exhausted; the job completed.
    Complete,
    /// The job was marked failed.
    Failed,
}

impl EventType {
    /// Stored text representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Progress => "progress",
            Self::InterruptRequested => "interrupt_requested",
            Self::Interrupted => "interrupted",
            Self::Error => "error",
            Self::ResumeRequested => "resume_requested",
            Self::Resumed => "resumed",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Represents a journal record in the database
#[derive(Debug, Clone, PartialEq, FromRow, Serialize)]
pub struct JournalEntry {
    /// Append position; strictly increasing
    pub id: i64,
    /// Job the event belongs to, `None` for process-wide events
    pub job_id: Option<JobId>,
    /// Kind of event
    pub event_type: EventType,
    /// Structured payload
    pub event_data: Value,
    /// Timestamp of the append, never decreasing per job
    pub created_at: DateTime<Utc>,
}

/// Payload of a `progress` journal entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProgressRecord {
    /// Checkpoint reported by the source.
    pub checkpoint: Checkpoint,
    /// Records handed to the sink up to this checkpoint.
    pub results_count: u64,
}
