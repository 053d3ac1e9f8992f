#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod checkpoint;
mod cleaner;
mod errors;
mod job_registry;
mod journal;
mod runner;
/// Database schema definitions.
pub mod schema;
mod sink;
/// Source contract and reusable producers.
pub mod source;
mod storage;
mod util;
mod worker;

/// Resumable position of a source.
pub use self::checkpoint::{Checkpoint, MAX_RECORDED_ERRORS};
/// Error types surfaced by this crate.
pub use self::errors::{JournalError, RegistryError, RunnerError};
/// Maps job type names to source factories.
pub use self::job_registry::JobRegistry;
/// The append-only event log used for recovery.
pub use self::journal::{JobSummary, Journal};
/// The main runner that orchestrates job execution.
pub use self::runner::{
    DEFAULT_CLEANUP_INTERVAL, DEFAULT_JOURNAL_RETENTION, ProgressCallback, RunHandle, RunOptions,
    Runner,
};
pub use self::schema::{EventType, Job, JobId, JobStatus, JournalEntry};
/// Consumer of normalized records.
pub use self::sink::Sink;
pub use self::source::{EntityType, NormalizedRecord, Page, RawRecord, Source};
/// Database setup helpers.
pub use self::storage::{connect, setup_database};
