use crate::schema::{JobId, JobStatus};

/// Errors raised while looking up or constructing a source.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// No factory was registered under this job type.
    #[error("no source registered for job type {0:?}")]
    UnknownSource(String),

    /// The job query did not match the parameters the source expects.
    #[error("invalid parameters for job type {job_type:?}: {source}")]
    InvalidParams {
        /// Job type whose parameters failed to parse.
        job_type: String,
        /// Underlying deserialization error.
        #[source]
        source: serde_json::Error,
    },

    /// The factory itself refused to build a source.
    #[error("failed to construct source for job type {job_type:?}: {source}")]
    Construction {
        /// Job type whose factory failed.
        job_type: String,
        /// Error returned by the factory.
        #[source]
        source: anyhow::Error,
    },
}

/// Errors produced by [`Journal`](crate::Journal) operations.
#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    /// Underlying database failure.
    #[error(transparent)]
    Database(#[from] sqlx::Error),

    /// Event payload could not be encoded.
    #[error("failed to encode journal payload: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors surfaced to callers of the [`Runner`](crate::Runner).
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    /// The job type or its parameters could not be resolved to a source.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// No job exists with this id.
    #[error("job {0} not found")]
    JobNotFound(JobId),

    /// The requested transition is not allowed from the job's current status.
    #[error("job {job_id} is {actual}, expected {expected}")]
    InvalidState {
        /// Job the transition was requested for.
        job_id: JobId,
        /// Status the transition requires.
        expected: JobStatus,
        /// Status the job was found in.
        actual: JobStatus,
    },

    /// A background run is still active on this runner.
    #[error("a background run for job {active} is still active")]
    ConcurrentRun {
        /// Job currently occupying the background slot.
        active: JobId,
    },

    /// The source (or the sink it feeds) failed fatally; the job is now `failed`.
    #[error("job {job_id} failed: {source}")]
    Source {
        /// Job that failed.
        job_id: JobId,
        /// Fatal error reported by the source or sink.
        #[source]
        source: anyhow::Error,
    },

    /// A journal write failed; progress past the last durable checkpoint is not recorded.
    #[error("journal write failed for job {job_id}: {source}")]
    Journal {
        /// Job whose checkpoint could not be recorded.
        job_id: JobId,
        /// Underlying journal error.
        #[source]
        source: JournalError,
    },

    /// Database failure outside of journaling.
    #[error(transparent)]
    Database(#[from] sqlx::Error),

    /// A background run terminated without producing a result.
    #[error("background run for job {job_id} was aborted: {reason}")]
    Aborted {
        /// Job the background run was driving.
        job_id: JobId,
        /// Panic message or cancellation reason.
        reason: String,
    },
}

impl RunnerError {
    pub(crate) fn journal(job_id: JobId, source: impl Into<JournalError>) -> Self {
        Self::Journal {
            job_id,
            source: source.into(),
        }
    }

    /// Whether this error is a protocol violation by the caller rather than a run failure.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Self::Registry(RegistryError::UnknownSource(_))
                | Self::InvalidState { .. }
                | Self::ConcurrentRun { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_source_displays_name() {
        let err = RegistryError::UnknownSource("Ghost".into());
        assert_eq!(err.to_string(), r#"no source registered for job type "Ghost""#);
    }

    #[test]
    fn invalid_state_displays_both_statuses() {
        let err = RunnerError::InvalidState {
            job_id: 7,
            expected: JobStatus::Paused,
            actual: JobStatus::Completed,
        };
        assert_eq!(err.to_string(), "job 7 is completed, expected paused");
        assert!(err.is_protocol_violation());
    }

    #[test]
    fn source_failure_is_not_a_protocol_violation() {
        let err = RunnerError::Source {
            job_id: 1,
            source: anyhow::anyhow!("401 Unauthorized"),
        };
        assert!(!err.is_protocol_violation());
        assert!(err.to_string().contains("401 Unauthorized"));
    }
}
