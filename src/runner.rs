use crate::checkpoint::Checkpoint;
use crate::cleaner::Cleaner;
use crate::errors::RunnerError;
use crate::job_registry::JobRegistry;
use crate::journal::{self, Journal};
use crate::schema::{EventType, Job, JobId, JobStatus};
use crate::sink::Sink;
use crate::source::Source;
use crate::storage;
use crate::worker::Worker;
use serde_json::{Value, json};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, info_span, warn};

/// Default age after which journal entries become eligible for cleanup.
pub const DEFAULT_JOURNAL_RETENTION: Duration = Duration::from_secs(30 * 24 * 60 * 60);
/// Default interval between two journal cleanup sweeps.
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Observer invoked after every recorded checkpoint with the results count so far.
pub type ProgressCallback = Arc<dyn Fn(&Checkpoint, u64) + Send + Sync>;

/// Per-run configuration
#[derive(Clone, Default)]
pub struct RunOptions {
    stop: CancellationToken,
    on_progress: Option<ProgressCallback>,
}

impl std::fmt::Debug for RunOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunOptions")
            .field("stop", &self.stop)
            .field("on_progress", &self.on_progress.as_ref().map(|_| "<function>"))
            .finish()
    }
}

impl RunOptions {
    /// Options with a fresh stop token and no progress callback.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `stop` to interrupt the run. Cancelling it pauses the job at the
    /// next checkpoint boundary.
    pub fn stop_token(mut self, stop: CancellationToken) -> Self {
        self.stop = stop;
        self
    }

    /// Call `on_progress` after every recorded checkpoint.
    pub fn on_progress(mut self, on_progress: impl Fn(&Checkpoint, u64) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Arc::new(on_progress));
        self
    }
}

/// The core runner responsible for starting, resuming and stopping jobs
#[derive(Clone)]
pub struct Runner {
    connection_pool: SqlitePool,
    job_registry: Arc<JobRegistry>,
    sink: Arc<dyn Sink>,
    journal: Journal,
    active_runs: Arc<Mutex<HashMap<JobId, CancellationToken>>>,
    background_run: Arc<Mutex<Option<JobId>>>,
    journal_retention: Duration,
    cleanup_interval: Duration,
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("job_registry", &self.job_registry)
            .field("journal_retention", &self.journal_retention)
            .field("cleanup_interval", &self.cleanup_interval)
            .finish_non_exhaustive()
    }
}

/// A job that passed its state check and is now `running`.
struct PreparedRun {
    job_id: JobId,
    active: ActiveRun,
    job_type: String,
    source: Box<dyn Source>,
    checkpoint: Option<Checkpoint>,
    results_count: u64,
}

#[derive(Clone, Copy)]
enum Entry {
    Start,
    Resume,
}

impl Runner {
    /// Create a new runner with the given connection pool, registry and sink.
    ///
    /// The database must have been set up with
    /// [`setup_database`](crate::setup_database).
    pub fn new(connection_pool: SqlitePool, job_registry: Arc<JobRegistry>, sink: Arc<dyn Sink>) -> Self {
        Self {
            journal: Journal::new(connection_pool.clone()),
            connection_pool,
            job_registry,
            sink,
            active_runs: Arc::default(),
            background_run: Arc::default(),
            journal_retention: DEFAULT_JOURNAL_RETENTION,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
        }
    }

    /// Set how old journal entries must be before the cleaner removes them.
    pub fn journal_retention(mut self, journal_retention: Duration) -> Self {
        self.journal_retention = journal_retention;
        self
    }

    /// Set how often the cleaner sweeps the journal.
    pub fn cleanup_interval(mut self, cleanup_interval: Duration) -> Self {
        self.cleanup_interval = cleanup_interval;
        self
    }

    /// The journal this runner writes to.
    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    /// Create a `pending` job.
    ///
    /// The job type and query are checked against the registry first; nothing
    /// is stored if no source can be built from them.
    pub async fn create_job(&self, job_type: &str, query: Value) -> Result<Job, RunnerError> {
        self.job_registry.get(job_type, &query)?;
        let job = storage::insert_job(&self.connection_pool, job_type, &query).await?;
        info!(job.id = job.id, job.type = job_type, "Job created");
        Ok(job)
    }

    /// Create a job and run it to the end in the caller's task.
    pub async fn start_job(
        &self,
        job_type: &str,
        query: Value,
        options: RunOptions,
    ) -> Result<Job, RunnerError> {
        let job = self.create_job(job_type, query).await?;
        self.run_job(job.id, options).await
    }

    /// Run a `pending` job until it completes, fails or is stopped.
    pub async fn run_job(&self, job_id: JobId, options: RunOptions) -> Result<Job, RunnerError> {
        let run = self.prepare(job_id, Entry::Start, &options.stop).await?;
        self.execute(run, options).await
    }

    /// Continue a `paused` job from its latest journaled checkpoint.
    pub async fn resume_job(&self, job_id: JobId, options: RunOptions) -> Result<Job, RunnerError> {
        let run = self.prepare(job_id, Entry::Resume, &options.stop).await?;
        self.execute(run, options).await
    }

    /// Start a `pending` job on a background task.
    ///
    /// Fails with [`RunnerError::ConcurrentRun`] while another background run
    /// of this runner is active. State errors are reported before anything is
    /// spawned.
    pub async fn spawn_job(&self, job_id: JobId, options: RunOptions) -> Result<RunHandle, RunnerError> {
        self.spawn(job_id, Entry::Start, options).await
    }

    /// Resume a `paused` job on a background task.
    pub async fn spawn_resume(
        &self,
        job_id: JobId,
        options: RunOptions,
    ) -> Result<RunHandle, RunnerError> {
        self.spawn(job_id, Entry::Resume, options).await
    }

    /// Ask the live run of `job_id` to stop at its next checkpoint.
    ///
    /// Returns `false`, and does nothing, when the job has no live run in this
    /// process.
    pub fn request_stop(&self, job_id: JobId) -> bool {
        let active_runs = self.active_runs.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(stop) = active_runs.get(&job_id) else {
            return false;
        };
        info!(job.id = job_id, "Stop requested");
        stop.cancel();
        true
    }

    /// Look up a job by id.
    pub async fn job(&self, job_id: JobId) -> Result<Job, RunnerError> {
        storage::find_job(&self.connection_pool, job_id)
            .await?
            .ok_or(RunnerError::JobNotFound(job_id))
    }

    /// List jobs, newest first, optionally restricted to one status.
    pub async fn jobs(&self, status: Option<JobStatus>) -> Result<Vec<Job>, RunnerError> {
        Ok(storage::list_jobs(&self.connection_pool, status).await?)
    }

    /// Jobs that [`resume_job`](Self::resume_job) accepts.
    pub async fn resumable_jobs(&self) -> Result<Vec<Job>, RunnerError> {
        self.jobs(Some(JobStatus::Paused)).await
    }

    /// Pause jobs left `running` by a process that no longer exists.
    ///
    /// Call this on startup, before starting new runs. Jobs with a live run in
    /// this runner are left alone. Returns the ids of the recovered jobs.
    pub async fn recover_orphaned_jobs(&self) -> Result<Vec<JobId>, RunnerError> {
        let running = storage::list_jobs(&self.connection_pool, Some(JobStatus::Running)).await?;
        let mut recovered = Vec::new();

        for job in running {
            if self.is_active(job.id) {
                continue;
            }

            let processed_items = job
                .cached_checkpoint()
                .map_or(0, |checkpoint| checkpoint.processed_items);
            let data = json!({ "reason": "orphaned", "processed_items": processed_items });

            let mut tx = self.connection_pool.begin().await?;
            if !storage::transition(&mut tx, job.id, JobStatus::Running, JobStatus::Paused).await? {
                continue;
            }
            journal::append(&mut tx, Some(job.id), EventType::Interrupted, &data)
                .await
                .map_err(|error| RunnerError::journal(job.id, error))?;
            tx.commit().await?;

            warn!(job.id = job.id, job.type = %job.job_type, "Recovered orphaned job");
            recovered.push(job.id);
        }

        Ok(recovered)
    }

    /// Start the periodic journal cleanup.
    ///
    /// Abort the returned handle to stop it.
    pub fn start_cleaner(&self) -> AbortHandle {
        info!(
            retention = ?self.journal_retention,
            interval = ?self.cleanup_interval,
            "Starting journal cleaner…"
        );
        Cleaner::new(self.journal.clone(), self.journal_retention, self.cleanup_interval).start()
    }

    fn is_active(&self, job_id: JobId) -> bool {
        self.active_runs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&job_id)
    }

    async fn spawn(&self, job_id: JobId, entry: Entry, options: RunOptions) -> Result<RunHandle, RunnerError> {
        let slot = BackgroundSlot::claim(self.background_run.clone(), job_id)?;
        let run = self.prepare(job_id, entry, &options.stop).await?;

        let stop = options.stop.clone();
        let runner = self.clone();
        let handle = tokio::spawn(async move {
            let _slot = slot;
            runner.execute(run, options).await
        });

        Ok(RunHandle {
            job_id,
            stop,
            handle,
        })
    }

    /// Checks the job's status, builds its source and marks it `running`.
    async fn prepare(
        &self,
        job_id: JobId,
        entry: Entry,
        stop: &CancellationToken,
    ) -> Result<PreparedRun, RunnerError> {
        let expected = match entry {
            Entry::Start => JobStatus::Pending,
            Entry::Resume => JobStatus::Paused,
        };

        let job = self.job(job_id).await?;
        if job.status != expected {
            return Err(RunnerError::InvalidState {
                job_id,
                expected,
                actual: job.status,
            });
        }

        let source = self.job_registry.get(&job.job_type, &job.query)?;

        let (checkpoint, results_count) = match entry {
            Entry::Start => (None, 0),
            Entry::Resume => match self.journal.get_recovery_state(job_id).await {
                Ok(Some(state)) => (Some(state.checkpoint), state.results_count),
                Ok(None) => (None, 0),
                Err(error) => return Err(RunnerError::journal(job_id, error)),
            },
        };

        let active = ActiveRun::register(self.active_runs.clone(), job_id, stop.clone()).ok_or(
            RunnerError::InvalidState {
                job_id,
                expected,
                actual: JobStatus::Running,
            },
        )?;

        let mut tx = self.connection_pool.begin().await?;
        if !storage::transition(&mut tx, job_id, expected, JobStatus::Running).await? {
            let actual = storage::find_job_tx(&mut tx, job_id)
                .await?
                .map_or(JobStatus::Running, |job| job.status);
            return Err(RunnerError::InvalidState {
                job_id,
                expected,
                actual,
            });
        }

        let events = match entry {
            Entry::Start => vec![(EventType::Start, json!({ "job_type": job.job_type }))],
            Entry::Resume => {
                let processed_items = checkpoint.as_ref().map_or(0, |c| c.processed_items);
                vec![
                    (EventType::ResumeRequested, json!({ "from": checkpoint })),
                    (EventType::Resumed, json!({ "processed_items": processed_items })),
                ]
            }
        };
        for (event_type, data) in &events {
            journal::append(&mut tx, Some(job_id), *event_type, data)
                .await
                .map_err(|error| RunnerError::journal(job_id, error))?;
        }
        tx.commit().await?;

        match entry {
            Entry::Start => info!(job.id = job_id, job.type = %job.job_type, "Job started"),
            Entry::Resume => info!(job.id = job_id, job.type = %job.job_type, results_count, "Job resumed"),
        }

        Ok(PreparedRun {
            job_id,
            active,
            job_type: job.job_type,
            source,
            checkpoint,
            results_count,
        })
    }

    async fn execute(&self, run: PreparedRun, options: RunOptions) -> Result<Job, RunnerError> {
        let _active = run.active;
        let span = info_span!("job", job.id = run.job_id, job.type = %run.job_type);
        let worker = Worker {
            connection_pool: self.connection_pool.clone(),
            sink: self.sink.clone(),
            job_id: run.job_id,
            source: run.source,
            stop: options.stop,
            on_progress: options.on_progress,
            checkpoint: run.checkpoint,
            results_count: run.results_count,
        };

        worker.run().instrument(span).await
    }
}

/// Keeps a job's stop token reachable through [`Runner::request_stop`] while it runs.
struct ActiveRun {
    active_runs: Arc<Mutex<HashMap<JobId, CancellationToken>>>,
    job_id: JobId,
}

impl ActiveRun {
    /// Returns `None` if the job already has a live run in this process.
    fn register(
        active_runs: Arc<Mutex<HashMap<JobId, CancellationToken>>>,
        job_id: JobId,
        stop: CancellationToken,
    ) -> Option<Self> {
        {
            let mut runs = active_runs.lock().unwrap_or_else(PoisonError::into_inner);
            if runs.contains_key(&job_id) {
                return None;
            }
            runs.insert(job_id, stop);
        }
        Some(Self {
            active_runs,
            job_id,
        })
    }
}

impl Drop for ActiveRun {
    fn drop(&mut self) {
        self.active_runs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.job_id);
    }
}

/// The single background run a runner may have at a time.
struct BackgroundSlot {
    background_run: Arc<Mutex<Option<JobId>>>,
}

impl BackgroundSlot {
    fn claim(background_run: Arc<Mutex<Option<JobId>>>, job_id: JobId) -> Result<Self, RunnerError> {
        {
            let mut slot = background_run.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(active) = *slot {
                return Err(RunnerError::ConcurrentRun { active });
            }
            *slot = Some(job_id);
        }
        Ok(Self { background_run })
    }
}

impl Drop for BackgroundSlot {
    fn drop(&mut self) {
        *self.background_run.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

/// Handle to a job running on a background task
#[derive(Debug)]
pub struct RunHandle {
    job_id: JobId,
    stop: CancellationToken,
    handle: JoinHandle<Result<Job, RunnerError>>,
}

impl RunHandle {
    /// The job this run is driving.
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Ask the run to stop at its next checkpoint. Idempotent.
    pub fn request_stop(&self) {
        self.stop.cancel();
    }

    /// Whether the background task has finished.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the run to end and return the job in its final state.
    pub async fn wait_for_completion(self) -> Result<Job, RunnerError> {
        match self.handle.await {
            Ok(result) => result,
            Err(error) => Err(RunnerError::Aborted {
                job_id: self.job_id,
                reason: error.to_string(),
            }),
        }
    }
}
