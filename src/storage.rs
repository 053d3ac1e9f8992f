use crate::schema::{Job, JobId, JobStatus};
use crate::util::now_timestamp;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::str::FromStr;

const JOB_COLUMNS: &str = "id, job_type, status, query, progress, results_count, error, \
                           created_at, updated_at, started_at, completed_at";

/// Open a connection pool to the SQLite database at `url`.
///
/// The database file is created if missing and uses write-ahead logging so
/// that readers polling job status do not block the running job.
pub async fn connect(url: &str) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal);

    SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
}

/// Create the `jobs` and `journal` tables if they do not exist yet.
pub async fn setup_database(pool: &SqlitePool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}

/// Inserts a new `pending` job
pub(crate) async fn insert_job(
    pool: &SqlitePool,
    job_type: &str,
    query: &Value,
) -> Result<Job, sqlx::Error> {
    let now = now_timestamp();
    sqlx::query_as::<_, Job>(&format!(
        "INSERT INTO jobs (job_type, status, query, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?4) RETURNING {JOB_COLUMNS}"
    ))
    .bind(job_type)
    .bind(JobStatus::Pending.as_str())
    .bind(query.to_string())
    .bind(now)
    .fetch_one(pool)
    .await
}

pub(crate) async fn find_job(pool: &SqlitePool, job_id: JobId) -> Result<Option<Job>, sqlx::Error> {
    sqlx::query_as::<_, Job>(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"))
        .bind(job_id)
        .fetch_optional(pool)
        .await
}

pub(crate) async fn find_job_tx(
    tx: &mut Transaction<'_, Sqlite>,
    job_id: JobId,
) -> Result<Option<Job>, sqlx::Error> {
    sqlx::query_as::<_, Job>(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"))
        .bind(job_id)
        .fetch_optional(&mut **tx)
        .await
}

/// Lists jobs, newest first, optionally restricted to one status
pub(crate) async fn list_jobs(
    pool: &SqlitePool,
    status: Option<JobStatus>,
) -> Result<Vec<Job>, sqlx::Error> {
    let mut query = format!("SELECT {JOB_COLUMNS} FROM jobs");
    if status.is_some() {
        query.push_str(" WHERE status = ?1");
    }
    query.push_str(" ORDER BY id DESC");

    let mut query_builder = sqlx::query_as::<_, Job>(&query);
    if let Some(status) = status {
        query_builder = query_builder.bind(status.as_str());
    }
    query_builder.fetch_all(pool).await
}

/// Moves a job from `from` to `to` if, and only if, it is currently in `from`.
///
/// Returns `false` when the job was in any other status, which makes the
/// transition safe against concurrent callers racing for the same job.
pub(crate) async fn transition(
    tx: &mut Transaction<'_, Sqlite>,
    job_id: JobId,
    from: JobStatus,
    to: JobStatus,
) -> Result<bool, sqlx::Error> {
    let now = now_timestamp();
    let result = sqlx::query(
        r"
        UPDATE jobs
        SET status = ?1,
            updated_at = ?2,
            started_at = CASE WHEN ?1 = 'running' THEN COALESCE(started_at, ?2) ELSE started_at END
        WHERE id = ?3 AND status = ?4
        ",
    )
    .bind(to.as_str())
    .bind(now)
    .bind(job_id)
    .bind(from.as_str())
    .execute(&mut **tx)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Stores the latest checkpoint and result count on a `running` job row.
///
/// Returns `false` if the job is not `running`.
pub(crate) async fn update_progress(
    tx: &mut Transaction<'_, Sqlite>,
    job_id: JobId,
    progress: &str,
    results_count: u64,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r"
        UPDATE jobs
        SET progress = ?1, results_count = ?2, updated_at = ?3
        WHERE id = ?4 AND status = 'running'
        ",
    )
    .bind(progress)
    .bind(i64::try_from(results_count).unwrap_or(i64::MAX))
    .bind(now_timestamp())
    .bind(job_id)
    .execute(&mut **tx)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Moves a running job to its end-of-run status
///
/// Returns `false` if the job is not `running`.
pub(crate) async fn finish_job(
    tx: &mut Transaction<'_, Sqlite>,
    job_id: JobId,
    status: JobStatus,
    error: Option<&str>,
) -> Result<bool, sqlx::Error> {
    let now = now_timestamp();
    let completed_at = status.is_terminal().then(|| now.clone());
    let result = sqlx::query(
        r"
        UPDATE jobs
        SET status = ?1, error = ?2, updated_at = ?3, completed_at = ?4
        WHERE id = ?5 AND status = 'running'
        ",
    )
    .bind(status.as_str())
    .bind(error)
    .bind(now)
    .bind(completed_at)
    .bind(job_id)
    .execute(&mut **tx)
    .await?;

    Ok(result.rows_affected() == 1)
}

#[cfg(test)]
pub(crate) mod test_support {
    use sqlx::SqlitePool;
    use tempfile::TempDir;

    /// A migrated database in a fresh temporary directory.
    pub(crate) async fn test_pool() -> anyhow::Result<(SqlitePool, TempDir)> {
        let dir = tempfile::tempdir()?;
        let url = format!("sqlite://{}", dir.path().join("jobs.db").display());
        let pool = super::connect(&url).await?;
        super::setup_database(&pool).await?;
        Ok((pool, dir))
    }
}
