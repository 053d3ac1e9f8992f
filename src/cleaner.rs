use crate::journal::Journal;
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

/// Periodically prunes journal entries older than the retention window.
pub(crate) struct Cleaner {
    journal: Journal,
    retention: Duration,
    interval: Duration,
}

impl Cleaner {
    pub(crate) fn new(journal: Journal, retention: Duration, interval: Duration) -> Self {
        Self {
            journal,
            retention,
            interval,
        }
    }

    /// Spawns the sweep loop. The first sweep runs immediately.
    pub(crate) fn start(self) -> AbortHandle {
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            loop {
                ticker.tick().await;
                match self.journal.clear_old_entries(self.retention).await {
                    Ok(deleted) => debug!(deleted, "Journal retention sweep finished"),
                    Err(error) => warn!(%error, "Journal retention sweep failed"),
                }
            }
        });
        task.abort_handle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::EventType;
    use crate::storage::test_support::test_pool;
    use serde_json::json;

    #[tokio::test]
    async fn sweeps_old_entries_in_the_background() -> anyhow::Result<()> {
        let (pool, _dir) = test_pool().await?;
        let journal = Journal::new(pool.clone());

        journal.log(EventType::Start, json!({}), None).await?;
        sqlx::query("UPDATE journal SET created_at = '2000-01-01T00:00:00.000000Z'")
            .execute(&pool)
            .await?;

        let handle = Cleaner::new(journal.clone(), Duration::from_secs(60), Duration::from_millis(10)).start();

        let mut remaining = usize::MAX;
        for _ in 0..100 {
            remaining = journal.recent_entries(10).await?.len();
            if remaining == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.abort();

        assert_eq!(remaining, 0);
        Ok(())
    }
}
