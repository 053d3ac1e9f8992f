//! A ready-made [`Source::produce`](super::Source::produce) for page-offset upstreams.
//!
//! Most upstream APIs expose numbered pages. [`paginate`] drives a
//! [`PageFetcher`] one page at a time, maintains the [`Checkpoint`], records
//! recoverable failures and translates a resume checkpoint back into an
//! upstream position.

use super::{Page, RawRecord};
use crate::checkpoint::Checkpoint;
use anyhow::anyhow;
use futures_util::future::BoxFuture;
use futures_util::stream::{self, BoxStream, StreamExt};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Recoverable failures in a row after which the upstream is considered broken.
pub const MAX_CONSECUTIVE_PAGE_ERRORS: u32 = 3;

/// Outcome of a failed upstream request.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// This page failed but later pages may succeed (timeouts, one bad page).
    #[error("{0}")]
    Recoverable(String),
    /// Nothing further can be fetched (authentication failure, unreadable response).
    #[error(transparent)]
    Fatal(anyhow::Error),
}

/// Fetches numbered pages from one upstream.
pub trait PageFetcher: Send + Sync {
    /// Estimated number of records upstream, `0` when unknown.
    fn estimate_total(&self) -> BoxFuture<'_, Result<u64, FetchError>> {
        Box::pin(async { Ok(0) })
    }

    /// Fetch page `page` (zero based). An empty page means there is no more data.
    fn fetch_page(&self, page: u64) -> BoxFuture<'_, Result<Vec<RawRecord>, FetchError>>;

    /// Stable identifier of a record, used to skip already-seen records.
    fn record_id(&self, record: &RawRecord) -> Option<String> {
        match record.get("id")? {
            Value::String(id) => Some(id.clone()),
            Value::Number(id) => Some(id.to_string()),
            _ => None,
        }
    }

    /// Requested page size; a shorter page is treated as the last one.
    fn page_size(&self) -> Option<usize> {
        None
    }
}

/// Produce pages from `fetcher`, continuing after `resume_from` when given.
///
/// `stop` is checked before every page fetch. If a resumed run finds its
/// starting page empty, the upstream position is considered lost: fetching
/// restarts at page 0 and records up to `last_id` (or the first
/// `processed_items` records when no id was recorded) are skipped.
pub fn paginate<'a, F>(
    fetcher: &'a F,
    resume_from: Option<Checkpoint>,
    stop: CancellationToken,
) -> BoxStream<'a, anyhow::Result<Page>>
where
    F: PageFetcher + ?Sized,
{
    let pager = Pager::new(fetcher, resume_from, stop);
    stream::unfold(pager, |mut pager| async move {
        let item = pager.next_page().await?;
        Some((item, pager))
    })
    .boxed()
}

enum Skip {
    Nothing,
    Through(String),
    Count(u64),
}

struct Pager<'a, F: ?Sized> {
    fetcher: &'a F,
    checkpoint: Checkpoint,
    stop: CancellationToken,
    skip: Skip,
    resumed_mid_way: bool,
    estimated: bool,
    consecutive_errors: u32,
    exhausted: bool,
}

impl<'a, F: PageFetcher + ?Sized> Pager<'a, F> {
    fn new(fetcher: &'a F, resume_from: Option<Checkpoint>, stop: CancellationToken) -> Self {
        let checkpoint = resume_from.unwrap_or_default();
        Self {
            fetcher,
            resumed_mid_way: checkpoint.current_page > 0,
            checkpoint,
            stop,
            skip: Skip::Nothing,
            estimated: false,
            consecutive_errors: 0,
            exhausted: false,
        }
    }

    async fn next_page(&mut self) -> Option<anyhow::Result<Page>> {
        if self.exhausted {
            return None;
        }
        if self.stop.is_cancelled() {
            debug!(page = self.checkpoint.current_page, "Stop requested, not fetching further pages");
            self.exhausted = true;
            return None;
        }

        if !self.estimated {
            self.estimated = true;
            match self.fetcher.estimate_total().await {
                Ok(total) => self.checkpoint.set_total(total),
                Err(FetchError::Recoverable(message)) => {
                    self.checkpoint.record_error(format!("count: {message}"));
                }
                Err(FetchError::Fatal(error)) => return Some(Err(self.fail(error))),
            }
        }

        loop {
            let page = self.checkpoint.current_page;
            match self.fetcher.fetch_page(page).await {
                Ok(records) if records.is_empty() && self.position_lost() => {
                    self.restart_from_beginning();
                }
                Ok(records) if records.is_empty() && self.searching_last_id() => {
                    self.deliver_everything();
                }
                Ok(records) if records.is_empty() => {
                    debug!(page, "Upstream exhausted");
                    self.exhausted = true;
                    return None;
                }
                Ok(records) => {
                    let accepted = self.accept(page, records);
                    // Pages consumed entirely by the skip are not a resumable position.
                    if !accepted.records.is_empty() || !self.is_skipping() {
                        return Some(Ok(accepted));
                    }
                    if self.exhausted {
                        if !self.searching_last_id() {
                            return Some(Ok(accepted));
                        }
                        self.exhausted = false;
                        self.deliver_everything();
                    }
                    if self.stop.is_cancelled() {
                        self.exhausted = true;
                        return None;
                    }
                }
                Err(FetchError::Recoverable(message)) => {
                    return Some(self.skip_failed_page(page, message));
                }
                Err(FetchError::Fatal(error)) => return Some(Err(self.fail(error))),
            }
        }
    }

    fn accept(&mut self, page: u64, records: Vec<RawRecord>) -> Page {
        self.resumed_mid_way = false;
        self.consecutive_errors = 0;

        let fetched = records.len();
        let records = self.skip_seen(records);
        let last_id = records.last().and_then(|record| self.fetcher.record_id(record));
        self.checkpoint.advance(records.len() as u64, page + 1, last_id);

        if self.fetcher.page_size().is_some_and(|size| fetched < size) {
            debug!(page, fetched, "Short page, upstream exhausted");
            self.exhausted = true;
        }

        Page {
            records,
            checkpoint: self.checkpoint.clone(),
        }
    }

    fn skip_failed_page(&mut self, page: u64, message: String) -> anyhow::Result<Page> {
        self.resumed_mid_way = false;
        self.consecutive_errors += 1;
        if self.consecutive_errors >= MAX_CONSECUTIVE_PAGE_ERRORS {
            return Err(self.fail(anyhow!(
                "giving up after {} consecutive page failures, last at page {page}: {message}",
                self.consecutive_errors
            )));
        }

        warn!(page, %message, "Skipping page after recoverable fetch error");
        self.checkpoint.record_error(format!("page {page}: {message}"));
        self.checkpoint.advance(0, page + 1, None);
        Ok(Page {
            records: Vec::new(),
            checkpoint: self.checkpoint.clone(),
        })
    }

    fn restart_from_beginning(&mut self) {
        warn!(
            page = self.checkpoint.current_page,
            "Resume position no longer exists upstream, restarting from the first page"
        );
        self.resumed_mid_way = false;
        self.skip = match &self.checkpoint.last_id {
            Some(last_id) => Skip::Through(last_id.clone()),
            None => Skip::Count(self.checkpoint.processed_items),
        };
        self.checkpoint.current_page = 0;
    }

    /// The last seen record vanished upstream, so nothing can be proven seen.
    ///
    /// Delivers every record again from the first page; the sink absorbs
    /// the duplicates.
    fn deliver_everything(&mut self) {
        warn!(
            last_id = ?self.checkpoint.last_id,
            "Last seen record no longer exists upstream, delivering every record again"
        );
        self.skip = Skip::Nothing;
        self.checkpoint.current_page = 0;
    }

    /// An empty first page after resuming is only expected once everything was seen.
    fn position_lost(&self) -> bool {
        let Checkpoint {
            total_items,
            processed_items,
            ..
        } = self.checkpoint;
        self.resumed_mid_way && (total_items == 0 || processed_items < total_items)
    }

    fn is_skipping(&self) -> bool {
        !matches!(self.skip, Skip::Nothing)
    }

    fn searching_last_id(&self) -> bool {
        matches!(self.skip, Skip::Through(_))
    }

    fn skip_seen(&mut self, records: Vec<RawRecord>) -> Vec<RawRecord> {
        match std::mem::replace(&mut self.skip, Skip::Nothing) {
            Skip::Nothing => records,
            Skip::Through(last_id) => {
                let seen = records
                    .iter()
                    .position(|record| self.fetcher.record_id(record).as_deref() == Some(&*last_id));
                match seen {
                    Some(index) => records.into_iter().skip(index + 1).collect(),
                    None => {
                        self.skip = Skip::Through(last_id);
                        Vec::new()
                    }
                }
            }
            Skip::Count(remaining) => {
                let fetched = records.len() as u64;
                if remaining >= fetched {
                    if remaining > fetched {
                        self.skip = Skip::Count(remaining - fetched);
                    }
                    Vec::new()
                } else {
                    let skip = usize::try_from(remaining).unwrap_or(usize::MAX);
                    records.into_iter().skip(skip).collect()
                }
            }
        }
    }

    fn fail(&mut self, error: anyhow::Error) -> anyhow::Error {
        self.exhausted = true;
        error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::TryStreamExt;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct VecFetcher {
        pages: Vec<Vec<RawRecord>>,
        failures: Mutex<HashMap<u64, Vec<FetchError>>>,
        page_size: Option<usize>,
        requested: Mutex<Vec<u64>>,
    }

    impl VecFetcher {
        fn new(pages: &[&[&str]]) -> Self {
            let pages = pages
                .iter()
                .map(|page| page.iter().map(|id| json!({ "id": id })).collect())
                .collect();
            Self {
                pages,
                ..Self::default()
            }
        }

        fn fail(self, page: u64, error: FetchError) -> Self {
            self.failures.lock().unwrap().entry(page).or_default().push(error);
            self
        }

        fn requested(&self) -> Vec<u64> {
            self.requested.lock().unwrap().clone()
        }
    }

    impl PageFetcher for VecFetcher {
        fn estimate_total(&self) -> BoxFuture<'_, Result<u64, FetchError>> {
            let total = self.pages.iter().map(Vec::len).sum::<usize>() as u64;
            Box::pin(async move { Ok(total) })
        }

        fn fetch_page(&self, page: u64) -> BoxFuture<'_, Result<Vec<RawRecord>, FetchError>> {
            self.requested.lock().unwrap().push(page);
            let failure = self
                .failures
                .lock()
                .unwrap()
                .get_mut(&page)
                .and_then(Vec::pop);
            let records = self
                .pages
                .get(usize::try_from(page).unwrap())
                .cloned()
                .unwrap_or_default();
            Box::pin(async move {
                match failure {
                    Some(error) => Err(error),
                    None => Ok(records),
                }
            })
        }

        fn page_size(&self) -> Option<usize> {
            self.page_size
        }
    }

    fn ids(pages: &[Page]) -> Vec<Vec<String>> {
        pages
            .iter()
            .map(|page| {
                page.records
                    .iter()
                    .map(|record| record["id"].as_str().unwrap().to_string())
                    .collect()
            })
            .collect()
    }

    #[tokio::test]
    async fn fresh_run_yields_every_page_then_ends() -> anyhow::Result<()> {
        let fetcher = VecFetcher::new(&[&["a", "b"], &["c", "d"], &["e"]]);
        let pages: Vec<Page> = paginate(&fetcher, None, CancellationToken::new())
            .try_collect()
            .await?;

        assert_eq!(ids(&pages), vec![vec!["a", "b"], vec!["c", "d"], vec!["e"]]);
        let last = &pages[2].checkpoint;
        assert_eq!(last.processed_items, 5);
        assert_eq!(last.total_items, 5);
        assert_eq!(last.current_page, 3);
        assert_eq!(last.last_id.as_deref(), Some("e"));
        assert_eq!(fetcher.requested(), vec![0, 1, 2, 3]);
        Ok(())
    }

    #[tokio::test]
    async fn short_page_ends_without_extra_request() -> anyhow::Result<()> {
        let mut fetcher = VecFetcher::new(&[&["a", "b"], &["c"]]);
        fetcher.page_size = Some(2);
        let pages: Vec<Page> = paginate(&fetcher, None, CancellationToken::new())
            .try_collect()
            .await?;

        assert_eq!(pages.len(), 2);
        assert_eq!(fetcher.requested(), vec![0, 1]);
        Ok(())
    }

    #[tokio::test]
    async fn resume_starts_at_checkpoint_page() -> anyhow::Result<()> {
        let fetcher = VecFetcher::new(&[&["a", "b"], &["c", "d"], &["e"]]);
        let resume_from = Checkpoint {
            total_items: 5,
            processed_items: 2,
            current_page: 1,
            last_id: Some("b".into()),
            ..Checkpoint::default()
        };
        let pages: Vec<Page> = paginate(&fetcher, Some(resume_from), CancellationToken::new())
            .try_collect()
            .await?;

        assert_eq!(ids(&pages), vec![vec!["c", "d"], vec!["e"]]);
        assert_eq!(pages[1].checkpoint.processed_items, 5);
        assert_eq!(fetcher.requested(), vec![1, 2, 3]);
        Ok(())
    }

    #[tokio::test]
    async fn stop_is_checked_between_pages() -> anyhow::Result<()> {
        let fetcher = VecFetcher::new(&[&["a"], &["b"], &["c"]]);
        let stop = CancellationToken::new();
        let mut stream = paginate(&fetcher, None, stop.clone());

        let first = stream.next().await.unwrap()?;
        assert_eq!(first.checkpoint.current_page, 1);

        stop.cancel();
        assert!(stream.next().await.is_none());
        assert_eq!(fetcher.requested(), vec![0]);
        Ok(())
    }

    #[tokio::test]
    async fn recoverable_errors_are_recorded_and_skipped() -> anyhow::Result<()> {
        let fetcher = VecFetcher::new(&[&["a"], &["b"], &["c"]])
            .fail(1, FetchError::Recoverable("502 Bad Gateway".into()));
        let pages: Vec<Page> = paginate(&fetcher, None, CancellationToken::new())
            .try_collect()
            .await?;

        assert_eq!(ids(&pages), vec![vec!["a"], vec![], vec!["c"]]);
        let last = &pages[2].checkpoint;
        assert_eq!(last.processed_items, 2);
        assert_eq!(last.errors, vec!["page 1: 502 Bad Gateway".to_string()]);
        Ok(())
    }

    #[tokio::test]
    async fn repeated_recoverable_errors_become_fatal() {
        let fetcher = VecFetcher::new(&[&["a"], &["b"], &["c"], &["d"]])
            .fail(1, FetchError::Recoverable("timeout".into()))
            .fail(2, FetchError::Recoverable("timeout".into()))
            .fail(3, FetchError::Recoverable("timeout".into()));
        let result: anyhow::Result<Vec<Page>> = paginate(&fetcher, None, CancellationToken::new())
            .try_collect()
            .await;

        let error = result.unwrap_err().to_string();
        assert!(error.contains("3 consecutive page failures"), "got: {error}");
    }

    #[tokio::test]
    async fn fatal_error_ends_the_stream() {
        let fetcher = VecFetcher::new(&[&["a"], &["b"], &["c"]])
            .fail(1, FetchError::Fatal(anyhow!("401 Unauthorized")));
        let mut stream = paginate(&fetcher, None, CancellationToken::new());

        assert!(stream.next().await.unwrap().is_ok());
        let error = stream.next().await.unwrap().unwrap_err();
        assert_eq!(error.to_string(), "401 Unauthorized");
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn lost_position_restarts_and_skips_through_last_id() -> anyhow::Result<()> {
        // Upstream shrank: the recorded page 3 no longer exists.
        let fetcher = VecFetcher::new(&[&["a", "b"], &["c", "d"], &["e"]]);
        let resume_from = Checkpoint {
            processed_items: 3,
            current_page: 3,
            last_id: Some("c".into()),
            ..Checkpoint::default()
        };
        let pages: Vec<Page> = paginate(&fetcher, Some(resume_from), CancellationToken::new())
            .try_collect()
            .await?;

        assert_eq!(ids(&pages), vec![vec!["d"], vec!["e"]]);
        assert_eq!(pages[1].checkpoint.processed_items, 5);
        assert_eq!(fetcher.requested(), vec![3, 0, 1, 2, 3]);
        Ok(())
    }

    #[tokio::test]
    async fn vanished_last_id_delivers_everything_again() -> anyhow::Result<()> {
        // Upstream shrank and the last seen record "c" was deleted.
        let fetcher = VecFetcher::new(&[&["a", "b"], &["d", "e"], &["f"]]);
        let resume_from = Checkpoint {
            processed_items: 3,
            current_page: 5,
            last_id: Some("c".into()),
            ..Checkpoint::default()
        };
        let pages: Vec<Page> = paginate(&fetcher, Some(resume_from), CancellationToken::new())
            .try_collect()
            .await?;

        assert_eq!(ids(&pages), vec![vec!["a", "b"], vec!["d", "e"], vec!["f"]]);
        let last = &pages[2].checkpoint;
        assert_eq!(last.processed_items, 8);
        assert!(last.processed_items <= last.total_items);
        assert_eq!(fetcher.requested(), vec![5, 0, 1, 2, 3, 0, 1, 2, 3]);
        Ok(())
    }

    #[tokio::test]
    async fn vanished_last_id_is_detected_on_a_short_page() -> anyhow::Result<()> {
        let mut fetcher = VecFetcher::new(&[&["a", "b"], &["d", "e"], &["f"]]);
        fetcher.page_size = Some(2);
        let resume_from = Checkpoint {
            processed_items: 3,
            current_page: 5,
            last_id: Some("c".into()),
            ..Checkpoint::default()
        };
        let pages: Vec<Page> = paginate(&fetcher, Some(resume_from), CancellationToken::new())
            .try_collect()
            .await?;

        assert_eq!(ids(&pages), vec![vec!["a", "b"], vec!["d", "e"], vec!["f"]]);
        assert_eq!(fetcher.requested(), vec![5, 0, 1, 2, 0, 1, 2]);
        Ok(())
    }

    #[tokio::test]
    async fn lost_position_without_id_skips_by_count() -> anyhow::Result<()> {
        let fetcher = VecFetcher::new(&[&["a", "b"], &["c"]]);
        let resume_from = Checkpoint {
            processed_items: 1,
            current_page: 7,
            ..Checkpoint::default()
        };
        let pages: Vec<Page> = paginate(&fetcher, Some(resume_from), CancellationToken::new())
            .try_collect()
            .await?;

        assert_eq!(ids(&pages), vec![vec!["b"], vec!["c"]]);
        assert_eq!(pages[1].checkpoint.processed_items, 3);
        Ok(())
    }
}
