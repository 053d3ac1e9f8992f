//! Point-in-time progress snapshots.
//!
//! A [`Checkpoint`] is owned by a source while it runs and handed to the
//! runner by value with every page. The runner persists it (job row and
//! journal) and a later resume hands it back to a freshly constructed
//! source, which must be able to continue from the fields alone.

use serde::{Deserialize, Serialize};

/// Number of recoverable error messages retained in a checkpoint.
pub const MAX_RECORDED_ERRORS: usize = 10;

/// Progress snapshot of one ingestion run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Checkpoint {
    /// Estimated number of items upstream, `0` when unknown.
    pub total_items: u64,
    /// Items produced so far, across all runs of the job.
    pub processed_items: u64,
    /// Next page to fetch.
    pub current_page: u64,
    /// Opaque upstream cursor for sources that paginate by token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
    /// Id of the last record produced, used to skip already-seen records.
    pub last_id: Option<String>,
    /// Most recent recoverable errors, oldest first.
    pub errors: Vec<String>,
}

impl Checkpoint {
    /// A checkpoint at the very beginning of the upstream data.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a unit of work: `items` more produced, positioned before `next_page`.
    ///
    /// `last_id` is kept from before when the page had no identifiable record.
    pub fn advance(&mut self, items: u64, next_page: u64, last_id: Option<String>) {
        self.processed_items += items;
        self.current_page = next_page;
        if last_id.is_some() {
            self.last_id = last_id;
        }
        if self.total_items != 0 && self.processed_items > self.total_items {
            self.total_items = self.processed_items;
        }
    }

    /// Update the total estimate without dropping below what was already processed.
    pub fn set_total(&mut self, total: u64) {
        self.total_items = if total == 0 {
            0
        } else {
            total.max(self.processed_items)
        };
    }

    /// Append a recoverable error, keeping only the most recent ones.
    pub fn record_error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
        if self.errors.len() > MAX_RECORDED_ERRORS {
            let excess = self.errors.len() - MAX_RECORDED_ERRORS;
            self.errors.drain(..excess);
        }
    }

    /// Fraction of the known total that has been processed.
    #[allow(clippy::cast_precision_loss)]
    pub fn fraction_done(&self) -> Option<f64> {
        if self.total_items == 0 {
            return None;
        }
        Some(self.processed_items as f64 / self.total_items as f64)
    }
}
