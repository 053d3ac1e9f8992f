//! The resumable producer contract.
//!
//! A [`Source`] turns an optional [`Checkpoint`] into a lazy stream of
//! [`Page`]s. Each page is one unit of work: the records fetched together and
//! the checkpoint as of the end of that page. Sources check the stop token
//! between pages, never in the middle of one, so every reported checkpoint is
//! consistent with the records delivered before it.

use crate::checkpoint::Checkpoint;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

pub mod paged;

/// A record exactly as the upstream returned it.
pub type RawRecord = Value;

/// One unit of work produced by a [`Source`].
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    /// Records fetched in this unit, possibly none.
    pub records: Vec<RawRecord>,
    /// Progress as of the end of this unit.
    pub checkpoint: Checkpoint,
}

/// Domain entity kinds the sink knows how to persist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    /// A plant species.
    Plant,
    /// A chemical ingredient or compound.
    Ingredient,
    /// An ailment or condition.
    Ailment,
    /// A preparation combining ingredients.
    Recipe,
}

/// A record transformed into the shape the sink understands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    /// Which kind of entity `data` describes.
    pub entity_type: EntityType,
    /// Entity fields.
    pub data: Value,
}

impl NormalizedRecord {
    /// Build a record of the given kind.
    pub fn new(entity_type: EntityType, data: Value) -> Self {
        Self { entity_type, data }
    }
}

/// A pluggable, resumable producer of raw upstream records.
///
/// Implementations must be reconstructible from a [`Checkpoint`] alone: a
/// resumed job builds a fresh source through the registry and passes the
/// journal's recovery point to [`Source::produce`].
pub trait Source: Send + Sync {
    /// Start producing pages, continuing after `resume_from` when given.
    ///
    /// The stream must check `stop` between pages and end promptly once it is
    /// cancelled. Recoverable failures belong in the checkpoint's `errors`; an
    /// `Err` item is fatal and terminates the run.
    fn produce(
        &self,
        resume_from: Option<Checkpoint>,
        stop: CancellationToken,
    ) -> BoxStream<'_, anyhow::Result<Page>>;

    /// Transform a raw record, returning `None` to skip it without error.
    fn normalize(&self, raw: RawRecord) -> Option<NormalizedRecord>;
}
