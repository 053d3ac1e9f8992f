use crate::source::EntityType;
use futures_util::future::BoxFuture;
use serde_json::Value;

/// Consumer that persists normalized records.
///
/// The runner may re-deliver records produced after the last durable
/// checkpoint when a job is resumed, so implementations must tolerate
/// duplicates, typically by upserting on a natural key.
pub trait Sink: Send + Sync {
    /// Persist one record, returning its identifier in the store.
    fn save(&self, data: Value, entity_type: EntityType) -> BoxFuture<'_, anyhow::Result<i64>>;
}

