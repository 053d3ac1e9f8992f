use anyhow::anyhow;
use chrono::{DateTime, Utc};
use std::any::Any;

/// Fixed-width UTC timestamp format used for every stored timestamp.
///
/// Fixed width keeps textual ordering identical to chronological ordering,
/// which the retention sweep relies on.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

pub(crate) fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.format(TIMESTAMP_FORMAT).to_string()
}

pub(crate) fn now_timestamp() -> String {
    format_timestamp(Utc::now())
}

/// Try to figure out what's in the panic payload
pub(crate) fn try_to_extract_panic_info(info: &(dyn Any + Send + 'static)) -> anyhow::Error {
    if let Some(message) = info.downcast_ref::<&str>() {
        anyhow!("source panicked: {message}")
    } else if let Some(message) = info.downcast_ref::<String>() {
        anyhow!("source panicked: {message}")
    } else {
        anyhow!("source panicked")
    }
}
