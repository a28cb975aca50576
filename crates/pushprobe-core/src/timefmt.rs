//! Time formats shared across the fleet.
//!
//! The file tag names receipt files on the device side and must sort and
//! round-trip byte-for-byte between sender and resolver. The log stamp is
//! the human-readable form carried in probe log records.

use chrono::{DateTime, Utc};

/// Format of the timestamp embedded in receipt file names,
/// e.g. `2020-06-01-T123456.789+0000`
pub const FILE_TAG_FORMAT: &str = "%Y-%m-%d-T%H%M%S%.3f%z";

/// Format of the send-time field in probe log records,
/// e.g. `Mon Jun  1 12:34:56 UTC 2020`
pub const LOG_FORMAT: &str = "%a %b %e %H:%M:%S %Z %Y";

/// Render an instant as a receipt file tag.
pub fn file_tag(t: &DateTime<Utc>) -> String {
    t.format(FILE_TAG_FORMAT).to_string()
}

/// Render an instant as a log-record timestamp.
pub fn log_stamp(t: &DateTime<Utc>) -> String {
    t.format(LOG_FORMAT).to_string()
}
