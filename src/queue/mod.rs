//! Durable job queue (C4, §4.4, §6).
//!
//! Backed by SQLite. A [`Queue`] owns four tables:
//! - `messages` — pending work, invisible while leased (`lease_expiry`)
//! - `in_progress_items` — a shadow row for every currently-leased message,
//!   kept alive after [`jobs::MarkAsError`] so a parked job can be revived
//!   by `RetryErroredJob` without re-deriving its `FileJob` from scratch
//! - `completed_items` — terminal successes, with optional deferred
//!   verification status
//! - `deferred_article_checks` — background STAT recheck schedule (§4.7)
//!
//! Methods are organized by domain, mirroring the teacher's per-file layout:
//! - [`migrations`] — schema bootstrap
//! - [`jobs`] — queue CRUD (`AddFile` through `GetCompletedItemNzbPath`)
//! - [`deferred`] — deferred article check CRUD

use rand::Rng;
use sqlx::sqlite::SqlitePool;

mod deferred;
mod jobs;
mod migrations;

#[cfg(test)]
mod tests;

/// Durable queue handle.
pub struct Queue {
    pool: SqlitePool,
}

/// Snapshot of queue depth across each state (§4.4 `GetQueueStats`).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Messages waiting to be received
    pub pending: i64,
    /// Messages currently leased
    pub in_progress: i64,
    /// Jobs that reached `completed_items`
    pub completed: i64,
    /// Parked jobs (errored out of retries, awaiting `RetryErroredJob`)
    pub errored: i64,
}

/// Which table a [`jobs::QueueItem`] currently lives in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueItemState {
    /// Sitting in `messages`, not currently leased
    Pending,
    /// Leased; a `messages` row and an `in_progress_items` row both exist
    InProgress,
    /// Parked in `in_progress_items` with no corresponding `messages` row,
    /// after retries were exhausted
    Errored,
}

pub use jobs::QueueItem;

/// A 26-character random alphanumeric id, used for every opaque primary key
/// this module hands out (`messages.id`, `in_progress_items.id`,
/// `completed_items.id`, `deferred_article_checks.id`).
fn new_id() -> String {
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..26)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect()
}

/// Render a UTC timestamp as the millisecond-precision ISO-8601 string
/// stored in every `TEXT` timestamp column.
fn to_iso(ts: chrono::DateTime<chrono::Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Parse a millisecond-precision ISO-8601 timestamp column, falling back to
/// the current time if a row somehow contains a malformed value rather than
/// failing the whole query.
fn from_iso(s: &str) -> chrono::DateTime<chrono::Utc> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .unwrap_or_else(|_| chrono::Utc::now())
}
