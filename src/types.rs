//! Core data types for usenet-poster (§3 of the specification)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Signed job priority; higher values are drained first, ties broken by
/// creation time (oldest first).
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Priority(pub i64);

impl Priority {
    /// The default priority assigned to jobs added without an explicit value
    pub const NORMAL: Priority = Priority(0);
}

impl From<i64> for Priority {
    fn from(v: i64) -> Self {
        Priority(v)
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A unit of posting work: one local file to be encoded, posted, and
/// (optionally) verified. Serialized as the opaque `job_data` blob stored
/// alongside queue messages and completed/in-progress rows.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileJob {
    /// Absolute path to the source file
    pub path: PathBuf,
    /// Size of the source file in bytes
    pub size: u64,
    /// Job priority (higher first)
    pub priority: Priority,
    /// Number of times this job has been re-added after a failed attempt
    pub retry_count: u32,
    /// When the job was first created
    pub created_at: DateTime<Utc>,
}

impl FileJob {
    /// Construct a new job with zero retries, stamped at the current time
    pub fn new(path: PathBuf, size: u64, priority: Priority) -> Self {
        Self {
            path,
            size,
            priority,
            retry_count: 0,
            created_at: Utc::now(),
        }
    }
}

/// A durable queue message (§4.4). The body is an opaque blob (the
/// serialized `FileJob`); the queue never interprets it beyond storing it.
#[derive(Clone, Debug)]
pub struct QueueMessage {
    /// Opaque identifier, unique across the queue's lifetime
    pub id: String,
    /// Opaque message body
    pub body: Vec<u8>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last-updated timestamp
    pub updated_at: DateTime<Utc>,
    /// Lease expiry; the message is invisible to new receivers until this
    /// passes (or the lease is extended)
    pub lease_expiry: DateTime<Utc>,
    /// Number of times this message has been delivered
    pub delivery_count: u32,
}

impl QueueMessage {
    /// Deserialize the message body as a `FileJob`
    pub fn job(&self) -> crate::error::Result<FileJob> {
        serde_json::from_slice(&self.body)
            .map_err(|e| crate::error::QueueError::Corrupt(format!("{}: {}", self.id, e)).into())
    }
}

/// Null | pending | verified | verification_failed, per §9's resolved open
/// question: starts absent (`None` at the Rust level / SQL `NULL`) unless
/// deferred checks were scheduled at completion time, in which case it
/// starts `Pending`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    /// Deferred checks are outstanding
    Pending,
    /// Every associated check verified
    Verified,
    /// At least one check failed and none remain pending
    VerificationFailed,
}

impl VerificationStatus {
    /// Parse the SQL `TEXT` representation, treating unrecognized strings as
    /// `None` rather than failing the caller.
    pub fn from_db(s: Option<&str>) -> Option<Self> {
        match s {
            Some("pending") => Some(Self::Pending),
            Some("verified") => Some(Self::Verified),
            Some("verification_failed") => Some(Self::VerificationFailed),
            _ => None,
        }
    }

    /// The SQL `TEXT` representation
    pub fn as_db_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Verified => "verified",
            Self::VerificationFailed => "verification_failed",
        }
    }
}

/// A job that has reached a terminal successful state.
#[derive(Clone, Debug)]
pub struct CompletedItem {
    /// The original queue message id
    pub id: String,
    /// Source file path
    pub path: PathBuf,
    /// Source file size
    pub size: u64,
    /// Job priority at completion time
    pub priority: Priority,
    /// Absolute path to the produced NZB file
    pub nzb_path: PathBuf,
    /// Original job creation time
    pub created_at: DateTime<Utc>,
    /// Completion time
    pub completed_at: DateTime<Utc>,
    /// The original serialized `FileJob`
    pub job_data: Vec<u8>,
    /// Verification status; `None` if no deferred checks were scheduled and
    /// in-job verification was not run
    pub verification_status: Option<VerificationStatus>,
}

/// Crash-recovery shadow row for a leased message (§3 invariant: exactly one
/// in-progress row per currently-leased message).
#[derive(Clone, Debug)]
pub struct InProgressItem {
    /// The queue message id this shadows
    pub id: String,
    /// Source file path
    pub path: PathBuf,
    /// Source file size
    pub size: u64,
    /// Job priority (preserved across crash recovery)
    pub priority: Priority,
    /// Original job creation time
    pub created_at: DateTime<Utc>,
    /// When the lease was taken
    pub started_at: DateTime<Utc>,
    /// The original serialized `FileJob`
    pub job_data: Vec<u8>,
}

/// Which obfuscation policy to apply per-article (§4.1)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObfuscationPolicy {
    /// Subject and filename are the real ones
    #[default]
    None,
    /// Subject/filename replaced by MD5 hex; date/poster remain real
    Partial,
    /// Subject, filename, and date are randomized per-article; poster regenerated
    Full,
}

/// Message-ID generation strategy (§4.1)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageIdFormat {
    /// 32 random alphanumerics @ 8 random alphanumerics . 3 random alphanumerics
    #[default]
    Random,
    /// Deterministic id derived from a per-file nxg header
    Ngx,
}

/// How newsgroups are assigned to a file's articles (§4.5.2)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupPolicy {
    /// Every article carries the entire configured newsgroup list
    #[default]
    All,
    /// One newsgroup, chosen uniformly at random per file, applied to every
    /// article of that file
    EachFile,
}

/// Whether a posted part is payload data or a PAR2 redundancy file; affects
/// obfuscation policy selection and the `ngx` message-id derivation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartType {
    /// A part of one of the job's original files
    Data,
    /// A part of a generated PAR2 redundancy volume
    Par2,
}

/// One NNTP article: a yEnc-encoded part of a file (§3).
///
/// Constructed when a file is split into parts; mutated only to fill
/// `content_hash` after its bytes are read. Never shared across jobs.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Article {
    /// RFC-style angle-bracketed message-id
    pub message_id: String,
    /// Subject line (real or obfuscated per policy)
    pub subject: String,
    /// `Name <user@host>`-shaped From header
    pub from: String,
    /// Newsgroups this article is posted to
    pub newsgroups: Vec<String>,
    /// 1-based part number
    pub part_number: u32,
    /// Total number of parts for this file
    pub total_parts: u32,
    /// Filename advertised in the yEnc header (possibly obfuscated)
    pub file_name: String,
    /// The real, un-obfuscated filename
    pub original_name: String,
    /// Total size of the source file
    pub file_size: u64,
    /// Byte offset of this part within the source file
    pub offset: u64,
    /// Number of original (pre-yEnc) bytes in this part
    pub part_size: u64,
    /// Article date
    pub date: DateTime<Utc>,
    /// Optional X-Nxg header value
    pub x_nxg: Option<String>,
    /// Additional headers; must never shadow the five mandatory headers
    pub custom_headers: HashMap<String, String>,
    /// SHA-256 of the part's content, filled in after the bytes are read
    pub content_hash: Option<String>,
    /// Whether this part belongs to the file's data or to a PAR2 volume
    pub part_type: PartType,
}

/// Per-file posting status (§3)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PostStatus {
    /// Not yet attempted
    Pending,
    /// All articles posted, verification not yet run (or disabled)
    Posted,
    /// All articles verified to exist on the verify pool
    Verified,
    /// Posting or verification failed terminally
    Failed,
    /// Cancelled by an external or internal context cancellation
    Cancelled,
}

/// Deferred STAT re-check scheduled by the poster when in-job verification
/// is skipped in favor of a long-horizon background check (§3, §4.7).
#[derive(Clone, Debug)]
pub struct DeferredArticleCheck {
    /// Opaque check id
    pub id: String,
    /// The completed item this check belongs to
    pub completed_item_id: String,
    /// The article's message-id
    pub message_id: String,
    /// Newsgroups to check against
    pub newsgroups: Vec<String>,
    /// Number of STAT attempts made so far
    pub retry_count: u32,
    /// Earliest time the next STAT attempt may run
    pub next_retry: DateTime<Utc>,
    /// pending | verified | failed
    pub status: CheckStatus,
    /// Time of the first failed STAT, if any
    pub first_failure_at: Option<DateTime<Utc>>,
}

/// Status of one deferred article check
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    /// Still awaiting a successful STAT or exhaustion of retries
    Pending,
    /// STAT succeeded
    Verified,
    /// Retries exhausted without a successful STAT
    Failed,
}

impl CheckStatus {
    /// Parse the SQL `TEXT` representation
    pub fn from_db(s: &str) -> Self {
        match s {
            "verified" => Self::Verified,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }

    /// The SQL `TEXT` representation
    pub fn as_db_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Verified => "verified",
            Self::Failed => "failed",
        }
    }
}

/// A role a provider (and therefore a connection pool) can serve.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderRole {
    /// Carries POST traffic
    Upload,
    /// Carries STAT traffic
    Verify,
}

/// Point-in-time state of one configured provider, as reported in a
/// [`PoolMetricsSnapshot`].
#[derive(Clone, Debug)]
pub struct ProviderState {
    /// Provider host
    pub host: String,
    /// Role this provider was assigned
    pub role: ProviderRole,
    /// Connections currently checked out
    pub acquired: u32,
    /// Connections currently idle
    pub idle: u32,
    /// Configured connection ceiling
    pub max_connections: u32,
    /// Whether the provider is enabled
    pub enabled: bool,
}

/// Read-only snapshot of pool activity (§3)
#[derive(Clone, Debug, Default)]
pub struct PoolMetricsSnapshot {
    /// Total connections currently acquired across all providers in this pool
    pub active_connections: u32,
    /// Cumulative bytes posted since pool construction
    pub bytes_posted: u64,
    /// Cumulative articles posted since pool construction
    pub articles_posted: u64,
    /// Cumulative errors, keyed by provider host
    pub errors_per_provider: HashMap<String, u64>,
    /// Rolling average time spent waiting to acquire a connection
    pub average_acquire_wait: Duration,
    /// Per-provider state
    pub provider_states: Vec<ProviderState>,
}

/// The stage a progress callback invocation refers to (§4.5.4)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    /// Articles are being uploaded
    Posting,
    /// Articles are being STAT-checked
    Verifying,
}

/// One progress callback invocation. The poster invokes this on every
/// meaningful update; consumers are responsible for coalescing since the
/// callback must be non-blocking from the poster's perspective.
#[derive(Clone, Debug)]
pub struct ProgressUpdate {
    /// Which stage produced this update
    pub stage: Stage,
    /// Bytes processed so far for the current file
    pub current_bytes: u64,
    /// Total bytes for the current file
    pub total_bytes: u64,
    /// Human-readable detail (e.g. current file name)
    pub details: String,
    /// Instantaneous throughput in kilobytes/sec
    pub kbps: f64,
    /// Estimated seconds remaining, if computable
    pub seconds_left: Option<u64>,
    /// Elapsed time since the job started
    pub elapsed: Duration,
}

/// Non-blocking progress sink implemented by UI adapters (§9 design notes:
/// abstracts the event-emitter coupling behind a single-method interface).
pub trait ProgressSink: Send + Sync {
    /// Called on every meaningful progress update. Must not block.
    fn on_progress(&self, update: ProgressUpdate);
}

impl<F> ProgressSink for F
where
    F: Fn(ProgressUpdate) + Send + Sync,
{
    fn on_progress(&self, update: ProgressUpdate) {
        self(update)
    }
}

/// A no-op sink for callers that don't need progress reporting.
pub struct NullProgressSink;

impl ProgressSink for NullProgressSink {
    fn on_progress(&self, _update: ProgressUpdate) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_ordering_is_numeric() {
        assert!(Priority(5) > Priority(0));
        assert!(Priority(0) > Priority(-1));
    }

    #[test]
    fn verification_status_round_trips_through_db_strings() {
        for s in [
            VerificationStatus::Pending,
            VerificationStatus::Verified,
            VerificationStatus::VerificationFailed,
        ] {
            assert_eq!(VerificationStatus::from_db(Some(s.as_db_str())), Some(s));
        }
        assert_eq!(VerificationStatus::from_db(None), None);
        assert_eq!(VerificationStatus::from_db(Some("garbage")), None);
    }

    #[test]
    fn check_status_round_trips_through_db_strings() {
        for s in [CheckStatus::Pending, CheckStatus::Verified, CheckStatus::Failed] {
            assert_eq!(CheckStatus::from_db(s.as_db_str()), s);
        }
    }
}
