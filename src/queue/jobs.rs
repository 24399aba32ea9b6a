//! Queue CRUD (§4.4): `AddFile` through `GetCompletedItemNzbPath`.
//!
//! Message bodies are opaque per §3, but a leased message's priority still
//! has to drive receive order, so `ReceiveFile` deserializes the candidate
//! batch's `FileJob.priority` in application code rather than indexing it in
//! SQL — see `DESIGN.md` for why `messages` carries no `priority` column.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use sqlx::FromRow;

use crate::error::{Error, QueueError, Result};
use crate::types::{CompletedItem, FileJob, Priority, QueueMessage, VerificationStatus};

use super::{QueueItemState, QueueStats, from_iso, new_id, to_iso};

/// The single logical queue name this crate posts to; kept as an explicit
/// column (rather than folded away) so the schema matches §6 verbatim.
const QUEUE_NAME: &str = "files";

#[derive(FromRow)]
struct MessageRow {
    id: String,
    created: String,
    body: Vec<u8>,
    delivery_count: i64,
}

#[derive(FromRow)]
struct InProgressSourceRow {
    path: String,
    size: i64,
    priority: i64,
    created_at: String,
    job_data: Vec<u8>,
}

#[derive(FromRow)]
struct PendingRow {
    id: String,
    body: Vec<u8>,
    created: String,
}

#[derive(FromRow)]
struct ErroredRow {
    id: String,
    path: String,
    size: i64,
    priority: i64,
    created_at: String,
}

/// How many candidate pending messages `ReceiveFile` inspects before picking
/// the highest-priority one to lease.
const RECEIVE_BATCH: i64 = 64;

/// One row as surfaced by `GetQueueItems`, spanning all three states a
/// not-yet-completed job can be in.
#[derive(Clone, Debug)]
pub struct QueueItem {
    /// Opaque id (shared across a job's `messages` and `in_progress_items` rows)
    pub id: String,
    /// Source file path
    pub path: PathBuf,
    /// Source file size
    pub size: u64,
    /// Current priority
    pub priority: Priority,
    /// Which table(s) this id currently lives in
    pub state: QueueItemState,
    /// Original job creation time
    pub created_at: chrono::DateTime<Utc>,
}

impl super::Queue {
    /// Enqueue a new job at normal priority.
    pub async fn add_file(&self, path: PathBuf, size: u64) -> Result<String> {
        self.add_file_with_priority(path, size, Priority::NORMAL)
            .await
    }

    /// Enqueue a new job at an explicit priority.
    pub async fn add_file_with_priority(
        &self,
        path: PathBuf,
        size: u64,
        priority: Priority,
    ) -> Result<String> {
        let job = FileJob::new(path, size, priority);
        let body = serde_json::to_vec(&job)?;
        let id = new_id();
        let now = to_iso(Utc::now());

        sqlx::query(
            r#"
            INSERT INTO messages (id, created, updated, queue, body, lease_expiry, delivery_count)
            VALUES (?, ?, ?, ?, ?, ?, 0)
            "#,
        )
        .bind(&id)
        .bind(&now)
        .bind(&now)
        .bind(QUEUE_NAME)
        .bind(&body)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        Ok(id)
    }

    /// Lease the highest-priority available message (ties broken by oldest
    /// `created`), returning it alongside its deserialized job. `None` if no
    /// message is currently available.
    pub async fn receive_file(
        &self,
        lease_duration: Duration,
    ) -> Result<Option<(QueueMessage, FileJob)>> {
        let now = Utc::now();
        let now_s = to_iso(now);

        let rows: Vec<MessageRow> = sqlx::query_as(
            r#"
            SELECT id, created, body, delivery_count
            FROM messages
            WHERE queue = ? AND lease_expiry <= ?
            ORDER BY created ASC
            LIMIT ?
            "#,
        )
        .bind(QUEUE_NAME)
        .bind(&now_s)
        .bind(RECEIVE_BATCH)
        .fetch_all(&self.pool)
        .await?;

        let mut best: Option<(MessageRow, FileJob)> = None;
        for row in rows {
            let job: FileJob = match serde_json::from_slice(&row.body) {
                Ok(job) => job,
                Err(_) => continue, // corrupt row; skip rather than fail the whole receive
            };
            let better = match &best {
                None => true,
                Some((_, current_job)) => job.priority > current_job.priority,
            };
            if better {
                best = Some((row, job));
            }
        }

        let Some((MessageRow { id, created, body, delivery_count }, job)) = best else {
            return Ok(None);
        };

        let new_lease_expiry = to_iso(now + chrono::Duration::from_std(lease_duration).unwrap_or_default());
        let result = sqlx::query(
            r#"
            UPDATE messages
            SET lease_expiry = ?, updated = ?, delivery_count = delivery_count + 1
            WHERE id = ? AND lease_expiry <= ?
            "#,
        )
        .bind(&new_lease_expiry)
        .bind(&now_s)
        .bind(&id)
        .bind(&now_s)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            // Another receiver won the race for this row; caller should retry.
            return Err(Error::Queue(QueueError::Transient(format!(
                "lost race leasing message {id}"
            ))));
        }

        sqlx::query(
            r#"
            INSERT INTO in_progress_items (id, path, size, priority, created_at, started_at, job_data)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(job.path.to_string_lossy().to_string())
        .bind(job.size as i64)
        .bind(job.priority.0)
        .bind(to_iso(job.created_at))
        .bind(&now_s)
        .bind(&body)
        .execute(&self.pool)
        .await?;

        let message = QueueMessage {
            id: id.clone(),
            body,
            created_at: from_iso(&created),
            updated_at: now,
            lease_expiry: from_iso(&new_lease_expiry),
            delivery_count: delivery_count as u32 + 1,
        };

        Ok(Some((message, job)))
    }

    /// Move a leased job to `completed_items`, dropping its `messages` and
    /// `in_progress_items` rows.
    pub async fn complete_file(&self, message_id: &str, nzb_path: &Path) -> Result<CompletedItem> {
        let row: Option<InProgressSourceRow> = sqlx::query_as(
            "SELECT path, size, priority, created_at, job_data FROM in_progress_items WHERE id = ?",
        )
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(InProgressSourceRow { path, size, priority, created_at, job_data }) = row else {
            return Err(Error::Queue(QueueError::NotFound(message_id.to_string())));
        };

        let now = to_iso(Utc::now());
        let nzb_path_s = nzb_path.to_string_lossy().to_string();

        sqlx::query(
            r#"
            INSERT INTO completed_items
                (id, path, size, priority, nzb_path, created_at, completed_at, job_data, verification_status)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, NULL)
            "#,
        )
        .bind(message_id)
        .bind(&path)
        .bind(size)
        .bind(priority)
        .bind(&nzb_path_s)
        .bind(&created_at)
        .bind(&now)
        .bind(&job_data)
        .execute(&self.pool)
        .await?;

        sqlx::query("DELETE FROM messages WHERE id = ?")
            .bind(message_id)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM in_progress_items WHERE id = ?")
            .bind(message_id)
            .execute(&self.pool)
            .await?;

        Ok(CompletedItem {
            id: message_id.to_string(),
            path: PathBuf::from(path),
            size: size as u64,
            priority: Priority(priority),
            nzb_path: nzb_path.to_path_buf(),
            created_at: from_iso(&created_at),
            completed_at: from_iso(&now),
            job_data,
            verification_status: None,
        })
    }

    /// Terminally fail a leased job: drop its `messages` row but keep the
    /// `in_progress_items` row parked, ready for `retry_errored_job`.
    pub async fn mark_as_error(&self, message_id: &str, reason: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM messages WHERE id = ?")
            .bind(message_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::Queue(QueueError::NotFound(message_id.to_string())));
        }

        tracing::warn!(message_id, reason, "job parked as errored");
        Ok(())
    }

    /// Re-add a leased job to the queue with its retry count incremented,
    /// dropping the `in_progress_items` shadow row.
    pub async fn readd_job(&self, message_id: &str) -> Result<()> {
        let row: Option<Vec<u8>> =
            sqlx::query_scalar("SELECT job_data FROM in_progress_items WHERE id = ?")
                .bind(message_id)
                .fetch_optional(&self.pool)
                .await?;

        let Some(job_data) = row else {
            return Err(Error::Queue(QueueError::NotFound(message_id.to_string())));
        };

        let mut job: FileJob = serde_json::from_slice(&job_data)
            .map_err(|e| Error::Queue(QueueError::Corrupt(format!("{message_id}: {e}"))))?;
        job.retry_count += 1;
        let new_body = serde_json::to_vec(&job)?;
        let now = to_iso(Utc::now());

        sqlx::query(
            r#"
            INSERT INTO messages (id, created, updated, queue, body, lease_expiry, delivery_count)
            VALUES (?, ?, ?, ?, ?, ?, 0)
            "#,
        )
        .bind(message_id)
        .bind(&now)
        .bind(&now)
        .bind(QUEUE_NAME)
        .bind(&new_body)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        sqlx::query("DELETE FROM in_progress_items WHERE id = ?")
            .bind(message_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Push a leased message's lease expiry further into the future without
    /// otherwise disturbing it (long-running posts that outlive one lease).
    pub async fn extend_timeout(&self, message_id: &str, extension: Duration) -> Result<()> {
        let now = Utc::now();
        let new_expiry = to_iso(now + chrono::Duration::from_std(extension).unwrap_or_default());
        let result = sqlx::query("UPDATE messages SET lease_expiry = ?, updated = ? WHERE id = ?")
            .bind(&new_expiry)
            .bind(to_iso(now))
            .bind(message_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::Queue(QueueError::NotFound(message_id.to_string())));
        }
        Ok(())
    }

    /// Un-park a job previously parked by `mark_as_error`, re-enqueuing it
    /// without touching its retry count.
    pub async fn retry_errored_job(&self, message_id: &str) -> Result<()> {
        let exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM messages WHERE id = ?")
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?;
        if exists.is_some() {
            return Err(Error::Queue(QueueError::Conflict(format!(
                "{message_id} is not parked (still has an active message row)"
            ))));
        }

        let row: Option<Vec<u8>> =
            sqlx::query_scalar("SELECT job_data FROM in_progress_items WHERE id = ?")
                .bind(message_id)
                .fetch_optional(&self.pool)
                .await?;
        let Some(job_data) = row else {
            return Err(Error::Queue(QueueError::NotFound(message_id.to_string())));
        };

        let now = to_iso(Utc::now());
        sqlx::query(
            r#"
            INSERT INTO messages (id, created, updated, queue, body, lease_expiry, delivery_count)
            VALUES (?, ?, ?, ?, ?, ?, 0)
            "#,
        )
        .bind(message_id)
        .bind(&now)
        .bind(&now)
        .bind(QUEUE_NAME)
        .bind(&job_data)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        sqlx::query("DELETE FROM in_progress_items WHERE id = ?")
            .bind(message_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Remove a job outright, whatever state it is in (pending, leased, or
    /// parked). Used for user-initiated cancellation.
    pub async fn remove_from_queue(&self, message_id: &str) -> Result<()> {
        let a = sqlx::query("DELETE FROM messages WHERE id = ?")
            .bind(message_id)
            .execute(&self.pool)
            .await?;
        let b = sqlx::query("DELETE FROM in_progress_items WHERE id = ?")
            .bind(message_id)
            .execute(&self.pool)
            .await?;

        if a.rows_affected() == 0 && b.rows_affected() == 0 {
            return Err(Error::Queue(QueueError::NotFound(message_id.to_string())));
        }
        Ok(())
    }

    /// Drop every pending, leased, and parked job. Completed items and
    /// deferred checks are untouched.
    pub async fn clear_queue(&self) -> Result<()> {
        sqlx::query("DELETE FROM messages")
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM in_progress_items")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// List every not-yet-completed job, across pending/in-progress/errored.
    pub async fn get_queue_items(&self) -> Result<Vec<QueueItem>> {
        let mut items = Vec::new();

        let pending: Vec<PendingRow> = sqlx::query_as("SELECT id, body, created FROM messages")
            .fetch_all(&self.pool)
            .await?;
        let leased_ids: std::collections::HashSet<String> =
            sqlx::query_scalar("SELECT id FROM in_progress_items")
                .fetch_all(&self.pool)
                .await?
                .into_iter()
                .collect();

        for PendingRow { id, body, created } in pending {
            let Ok(job) = serde_json::from_slice::<FileJob>(&body) else {
                continue;
            };
            let state = if leased_ids.contains(&id) {
                QueueItemState::InProgress
            } else {
                QueueItemState::Pending
            };
            items.push(QueueItem {
                id,
                path: job.path,
                size: job.size,
                priority: job.priority,
                state,
                created_at: from_iso(&created),
            });
        }

        let errored: Vec<ErroredRow> = sqlx::query_as(
            r#"
            SELECT id, path, size, priority, created_at FROM in_progress_items
            WHERE id NOT IN (SELECT id FROM messages)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        for ErroredRow { id, path, size, priority, created_at } in errored {
            items.push(QueueItem {
                id,
                path: PathBuf::from(path),
                size: size as u64,
                priority: Priority(priority),
                state: QueueItemState::Errored,
                created_at: from_iso(&created_at),
            });
        }

        Ok(items)
    }

    /// Depth of each queue state.
    pub async fn get_queue_stats(&self) -> Result<QueueStats> {
        let pending: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM messages WHERE id NOT IN (SELECT id FROM in_progress_items)",
        )
        .fetch_one(&self.pool)
        .await?;
        let in_progress: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM in_progress_items WHERE id IN (SELECT id FROM messages)",
        )
        .fetch_one(&self.pool)
        .await?;
        let errored: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM in_progress_items WHERE id NOT IN (SELECT id FROM messages)",
        )
        .fetch_one(&self.pool)
        .await?;
        let completed: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM completed_items")
            .fetch_one(&self.pool)
            .await?;

        Ok(QueueStats {
            pending,
            in_progress,
            completed,
            errored,
        })
    }

    /// Change a pending job's priority in place.
    pub async fn set_queue_item_priority(&self, message_id: &str, priority: Priority) -> Result<()> {
        let body: Option<Vec<u8>> =
            sqlx::query_scalar("SELECT body FROM messages WHERE id = ?")
                .bind(message_id)
                .fetch_optional(&self.pool)
                .await?;
        let Some(body) = body else {
            return Err(Error::Queue(QueueError::NotFound(message_id.to_string())));
        };

        let mut job: FileJob = serde_json::from_slice(&body)
            .map_err(|e| Error::Queue(QueueError::Corrupt(format!("{message_id}: {e}"))))?;
        job.priority = priority;
        let new_body = serde_json::to_vec(&job)?;

        sqlx::query("UPDATE messages SET body = ?, updated = ? WHERE id = ?")
            .bind(&new_body)
            .bind(to_iso(Utc::now()))
            .bind(message_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// The NZB path recorded for a completed job, if it exists.
    pub async fn get_completed_item_nzb_path(
        &self,
        completed_item_id: &str,
    ) -> Result<Option<PathBuf>> {
        let path: Option<String> =
            sqlx::query_scalar("SELECT nzb_path FROM completed_items WHERE id = ?")
                .bind(completed_item_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(path.map(PathBuf::from))
    }

    /// Update a completed item's aggregate verification status.
    pub async fn update_completed_item_verification_status(
        &self,
        completed_item_id: &str,
        status: VerificationStatus,
    ) -> Result<()> {
        let result = sqlx::query("UPDATE completed_items SET verification_status = ? WHERE id = ?")
            .bind(status.as_db_str())
            .bind(completed_item_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::Queue(QueueError::NotFound(
                completed_item_id.to_string(),
            )));
        }
        Ok(())
    }
}
