//! Deferred article check CRUD (§4.7): the background STAT recheck worker's
//! persistence needs.

use chrono::Utc;

use crate::error::{Error, QueueError, Result};
use crate::types::{CheckStatus, DeferredArticleCheck};

use super::{from_iso, new_id, to_iso};

impl super::Queue {
    /// Schedule a deferred STAT recheck for one article of a completed job.
    pub async fn add_article_check(
        &self,
        completed_item_id: &str,
        message_id: &str,
        groups: &[String],
        next_retry: chrono::DateTime<Utc>,
    ) -> Result<String> {
        let id = new_id();
        sqlx::query(
            r#"
            INSERT INTO deferred_article_checks
                (id, completed_item_id, message_id, groups, retry_count, next_retry, status, first_failure_at)
            VALUES (?, ?, ?, ?, 0, ?, 'pending', NULL)
            "#,
        )
        .bind(&id)
        .bind(completed_item_id)
        .bind(message_id)
        .bind(groups.join(","))
        .bind(to_iso(next_retry))
        .execute(&self.pool)
        .await?;

        Ok(id)
    }

    /// Fetch up to `limit` pending checks whose `next_retry` has passed,
    /// oldest-due first.
    pub async fn get_articles_for_check(&self, limit: i64) -> Result<Vec<DeferredArticleCheck>> {
        let now = to_iso(Utc::now());
        let rows: Vec<(String, String, String, String, i64, String, String, Option<String>)> =
            sqlx::query_as(
                r#"
                SELECT id, completed_item_id, message_id, groups, retry_count, next_retry, status, first_failure_at
                FROM deferred_article_checks
                WHERE status = 'pending' AND next_retry <= ?
                ORDER BY next_retry ASC
                LIMIT ?
                "#,
            )
            .bind(&now)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(
                |(id, completed_item_id, message_id, groups, retry_count, next_retry, status, first_failure_at)| {
                    DeferredArticleCheck {
                        id,
                        completed_item_id,
                        message_id,
                        newsgroups: groups.split(',').map(str::to_string).filter(|s| !s.is_empty()).collect(),
                        retry_count: retry_count as u32,
                        next_retry: from_iso(&next_retry),
                        status: CheckStatus::from_db(&status),
                        first_failure_at: first_failure_at.as_deref().map(from_iso),
                    }
                },
            )
            .collect())
    }

    /// Mark a check as verified (STAT succeeded).
    pub async fn mark_article_verified(&self, check_id: &str) -> Result<()> {
        let result = sqlx::query("UPDATE deferred_article_checks SET status = 'verified' WHERE id = ?")
            .bind(check_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::Queue(QueueError::NotFound(check_id.to_string())));
        }
        Ok(())
    }

    /// Mark a check as terminally failed (retries exhausted).
    pub async fn mark_article_check_failed(&self, check_id: &str) -> Result<()> {
        let result = sqlx::query("UPDATE deferred_article_checks SET status = 'failed' WHERE id = ?")
            .bind(check_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::Queue(QueueError::NotFound(check_id.to_string())));
        }
        Ok(())
    }

    /// Record a failed STAT attempt: bump `retry_count`, push `next_retry`
    /// out, and stamp `first_failure_at` the first time this happens.
    pub async fn update_article_check_retry(
        &self,
        check_id: &str,
        next_retry: chrono::DateTime<Utc>,
    ) -> Result<()> {
        let first_failure_at: Option<String> =
            sqlx::query_scalar("SELECT first_failure_at FROM deferred_article_checks WHERE id = ?")
                .bind(check_id)
                .fetch_optional(&self.pool)
                .await?
                .ok_or_else(|| Error::Queue(QueueError::NotFound(check_id.to_string())))?;

        let stamp = first_failure_at.unwrap_or_else(|| to_iso(Utc::now()));

        sqlx::query(
            r#"
            UPDATE deferred_article_checks
            SET retry_count = retry_count + 1, next_retry = ?, first_failure_at = ?
            WHERE id = ?
            "#,
        )
        .bind(to_iso(next_retry))
        .bind(stamp)
        .bind(check_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Count of checks still pending for a completed item (used to decide
    /// whether the item's aggregate verification status can be finalized).
    pub async fn get_pending_check_count_for_item(&self, completed_item_id: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM deferred_article_checks WHERE completed_item_id = ? AND status = 'pending'",
        )
        .bind(completed_item_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Whether any check for this item failed terminally.
    pub async fn has_failed_check_for_item(&self, completed_item_id: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM deferred_article_checks WHERE completed_item_id = ? AND status = 'failed'",
        )
        .bind(completed_item_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }
}
