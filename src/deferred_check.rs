//! Deferred article check worker (C7, §4.7): a background loop that
//! periodically re-STATs articles whose verification was deferred at job
//! completion, retrying with exponential backoff and rolling each
//! completed item's aggregate verification status forward once its checks
//! resolve.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::PostCheckConfig;
use crate::pool::PoolManager;
use crate::queue::Queue;
use crate::types::VerificationStatus;

/// How many due checks are pulled per tick.
const CHECK_BATCH: i64 = 50;

/// Background worker driving `deferred_article_checks` to resolution.
pub struct DeferredCheckWorker {
    queue: Arc<Queue>,
    pool: Arc<PoolManager>,
    config: PostCheckConfig,
}

impl DeferredCheckWorker {
    /// Construct a worker over `queue`, STATing through `pool`'s verify role.
    pub fn new(queue: Arc<Queue>, pool: Arc<PoolManager>, config: PostCheckConfig) -> Self {
        Self { queue, pool, config }
    }

    /// Run the tick loop until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.deferred_check_interval) => {
                    if let Err(e) = self.run_once().await {
                        tracing::warn!(error = %e, "deferred check tick failed");
                    }
                }
            }
        }
    }

    /// Process one batch of due checks. Exposed separately from `run` so
    /// tests and one-shot callers (e.g. a CLI `--check-now` flag) don't need
    /// to spin up the tick loop.
    pub async fn run_once(&self) -> crate::error::Result<()> {
        let due = self.queue.get_articles_for_check(CHECK_BATCH).await?;
        if due.is_empty() {
            return Ok(());
        }

        for check in due {
            self.process_check(check).await?;
        }
        Ok(())
    }

    async fn process_check(&self, check: crate::types::DeferredArticleCheck) -> crate::error::Result<()> {
        let found = match self.pool.stat(&check.message_id, &check.newsgroups).await {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!(check_id = %check.id, error = %e, "deferred STAT failed, treating as not found");
                false
            }
        };

        if found {
            self.queue.mark_article_verified(&check.id).await?;
        } else {
            let next_retry_count = check.retry_count + 1;
            if next_retry_count >= self.config.deferred_max_retries {
                self.queue.mark_article_check_failed(&check.id).await?;
            } else {
                let backoff = exponential_backoff(
                    self.config.deferred_check_delay,
                    next_retry_count,
                    self.config.deferred_max_backoff,
                );
                self.queue
                    .update_article_check_retry(&check.id, chrono::Utc::now() + backoff)
                    .await?;
            }
        }

        self.finalize_item_if_resolved(&check.completed_item_id).await
    }

    /// Once no pending checks remain for an item, roll its aggregate
    /// verification status forward: `verification_failed` if any check
    /// failed, `verified` otherwise.
    async fn finalize_item_if_resolved(&self, completed_item_id: &str) -> crate::error::Result<()> {
        let pending = self.queue.get_pending_check_count_for_item(completed_item_id).await?;
        if pending > 0 {
            return Ok(());
        }

        let status = if self.queue.has_failed_check_for_item(completed_item_id).await? {
            VerificationStatus::VerificationFailed
        } else {
            VerificationStatus::Verified
        };

        self.queue
            .update_completed_item_verification_status(completed_item_id, status)
            .await
    }
}

/// `min(initial_delay * 2^retry_count, max_backoff)` (§4.7).
fn exponential_backoff(initial_delay: Duration, retry_count: u32, max_backoff: Duration) -> chrono::Duration {
    let scaled = initial_delay.saturating_mul(1u32.checked_shl(retry_count.min(31)).unwrap_or(u32::MAX));
    let capped = scaled.min(max_backoff);
    chrono::Duration::from_std(capped).unwrap_or_else(|_| chrono::Duration::seconds(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn backoff_doubles_and_caps() {
        let initial = Duration::from_secs(5);
        let max = Duration::from_secs(60);
        assert_eq!(exponential_backoff(initial, 0, max), chrono::Duration::seconds(5));
        assert_eq!(exponential_backoff(initial, 1, max), chrono::Duration::seconds(10));
        assert_eq!(exponential_backoff(initial, 2, max), chrono::Duration::seconds(20));
        assert_eq!(exponential_backoff(initial, 10, max), chrono::Duration::seconds(60));
    }

    #[tokio::test]
    async fn run_once_is_a_no_op_when_nothing_is_due() {
        let config = Config::default();
        let queue = Arc::new(Queue::open_in_memory().await.unwrap());
        let pool = Arc::new(PoolManager::new(&config).await.unwrap());
        let worker = DeferredCheckWorker::new(queue, pool, config.post_check);

        assert!(worker.run_once().await.is_ok());
    }

    #[tokio::test]
    async fn failed_stat_past_max_retries_marks_check_and_item_failed() {
        let mut config = Config::default();
        config.post_check.deferred_max_retries = 1;
        let queue = Arc::new(Queue::open_in_memory().await.unwrap());
        let pool = Arc::new(PoolManager::new(&config).await.unwrap());

        let job = crate::types::FileJob::new(
            std::path::PathBuf::from("/tmp/f.bin"),
            10,
            crate::types::Priority::NORMAL,
        );
        let id = queue
            .add_file_with_priority(job.path.clone(), job.size, job.priority)
            .await
            .unwrap();
        let (_message, _job) = queue.receive_file(Duration::from_secs(60)).await.unwrap().unwrap();
        let completed = queue
            .complete_file(&id, std::path::Path::new("/tmp/f.nzb"))
            .await
            .unwrap();
        queue
            .add_article_check(&completed.id, "<a@x>", &["alt.binaries.test".to_string()], chrono::Utc::now())
            .await
            .unwrap();

        let worker = DeferredCheckWorker::new(Arc::clone(&queue), pool, config.post_check);
        worker.run_once().await.unwrap();

        assert!(queue.has_failed_check_for_item(&completed.id).await.unwrap());
        assert_eq!(
            queue.get_pending_check_count_for_item(&completed.id).await.unwrap(),
            0
        );
    }
}
