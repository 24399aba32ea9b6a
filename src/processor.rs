//! Queue processor (C6, §4.6): drains the durable queue with bounded
//! concurrency, running each leased job through PAR2 generation (if
//! configured), the poster, and completion/retry bookkeeping.
//!
//! Structured after the teacher's `queue_processor`: a semaphore caps
//! concurrent jobs, each leased job is tracked in a `running_jobs` map keyed
//! by message id so it can be cancelled externally, and the drain loop polls
//! on a fixed tick rather than a tight spin when the queue is empty.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::Result;
use crate::par2::Par2Invoker;
use crate::pool::PoolManager;
use crate::poster::Poster;
use crate::queue::Queue;
use crate::types::{NullProgressSink, ProgressSink, VerificationStatus};

/// How long a lease is held before it must be renewed; posting a large file
/// can easily outlive a short lease, so the processor renews it periodically
/// via `Queue::extend_timeout` rather than taking one long lease up front.
const LEASE_DURATION: Duration = Duration::from_secs(60 * 30);

struct RunningJob {
    cancel: CancellationToken,
    path: PathBuf,
}

/// Bounded-concurrency drain loop over the durable queue.
pub struct Processor {
    queue: Arc<Queue>,
    pool: Arc<PoolManager>,
    config: Config,
    par2: Option<Par2Invoker>,
    progress: Arc<dyn ProgressSink>,
    semaphore: Arc<Semaphore>,
    running_jobs: Arc<Mutex<HashMap<String, RunningJob>>>,
    paused: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

impl Processor {
    /// Construct a processor over `queue`, posting through `pool` per
    /// `config`. Resolves a `par2` binary from `PATH` when PAR2 generation is
    /// enabled; the processor does not fetch one itself (see [`Par2Invoker`]).
    pub fn new(config: Config, queue: Arc<Queue>, pool: Arc<PoolManager>) -> Self {
        let par2 = if config.par2.enabled {
            Par2Invoker::from_path()
        } else {
            None
        };

        Self {
            queue,
            pool,
            config,
            par2,
            progress: Arc::new(NullProgressSink),
            semaphore: Arc::new(Semaphore::new(0)),
            running_jobs: Arc::new(Mutex::new(HashMap::new())),
            paused: Arc::new(AtomicBool::new(false)),
            shutdown: CancellationToken::new(),
        }
    }

    /// Attach a progress sink shared by every job's poster.
    #[must_use]
    pub fn with_progress_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress = sink;
        self
    }

    /// Start the drain loop. Returns a handle; drop or await it after calling
    /// [`Processor::shutdown`] to wait for in-flight jobs to finish.
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        self.semaphore.add_permits(self.config.queue.max_concurrent_uploads);
        let this = Arc::clone(self);

        tokio::spawn(async move {
            loop {
                if this.shutdown.is_cancelled() {
                    break;
                }

                if this.paused.load(Ordering::SeqCst) {
                    tokio::time::sleep(this.config.queue.tick_interval).await;
                    continue;
                }

                let permit = tokio::select! {
                    permit = this.semaphore.clone().acquire_owned() => {
                        match permit {
                            Ok(p) => p,
                            Err(_) => break,
                        }
                    }
                    _ = this.shutdown.cancelled() => break,
                };

                match this.queue.receive_file(LEASE_DURATION).await {
                    Ok(Some((message, job))) => {
                        let this = Arc::clone(&this);
                        tokio::spawn(async move {
                            let _permit = permit;
                            this.run_leased_job(message.id, job).await;
                        });
                    }
                    Ok(None) => {
                        drop(permit);
                        tokio::time::sleep(this.config.queue.tick_interval).await;
                    }
                    Err(e) => {
                        drop(permit);
                        tracing::warn!(error = %e, "failed to receive from queue");
                        tokio::time::sleep(this.config.queue.tick_interval).await;
                    }
                }
            }
        })
    }

    /// Signal the drain loop to stop accepting new jobs. In-flight jobs are
    /// left to complete; cancel them individually via [`Processor::cancel_job`]
    /// if an immediate stop is required.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Stop leasing new jobs without disturbing in-flight ones.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    /// Resume leasing new jobs after [`Processor::pause`].
    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    /// Cancel a specific in-flight job by its queue message id. Returns
    /// `false` if no job with that id is currently running.
    pub async fn cancel_job(&self, message_id: &str) -> bool {
        let jobs = self.running_jobs.lock().await;
        match jobs.get(message_id) {
            Some(running) => {
                running.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Whether any in-flight job is currently posting the given source path.
    pub async fn is_path_being_processed(&self, path: &Path) -> bool {
        let jobs = self.running_jobs.lock().await;
        jobs.values().any(|running| running.path == path)
    }

    async fn run_leased_job(&self, message_id: String, job: crate::types::FileJob) {
        let cancel = CancellationToken::new();
        {
            let mut jobs = self.running_jobs.lock().await;
            jobs.insert(
                message_id.clone(),
                RunningJob { cancel: cancel.clone(), path: job.path.clone() },
            );
        }

        let keepalive_cancel = CancellationToken::new();
        let keepalive_handle = self.spawn_keepalive(message_id.clone(), keepalive_cancel.clone());

        let result = self.process_one(&message_id, &job, cancel).await;

        keepalive_cancel.cancel();
        let _ = keepalive_handle.await;
        self.running_jobs.lock().await.remove(&message_id);

        if let Err(e) = result {
            self.handle_failure(&message_id, &job, &e).await;
        }
    }

    fn spawn_keepalive(
        &self,
        message_id: String,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let queue = Arc::clone(&self.queue);
        let interval = LEASE_DURATION / 2;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        if let Err(e) = queue.extend_timeout(&message_id, LEASE_DURATION).await {
                            tracing::warn!(message_id, error = %e, "failed to extend lease");
                        }
                    }
                }
            }
        })
    }

    async fn process_one(
        &self,
        message_id: &str,
        job: &crate::types::FileJob,
        cancel: CancellationToken,
    ) -> Result<()> {
        let par2_files = self.generate_par2(job).await?;

        let poster = Poster::new(
            Arc::clone(&self.pool),
            self.config.posting.clone(),
            self.config.post_check.clone(),
        )
        .with_progress_sink(Arc::clone(&self.progress));

        let outcome = poster
            .post(
                job,
                std::slice::from_ref(&job.path),
                &par2_files,
                &self.config.output_dir,
                &self.config.nzb_compression,
                cancel,
            )
            .await;

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                self.cleanup_par2(&par2_files);
                return Err(e);
            }
        };

        let completed = self.queue.complete_file(message_id, &outcome.nzb_path).await?;

        if !outcome.deferred_checks.is_empty() {
            let due = chrono::Utc::now()
                + chrono::Duration::from_std(self.config.post_check.deferred_check_delay)
                    .unwrap_or_default();
            for check in &outcome.deferred_checks {
                self.queue
                    .add_article_check(&completed.id, &check.message_id, &check.newsgroups, due)
                    .await?;
            }
            self.queue
                .update_completed_item_verification_status(&completed.id, VerificationStatus::Pending)
                .await?;
        }

        self.cleanup_par2(&par2_files);
        Ok(())
    }

    async fn generate_par2(&self, job: &crate::types::FileJob) -> Result<Vec<PathBuf>> {
        if !self.config.par2.enabled {
            return Ok(Vec::new());
        }
        let Some(invoker) = &self.par2 else {
            return Err(crate::error::Error::ExternalTool(
                "par2 generation enabled but no par2 binary found on PATH".to_string(),
            ));
        };
        invoker
            .create_redundancy_set(std::slice::from_ref(&job.path), &self.config.par2)
            .await
    }

    fn cleanup_par2(&self, par2_files: &[PathBuf]) {
        if self.config.par2.maintain_par2_files {
            return;
        }
        for file in par2_files {
            if let Err(e) = std::fs::remove_file(file) {
                tracing::warn!(path = %file.display(), error = %e, "failed to remove par2 file");
            }
        }
    }

    async fn handle_failure(&self, message_id: &str, job: &crate::types::FileJob, error: &crate::error::Error) {
        if matches!(
            error,
            crate::error::Error::Post(crate::error::PostError::Cancelled)
        ) {
            // Leave the in-progress shadow row exactly as `receive_file` left
            // it; crash-recovery reconciliation (not this handler) is what
            // turns it back into a pending job.
            tracing::info!(message_id, "job cancelled, leaving in-progress row for crash recovery");
            return;
        }

        tracing::warn!(message_id, path = %job.path.display(), error = %error, "job attempt failed");

        if job.retry_count + 1 < self.config.posting.max_retries {
            if let Err(e) = self.queue.readd_job(message_id).await {
                tracing::error!(message_id, error = %e, "failed to re-add job for retry");
            }
        } else if let Err(e) = self
            .queue
            .mark_as_error(message_id, &error.to_string())
            .await
        {
            tracing::error!(message_id, error = %e, "failed to park exhausted job");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.queue.database_path = PathBuf::from(":memory:");
        config.posting.groups = vec!["alt.binaries.test".to_string()];
        config
    }

    #[tokio::test]
    async fn pause_resume_toggle_the_flag() {
        let config = test_config();
        let queue = Arc::new(Queue::open_in_memory().await.unwrap());
        let pool = Arc::new(PoolManager::new(&config).await.unwrap());
        let processor = Processor::new(config, queue, pool);

        assert!(!processor.paused.load(Ordering::SeqCst));
        processor.pause();
        assert!(processor.paused.load(Ordering::SeqCst));
        processor.resume();
        assert!(!processor.paused.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn cancel_job_returns_false_for_unknown_id() {
        let config = test_config();
        let queue = Arc::new(Queue::open_in_memory().await.unwrap());
        let pool = Arc::new(PoolManager::new(&config).await.unwrap());
        let processor = Processor::new(config, queue, pool);

        assert!(!processor.cancel_job("does-not-exist").await);
    }

    #[tokio::test]
    async fn is_path_being_processed_false_when_idle() {
        let config = test_config();
        let queue = Arc::new(Queue::open_in_memory().await.unwrap());
        let pool = Arc::new(PoolManager::new(&config).await.unwrap());
        let processor = Processor::new(config, queue, pool);

        assert!(!processor.is_path_being_processed(Path::new("/tmp/anything")).await);
    }

    #[tokio::test]
    async fn failed_job_under_retry_limit_is_readded_with_incremented_retry_count() {
        let config = test_config();
        let queue = Arc::new(Queue::open_in_memory().await.unwrap());
        let pool = Arc::new(PoolManager::new(&config).await.unwrap());
        let processor = Processor::new(config, Arc::clone(&queue), pool);

        let id = queue
            .add_file(PathBuf::from("/tmp/movie.mkv"), 1_000)
            .await
            .unwrap();
        let (_message, job) = queue.receive_file(Duration::from_secs(60)).await.unwrap().unwrap();

        processor
            .handle_failure(
                &id,
                &job,
                &crate::error::Error::Post(crate::error::PostError::Upload {
                    message_id: "<a@x>".to_string(),
                    reason: "connection reset".to_string(),
                }),
            )
            .await;

        let stats = queue.get_queue_stats().await.unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.errored, 0);
    }

    #[tokio::test]
    async fn failed_job_at_retry_limit_is_parked_as_errored() {
        let mut config = test_config();
        config.posting.max_retries = 1;
        let queue = Arc::new(Queue::open_in_memory().await.unwrap());
        let pool = Arc::new(PoolManager::new(&config).await.unwrap());
        let processor = Processor::new(config, Arc::clone(&queue), pool);

        let id = queue
            .add_file(PathBuf::from("/tmp/movie.mkv"), 1_000)
            .await
            .unwrap();
        let (_message, job) = queue.receive_file(Duration::from_secs(60)).await.unwrap().unwrap();
        assert_eq!(job.retry_count, 0);

        processor
            .handle_failure(
                &id,
                &job,
                &crate::error::Error::Post(crate::error::PostError::Upload {
                    message_id: "<a@x>".to_string(),
                    reason: "connection reset".to_string(),
                }),
            )
            .await;

        let stats = queue.get_queue_stats().await.unwrap();
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.errored, 1);
    }
}
