//! Poster (C5, §4.5): the per-job two-stage post→verify pipeline.
//!
//! Constructed fresh for each job the processor leases, from the shared
//! [`crate::pool::PoolManager`] and the job's posting/post-check
//! configuration. Fans out article uploads (and, if in-job verification is
//! enabled, STAT probes) with a parallelism bound derived from
//! `available_parallelism`, generalizing the teacher's download-side
//! batch-fetch fan-out to read-encode-post-verify.

mod post_stage;
mod verify_stage;

use crate::codec::{self, ArticleParams};
use crate::config::{PostCheckConfig, PostingConfig};
use crate::error::{Error, PostError, Result};
use crate::nzb::NzbAccumulator;
use crate::pool::PoolManager;
use crate::throttle::Throttle;
use crate::types::{Article, FileJob, NullProgressSink, PartType, PostStatus, ProgressSink};

use rand::seq::SliceRandom;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use post_stage::PostStageContext;
use verify_stage::VerifyOutcome;

/// One article-check the processor must register with the queue (C4) after
/// `CompleteFile` succeeds — deferred checks reference `completed_item_id`,
/// which only exists once the completed-items row has been inserted (§6 FK).
#[derive(Clone, Debug)]
pub struct DeferredCheckRequest {
    /// The article's message-id
    pub message_id: String,
    /// Newsgroups to check against
    pub newsgroups: Vec<String>,
}

/// Result of a successful `Poster::post` call (§4.5.5).
pub struct PostOutcome {
    /// Absolute path to the produced NZB file
    pub nzb_path: PathBuf,
    /// Deferred checks to register, one per article, when deferred
    /// verification is configured instead of (or after) in-job verification.
    /// Empty when verification is disabled or ran entirely in-job.
    pub deferred_checks: Vec<DeferredCheckRequest>,
}

/// Per-file posting state (§3 `PostAggregate`). The status lock is never
/// held across I/O (§5); `articles` holds the stable, fully-built article
/// descriptors for the file, mutated only to refresh `content_hash` on
/// (re)post.
struct PostAggregate {
    path: PathBuf,
    status: Mutex<PostStatus>,
    retry_count: AtomicU32,
    articles: Mutex<Vec<Article>>,
}

impl PostAggregate {
    async fn merge_posted(&self, posted: Vec<Article>) {
        let mut articles = self.articles.lock().await;
        for updated in posted {
            if let Some(slot) = articles.iter_mut().find(|a| a.message_id == updated.message_id) {
                slot.content_hash = updated.content_hash;
            }
        }
    }

    async fn snapshot(&self) -> Vec<Article> {
        self.articles.lock().await.clone()
    }
}

/// Per-job posting/verification pipeline.
pub struct Poster {
    pool: Arc<PoolManager>,
    throttle: Throttle,
    posting: PostingConfig,
    post_check: PostCheckConfig,
    progress: Arc<dyn ProgressSink>,
}

impl Poster {
    /// Construct a poster for one job, sharing the given connection pool.
    pub fn new(
        pool: Arc<PoolManager>,
        posting: PostingConfig,
        post_check: PostCheckConfig,
    ) -> Self {
        let throttle = Throttle::new(posting.throttle_rate);
        Self {
            pool,
            throttle,
            posting,
            post_check,
            progress: Arc::new(NullProgressSink),
        }
    }

    /// Attach a progress sink; replaces the default no-op sink.
    #[must_use]
    pub fn with_progress_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress = sink;
        self
    }

    /// Post `data_files` (obfuscated per `posting.obfuscation_policy`) and
    /// `par2_files` (obfuscated per `posting.par2_obfuscation_policy`,
    /// tagged [`PartType::Par2`]), accumulate their articles into an NZB,
    /// and write it to `{output_dir}/{basename}.nzb` (§4.5.5).
    pub async fn post(
        &self,
        job: &FileJob,
        data_files: &[PathBuf],
        par2_files: &[PathBuf],
        output_dir: &Path,
        nzb_compression: &crate::config::NzbCompressionConfig,
        cancel: CancellationToken,
    ) -> Result<PostOutcome> {
        if data_files.is_empty() && par2_files.is_empty() {
            return Err(Error::Post(PostError::FileOpen {
                path: job.path.clone(),
                reason: "no files to post".to_string(),
            }));
        }

        let total_files = data_files.len() + par2_files.len();
        let mut aggregates = Vec::with_capacity(total_files);
        for (file_no, path) in data_files.iter().enumerate() {
            aggregates.push(self.build_aggregate(path, PartType::Data, file_no as u32 + 1, total_files as u32)?);
        }
        for (file_no, path) in par2_files.iter().enumerate() {
            aggregates.push(self.build_aggregate(
                path,
                PartType::Par2,
                (data_files.len() + file_no) as u32 + 1,
                total_files as u32,
            )?);
        }

        let parallelism = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4);
        let mut nzb = NzbAccumulator::new();
        let mut deferred_checks = Vec::new();

        for aggregate in &aggregates {
            self.run_file(aggregate, parallelism, &cancel, &mut nzb, &mut deferred_checks)
                .await?;
        }

        let basename = job
            .path
            .file_stem()
            .and_then(|s| s.to_str())
            .map(str::to_string)
            .unwrap_or_else(|| job.path.to_string_lossy().to_string());
        let nzb_path = nzb.finalize(output_dir, &basename, nzb_compression)?;

        Ok(PostOutcome { nzb_path, deferred_checks })
    }

    fn build_aggregate(
        &self,
        path: &Path,
        part_type: PartType,
        file_no: u32,
        total_files: u32,
    ) -> Result<PostAggregate> {
        let metadata = std::fs::metadata(path).map_err(|e| {
            Error::Post(PostError::FileOpen {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })
        })?;
        let file_size = metadata.len();
        let articles = self.build_file_articles(path, part_type, file_size, file_no, total_files)?;

        Ok(PostAggregate {
            path: path.to_path_buf(),
            status: Mutex::new(PostStatus::Pending),
            retry_count: AtomicU32::new(0),
            articles: Mutex::new(articles),
        })
    }

    /// Splits the file into `article_size_in_bytes`-sized parts and builds a
    /// stable `Article` descriptor for each, selecting the group list per
    /// `group_policy` once per file (§4.5.2).
    fn build_file_articles(
        &self,
        path: &Path,
        part_type: PartType,
        file_size: u64,
        file_no: u32,
        total_files: u32,
    ) -> Result<Vec<Article>> {
        let article_size = self.posting.article_size_in_bytes.max(1);
        let total_parts = file_size.div_ceil(article_size).max(1) as u32;
        let original_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("file")
            .to_string();

        let newsgroups = self.select_newsgroups();
        let obfuscation_policy = match part_type {
            PartType::Data => self.posting.obfuscation_policy,
            PartType::Par2 => self.posting.par2_obfuscation_policy,
        };
        let nxg_header = derive_nxg_header(path, file_size);
        let headers = &self.posting.post_headers;

        let mut articles = Vec::with_capacity(total_parts as usize);
        for part_number in 1..=total_parts {
            let offset = (part_number as u64 - 1) * article_size;
            let part_size = (file_size - offset).min(article_size);

            let article = codec::build_article(ArticleParams {
                file_no,
                total_files,
                original_name: original_name.clone(),
                part_number,
                total_parts,
                file_size,
                offset,
                part_size,
                newsgroups: newsgroups.clone(),
                part_type,
                obfuscation_policy,
                message_id_format: self.posting.message_id_format,
                nxg_header: Some(nxg_header.clone()),
                add_ngx_header: headers.add_ngx_header,
                custom_headers: headers.custom_headers.iter().cloned().collect(),
                default_from: headers.default_from.clone(),
            })?;
            articles.push(article);
        }

        Ok(articles)
    }

    fn select_newsgroups(&self) -> Vec<String> {
        match self.posting.group_policy {
            crate::types::GroupPolicy::All => self.posting.groups.clone(),
            crate::types::GroupPolicy::EachFile => self
                .posting
                .groups
                .choose(&mut rand::thread_rng())
                .cloned()
                .map(|g| vec![g])
                .unwrap_or_default(),
        }
    }

    async fn run_file(
        &self,
        aggregate: &PostAggregate,
        parallelism: usize,
        cancel: &CancellationToken,
        nzb: &mut NzbAccumulator,
        deferred_checks: &mut Vec<DeferredCheckRequest>,
    ) -> Result<()> {
        let mut to_post = aggregate.snapshot().await;

        loop {
            if cancel.is_cancelled() {
                *aggregate.status.lock().await = PostStatus::Cancelled;
                return Err(Error::Post(PostError::Cancelled));
            }

            let ctx = PostStageContext {
                path: &aggregate.path,
                pool: self.pool.as_ref(),
                throttle: &self.throttle,
                progress: self.progress.as_ref(),
                cancel,
                parallelism,
                max_retries: self.posting.max_retries,
                retry_delay: self.posting.retry_delay,
            };
            let posted = match post_stage::run_post_stage(to_post, &ctx).await {
                Ok(posted) => posted,
                Err(Error::Post(PostError::Cancelled)) => {
                    *aggregate.status.lock().await = PostStatus::Cancelled;
                    return Err(Error::Post(PostError::Cancelled));
                }
                Err(e) => {
                    *aggregate.status.lock().await = PostStatus::Failed;
                    return Err(e);
                }
            };
            aggregate.merge_posted(posted).await;

            if !self.post_check.enabled {
                *aggregate.status.lock().await = PostStatus::Posted;
                return self.finish_file(aggregate, nzb).await;
            }

            if self.post_check.deferred_check {
                *aggregate.status.lock().await = PostStatus::Posted;
                self.finish_file(aggregate, nzb).await?;
                let snapshot = aggregate.snapshot().await;
                deferred_checks.extend(snapshot.iter().map(|a| DeferredCheckRequest {
                    message_id: a.message_id.clone(),
                    newsgroups: a.newsgroups.clone(),
                }));
                return Ok(());
            }

            if !self.post_check.delay.is_zero() {
                tokio::time::sleep(self.post_check.delay).await;
            }

            let snapshot = aggregate.snapshot().await;
            match verify_stage::run_verify_stage(&snapshot, self.pool.as_ref(), parallelism).await? {
                VerifyOutcome::AllVerified => {
                    *aggregate.status.lock().await = PostStatus::Verified;
                    return self.finish_file(aggregate, nzb).await;
                }
                VerifyOutcome::SomeFailed(failed) => {
                    let previous_retries = aggregate.retry_count.fetch_add(1, Ordering::SeqCst);
                    if previous_retries >= self.post_check.max_reposts {
                        *aggregate.status.lock().await = PostStatus::Failed;
                        return Err(Error::Post(PostError::VerifyExhausted {
                            path: aggregate.path.clone(),
                            attempts: previous_retries + 1,
                        }));
                    }
                    to_post = failed;
                }
            }
        }
    }

    async fn finish_file(&self, aggregate: &PostAggregate, nzb: &mut NzbAccumulator) -> Result<()> {
        let articles = aggregate.snapshot().await;
        let original_name = aggregate
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("file")
            .to_string();

        let mut hasher = Sha256::new();
        for article in &articles {
            nzb.add_article(article);
            if let Some(hash) = &article.content_hash {
                hasher.update(hash.as_bytes());
            }
        }
        nzb.add_file_hash(&original_name, format!("{:x}", hasher.finalize()));
        Ok(())
    }
}

/// Deterministic per-file nxg header for `message_id_format = ngx`, stable
/// across retries and process restarts since it derives only from the
/// file's identity, not from any random state.
fn derive_nxg_header(path: &Path, file_size: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.to_string_lossy().as_bytes());
    hasher.update(file_size.to_be_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, PostCheckConfig, PostingConfig};
    use crate::pool::PoolManager;
    use std::io::Write;

    async fn no_provider_poster(posting: PostingConfig, post_check: PostCheckConfig) -> Poster {
        let pool = Arc::new(PoolManager::new(&Config::default()).await.unwrap());
        Poster::new(pool, posting, post_check)
    }

    fn write_temp_file(bytes: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(bytes).unwrap();
        file.flush().unwrap();
        file
    }

    #[tokio::test]
    async fn build_file_articles_splits_by_article_size() {
        let mut posting = PostingConfig::default();
        posting.article_size_in_bytes = 750_000;
        posting.groups = vec!["alt.binaries.test".to_string()];
        let poster = no_provider_poster(posting, PostCheckConfig::default()).await;

        let body = vec![0u8; 2_250_000];
        let file = write_temp_file(&body);
        let articles = poster
            .build_file_articles(file.path(), PartType::Data, 2_250_000, 1, 1)
            .unwrap();

        assert_eq!(articles.len(), 3);
        assert_eq!(articles[0].part_number, 1);
        assert_eq!(articles[2].part_size, 750_000);
        let ids: std::collections::HashSet<_> = articles.iter().map(|a| &a.message_id).collect();
        assert_eq!(ids.len(), 3);
    }

    #[tokio::test]
    async fn each_file_group_policy_applies_same_group_to_every_article() {
        let mut posting = PostingConfig::default();
        posting.article_size_in_bytes = 500_000;
        posting.groups = vec!["a.b".to_string(), "a.c".to_string(), "a.d".to_string()];
        posting.group_policy = crate::types::GroupPolicy::EachFile;
        let poster = no_provider_poster(posting, PostCheckConfig::default()).await;

        let body = vec![0u8; 1_500_000];
        let file = write_temp_file(&body);
        let articles = poster
            .build_file_articles(file.path(), PartType::Data, 1_500_000, 1, 1)
            .unwrap();

        let first = &articles[0].newsgroups;
        assert_eq!(first.len(), 1);
        assert!(articles.iter().all(|a| &a.newsgroups == first));
    }

    #[tokio::test]
    async fn post_with_no_providers_fails_with_upload_error() {
        let mut posting = PostingConfig::default();
        posting.article_size_in_bytes = 750_000;
        posting.groups = vec!["alt.binaries.test".to_string()];
        posting.max_retries = 0;
        let poster = no_provider_poster(posting, PostCheckConfig::default()).await;

        let body = vec![0u8; 750_000];
        let file = write_temp_file(&body);
        let job = FileJob::new(file.path().to_path_buf(), 750_000, crate::types::Priority::NORMAL);
        let out_dir = tempfile::tempdir().unwrap();

        let result = poster
            .post(
                &job,
                &[file.path().to_path_buf()],
                &[],
                out_dir.path(),
                &crate::config::NzbCompressionConfig::default(),
                CancellationToken::new(),
            )
            .await;
        assert!(matches!(result, Err(Error::Post(PostError::Upload { .. }))));
    }
}
