//! Post stage (§4.5.3): reads each article's file part, encodes it, and
//! uploads it via the shared pool, fanned out with bounded concurrency —
//! the posting-direction analogue of the teacher's batched article
//! download fan-out.

use crate::codec;
use crate::error::{Error, PostError, Result};
use crate::pool::PoolManager;
use crate::throttle::Throttle;
use crate::types::{Article, ProgressSink, ProgressUpdate, Stage};

use futures::stream::{self, StreamExt};
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub(super) struct PostStageContext<'a> {
    pub(super) path: &'a Path,
    pub(super) pool: &'a PoolManager,
    pub(super) throttle: &'a Throttle,
    pub(super) progress: &'a dyn ProgressSink,
    pub(super) cancel: &'a CancellationToken,
    pub(super) parallelism: usize,
    /// Per-article retry attempts on a transient upload failure, and the
    /// flat delay between them (distinct from the processor's job-level
    /// requeue, which only sees a file as failed once this is exhausted).
    pub(super) max_retries: u32,
    pub(super) retry_delay: Duration,
}

/// Posts every article in `articles`, returning the same articles with
/// `content_hash` filled in. Concurrency is bounded by `ctx.parallelism`.
pub(super) async fn run_post_stage(
    articles: Vec<Article>,
    ctx: &PostStageContext<'_>,
) -> Result<Vec<Article>> {
    let total_bytes: u64 = articles.iter().map(|a| a.part_size).sum();
    let total_parts = articles.len();

    let mut stream = stream::iter(articles)
        .map(|article| post_one(article, ctx))
        .buffer_unordered(ctx.parallelism.max(1));

    let mut posted = Vec::with_capacity(total_parts);
    let mut bytes_done = 0u64;
    let mut first_error = None;

    // Poll results as they complete rather than collecting the whole stream
    // first, so the moment one worker fails we can cancel the job context
    // (§4.5.3) while its siblings are still in flight instead of after
    // they've all finished uploading.
    while let Some(result) = stream.next().await {
        match result {
            Ok(article) => {
                if first_error.is_some() {
                    continue;
                }
                bytes_done += article.part_size;
                ctx.progress.on_progress(ProgressUpdate {
                    stage: Stage::Posting,
                    current_bytes: bytes_done,
                    total_bytes,
                    details: article.original_name.clone(),
                    kbps: 0.0,
                    seconds_left: None,
                    elapsed: std::time::Duration::ZERO,
                });
                posted.push(article);
            }
            Err(e) => {
                if first_error.is_none() {
                    ctx.cancel.cancel();
                    first_error = Some(e);
                }
            }
        }
    }

    if let Some(e) = first_error {
        return Err(e);
    }

    Ok(posted)
}

async fn post_one(mut article: Article, ctx: &PostStageContext<'_>) -> Result<Article> {
    if ctx.cancel.is_cancelled() {
        return Err(Error::Post(PostError::Cancelled));
    }

    let body = read_part(ctx.path, article.offset, article.part_size).await?;
    article.content_hash = Some(codec::content_hash(&body));
    let wire = codec::encode(&article, &body)?;

    let mut attempt = 0u32;
    loop {
        ctx.throttle.wait(article.part_size).await;

        if ctx.cancel.is_cancelled() {
            return Err(Error::Post(PostError::Cancelled));
        }

        match ctx.pool.post(&wire).await {
            Ok(()) => return Ok(article),
            Err(e) => {
                attempt += 1;
                if attempt > ctx.max_retries {
                    return Err(Error::Post(PostError::Upload {
                        message_id: article.message_id.clone(),
                        reason: e.to_string(),
                    }));
                }
                tracing::warn!(
                    message_id = %article.message_id,
                    attempt,
                    error = %e,
                    "article upload failed, retrying"
                );
                tokio::time::sleep(ctx.retry_delay).await;
            }
        }
    }
}

/// Reads `len` bytes starting at `offset` from `path`, using positional
/// reads so concurrent parts of the same file never contend on a shared
/// cursor (cross-platform counterpart to the teacher's positional-write
/// `OutputFiles`).
async fn read_part(path: &Path, offset: u64, len: u64) -> Result<Vec<u8>> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
        let file = std::fs::File::open(&path).map_err(|e| {
            Error::Post(PostError::FileOpen {
                path: path.clone(),
                reason: e.to_string(),
            })
        })?;
        let mut buf = vec![0u8; len as usize];
        read_exact_at(&file, &mut buf, offset).map_err(|e| {
            Error::Post(PostError::FileOpen {
                path: path.clone(),
                reason: e.to_string(),
            })
        })?;
        Ok(buf)
    })
    .await
    .map_err(|e| Error::Other(format!("read_part task panicked: {e}")))?
}

#[cfg(unix)]
fn read_exact_at(file: &std::fs::File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &std::fs::File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    let mut read = 0usize;
    while read < buf.len() {
        let n = file.seek_read(&mut buf[read..], offset + read as u64)?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "short read",
            ));
        }
        read += n;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::throttle::Throttle;
    use crate::types::{NullProgressSink, PartType};
    use std::collections::HashMap;
    use std::io::Write;

    fn article(part_number: u32, offset: u64, part_size: u64) -> Article {
        Article {
            message_id: format!("<{part_number}@x>"),
            subject: "subj".to_string(),
            from: "from".to_string(),
            newsgroups: vec!["alt.binaries.test".to_string()],
            part_number,
            total_parts: 3,
            file_name: "file.bin".to_string(),
            original_name: "file.bin".to_string(),
            file_size: 3 * part_size,
            offset,
            part_size,
            date: chrono::Utc::now(),
            x_nxg: None,
            custom_headers: HashMap::new(),
            content_hash: None,
            part_type: PartType::Data,
        }
    }

    #[tokio::test]
    async fn read_part_reads_exact_slice_at_offset() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let data: Vec<u8> = (0..30u8).collect();
        file.write_all(&data).unwrap();
        file.flush().unwrap();

        let part = read_part(file.path(), 10, 5).await.unwrap();
        assert_eq!(part, &data[10..15]);
    }

    #[tokio::test]
    async fn run_post_stage_fails_fast_when_no_providers_configured() {
        let pool = PoolManager::new(&Config::default()).await.unwrap();
        let throttle = Throttle::new(None);
        let cancel = CancellationToken::new();
        let progress = NullProgressSink;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0u8; 10]).unwrap();
        file.flush().unwrap();

        let ctx = PostStageContext {
            path: file.path(),
            pool: &pool,
            throttle: &throttle,
            progress: &progress,
            cancel: &cancel,
            parallelism: 2,
            max_retries: 0,
            retry_delay: Duration::from_millis(1),
        };

        let result = run_post_stage(vec![article(1, 0, 10)], &ctx).await;
        assert!(matches!(result, Err(Error::Post(PostError::Upload { .. }))));
    }
}
