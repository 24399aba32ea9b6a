//! Verify stage (§4.5.3): STATs every posted article against the verify
//! pool, fanned out the same way as the post stage, and reports which
//! articles (if any) must be partially reposted.

use crate::error::Result;
use crate::pool::PoolManager;
use crate::types::Article;

use futures::stream::{self, StreamExt};

/// Outcome of one verification pass over a file's articles.
pub(super) enum VerifyOutcome {
    /// Every article STATed successfully
    AllVerified,
    /// These articles did not STAT and must be reposted
    SomeFailed(Vec<Article>),
}

pub(super) async fn run_verify_stage(
    articles: &[Article],
    pool: &PoolManager,
    parallelism: usize,
) -> Result<VerifyOutcome> {
    let results: Vec<Result<(Article, bool)>> = stream::iter(articles.iter().cloned())
        .map(|article| async move {
            let found = pool.stat(&article.message_id, &article.newsgroups).await?;
            Ok((article, found))
        })
        .buffer_unordered(parallelism.max(1))
        .collect()
        .await;

    let mut failed = Vec::new();
    for result in results {
        let (article, found) = result?;
        if !found {
            failed.push(article);
        }
    }

    if failed.is_empty() {
        Ok(VerifyOutcome::AllVerified)
    } else {
        Ok(VerifyOutcome::SomeFailed(failed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[tokio::test]
    async fn verify_stage_propagates_pool_errors_when_no_providers_configured() {
        // Neither role has any servers, so the pool's upload/verify fallback
        // (§4.2) has nothing to fall back to and `stat` still errors.
        let pool = PoolManager::new(&Config::default()).await.unwrap();
        let article = Article {
            message_id: "<a@x>".to_string(),
            subject: "s".to_string(),
            from: "f".to_string(),
            newsgroups: vec!["alt.binaries.test".to_string()],
            part_number: 1,
            total_parts: 1,
            file_name: "f.bin".to_string(),
            original_name: "f.bin".to_string(),
            file_size: 10,
            offset: 0,
            part_size: 10,
            date: chrono::Utc::now(),
            x_nxg: None,
            custom_headers: std::collections::HashMap::new(),
            content_hash: None,
            part_type: crate::types::PartType::Data,
        };

        let result = run_verify_stage(&[article], &pool, 2).await;
        assert!(result.is_err());
    }
}
