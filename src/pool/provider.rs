//! One provider's `nntp_rs::NntpPool`, wrapped with the metadata the pool
//! manager needs for role-aware selection and metrics reporting.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::types::ProviderRole;

/// Adapts one configured provider into an `nntp_rs` connection pool.
pub(super) struct ProviderPool {
    host: String,
    role: ProviderRole,
    enabled: bool,
    max_connections: u32,
    acquired: AtomicU32,
    pool: nntp_rs::NntpPool,
}

impl ProviderPool {
    pub(super) async fn new(config: &ServerConfig, role: ProviderRole) -> Result<Self> {
        let nntp_config: nntp_rs::ServerConfig = config.clone().into();
        let pool = nntp_rs::NntpPool::new(nntp_config, config.max_connections)
            .await
            .map_err(|e| Error::Nntp(format!("failed to create pool for {}: {e}", config.host)))?;

        Ok(Self {
            host: config.host.clone(),
            role,
            enabled: config.enabled,
            max_connections: config.max_connections,
            acquired: AtomicU32::new(0),
            pool,
        })
    }

    pub(super) fn host(&self) -> &str {
        &self.host
    }

    pub(super) fn role(&self) -> ProviderRole {
        self.role
    }

    pub(super) fn enabled(&self) -> bool {
        self.enabled
    }

    pub(super) fn max_connections(&self) -> u32 {
        self.max_connections
    }

    pub(super) fn connection_counts(&self) -> (u32, u32) {
        let acquired = self.acquired.load(Ordering::Relaxed);
        (acquired, self.max_connections.saturating_sub(acquired))
    }

    /// POST one fully-encoded article over a connection from this provider.
    pub(super) async fn post(&self, article_bytes: &[u8]) -> Result<()> {
        self.acquired.fetch_add(1, Ordering::Relaxed);
        let result = async {
            let mut conn = self
                .pool
                .get()
                .await
                .map_err(|e| Error::Nntp(format!("{}: {e}", self.host)))?;
            conn.post_article(article_bytes)
                .await
                .map_err(|e| Error::Nntp(format!("{}: {e}", self.host)))
        }
        .await;
        self.acquired.fetch_sub(1, Ordering::Relaxed);
        result
    }

    /// STAT one message-id against `newsgroups`, returning whether it exists.
    pub(super) async fn stat(&self, message_id: &str, newsgroups: &[String]) -> Result<bool> {
        self.acquired.fetch_add(1, Ordering::Relaxed);
        let result = async {
            let mut conn = self
                .pool
                .get()
                .await
                .map_err(|e| Error::Nntp(format!("{}: {e}", self.host)))?;
            match conn.stat_article(message_id, newsgroups).await {
                Ok(()) => Ok(true),
                Err(nntp_rs::NntpError::NoSuchArticle(_)) => Ok(false),
                Err(nntp_rs::NntpError::Protocol { code: 430, .. }) => Ok(false),
                Err(e) => Err(Error::Nntp(format!("{}: {e}", self.host))),
            }
        }
        .await;
        self.acquired.fetch_sub(1, Ordering::Relaxed);
        result
    }
}
