//! NNTP connection pool manager (C2, §4.2).
//!
//! Wraps one `nntp_rs::NntpPool` per configured, enabled provider, split
//! into an upload pool list and a verify pool list by [`ProviderRole`].
//! `UpdateConfig` rebuilds both lists and swaps them in behind a single
//! `RwLock` write (copy-then-swap, §9), so in-flight `post`/`stat` calls on
//! the old state finish undisturbed.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use crate::config::{Config, ServerConfig};
use crate::error::{Error, PoolError, Result};
use crate::types::{PoolMetricsSnapshot, ProviderRole, ProviderState};

mod provider;

use provider::ProviderPool;

/// Shared counters updated by every pool, independent of reconfiguration.
#[derive(Default)]
struct Counters {
    bytes_posted: AtomicU64,
    articles_posted: AtomicU64,
    errors_per_provider: std::sync::Mutex<HashMap<String, u64>>,
    acquire_wait_total_nanos: AtomicU64,
    acquire_wait_samples: AtomicU64,
}

impl Counters {
    fn record_acquire_wait(&self, elapsed: Duration) {
        self.acquire_wait_total_nanos
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
        self.acquire_wait_samples.fetch_add(1, Ordering::Relaxed);
    }

    fn record_error(&self, host: &str) {
        let mut errors = self.errors_per_provider.lock().unwrap_or_else(|e| e.into_inner());
        *errors.entry(host.to_string()).or_insert(0) += 1;
    }

    fn average_acquire_wait(&self) -> Duration {
        let samples = self.acquire_wait_samples.load(Ordering::Relaxed);
        if samples == 0 {
            return Duration::ZERO;
        }
        let total = self.acquire_wait_total_nanos.load(Ordering::Relaxed);
        Duration::from_nanos(total / samples)
    }
}

struct PoolState {
    upload: Vec<ProviderPool>,
    verify: Vec<ProviderPool>,
}

impl PoolState {
    /// Builds both roles' pools, falling back to the other role's server
    /// list when one role has no providers configured at all — "if only one
    /// role is configured, the other returns the same handle" (§4.2).
    async fn build(config: &Config) -> Result<Self> {
        let upload_servers = config.providers_for_role(ProviderRole::Upload);
        let verify_servers = config.providers_for_role(ProviderRole::Verify);
        let (upload_servers, verify_servers) = select_servers(upload_servers, verify_servers);

        let upload = Self::build_from(&upload_servers, ProviderRole::Upload).await?;
        let verify = Self::build_from(&verify_servers, ProviderRole::Verify).await?;
        Ok(Self { upload, verify })
    }

    async fn build_from(servers: &[&ServerConfig], role: ProviderRole) -> Result<Vec<ProviderPool>> {
        let mut pools = Vec::with_capacity(servers.len());
        for server in servers {
            pools.push(ProviderPool::new(server, role).await?);
        }
        Ok(pools)
    }
}

/// When one role's server list is empty and the other isn't, both roles
/// draw from the non-empty list (each `ProviderPool` is still tagged with
/// its own role, independent of which list it was selected from).
fn select_servers<'a>(
    upload: Vec<&'a ServerConfig>,
    verify: Vec<&'a ServerConfig>,
) -> (Vec<&'a ServerConfig>, Vec<&'a ServerConfig>) {
    match (upload.is_empty(), verify.is_empty()) {
        (true, false) => (verify.clone(), verify),
        (false, true) => (upload.clone(), upload),
        _ => (upload, verify),
    }
}

/// Connection pool manager: `GetUploadPool`/`GetVerifyPool` semantics
/// collapsed into `post`/`stat` convenience methods that internally select
/// and fail over across the role's configured providers.
pub struct PoolManager {
    state: RwLock<Arc<PoolState>>,
    counters: Arc<Counters>,
    closed: AtomicBool,
}

impl PoolManager {
    /// Build pools for every enabled provider in `config`.
    pub async fn new(config: &Config) -> Result<Self> {
        let state = PoolState::build(config).await?;
        Ok(Self {
            state: RwLock::new(Arc::new(state)),
            counters: Arc::new(Counters::default()),
            closed: AtomicBool::new(false),
        })
    }

    /// Rebuild provider pools from a new configuration and swap them in.
    /// In-flight `post`/`stat` calls using the previous pool set complete
    /// against their already-acquired connections.
    pub async fn update_config(&self, config: &Config) -> Result<()> {
        self.ensure_open()?;
        let new_state = Arc::new(PoolState::build(config).await?);
        let mut guard = self.state.write().await;
        *guard = new_state;
        Ok(())
    }

    /// POST `article_bytes` via the upload pool, trying providers in
    /// configured order and failing over on a connection-level error.
    pub async fn post(&self, article_bytes: &[u8]) -> Result<()> {
        self.ensure_open()?;
        let state = self.state.read().await.clone();
        if state.upload.is_empty() {
            return Err(Error::Pool(PoolError::NoProvidersForRole(
                "upload".to_string(),
            )));
        }

        let mut last_error = None;
        for provider in &state.upload {
            if !provider.enabled() {
                continue;
            }
            let acquire_start = Instant::now();
            match provider.post(article_bytes).await {
                Ok(()) => {
                    self.counters.record_acquire_wait(acquire_start.elapsed());
                    self.counters
                        .bytes_posted
                        .fetch_add(article_bytes.len() as u64, Ordering::Relaxed);
                    self.counters.articles_posted.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
                Err(e) => {
                    self.counters.record_error(provider.host());
                    tracing::warn!(host = provider.host(), error = %e, "upload failed, trying next provider");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            Error::Pool(PoolError::NoProvidersForRole("upload".to_string()))
        }))
    }

    /// STAT `message_id` on `newsgroups` via the verify pool, returning
    /// whether the article exists. Tries providers in order, failing over
    /// on connection-level errors (not on a definitive "not found").
    pub async fn stat(&self, message_id: &str, newsgroups: &[String]) -> Result<bool> {
        self.ensure_open()?;
        let state = self.state.read().await.clone();
        if state.verify.is_empty() {
            return Err(Error::Pool(PoolError::NoProvidersForRole(
                "verify".to_string(),
            )));
        }

        let mut last_error = None;
        for provider in &state.verify {
            if !provider.enabled() {
                continue;
            }
            let acquire_start = Instant::now();
            match provider.stat(message_id, newsgroups).await {
                Ok(found) => {
                    self.counters.record_acquire_wait(acquire_start.elapsed());
                    return Ok(found);
                }
                Err(e) => {
                    self.counters.record_error(provider.host());
                    tracing::warn!(host = provider.host(), error = %e, "stat failed, trying next provider");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            Error::Pool(PoolError::NoProvidersForRole("verify".to_string()))
        }))
    }

    /// Point-in-time snapshot of pool activity across both roles.
    pub async fn metrics(&self) -> PoolMetricsSnapshot {
        let state = self.state.read().await.clone();
        let mut provider_states = Vec::new();
        let mut active_connections = 0u32;

        for provider in state.upload.iter().chain(state.verify.iter()) {
            let (acquired, idle) = provider.connection_counts();
            active_connections += acquired;
            provider_states.push(ProviderState {
                host: provider.host().to_string(),
                role: provider.role(),
                acquired,
                idle,
                max_connections: provider.max_connections(),
                enabled: provider.enabled(),
            });
        }

        PoolMetricsSnapshot {
            active_connections,
            bytes_posted: self.counters.bytes_posted.load(Ordering::Relaxed),
            articles_posted: self.counters.articles_posted.load(Ordering::Relaxed),
            errors_per_provider: self
                .counters
                .errors_per_provider
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
            average_acquire_wait: self.counters.average_acquire_wait(),
            provider_states,
        }
    }

    /// Mark the pool manager closed; subsequent `post`/`stat`/`update_config`
    /// calls fail with `PoolError::Closed`. Idempotent.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Pool(PoolError::Closed));
        }
        Ok(())
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn config_with_no_servers() -> Config {
        Config::default()
    }

    fn server(host: &str, role: ProviderRole) -> ServerConfig {
        ServerConfig {
            host: host.to_string(),
            port: 119,
            username: None,
            password: None,
            ssl: false,
            insecure_ssl: false,
            max_connections: 1,
            max_connection_idle_time_s: 300,
            max_connection_ttl_s: 3600,
            enabled: true,
            role,
            proxy_url: None,
        }
    }

    #[test]
    fn select_servers_leaves_both_roles_alone_when_both_configured() {
        let upload = server("upload.example.com", ProviderRole::Upload);
        let verify = server("verify.example.com", ProviderRole::Verify);
        let (up, ver) = select_servers(vec![&upload], vec![&verify]);
        assert_eq!(up.len(), 1);
        assert_eq!(up[0].host, "upload.example.com");
        assert_eq!(ver.len(), 1);
        assert_eq!(ver[0].host, "verify.example.com");
    }

    #[test]
    fn select_servers_falls_back_to_upload_list_when_verify_unconfigured() {
        let upload = server("upload.example.com", ProviderRole::Upload);
        let (up, ver) = select_servers(vec![&upload], vec![]);
        assert_eq!(up.len(), 1);
        assert_eq!(ver.len(), 1);
        assert_eq!(ver[0].host, "upload.example.com");
    }

    #[test]
    fn select_servers_falls_back_to_verify_list_when_upload_unconfigured() {
        let verify = server("verify.example.com", ProviderRole::Verify);
        let (up, ver) = select_servers(vec![], vec![&verify]);
        assert_eq!(ver.len(), 1);
        assert_eq!(up.len(), 1);
        assert_eq!(up[0].host, "verify.example.com");
    }

    #[test]
    fn select_servers_stays_empty_when_neither_role_configured() {
        let (up, ver) = select_servers(vec![], vec![]);
        assert!(up.is_empty());
        assert!(ver.is_empty());
    }

    #[tokio::test]
    async fn new_with_no_servers_has_empty_pools() {
        let manager = PoolManager::new(&config_with_no_servers()).await.unwrap();
        let result = manager.post(b"irrelevant").await;
        assert!(matches!(
            result,
            Err(Error::Pool(PoolError::NoProvidersForRole(role))) if role == "upload"
        ));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_rejects_further_calls() {
        let manager = PoolManager::new(&config_with_no_servers()).await.unwrap();
        manager.close();
        manager.close();
        let result = manager.post(b"irrelevant").await;
        assert!(matches!(result, Err(Error::Pool(PoolError::Closed))));
    }

    #[tokio::test]
    async fn metrics_start_at_zero() {
        let manager = PoolManager::new(&config_with_no_servers()).await.unwrap();
        let snapshot = manager.metrics().await;
        assert_eq!(snapshot.active_connections, 0);
        assert_eq!(snapshot.bytes_posted, 0);
        assert_eq!(snapshot.articles_posted, 0);
    }
}
