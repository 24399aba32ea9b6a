//! # usenet-poster
//!
//! High-throughput binary poster for Usenet/NNTP: a durable SQLite-backed
//! job queue, a bounded-concurrency processor that drains it, a two-stage
//! post-then-verify article pipeline, a multi-server connection pool with
//! failover, and a background worker that resolves deferred post-checks.
//!
//! ## Design Philosophy
//!
//! - **Durable** — queued jobs, completed items, and deferred checks all
//!   survive a process restart; nothing lives only in memory.
//! - **Bounded** — concurrency, throttling, and article size are all
//!   explicit configuration, never implicit defaults baked into the code.
//! - **Library-first** — no CLI or UI, purely a Rust crate for embedding.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use usenet_poster::{Config, PoolManager, ProviderRole, Processor, Queue, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config {
//!         servers: vec![
//!             ServerConfig {
//!                 host: "news.example.com".to_string(),
//!                 port: 563,
//!                 username: Some("user".to_string()),
//!                 password: Some("pass".to_string()),
//!                 ssl: true,
//!                 insecure_ssl: false,
//!                 max_connections: 10,
//!                 max_connection_idle_time_s: 300,
//!                 max_connection_ttl_s: 3600,
//!                 enabled: true,
//!                 role: ProviderRole::Upload,
//!                 proxy_url: None,
//!             }
//!         ],
//!         ..Default::default()
//!     };
//!
//!     let queue = Arc::new(Queue::open(&config.queue.database_path).await?);
//!     let pool = Arc::new(PoolManager::new(&config).await?);
//!     let processor = Arc::new(Processor::new(config, queue, pool));
//!     let handle = processor.start();
//!
//!     usenet_poster::wait_for_signal().await;
//!     processor.shutdown();
//!     handle.await?;
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Article wire encoding/decoding (yEnc body, header assembly, message-ids)
pub mod codec;
/// Configuration types
pub mod config;
/// Background worker resolving deferred post-checks
pub mod deferred_check;
/// Error types
pub mod error;
/// NZB document accumulation and serialization
pub mod nzb;
/// PAR2 redundancy-set generation
pub mod par2;
/// Multi-server connection pool with failover
pub mod pool;
/// Per-job post-then-verify pipeline
pub mod poster;
/// Bounded-concurrency queue drain loop
pub mod processor;
/// Durable SQLite-backed job queue
pub mod queue;
/// Token-bucket upload throttling
pub mod throttle;
/// Core types and events
pub mod types;

// Re-export commonly used types
pub use config::{Config, NzbCompressionConfig, Par2Config, PostCheckConfig, PostingConfig, QueueConfig, ServerConfig};
pub use deferred_check::DeferredCheckWorker;
pub use error::{Error, PoolError, PostError, QueueError, Result};
pub use nzb::NzbAccumulator;
pub use par2::Par2Invoker;
pub use pool::PoolManager;
pub use poster::{DeferredCheckRequest, PostOutcome, Poster};
pub use processor::Processor;
pub use queue::{Queue, QueueItem, QueueItemState, QueueStats};
pub use throttle::Throttle;
pub use types::{
    Article, CheckStatus, CompletedItem, DeferredArticleCheck, FileJob, GroupPolicy,
    InProgressItem, MessageIdFormat, NullProgressSink, ObfuscationPolicy, PartType, PoolMetricsSnapshot,
    PostStatus, Priority, ProgressSink, ProgressUpdate, ProviderRole, ProviderState, QueueMessage,
    Stage, VerificationStatus,
};

/// Waits for a termination signal so callers can drive their own shutdown
/// sequence (typically `processor.shutdown()` followed by cancelling any
/// [`DeferredCheckWorker`] tokens and awaiting outstanding task handles).
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal
///   registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
pub async fn wait_for_signal() {
    imp::wait_for_signal().await;
}

#[cfg(unix)]
mod imp {
    pub async fn wait_for_signal() {
        use tokio::signal::unix::{SignalKind, signal};

        let sigterm_result = signal(SignalKind::terminate());
        let sigint_result = signal(SignalKind::interrupt());

        match (sigterm_result, sigint_result) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => {
                        tracing::info!("received SIGTERM");
                    }
                    _ = sigint.recv() => {
                        tracing::info!("received SIGINT");
                    }
                }
            }
            (Err(e), _) => {
                tracing::warn!(error = %e, "could not register SIGTERM handler, waiting for SIGINT only");
                if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
                    sigint.recv().await;
                    tracing::info!("received SIGINT");
                } else {
                    tracing::error!("could not register any signal handlers, using ctrl_c fallback");
                    tokio::signal::ctrl_c().await.ok();
                }
            }
            (_, Err(e)) => {
                tracing::warn!(error = %e, "could not register SIGINT handler, waiting for SIGTERM only");
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    tracing::info!("received SIGTERM");
                } else {
                    tracing::error!("could not register any signal handlers, using ctrl_c fallback");
                    tokio::signal::ctrl_c().await.ok();
                }
            }
        }
    }
}

#[cfg(not(unix))]
mod imp {
    pub async fn wait_for_signal() {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("received Ctrl+C"),
            Err(e) => tracing::error!(error = %e, "failed to listen for Ctrl+C"),
        }
    }
}
