//! Database lifecycle and schema bootstrap (§6 canonical schema).

use crate::error::{Error, Result};
use sqlx::SqliteConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool};
use std::path::Path;
use std::str::FromStr;

use super::Queue;

impl Queue {
    /// Open (creating if missing) the queue database at `path` and run
    /// schema migrations.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(Error::Io)?;
            }
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
            .map_err(|e| Error::Config {
                message: format!("invalid queue database path: {e}"),
                key: Some("queue.database_path".to_string()),
            })?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePool::connect_with(options).await?;
        let queue = Self { pool };
        queue.run_migrations().await?;
        queue.reconcile_crashed_leases().await?;
        Ok(queue)
    }

    /// In-memory queue, for tests and short-lived tooling.
    pub async fn open_in_memory() -> Result<Self> {
        let pool = SqlitePool::connect("sqlite::memory:").await?;
        let queue = Self { pool };
        queue.run_migrations().await?;
        queue.reconcile_crashed_leases().await?;
        Ok(queue)
    }

    /// Crash recovery (§4.4, §7 scenario 3): a job whose `in_progress_items`
    /// shadow row still has a matching `messages` row was mid-lease when the
    /// previous process died. Reset its lease so it is immediately visible
    /// as pending instead of waiting out `LEASE_DURATION`, and drop the
    /// now-stale shadow row so the next `receive_file` can re-insert it
    /// without hitting the `in_progress_items.id` primary key.
    ///
    /// Jobs parked by `mark_as_error` have no `messages` row and are left
    /// untouched.
    async fn reconcile_crashed_leases(&self) -> Result<()> {
        let now = super::to_iso(chrono::Utc::now());

        let result = sqlx::query(
            r#"
            UPDATE messages
            SET lease_expiry = ?
            WHERE id IN (SELECT id FROM in_progress_items)
            "#,
        )
        .bind(&now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            tracing::warn!(
                count = result.rows_affected(),
                "reconciled crashed in-progress jobs back to pending"
            );
        }

        sqlx::query(
            r#"
            DELETE FROM in_progress_items
            WHERE id IN (SELECT id FROM messages)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn run_migrations(&self) -> Result<()> {
        let mut conn = self.pool.acquire().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&mut *conn)
        .await?;

        let current_version: Option<i64> =
            sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
                .fetch_optional(&mut *conn)
                .await?;

        if current_version.unwrap_or(0) < 1 {
            Self::migrate_v1(&mut conn).await?;
        }

        Ok(())
    }

    async fn migrate_v1(conn: &mut SqliteConnection) -> Result<()> {
        tracing::info!("applying queue schema migration v1");

        sqlx::query("BEGIN").execute(&mut *conn).await?;

        let result = async {
            sqlx::query(
                r#"
                CREATE TABLE messages (
                    id TEXT PRIMARY KEY,
                    created TEXT NOT NULL,
                    updated TEXT NOT NULL,
                    queue TEXT NOT NULL,
                    body BLOB NOT NULL,
                    lease_expiry TEXT NOT NULL,
                    delivery_count INTEGER NOT NULL DEFAULT 0
                )
                "#,
            )
            .execute(&mut *conn)
            .await?;

            sqlx::query("CREATE INDEX idx_messages_queue_created ON messages(queue, created)")
                .execute(&mut *conn)
                .await?;

            sqlx::query(
                r#"
                CREATE TABLE in_progress_items (
                    id TEXT PRIMARY KEY,
                    path TEXT NOT NULL,
                    size INTEGER NOT NULL,
                    priority INTEGER NOT NULL,
                    created_at TEXT NOT NULL,
                    started_at TEXT NOT NULL,
                    job_data BLOB NOT NULL
                )
                "#,
            )
            .execute(&mut *conn)
            .await?;

            sqlx::query("CREATE INDEX idx_in_progress_path ON in_progress_items(path)")
                .execute(&mut *conn)
                .await?;

            sqlx::query(
                r#"
                CREATE TABLE completed_items (
                    id TEXT PRIMARY KEY,
                    path TEXT NOT NULL,
                    size INTEGER NOT NULL,
                    priority INTEGER NOT NULL,
                    nzb_path TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    completed_at TEXT NOT NULL,
                    job_data BLOB NOT NULL,
                    verification_status TEXT
                )
                "#,
            )
            .execute(&mut *conn)
            .await?;

            sqlx::query(
                r#"
                CREATE TABLE deferred_article_checks (
                    id TEXT PRIMARY KEY,
                    completed_item_id TEXT NOT NULL REFERENCES completed_items(id) ON DELETE CASCADE,
                    message_id TEXT NOT NULL,
                    groups TEXT NOT NULL,
                    retry_count INTEGER NOT NULL DEFAULT 0,
                    next_retry TEXT NOT NULL,
                    status TEXT NOT NULL,
                    first_failure_at TEXT
                )
                "#,
            )
            .execute(&mut *conn)
            .await?;

            sqlx::query(
                "CREATE INDEX idx_deferred_checks_pending ON deferred_article_checks(status, next_retry) WHERE status = 'pending'",
            )
            .execute(&mut *conn)
            .await?;

            sqlx::query(
                "CREATE INDEX idx_deferred_checks_item ON deferred_article_checks(completed_item_id)",
            )
            .execute(&mut *conn)
            .await?;

            let now = super::to_iso(chrono::Utc::now());
            sqlx::query("INSERT INTO schema_version (version, applied_at) VALUES (1, ?)")
                .bind(now)
                .execute(&mut *conn)
                .await?;

            Ok::<(), Error>(())
        }
        .await;

        match result {
            Ok(()) => {
                sqlx::query("COMMIT").execute(&mut *conn).await?;
            }
            Err(e) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                return Err(e);
            }
        }

        tracing::info!("queue schema migration v1 complete");
        Ok(())
    }

    /// Close the underlying connection pool.
    pub async fn close(self) {
        self.pool.close().await;
    }
}
