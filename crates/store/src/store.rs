//! Gateway store trait and the SQLite implementation.

use crate::error::StoreResult;
use crate::repos::{ChannelRepo, LockRepo, MessageRepo};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// SQLite schema (embedded).
const SCHEMA_SQL: &str = include_str!("sqlite_schema.sql");

/// Combined gateway store trait.
#[async_trait]
pub trait GatewayStore: ChannelRepo + MessageRepo + LockRepo + Send + Sync {
    /// Run database migrations.
    async fn migrate(&self) -> StoreResult<()>;

    /// Check database connectivity and health.
    async fn health_check(&self) -> StoreResult<()>;
}

/// SQLite-based gateway store.
///
/// Locks are emulated with the `sync_locks` table, which gives mutual
/// exclusion between processes sharing the same database file.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
    lock_ttl: Duration,
}

impl SqliteStore {
    /// Open (creating if missing) a SQLite store and run migrations.
    pub async fn new(path: impl AsRef<Path>, lock_ttl: Duration) -> StoreResult<Self> {
        let path = path.as_ref();

        // Ensure parent directory exists
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            // Prevent transient "database is locked" errors when several
            // processes share the file.
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            // SQLite permits limited write concurrency; a single connection
            // avoids persistent "database is locked" failures in-process.
            .max_connections(1)
            .connect_with(opts)
            .await?;

        let store = Self { pool, lock_ttl };
        store.migrate().await?;

        tracing::debug!(
            path = %path.display(),
            lock_ttl_secs = lock_ttl.as_secs(),
            "SQLite store opened"
        );

        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

#[async_trait]
impl GatewayStore for SqliteStore {
    async fn migrate(&self) -> StoreResult<()> {
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    async fn health_check(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

// Implement all the repository traits for SqliteStore
mod sqlite_impl {
    use super::*;
    use crate::models::{ChannelRow, MessageRow};
    use crate::repos::messages::fill_last_ids;
    use crate::repos::{INSERT_BATCH_ROWS, LockSession};
    use sqlx::QueryBuilder;
    use std::collections::HashMap;
    use tgsync_core::{ChannelId, NewMessage};
    use time::OffsetDateTime;
    use uuid::Uuid;

    #[async_trait]
    impl ChannelRepo for SqliteStore {
        async fn upsert_channel(&self, channel: &ChannelRow) -> StoreResult<()> {
            sqlx::query(
                r#"
                INSERT INTO channels (channel_id, label, description, is_active, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT(channel_id) DO UPDATE SET
                    label = excluded.label,
                    description = excluded.description,
                    is_active = excluded.is_active,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(channel.channel_id)
            .bind(&channel.label)
            .bind(&channel.description)
            .bind(channel.is_active)
            .bind(channel.created_at)
            .bind(channel.updated_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        }

        async fn get_channel(&self, channel_id: ChannelId) -> StoreResult<Option<ChannelRow>> {
            let row =
                sqlx::query_as::<_, ChannelRow>("SELECT * FROM channels WHERE channel_id = ?")
                    .bind(channel_id.get())
                    .fetch_optional(&self.pool)
                    .await?;
            Ok(row)
        }

        async fn list_channels(&self) -> StoreResult<Vec<ChannelRow>> {
            let rows = sqlx::query_as::<_, ChannelRow>("SELECT * FROM channels ORDER BY channel_id")
                .fetch_all(&self.pool)
                .await?;
            Ok(rows)
        }

        async fn list_active_channels(&self) -> StoreResult<Vec<ChannelRow>> {
            let rows = sqlx::query_as::<_, ChannelRow>(
                "SELECT * FROM channels WHERE is_active = 1 ORDER BY channel_id",
            )
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }
    }

    #[async_trait]
    impl MessageRepo for SqliteStore {
        async fn insert_messages(&self, messages: &[NewMessage]) -> StoreResult<u64> {
            if messages.is_empty() {
                return Ok(0);
            }

            let now = OffsetDateTime::now_utc();
            let mut inserted = 0;
            let mut tx = self.pool.begin().await?;

            for batch in messages.chunks(INSERT_BATCH_ROWS) {
                let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
                    "INSERT INTO messages (channel_id, message_id, status, text, caption, \
                     media_type, media_json, source_date, metadata_json, created_at) ",
                );
                qb.push_values(batch, |mut row, m| {
                    row.push_bind(m.channel_id.get())
                        .push_bind(m.message_id)
                        .push_bind(m.status.as_str())
                        .push_bind(m.text.clone())
                        .push_bind(m.caption.clone())
                        .push_bind(m.media_type.clone())
                        .push_bind(m.media_json.clone())
                        .push_bind(m.source_date)
                        .push_bind(m.metadata_json.clone())
                        .push_bind(now);
                });
                qb.push(" ON CONFLICT (channel_id, message_id) DO NOTHING");

                let result = qb.build().execute(&mut *tx).await?;
                inserted += result.rows_affected();
            }

            tx.commit().await?;
            Ok(inserted)
        }

        async fn last_message_ids(
            &self,
            channel_ids: &[ChannelId],
        ) -> StoreResult<HashMap<ChannelId, i64>> {
            if channel_ids.is_empty() {
                return Ok(HashMap::new());
            }

            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
                "SELECT channel_id, MAX(message_id) FROM messages WHERE channel_id IN (",
            );
            let mut separated = qb.separated(", ");
            for id in channel_ids {
                separated.push_bind(id.get());
            }
            separated.push_unseparated(") GROUP BY channel_id");

            let rows: Vec<(i64, Option<i64>)> =
                qb.build_query_as().fetch_all(&self.pool).await?;
            Ok(fill_last_ids(channel_ids, rows))
        }

        async fn get_message(
            &self,
            channel_id: ChannelId,
            message_id: i64,
        ) -> StoreResult<Option<MessageRow>> {
            let row = sqlx::query_as::<_, MessageRow>(
                "SELECT * FROM messages WHERE channel_id = ? AND message_id = ?",
            )
            .bind(channel_id.get())
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn count_messages(&self, channel_id: ChannelId) -> StoreResult<u64> {
            let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE channel_id = ?")
                .bind(channel_id.get())
                .fetch_one(&self.pool)
                .await?;
            Ok(count as u64)
        }
    }

    #[async_trait]
    impl LockRepo for SqliteStore {
        async fn lock_session(&self) -> StoreResult<Box<dyn LockSession>> {
            Ok(Box::new(SqliteLockSession {
                pool: self.pool.clone(),
                holder: Uuid::new_v4().to_string(),
                ttl: self.lock_ttl,
            }))
        }
    }

    /// Table-backed lock session. The random holder id plays the role of the
    /// database session identity.
    pub struct SqliteLockSession {
        pool: Pool<Sqlite>,
        holder: String,
        ttl: Duration,
    }

    #[async_trait]
    impl LockSession for SqliteLockSession {
        async fn try_lock(&self, lock_id: i64) -> StoreResult<bool> {
            let now = OffsetDateTime::now_utc().unix_timestamp();
            let stale_before = now.saturating_sub(self.ttl.as_secs() as i64);

            // Insert if absent; take over only rows older than the TTL.
            let result = sqlx::query(
                r#"
                INSERT INTO sync_locks (lock_id, holder, acquired_at)
                VALUES (?, ?, ?)
                ON CONFLICT(lock_id) DO UPDATE SET
                    holder = excluded.holder,
                    acquired_at = excluded.acquired_at
                WHERE sync_locks.acquired_at < ?
                "#,
            )
            .bind(lock_id)
            .bind(&self.holder)
            .bind(now)
            .bind(stale_before)
            .execute(&self.pool)
            .await?;

            Ok(result.rows_affected() > 0)
        }

        async fn unlock(&self, lock_id: i64) -> StoreResult<bool> {
            let result = sqlx::query("DELETE FROM sync_locks WHERE lock_id = ? AND holder = ?")
                .bind(lock_id)
                .bind(&self.holder)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected() > 0)
        }

        fn backend_name(&self) -> &'static str {
            "sqlite"
        }
    }

    impl Drop for SqliteLockSession {
        fn drop(&mut self) {
            // Nothing frees rows of a dropped session except the TTL, so make
            // a best-effort cleanup when a runtime is available.
            let Ok(handle) = tokio::runtime::Handle::try_current() else {
                return;
            };
            let pool = self.pool.clone();
            let holder = std::mem::take(&mut self.holder);
            handle.spawn(async move {
                match sqlx::query("DELETE FROM sync_locks WHERE holder = ?")
                    .bind(&holder)
                    .execute(&pool)
                    .await
                {
                    Ok(result) if result.rows_affected() > 0 => {
                        tracing::warn!(
                            holder = %holder,
                            released = result.rows_affected(),
                            "Lock session dropped while holding locks; released them"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::error!(holder = %holder, error = %e, "Failed to clean up dropped lock session");
                    }
                }
            });
        }
    }
}

pub use sqlite_impl::SqliteLockSession;
