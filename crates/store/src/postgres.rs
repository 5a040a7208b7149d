//! PostgreSQL-based gateway store implementation.

use crate::error::{StoreError, StoreResult};
use crate::models::{ChannelRow, MessageRow};
use crate::repos::messages::fill_last_ids;
use crate::repos::{ChannelRepo, INSERT_BATCH_ROWS, LockRepo, LockSession, MessageRepo};
use crate::store::GatewayStore;
use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode as SqlxPgSslMode};
use sqlx::{Pool, Postgres, QueryBuilder};
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use tgsync_core::config::PgSslMode;
use tgsync_core::{ChannelId, NewMessage};
use time::OffsetDateTime;
use tokio::sync::Mutex;

/// PostgreSQL schema (embedded).
const POSTGRES_SCHEMA: &str = include_str!("postgres_schema.sql");

fn postgres_schema_statements(schema: &str) -> Vec<&str> {
    schema
        .split(';')
        .filter_map(|statement| {
            let trimmed = statement.trim();
            if trimmed.is_empty() {
                return None;
            }
            let has_sql = trimmed.lines().any(|line| {
                let line = line.trim();
                !line.is_empty() && !line.starts_with("--")
            });
            has_sql.then_some(trimmed)
        })
        .collect()
}

/// PostgreSQL-based gateway store.
pub struct PostgresStore {
    pool: Pool<Postgres>,
}

impl PostgresStore {
    /// Create a new PostgreSQL store from a connection URL.
    pub async fn from_url(
        url: &str,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> StoreResult<Self> {
        let opts = PgConnectOptions::from_str(url)?;
        Self::connect(opts, max_connections, statement_timeout_ms).await
    }

    /// Create a new PostgreSQL store from individual connection parameters.
    #[allow(clippy::too_many_arguments)]
    pub async fn from_params(
        host: &str,
        port: u16,
        username: Option<&str>,
        password: Option<&str>,
        database: &str,
        ssl_mode: Option<PgSslMode>,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> StoreResult<Self> {
        let mut opts = PgConnectOptions::new()
            .host(host)
            .port(port)
            .database(database);

        if let Some(user) = username {
            opts = opts.username(user);
        }

        if let Some(pass) = password {
            opts = opts.password(pass);
        }

        if let Some(mode) = ssl_mode {
            let sqlx_mode = match mode {
                PgSslMode::Disable => SqlxPgSslMode::Disable,
                PgSslMode::Prefer => SqlxPgSslMode::Prefer,
                PgSslMode::Require => SqlxPgSslMode::Require,
            };
            opts = opts.ssl_mode(sqlx_mode);
        }

        // Log connection info without password
        tracing::info!(
            host = host,
            port = port,
            database = database,
            username = username.unwrap_or("<none>"),
            ssl_mode = ?ssl_mode,
            "Connecting to PostgreSQL with individual parameters"
        );

        Self::connect(opts, max_connections, statement_timeout_ms).await
    }

    async fn connect(
        mut opts: PgConnectOptions,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> StoreResult<Self> {
        if let Some(timeout_ms) = statement_timeout_ms {
            opts = opts.options([("statement_timeout", format!("{}ms", timeout_ms))]);
            tracing::info!("PostgreSQL statement_timeout set to {}ms", timeout_ms);
        }

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;

        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }
}

#[async_trait]
impl GatewayStore for PostgresStore {
    async fn migrate(&self) -> StoreResult<()> {
        // PostgreSQL doesn't allow multiple statements in a single prepared statement,
        // so we split the schema and execute each statement separately.
        for statement in postgres_schema_statements(POSTGRES_SCHEMA) {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn health_check(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl ChannelRepo for PostgresStore {
    async fn upsert_channel(&self, channel: &ChannelRow) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO channels (channel_id, label, description, is_active, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (channel_id) DO UPDATE SET
                label = EXCLUDED.label,
                description = EXCLUDED.description,
                is_active = EXCLUDED.is_active,
                updated_at = EXCLUDED.updated_at
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
        let row = sqlx::query_as::<_, ChannelRow>("SELECT * FROM channels WHERE channel_id = $1")
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
            "SELECT * FROM channels WHERE is_active ORDER BY channel_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[async_trait]
impl MessageRepo for PostgresStore {
    async fn insert_messages(&self, messages: &[NewMessage]) -> StoreResult<u64> {
        if messages.is_empty() {
            return Ok(0);
        }

        let now = OffsetDateTime::now_utc();
        let mut inserted = 0;
        let mut tx = self.pool.begin().await?;

        for batch in messages.chunks(INSERT_BATCH_ROWS) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
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

        // ANY($1) with an array parameter instead of a dynamic IN list
        let ids: Vec<i64> = channel_ids.iter().map(|id| id.get()).collect();
        let rows: Vec<(i64, Option<i64>)> = sqlx::query_as(
            "SELECT channel_id, MAX(message_id) FROM messages WHERE channel_id = ANY($1) GROUP BY channel_id",
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;

        Ok(fill_last_ids(channel_ids, rows))
    }

    async fn get_message(
        &self,
        channel_id: ChannelId,
        message_id: i64,
    ) -> StoreResult<Option<MessageRow>> {
        let row = sqlx::query_as::<_, MessageRow>(
            "SELECT * FROM messages WHERE channel_id = $1 AND message_id = $2",
        )
        .bind(channel_id.get())
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn count_messages(&self, channel_id: ChannelId) -> StoreResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE channel_id = $1")
            .bind(channel_id.get())
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }
}

#[async_trait]
impl LockRepo for PostgresStore {
    async fn lock_session(&self) -> StoreResult<Box<dyn LockSession>> {
        let conn = self.pool.acquire().await?;
        Ok(Box::new(PgLockSession {
            inner: Mutex::new(PgLockInner {
                conn: Some(conn),
                held: HashSet::new(),
            }),
        }))
    }
}

/// Advisory-lock session pinned to one pooled connection.
///
/// `pg_try_advisory_lock` locks belong to the backend session that took them,
/// so every try-lock and unlock of a session runs on the same connection.
/// If the session is dropped while still holding locks, the connection is
/// detached from the pool and closed, which makes the server release them.
pub struct PgLockSession {
    inner: Mutex<PgLockInner>,
}

struct PgLockInner {
    conn: Option<PoolConnection<Postgres>>,
    held: HashSet<i64>,
}

#[async_trait]
impl LockSession for PgLockSession {
    async fn try_lock(&self, lock_id: i64) -> StoreResult<bool> {
        let mut guard = self.inner.lock().await;
        let PgLockInner { conn, held } = &mut *guard;
        let conn = conn
            .as_mut()
            .ok_or_else(|| StoreError::Internal("lock session connection closed".to_string()))?;

        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(lock_id)
            .fetch_one(&mut **conn)
            .await?;
        if acquired {
            held.insert(lock_id);
        }
        Ok(acquired)
    }

    async fn unlock(&self, lock_id: i64) -> StoreResult<bool> {
        let mut guard = self.inner.lock().await;
        let PgLockInner { conn, held } = &mut *guard;
        let conn = conn
            .as_mut()
            .ok_or_else(|| StoreError::Internal("lock session connection closed".to_string()))?;

        let released: bool = sqlx::query_scalar("SELECT pg_advisory_unlock($1)")
            .bind(lock_id)
            .fetch_one(&mut **conn)
            .await?;
        held.remove(&lock_id);
        Ok(released)
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }
}

impl Drop for PgLockSession {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if inner.held.is_empty() {
            return;
        }
        if let Some(conn) = inner.conn.take() {
            tracing::warn!(
                held = inner.held.len(),
                "Lock session dropped while holding advisory locks; closing its connection"
            );
            // Dropping the detached connection closes the backend session.
            drop(conn.detach());
        }
    }
}
