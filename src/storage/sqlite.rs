//! SQLite config store
//!
//! Entries live in one `config_entries` table keyed by
//! `(tenant, item, pool_id)`. A write runs in a transaction that reads the
//! current fingerprint and version, so content, fingerprint and version
//! always change together. The change broadcast fires after commit.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::sqlite::SqliteRow;
use sqlx::{Pool, Row, Sqlite};
use tokio::sync::broadcast;
use tracing::{debug, info, instrument};

use crate::digest::fingerprint;
use crate::model::{ConfigEntry, GroupKey};

use super::backend::{CHANGE_CHANNEL_CAPACITY, ConfigChange, ConfigStore};
use super::error::{StoreError, StoreResult};

pub struct SqliteConfigStore {
    pool: Pool<Sqlite>,
    changes: broadcast::Sender<ConfigChange>,
    db_path: String,
}

impl SqliteConfigStore {
    /// Open (or create) the database file and run migrations.
    #[instrument(skip_all)]
    pub async fn new(db_path: impl AsRef<Path>) -> StoreResult<Self> {
        let db_path = db_path.as_ref().to_string_lossy().to_string();
        info!("initializing SQLite config store at: {db_path}");

        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        debug!("running database migrations");
        sqlx::migrate!("./migrations").run(&pool).await?;

        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Ok(Self {
            pool,
            changes,
            db_path,
        })
    }

    pub fn path(&self) -> &str {
        &self.db_path
    }

    fn millis_to_timestamp(millis: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(millis).unwrap_or_else(Utc::now)
    }

    fn row_to_entry(row: &SqliteRow) -> StoreResult<ConfigEntry> {
        let group_key = GroupKey::new(
            row.get::<String, _>("tenant"),
            row.get::<String, _>("item"),
            row.get::<String, _>("pool_id"),
        )?;
        Ok(ConfigEntry {
            group_key,
            content: row.get("content"),
            fingerprint: row.get("fingerprint"),
            version: row.get::<i64, _>("version") as u64,
            updated_at: Self::millis_to_timestamp(row.get("updated_at")),
        })
    }

    async fn upsert(
        &self,
        key: &GroupKey,
        content: &str,
        overwrite: bool,
    ) -> StoreResult<(ConfigEntry, bool)> {
        let mut tx = self.pool.begin().await?;

        let current = sqlx::query(
            r#"
            SELECT tenant, item, pool_id, content, fingerprint, version, updated_at
            FROM config_entries
            WHERE tenant = ? AND item = ? AND pool_id = ?
            "#,
        )
        .bind(key.tenant())
        .bind(key.item())
        .bind(key.pool_id())
        .fetch_optional(&mut *tx)
        .await?
        .map(|row| Self::row_to_entry(&row))
        .transpose()?;

        let new_fingerprint = fingerprint(content);
        let version = match &current {
            Some(entry) if !overwrite || entry.fingerprint == new_fingerprint => {
                tx.rollback().await?;
                return Ok((entry.clone(), false));
            }
            Some(entry) => entry.version + 1,
            None => 1,
        };

        let entry = ConfigEntry {
            group_key: key.clone(),
            content: content.to_string(),
            fingerprint: new_fingerprint,
            version,
            updated_at: Utc::now(),
        };

        sqlx::query(
            r#"
            INSERT INTO config_entries (
                tenant, item, pool_id, content, fingerprint, version, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (tenant, item, pool_id) DO UPDATE SET
                content = excluded.content,
                fingerprint = excluded.fingerprint,
                version = excluded.version,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key.tenant())
        .bind(key.item())
        .bind(key.pool_id())
        .bind(&entry.content)
        .bind(&entry.fingerprint)
        .bind(entry.version as i64)
        .bind(entry.updated_at.timestamp_millis())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        let _ = self.changes.send(ConfigChange::from(&entry));
        debug!(key = %key, version, "stored new content");
        Ok((entry, true))
    }
}

#[async_trait]
impl ConfigStore for SqliteConfigStore {
    #[instrument(skip(self, content), fields(key = %key))]
    async fn write(&self, key: &GroupKey, content: &str) -> StoreResult<ConfigEntry> {
        let (entry, _) = self.upsert(key, content, true).await?;
        Ok(entry)
    }

    #[instrument(skip(self, content), fields(key = %key))]
    async fn insert_if_absent(
        &self,
        key: &GroupKey,
        content: &str,
    ) -> StoreResult<(ConfigEntry, bool)> {
        self.upsert(key, content, false).await
    }

    async fn read(&self, key: &GroupKey) -> StoreResult<ConfigEntry> {
        let row = sqlx::query(
            r#"
            SELECT tenant, item, pool_id, content, fingerprint, version, updated_at
            FROM config_entries
            WHERE tenant = ? AND item = ? AND pool_id = ?
            "#,
        )
        .bind(key.tenant())
        .bind(key.item())
        .bind(key.pool_id())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Self::row_to_entry(&row),
            None => Err(StoreError::NotFound(key.clone())),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<ConfigChange> {
        self.changes.subscribe()
    }

    async fn health_check(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await?;
        Ok(())
    }

    async fn close(&self) -> StoreResult<()> {
        info!("closing SQLite config store");
        self.pool.close().await;
        Ok(())
    }
}
