//! SQLite-backed store and lease lock.
//!
//! A fleet of engines pointed at the same database file shares desired specs,
//! state and the check-cycle lock.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::stream::BoxStream;
use sqlx::Row;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use tracing::debug;

use crate::diff::Fingerprint;
use crate::lock::{LockError, LockProvider};
use crate::resource::{
    Resource, ResourceHeader, ResourceId, ResourceKind, ResourceMetadata, ResourceState,
};

use super::error::{Result, StoreError};
use super::event::{ResourceEvent, ResourceEventKind};
use super::traits::*;
use super::DEFAULT_HISTORY_LIMIT;

/// How long a connection waits for another writer before giving up.
pub const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS resources (
        id TEXT PRIMARY KEY,
        api_version TEXT NOT NULL,
        kind TEXT NOT NULL,
        name TEXT NOT NULL,
        uid TEXT NOT NULL,
        resource_version INTEGER NOT NULL,
        spec_json TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS resource_dependencies (
        resource_id TEXT NOT NULL,
        depends_on TEXT NOT NULL,
        PRIMARY KEY (resource_id, depends_on)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_resource_dependencies_depends_on
        ON resource_dependencies (depends_on)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS resource_state (
        resource_id TEXT PRIMARY KEY,
        state TEXT NOT NULL,
        recorded_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS resource_history (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        resource_id TEXT NOT NULL,
        event_json TEXT NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_resource_history_resource
        ON resource_history (resource_id, seq)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS diff_fingerprints (
        resource_id TEXT PRIMARY KEY,
        fingerprint TEXT NOT NULL,
        seen_count INTEGER NOT NULL,
        actions_taken INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS locks (
        name TEXT PRIMARY KEY,
        holder TEXT NOT NULL,
        expires_at INTEGER NOT NULL
    )
    "#,
];

pub struct SqliteStore {
    pool: SqlitePool,
    history_limit: usize,
}

impl SqliteStore {
    /// Open (or create) the database at `path`.
    ///
    /// Connections use WAL and wait up to [`BUSY_TIMEOUT`] for a competing
    /// writer.
    pub async fn open(path: &Path) -> Result<Self> {
        let db_url = format!("sqlite:{}?mode=rwc", path.display());
        let options = SqliteConnectOptions::from_str(&db_url)?
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self {
            pool,
            history_limit: DEFAULT_HISTORY_LIMIT,
        };
        store.migrate().await?;
        Ok(store)
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit.max(1);
        self
    }

    /// A lock provider sharing this database, identified as `holder`.
    pub fn lock_provider(&self, holder: impl Into<String>) -> SqliteLock {
        SqliteLock {
            pool: self.pool.clone(),
            holder: holder.into(),
        }
    }

    async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn exists(&self, id: &ResourceId) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM resources WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn insert_history<'e, E>(&self, executor: E, event: &ResourceEvent) -> Result<()>
    where
        E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
    {
        let json = serde_json::to_string(event)
            .map_err(|e| StoreError::Internal(format!("encode event: {}", e)))?;
        sqlx::query("INSERT INTO resource_history (resource_id, event_json) VALUES (?, ?)")
            .bind(event.id.as_str())
            .bind(json)
            .execute(executor)
            .await?;
        Ok(())
    }

    async fn trim_history(&self, id: &ResourceId) -> Result<()> {
        sqlx::query(
            r#"
            DELETE FROM resource_history
            WHERE resource_id = ?
              AND seq NOT IN (
                SELECT seq FROM resource_history
                WHERE resource_id = ?
                ORDER BY seq DESC
                LIMIT ?
              )
            "#,
        )
        .bind(id.as_str())
        .bind(id.as_str())
        .bind(self.history_limit as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn row_to_header(row: &SqliteRow) -> Result<ResourceHeader> {
    let id: String = row.try_get("id")?;
    let api_version: String = row.try_get("api_version")?;
    let kind: String = row.try_get("kind")?;
    Ok(ResourceHeader {
        id: ResourceId::new(id),
        kind: ResourceKind::new(api_version, kind),
    })
}

fn row_to_resource(row: SqliteRow, depends_on: Vec<String>) -> Result<Resource> {
    let id: String = row.try_get("id")?;
    let spec_json: String = row.try_get("spec_json")?;
    let spec = serde_json::from_str(&spec_json).map_err(|e| StoreError::Corrupt {
        id: id.clone(),
        reason: e.to_string(),
    })?;
    let resource_version: i64 = row.try_get("resource_version")?;

    Ok(Resource {
        id: ResourceId::new(id),
        api_version: row.try_get("api_version")?,
        kind: row.try_get("kind")?,
        metadata: ResourceMetadata {
            name: row.try_get("name")?,
            uid: row.try_get("uid")?,
            resource_version: resource_version as u64,
        },
        spec,
        depends_on: depends_on.into_iter().map(ResourceId::new).collect(),
    })
}

fn row_to_diff_record(row: &SqliteRow) -> Result<DiffRecord> {
    Ok(DiffRecord {
        fingerprint: Fingerprint::from_hex(row.try_get::<String, _>("fingerprint")?),
        seen_count: row.try_get::<i64, _>("seen_count")? as u32,
        actions_taken: row.try_get::<i64, _>("actions_taken")? as u32,
    })
}

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

#[async_trait]
impl ResourceStore for SqliteStore {
    async fn get(&self, id: &ResourceId) -> Result<Resource> {
        let row = sqlx::query(
            r#"
            SELECT id, api_version, kind, name, uid, resource_version, spec_json
            FROM resources WHERE id = ?
            "#,
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Err(StoreError::NotFound(id.clone()));
        };

        let depends_on: Vec<String> = sqlx::query_scalar(
            "SELECT depends_on FROM resource_dependencies WHERE resource_id = ? ORDER BY depends_on",
        )
        .bind(id.as_str())
        .fetch_all(&self.pool)
        .await?;

        row_to_resource(row, depends_on)
    }

    async fn store(&self, mut resource: Resource) -> Result<Resource> {
        resource.validate()?;

        let spec_json = serde_json::to_string(&resource.spec)
            .map_err(|e| StoreError::Internal(format!("encode spec: {}", e)))?;
        let now = Utc::now().timestamp_millis();

        // Version check and upsert both run under the write lock.
        let mut tx = self.pool.begin_with("BEGIN IMMEDIATE").await?;

        let existing = sqlx::query("SELECT uid, resource_version FROM resources WHERE id = ?")
            .bind(resource.id.as_str())
            .fetch_optional(&mut *tx)
            .await?;

        let incoming = resource.metadata.resource_version;
        let event_kind = match existing {
            Some(row) => {
                let current = row.try_get::<i64, _>("resource_version")? as u64;
                if incoming != 0 && incoming != current {
                    return Err(StoreError::VersionMismatch {
                        expected: current,
                        actual: incoming,
                    });
                }
                resource.metadata.uid = row.try_get("uid")?;
                resource.metadata.resource_version = current + 1;
                ResourceEventKind::Updated {
                    resource_version: current + 1,
                }
            }
            None => {
                if resource.metadata.uid.is_empty() {
                    resource.metadata.uid = uuid::Uuid::new_v4().to_string();
                }
                resource.metadata.resource_version = 1;
                ResourceEventKind::Created
            }
        };

        sqlx::query(
            r#"
            INSERT INTO resources
                (id, api_version, kind, name, uid, resource_version, spec_json, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                api_version = excluded.api_version,
                kind = excluded.kind,
                name = excluded.name,
                resource_version = excluded.resource_version,
                spec_json = excluded.spec_json,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(resource.id.as_str())
        .bind(&resource.api_version)
        .bind(&resource.kind)
        .bind(&resource.metadata.name)
        .bind(&resource.metadata.uid)
        .bind(resource.metadata.resource_version as i64)
        .bind(&spec_json)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM resource_dependencies WHERE resource_id = ?")
            .bind(resource.id.as_str())
            .execute(&mut *tx)
            .await?;
        for dep in &resource.depends_on {
            sqlx::query("INSERT INTO resource_dependencies (resource_id, depends_on) VALUES (?, ?)")
                .bind(resource.id.as_str())
                .bind(dep.as_str())
                .execute(&mut *tx)
                .await?;
        }

        let event = ResourceEvent::now(resource.id.clone(), event_kind);
        self.insert_history(&mut *tx, &event).await?;
        tx.commit().await?;

        self.trim_history(&resource.id).await?;
        debug!(id = %resource.id, version = resource.metadata.resource_version, "Stored resource");
        Ok(resource)
    }

    async fn delete(&self, id: &ResourceId) -> Result<()> {
        let mut tx = self.pool.begin_with("BEGIN IMMEDIATE").await?;

        let deleted = sqlx::query("DELETE FROM resources WHERE id = ?")
            .bind(id.as_str())
            .execute(&mut *tx)
            .await?;
        if deleted.rows_affected() == 0 {
            return Err(StoreError::NotFound(id.clone()));
        }

        for table in [
            "DELETE FROM resource_dependencies WHERE resource_id = ?",
            "DELETE FROM resource_state WHERE resource_id = ?",
            "DELETE FROM resource_history WHERE resource_id = ?",
            "DELETE FROM diff_fingerprints WHERE resource_id = ?",
        ] {
            sqlx::query(table)
                .bind(id.as_str())
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn last_known_state(&self, id: &ResourceId) -> Result<ResourceState> {
        Ok(self
            .state_record(id)
            .await?
            .map(|r| r.state)
            .unwrap_or_default())
    }

    async fn state_record(&self, id: &ResourceId) -> Result<Option<StateRecord>> {
        let row = sqlx::query("SELECT state, recorded_at FROM resource_state WHERE resource_id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let state: String = row.try_get("state")?;
        let state = state.parse().map_err(|reason| StoreError::Corrupt {
            id: id.to_string(),
            reason,
        })?;
        Ok(Some(StateRecord {
            state,
            recorded_at: millis_to_datetime(row.try_get("recorded_at")?),
        }))
    }

    async fn update_state(&self, id: &ResourceId, state: ResourceState) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO resource_state (resource_id, state, recorded_at)
            SELECT ?, ?, ? WHERE EXISTS (SELECT 1 FROM resources WHERE id = ?)
            ON CONFLICT(resource_id) DO UPDATE SET
                state = excluded.state,
                recorded_at = excluded.recorded_at
            "#,
        )
        .bind(id.as_str())
        .bind(state.as_str())
        .bind(Utc::now().timestamp_millis())
        .bind(id.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id.clone()));
        }
        Ok(())
    }

    fn all_resources(&self) -> BoxStream<'_, Result<ResourceHeader>> {
        sqlx::query("SELECT id, api_version, kind FROM resources ORDER BY id")
            .fetch(&self.pool)
            .map(|row| row.map_err(StoreError::from).and_then(|row| row_to_header(&row)))
            .boxed()
    }

    fn root_resources(&self) -> BoxStream<'_, Result<ResourceHeader>> {
        sqlx::query(
            r#"
            SELECT id, api_version, kind FROM resources r
            WHERE NOT EXISTS (
                SELECT 1 FROM resource_dependencies d WHERE d.resource_id = r.id
            )
            ORDER BY id
            "#,
        )
        .fetch(&self.pool)
        .map(|row| row.map_err(StoreError::from).and_then(|row| row_to_header(&row)))
        .boxed()
    }

    async fn dependents(&self, id: &ResourceId) -> Result<Vec<ResourceId>> {
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT resource_id FROM resource_dependencies WHERE depends_on = ? ORDER BY resource_id",
        )
        .bind(id.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().map(ResourceId::new).collect())
    }
}

#[async_trait]
impl HistoryStore for SqliteStore {
    async fn append_history(&self, event: ResourceEvent) -> Result<()> {
        if !self.exists(&event.id).await? {
            return Err(StoreError::NotFound(event.id));
        }
        self.insert_history(&self.pool, &event).await?;
        self.trim_history(&event.id).await
    }

    async fn event_history(&self, id: &ResourceId, limit: usize) -> Result<Vec<ResourceEvent>> {
        let rows: Vec<String> = sqlx::query_scalar(
            "SELECT event_json FROM resource_history WHERE resource_id = ? ORDER BY seq DESC LIMIT ?",
        )
        .bind(id.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|json| {
                serde_json::from_str(json).map_err(|e| StoreError::Corrupt {
                    id: id.to_string(),
                    reason: e.to_string(),
                })
            })
            .collect()
    }
}

#[async_trait]
impl DiffStore for SqliteStore {
    async fn record_diff(&self, id: &ResourceId, fingerprint: Fingerprint) -> Result<DiffRecord> {
        // Same fingerprint bumps the seen count; a new one restarts tracking.
        let row = sqlx::query(
            r#"
            INSERT INTO diff_fingerprints (resource_id, fingerprint, seen_count, actions_taken)
            VALUES (?, ?, 1, 0)
            ON CONFLICT(resource_id) DO UPDATE SET
                seen_count = CASE
                    WHEN diff_fingerprints.fingerprint = excluded.fingerprint
                    THEN diff_fingerprints.seen_count + 1 ELSE 1 END,
                actions_taken = CASE
                    WHEN diff_fingerprints.fingerprint = excluded.fingerprint
                    THEN diff_fingerprints.actions_taken ELSE 0 END,
                fingerprint = excluded.fingerprint
            RETURNING fingerprint, seen_count, actions_taken
            "#,
        )
        .bind(id.as_str())
        .bind(fingerprint.as_str())
        .fetch_one(&self.pool)
        .await?;

        row_to_diff_record(&row)
    }

    async fn diff_record(&self, id: &ResourceId) -> Result<Option<DiffRecord>> {
        let row = sqlx::query(
            "SELECT fingerprint, seen_count, actions_taken FROM diff_fingerprints WHERE resource_id = ?",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_diff_record).transpose()
    }

    async fn mark_action_taken(&self, id: &ResourceId) -> Result<()> {
        sqlx::query(
            "UPDATE diff_fingerprints SET actions_taken = actions_taken + 1 WHERE resource_id = ?",
        )
        .bind(id.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn clear_diff(&self, id: &ResourceId) -> Result<()> {
        sqlx::query("DELETE FROM diff_fingerprints WHERE resource_id = ?")
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// TTL lease lock stored in the shared database.
///
/// A lease can be taken over once it has expired; the current holder may
/// renew it at any time.
pub struct SqliteLock {
    pool: SqlitePool,
    holder: String,
}

impl SqliteLock {
    pub fn holder(&self) -> &str {
        &self.holder
    }
}

#[async_trait]
impl LockProvider for SqliteLock {
    async fn try_acquire(&self, name: &str, ttl: Duration) -> std::result::Result<bool, LockError> {
        let now = Utc::now().timestamp_millis();
        let expires_at = now + ttl.as_millis() as i64;

        let result = sqlx::query(
            r#"
            INSERT INTO locks (name, holder, expires_at) VALUES (?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
                holder = excluded.holder,
                expires_at = excluded.expires_at
            WHERE locks.expires_at <= ? OR locks.holder = excluded.holder
            "#,
        )
        .bind(name)
        .bind(&self.holder)
        .bind(expires_at)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn release(&self, name: &str) -> std::result::Result<(), LockError> {
        sqlx::query("DELETE FROM locks WHERE name = ? AND holder = ?")
            .bind(name)
            .bind(&self.holder)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
