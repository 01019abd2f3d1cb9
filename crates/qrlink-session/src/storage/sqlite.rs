//! SQLite session storage (feature-gated).

use std::{path::Path, str::FromStr};

use async_trait::async_trait;
use qrlink_core::traits::{
    SessionId, SessionRecord, SessionStats, SessionStatus, SessionStore, StorageError,
};
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use uuid::Uuid;

use super::now;

const SELECT_SESSION: &str = r"SELECT s.id, s.name, s.remote_id, s.phone_number, s.status,
       COALESCE(st.contacts, 0) AS contacts,
       COALESCE(st.group_count, 0) AS group_count,
       COALESCE(st.conversations, 0) AS conversations,
       s.connected_at, s.last_active, s.created_at
FROM sessions s
LEFT JOIN session_stats st ON st.session_id = s.id";

/// SQLite storage implementation.
pub struct SqliteStore {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct SessionRow {
    id: String,
    name: String,
    remote_id: String,
    phone_number: String,
    status: String,
    contacts: i64,
    group_count: i64,
    conversations: i64,
    connected_at: i64,
    last_active: i64,
    created_at: i64,
}

fn count(value: i64) -> u32 {
    u32::try_from(value.max(0)).unwrap_or(u32::MAX)
}

impl TryFrom<SessionRow> for SessionRecord {
    type Error = StorageError;

    fn try_from(row: SessionRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: Uuid::parse_str(&row.id)
                .map_err(|e| StorageError::Internal(format!("invalid session id {}: {e}", row.id)))?,
            name: row.name,
            remote_id: row.remote_id,
            phone_number: row.phone_number,
            status: SessionStatus::from_str(&row.status)?,
            stats: SessionStats {
                contacts: count(row.contacts),
                groups: count(row.group_count),
                conversations: count(row.conversations),
            },
            connected_at: row.connected_at,
            last_active: row.last_active,
            created_at: row.created_at,
        })
    }
}

#[allow(clippy::needless_pass_by_value)]
fn internal(e: sqlx::Error) -> StorageError {
    StorageError::Internal(e.to_string())
}

impl SqliteStore {
    /// Open (creating if needed) the database file at `path`.
    ///
    /// # Errors
    /// Returns error if the database cannot be opened or initialized.
    pub async fn open(path: &Path) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .connect_with(options)
            .await
            .map_err(internal)?;
        Self::with_pool(pool).await
    }

    /// Private in-memory database, for tests and throwaway runs.
    ///
    /// # Errors
    /// Returns error if the database cannot be initialized.
    pub async fn in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(internal)?
            .foreign_keys(true);
        // Every connection would get its own database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(internal)?;
        Self::with_pool(pool).await
    }

    /// Wrap an existing pool, creating the tables if needed.
    ///
    /// # Errors
    /// Returns error if the schema cannot be created.
    pub async fn with_pool(pool: SqlitePool) -> Result<Self, StorageError> {
        Self::init(&pool).await?;
        Ok(Self { pool })
    }

    #[must_use]
    pub const fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn init(pool: &SqlitePool) -> Result<(), StorageError> {
        sqlx::query(
            r"CREATE TABLE IF NOT EXISTS sessions (
                id           TEXT PRIMARY KEY,
                name         TEXT NOT NULL,
                remote_id    TEXT NOT NULL DEFAULT '',
                phone_number TEXT NOT NULL DEFAULT '',
                status       TEXT NOT NULL,
                connected_at INTEGER NOT NULL,
                last_active  INTEGER NOT NULL,
                created_at   INTEGER NOT NULL
            )",
        )
        .execute(pool)
        .await
        .map_err(internal)?;

        sqlx::query(
            r"CREATE TABLE IF NOT EXISTS session_stats (
                id            INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id    TEXT NOT NULL UNIQUE
                              REFERENCES sessions (id) ON DELETE CASCADE,
                contacts      INTEGER NOT NULL DEFAULT 0,
                group_count   INTEGER NOT NULL DEFAULT 0,
                conversations INTEGER NOT NULL DEFAULT 0,
                updated_at    INTEGER NOT NULL
            )",
        )
        .execute(pool)
        .await
        .map_err(internal)?;

        Ok(())
    }
}

#[async_trait]
impl SessionStore for SqliteStore {
    async fn save_session(
        &self,
        id: SessionId,
        display_name: &str,
        remote_id: &str,
        phone_number: &str,
    ) -> Result<(), StorageError> {
        let now = now();
        sqlx::query(
            r"INSERT INTO sessions
                (id, name, remote_id, phone_number, status, connected_at, last_active, created_at)
              VALUES (?, ?, ?, ?, ?, ?, ?, ?)
              ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                remote_id = COALESCE(NULLIF(excluded.remote_id, ''), sessions.remote_id),
                phone_number = COALESCE(NULLIF(excluded.phone_number, ''), sessions.phone_number),
                status = excluded.status,
                last_active = excluded.last_active",
        )
        .bind(id.to_string())
        .bind(display_name)
        .bind(remote_id)
        .bind(phone_number)
        .bind(SessionStatus::Connected.as_str())
        .bind(now)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(internal)?;
        Ok(())
    }

    async fn update_session_stats(
        &self,
        id: SessionId,
        stats: SessionStats,
    ) -> Result<(), StorageError> {
        let now = now();
        let touched = sqlx::query("UPDATE sessions SET last_active = ? WHERE id = ?")
            .bind(now)
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(internal)?;
        if touched.rows_affected() == 0 {
            return Err(StorageError::NotFound(id));
        }

        sqlx::query(
            r"INSERT INTO session_stats (session_id, contacts, group_count, conversations, updated_at)
              VALUES (?, ?, ?, ?, ?)
              ON CONFLICT(session_id) DO UPDATE SET
                contacts = excluded.contacts,
                group_count = excluded.group_count,
                conversations = excluded.conversations,
                updated_at = excluded.updated_at",
        )
        .bind(id.to_string())
        .bind(i64::from(stats.contacts))
        .bind(i64::from(stats.groups))
        .bind(i64::from(stats.conversations))
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(internal)?;
        Ok(())
    }

    async fn get_session(&self, id: SessionId) -> Result<Option<SessionRecord>, StorageError> {
        sqlx::query_as::<_, SessionRow>(&format!("{SELECT_SESSION} WHERE s.id = ?"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(internal)?
            .map(SessionRecord::try_from)
            .transpose()
    }

    async fn list_sessions(&self) -> Result<Vec<SessionRecord>, StorageError> {
        sqlx::query_as::<_, SessionRow>(&format!(
            "{SELECT_SESSION} WHERE s.status = ? ORDER BY s.connected_at DESC, s.rowid DESC"
        ))
        .bind(SessionStatus::Connected.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(internal)?
        .into_iter()
        .map(SessionRecord::try_from)
        .collect()
    }

    async fn delete_session(&self, id: SessionId) -> Result<bool, StorageError> {
        let result = sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(internal)?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use tokio_test::assert_ok;

    use super::*;

    async fn store() -> SqliteStore {
        SqliteStore::in_memory().await.unwrap()
    }

    #[tokio::test]
    async fn test_save_and_get() {
        let store = store().await;
        let id = Uuid::new_v4();

        assert_ok!(
            store
                .save_session(id, "WhatsApp", "5511.0:1@s.whatsapp.net", "5511")
                .await
        );

        let record = store.get_session(id).await.unwrap().unwrap();
        assert_eq!(record.id, id);
        assert_eq!(record.name, "WhatsApp");
        assert_eq!(record.status, SessionStatus::Connected);
        assert_eq!(record.stats, SessionStats::default());
        assert!(store.get_session(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_upsert_keeps_identity_and_connected_at() {
        let store = store().await;
        let id = Uuid::new_v4();
        store.save_session(id, "WhatsApp", "remote", "5511").await.unwrap();
        sqlx::query("UPDATE sessions SET connected_at = 100 WHERE id = ?")
            .bind(id.to_string())
            .execute(store.pool())
            .await
            .unwrap();

        store.save_session(id, "Renamed", "", "").await.unwrap();

        let record = store.get_session(id).await.unwrap().unwrap();
        assert_eq!(record.name, "Renamed");
        assert_eq!(record.remote_id, "remote");
        assert_eq!(record.phone_number, "5511");
        assert_eq!(record.connected_at, 100);
    }

    #[tokio::test]
    async fn test_stats_upsert_and_missing_session() {
        let store = store().await;
        let id = Uuid::new_v4();
        let stats = SessionStats {
            contacts: 120,
            groups: 7,
            conversations: 31,
        };

        let missing = store.update_session_stats(id, stats).await;
        assert!(matches!(missing, Err(StorageError::NotFound(_))));

        store.save_session(id, "WhatsApp", "", "").await.unwrap();
        store.update_session_stats(id, SessionStats::default()).await.unwrap();
        store.update_session_stats(id, stats).await.unwrap();
        assert_eq!(store.get_session(id).await.unwrap().unwrap().stats, stats);
    }

    #[tokio::test]
    async fn test_list_only_connected_newest_first() {
        let store = store().await;
        let (old, new, gone) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        for id in [old, new, gone] {
            store.save_session(id, "WhatsApp", "", "").await.unwrap();
        }
        sqlx::query("UPDATE sessions SET connected_at = connected_at - 60 WHERE id = ?")
            .bind(old.to_string())
            .execute(store.pool())
            .await
            .unwrap();
        sqlx::query("UPDATE sessions SET status = 'logged_out' WHERE id = ?")
            .bind(gone.to_string())
            .execute(store.pool())
            .await
            .unwrap();

        let ids: Vec<_> = store
            .list_sessions()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec![new, old]);
    }

    #[tokio::test]
    async fn test_delete_cascades_stats() {
        let store = store().await;
        let id = Uuid::new_v4();
        store.save_session(id, "WhatsApp", "", "").await.unwrap();
        store
            .update_session_stats(
                id,
                SessionStats {
                    contacts: 1,
                    groups: 1,
                    conversations: 1,
                },
            )
            .await
            .unwrap();

        assert!(store.delete_session(id).await.unwrap());
        assert!(!store.delete_session(id).await.unwrap());

        let (stats_rows,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM session_stats")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(stats_rows, 0);
    }
}
