//! In-memory session storage.

use std::{
    collections::HashMap,
    sync::{
        RwLock,
        atomic::{AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use qrlink_core::traits::{
    SessionId, SessionRecord, SessionStats, SessionStatus, SessionStore, StorageError,
};

use super::now;

struct Stored {
    record: SessionRecord,
    /// Insertion order, breaks `connected_at` ties.
    seq: u64,
}

/// In-memory storage implementation.
///
/// Useful for development and tests.
/// Data is lost on restart.
pub struct MemoryStorage {
    sessions: RwLock<HashMap<SessionId, Stored>>,
    next_seq: AtomicU64,
}

impl MemoryStorage {
    /// Create a new in-memory storage.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
        }
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

fn keep_if_empty(current: &mut String, update: &str) {
    if !update.is_empty() {
        *current = update.to_string();
    }
}

#[async_trait]
impl SessionStore for MemoryStorage {
    async fn save_session(
        &self,
        id: SessionId,
        display_name: &str,
        remote_id: &str,
        phone_number: &str,
    ) -> Result<(), StorageError> {
        let timestamp = now();
        let mut sessions = self
            .sessions
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))?;

        let stored = sessions.entry(id).or_insert_with(|| Stored {
            record: SessionRecord {
                id,
                name: String::new(),
                remote_id: String::new(),
                phone_number: String::new(),
                status: SessionStatus::Connected,
                stats: SessionStats::default(),
                connected_at: timestamp,
                last_active: timestamp,
                created_at: timestamp,
            },
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
        });

        let record = &mut stored.record;
        record.name = display_name.to_string();
        keep_if_empty(&mut record.remote_id, remote_id);
        keep_if_empty(&mut record.phone_number, phone_number);
        record.status = SessionStatus::Connected;
        record.last_active = timestamp;

        Ok(())
    }

    async fn update_session_stats(
        &self,
        id: SessionId,
        stats: SessionStats,
    ) -> Result<(), StorageError> {
        let mut sessions = self
            .sessions
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))?;

        let stored = sessions.get_mut(&id).ok_or(StorageError::NotFound(id))?;

        stored.record.stats = stats;
        stored.record.last_active = now();

        Ok(())
    }

    async fn get_session(&self, id: SessionId) -> Result<Option<SessionRecord>, StorageError> {
        Ok(self
            .sessions
            .read()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .get(&id)
            .map(|s| s.record.clone()))
    }

    async fn list_sessions(&self) -> Result<Vec<SessionRecord>, StorageError> {
        let sessions = self
            .sessions
            .read()
            .map_err(|e| StorageError::Internal(e.to_string()))?;

        let mut connected: Vec<&Stored> = sessions
            .values()
            .filter(|s| s.record.status == SessionStatus::Connected)
            .collect();

        // Newest connection first
        connected.sort_by(|a, b| {
            b.record
                .connected_at
                .cmp(&a.record.connected_at)
                .then(b.seq.cmp(&a.seq))
        });

        Ok(connected.into_iter().map(|s| s.record.clone()).collect())
    }

    async fn delete_session(&self, id: SessionId) -> Result<bool, StorageError> {
        Ok(self
            .sessions
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .remove(&id)
            .is_some())
    }
}
