//! Session registry.

use std::{
    collections::{HashMap, HashSet, hash_map::Entry},
    sync::Arc,
};

use qrlink_core::{
    SessionConfig, SessionEventKind, SessionFeed,
    traits::{
        ClientFactory, ProtocolClient, ProtocolError, SessionId, SessionRecord, SessionStore,
        StorageError,
    },
};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{
    artifacts::ArtifactDir,
    cleanup,
    handle::{ConnectPolicy, SessionHandle},
    relay::EventRelay,
};

/// Session manager error.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("Failed to initialize protocol client for {session_id}: {source}")]
    ProtocolInit {
        session_id: SessionId,
        #[source]
        source: ProtocolError,
    },
    #[error("Connect failed for {session_id}: {source}")]
    Connect {
        session_id: SessionId,
        #[source]
        source: ProtocolError,
    },
    #[error("Connection of {session_id} not confirmed after {attempts} attempts")]
    ConnectTimeout { session_id: SessionId, attempts: u32 },
    #[error("No pairing code delivered for {0} before the deadline")]
    QrTimeout(SessionId),
    #[error("Failed to open QR channel for {session_id}: {source}")]
    QrChannel {
        session_id: SessionId,
        #[source]
        source: ProtocolError,
    },
    #[error("QR channel of {0} closed before a code was delivered")]
    QrChannelClosed(SessionId),
    #[error("Session id already registered: {0}")]
    IdCollision(SessionId),
    #[error("Session not found: {0}")]
    NotFound(SessionId),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

type Registry<C> = HashMap<SessionId, Arc<SessionHandle<C>>>;

/// Registry of live session handles.
///
/// The single source of truth for which sessions exist. Every destruction
/// path goes through [`SessionManager::remove_session`].
pub struct SessionManager<F, S>
where
    F: ClientFactory,
    S: SessionStore,
{
    factory: F,
    store: S,
    config: SessionConfig,
    artifacts: ArtifactDir,
    feed: Arc<SessionFeed>,
    sessions: RwLock<Registry<F::Client>>,
}

impl<F, S> SessionManager<F, S>
where
    F: ClientFactory + 'static,
    S: SessionStore + 'static,
{
    /// Create an empty registry.
    #[must_use]
    pub fn new(factory: F, store: S, config: SessionConfig) -> Arc<Self> {
        Arc::new(Self {
            factory,
            store,
            artifacts: ArtifactDir::new(&config.sessions_dir),
            feed: Arc::new(SessionFeed::with_history(config.feed_history)),
            config,
            sessions: RwLock::new(HashMap::new()),
        })
    }

    #[must_use]
    pub const fn config(&self) -> &SessionConfig {
        &self.config
    }

    #[must_use]
    pub const fn store(&self) -> &S {
        &self.store
    }

    #[must_use]
    pub const fn factory(&self) -> &F {
        &self.factory
    }

    #[must_use]
    pub const fn artifacts(&self) -> &ArtifactDir {
        &self.artifacts
    }

    /// Lifecycle events of every session.
    #[must_use]
    pub const fn feed(&self) -> &Arc<SessionFeed> {
        &self.feed
    }

    /// Allocate a session: store path, protocol client, registry entry,
    /// event relay and cleanup check.
    ///
    /// The registry is unchanged on failure.
    ///
    /// # Errors
    /// Returns `ProtocolInit` if the client or its store cannot be created.
    pub async fn create_session(
        self: &Arc<Self>,
    ) -> Result<Arc<SessionHandle<F::Client>>, ManagerError> {
        let id = Uuid::new_v4();
        let init = |source: ProtocolError| ManagerError::ProtocolInit {
            session_id: id,
            source,
        };

        self.artifacts
            .ensure()
            .await
            .map_err(|e| init(ProtocolError::Io(e)))?;
        let path = self.artifacts.path_for(id);

        let client = match self.factory.open(&path).await {
            Ok(client) => client,
            Err(e) => {
                tracing::error!(session_id = %id, "Failed to open protocol client: {e}");
                self.artifacts.purge(id).await;
                return Err(init(e));
            }
        };

        let handle = Arc::new(SessionHandle::new(
            id,
            client,
            Arc::clone(&self.feed),
            ConnectPolicy::from(&self.config),
        ));

        match self.sessions.write().await.entry(id) {
            Entry::Occupied(_) => {
                // The path belongs to the registered session, leave it alone.
                tracing::error!(session_id = %id, "Session id collision");
                return Err(ManagerError::IdCollision(id));
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&handle));
            }
        }

        // Registered before the first event can be observed.
        handle
            .client()
            .on_event(EventRelay::new(self, &handle).into_handler());
        self.feed.publish(id, SessionEventKind::Created);
        cleanup::schedule(Arc::downgrade(self), &handle, self.config.cleanup_grace);

        tracing::info!(session_id = %id, path = %path.display(), "Session created");
        Ok(handle)
    }

    /// Look up a live session.
    ///
    /// # Errors
    /// Returns `NotFound` if the id is not registered.
    pub async fn get_session(
        &self,
        id: SessionId,
    ) -> Result<Arc<SessionHandle<F::Client>>, ManagerError> {
        self.sessions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(ManagerError::NotFound(id))
    }

    /// Unregister a session and disconnect its client.
    ///
    /// Idempotent: returns whether this call removed it. Only the caller
    /// that took the entry shuts the handle down.
    pub async fn remove_session(&self, id: SessionId) -> bool {
        let taken = self.sessions.write().await.remove(&id);
        match taken {
            Some(handle) => {
                self.retire(&handle).await;
                true
            }
            None => {
                tracing::debug!(session_id = %id, "Session already removed");
                false
            }
        }
    }

    /// Remove a session only if it is still registered and not connected.
    pub(crate) async fn remove_if_unconnected(&self, id: SessionId) -> bool {
        let taken = {
            let mut sessions = self.sessions.write().await;
            match sessions.get(&id) {
                Some(handle) if !handle.is_connected() => sessions.remove(&id),
                _ => None,
            }
        };
        match taken {
            Some(handle) => {
                self.retire(&handle).await;
                true
            }
            None => false,
        }
    }

    async fn retire(&self, handle: &SessionHandle<F::Client>) {
        if handle.shutdown().await {
            self.feed.publish(handle.id(), SessionEventKind::Removed);
            tracing::info!(session_id = %handle.id(), "Session removed");
        }
    }

    /// Remove a session with all its durable state: registry entry, store
    /// file and persisted record.
    ///
    /// # Errors
    /// Returns `NotFound` if neither the registry nor the store knew the id,
    /// or a storage error.
    pub async fn delete_session(&self, id: SessionId) -> Result<(), ManagerError> {
        let live = self.remove_session(id).await;
        self.artifacts.purge(id).await;
        let stored = self.store.delete_session(id).await?;

        if live || stored {
            tracing::info!(session_id = %id, "Session deleted");
            Ok(())
        } else {
            Err(ManagerError::NotFound(id))
        }
    }

    /// Disconnect a live session without removing it.
    ///
    /// # Errors
    /// Returns `NotFound` if the id is not registered.
    pub async fn disconnect_session(&self, id: SessionId) -> Result<(), ManagerError> {
        self.get_session(id).await?.disconnect().await;
        Ok(())
    }

    /// Connectivity flag of a live session.
    ///
    /// # Errors
    /// Returns `NotFound` if the id is not registered.
    pub async fn connection_status(&self, id: SessionId) -> Result<bool, ManagerError> {
        Ok(self.get_session(id).await?.is_connected())
    }

    pub async fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.read().await.keys().copied().collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Connected sessions known to the store.
    ///
    /// # Errors
    /// Returns error if the store fails.
    pub async fn persisted_sessions(&self) -> Result<Vec<SessionRecord>, ManagerError> {
        Ok(self.store.list_sessions().await?)
    }

    /// Delete store files that belong to no live or persisted session.
    ///
    /// # Errors
    /// Returns error if the store or the sessions directory cannot be read.
    pub async fn purge_orphaned_artifacts(&self) -> Result<usize, ManagerError> {
        let mut keep: HashSet<SessionId> = self.session_ids().await.into_iter().collect();
        keep.extend(self.store.list_sessions().await?.into_iter().map(|r| r.id));

        let removed = self.artifacts.purge_except(&keep).await?;
        if removed > 0 {
            tracing::info!(removed, "Purged orphaned session stores");
        }
        Ok(removed)
    }

    /// Remove every live session. Returns how many were removed.
    pub async fn shutdown(&self) -> usize {
        let drained: Vec<_> = self.sessions.write().await.drain().map(|(_, h)| h).collect();
        for handle in &drained {
            self.retire(handle).await;
        }
        tracing::info!(count = drained.len(), "Session manager shut down");
        drained.len()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use qrlink_core::{
        ProtocolEvent,
        sim::{SimScript, SimulatedFactory},
        traits::{DeviceIdentity, SessionStore},
    };
    use tokio_test::{assert_err, assert_ok};

    use super::*;
    use crate::{
        handle::ConnectionState,
        storage::MemoryStorage,
        testing::{manager, manager_with},
    };

    #[tokio::test]
    async fn test_created_ids_are_distinct() {
        let (_dir, manager) = manager();
        let mut ids = HashSet::new();
        for _ in 0..16 {
            let handle = assert_ok!(manager.create_session().await);
            assert!(ids.insert(handle.id()));
            assert_eq!(handle.state(), ConnectionState::Created);
        }
        assert_eq!(manager.len().await, 16);
    }

    #[tokio::test]
    async fn test_create_opens_client_at_session_path() {
        let (_dir, manager) = manager();
        let handle = manager.create_session().await.unwrap();

        let path = manager.artifacts().path_for(handle.id());
        assert_eq!(handle.client().store_path(), path.as_path());
        assert!(path.exists());
        assert_eq!(manager.factory().opened(), 1);
        assert_eq!(
            manager.feed().history_for(handle.id()),
            vec![SessionEventKind::Created]
        );
    }

    #[tokio::test]
    async fn test_protocol_init_failure_leaves_registry_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SessionManager::new(
            SimulatedFactory::failing("device store locked"),
            MemoryStorage::new(),
            SessionConfig::default().with_sessions_dir(dir.path()),
        );

        let err = assert_err!(manager.create_session().await);
        assert!(matches!(err, ManagerError::ProtocolInit { .. }));
        assert!(manager.is_empty().await);
        assert!(manager.artifacts().list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let (_dir, manager) = manager();
        let handle = manager.create_session().await.unwrap();
        let id = handle.id();

        assert!(manager.remove_session(id).await);
        assert!(!manager.remove_session(id).await);

        assert!(manager.is_empty().await);
        assert!(handle.is_closed());
        assert_eq!(handle.client().disconnect_calls(), 1);
        let removed = manager
            .feed()
            .history_for(id)
            .into_iter()
            .filter(|k| *k == SessionEventKind::Removed)
            .count();
        assert_eq!(removed, 1);
    }

    #[tokio::test]
    async fn test_concurrent_removal_disconnects_once() {
        let (_dir, manager) = manager();
        let handle = manager.create_session().await.unwrap();
        let id = handle.id();

        let (a, b) = tokio::join!(manager.remove_session(id), manager.remove_session(id));
        assert!(a ^ b);
        assert_eq!(handle.client().disconnect_calls(), 1);
    }

    #[tokio::test]
    async fn test_get_after_remove_is_not_found() {
        let (_dir, manager) = manager();
        let id = manager.create_session().await.unwrap().id();
        assert_ok!(manager.get_session(id).await);

        manager.remove_session(id).await;

        let err = assert_err!(manager.get_session(id).await);
        assert!(matches!(err, ManagerError::NotFound(missing) if missing == id));
        assert!(matches!(
            manager.connection_status(id).await,
            Err(ManagerError::NotFound(_))
        ));
        assert!(matches!(
            manager.disconnect_session(id).await,
            Err(ManagerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_logged_out_event_removes_session() {
        let (_dir, manager) = manager();
        let handle = manager.create_session().await.unwrap();
        let id = handle.id();
        let path = manager.artifacts().path_for(id);

        handle.client().scan(DeviceIdentity {
            remote_id: "5511999990000.0:1@s.whatsapp.net".to_string(),
            phone_number: "5511999990000".to_string(),
        });
        assert!(handle.is_connected());

        handle.client().logout(Some("revoked from device".to_string()));
        assert_eq!(handle.state(), ConnectionState::LoggedOut);

        tokio::time::timeout(Duration::from_secs(5), async {
            while !manager.is_empty().await || manager.store().get_session(id).await.unwrap().is_some()
            {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert!(handle.is_closed());
        assert!(!path.exists());
        assert_eq!(handle.client().connect_calls(), 0);
        assert_eq!(handle.client().disconnect_calls(), 1);
    }

    #[tokio::test]
    async fn test_delete_session_purges_everything() {
        let (_dir, manager) = manager();
        let handle = manager.create_session().await.unwrap();
        let id = handle.id();
        manager
            .store()
            .save_session(id, "WhatsApp", "remote", "5511")
            .await
            .unwrap();

        assert_ok!(manager.delete_session(id).await);
        assert!(manager.is_empty().await);
        assert!(manager.store().get_session(id).await.unwrap().is_none());
        assert!(!manager.artifacts().path_for(id).exists());

        let err = assert_err!(manager.delete_session(id).await);
        assert!(matches!(err, ManagerError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_delete_persisted_only_session() {
        let (_dir, manager) = manager();
        let id = Uuid::new_v4();
        manager
            .store()
            .save_session(id, "WhatsApp", "", "")
            .await
            .unwrap();

        assert_ok!(manager.delete_session(id).await);
        assert!(manager.persisted_sessions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_session_keeps_registration() {
        let (_dir, manager) = manager();
        let handle = manager.create_session().await.unwrap();
        handle.client().emit(ProtocolEvent::Connected);
        assert!(manager.connection_status(handle.id()).await.unwrap());

        assert_ok!(manager.disconnect_session(handle.id()).await);
        assert!(!manager.connection_status(handle.id()).await.unwrap());
        assert_eq!(manager.len().await, 1);
    }

    #[tokio::test]
    async fn test_shutdown_removes_all() {
        let (_dir, manager) = manager_with(SimScript::default());
        let a = manager.create_session().await.unwrap();
        let b = manager.create_session().await.unwrap();

        assert_eq!(manager.shutdown().await, 2);
        assert!(manager.is_empty().await);
        assert!(a.is_closed() && b.is_closed());
    }

    #[tokio::test]
    async fn test_purge_orphaned_artifacts_keeps_known_sessions() {
        let (_dir, manager) = manager();
        let live = manager.create_session().await.unwrap().id();
        let persisted = Uuid::new_v4();
        let orphan = Uuid::new_v4();
        for id in [persisted, orphan] {
            tokio::fs::write(manager.artifacts().path_for(id), b"")
                .await
                .unwrap();
        }
        manager
            .store()
            .save_session(persisted, "WhatsApp", "", "")
            .await
            .unwrap();

        assert_eq!(manager.purge_orphaned_artifacts().await.unwrap(), 1);
        assert!(manager.artifacts().path_for(live).exists());
        assert!(manager.artifacts().path_for(persisted).exists());
        assert!(!manager.artifacts().path_for(orphan).exists());
    }
}
