//! Translates protocol events into handle transitions and store updates.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex, PoisonError, Weak},
};

use qrlink_core::{
    ProtocolEvent,
    traits::{
        ClientFactory, DeviceIdentity, EventHandler, ProtocolClient, SessionId, SessionStats,
        SessionStore,
    },
};
use tokio::sync::mpsc;

use crate::{handle::SessionHandle, manager::SessionManager};

/// Store update queued by the relay, applied in order.
#[derive(Debug)]
enum StoreOp {
    Save(Option<DeviceIdentity>),
    Stats(SessionStats),
    /// Delete every trace of the session. Last operation.
    Purge,
}

#[derive(Debug, Default)]
struct Tally {
    chats: HashSet<String>,
    contacts: u32,
    groups: u32,
}

impl Tally {
    fn stats(&self) -> SessionStats {
        SessionStats {
            contacts: self.contacts,
            groups: self.groups,
            conversations: u32::try_from(self.chats.len()).unwrap_or(u32::MAX),
        }
    }
}

/// Per-session event adapter.
///
/// Holds the handle weakly: the handler lives inside the handle's client.
pub(crate) struct EventRelay<C> {
    session_id: SessionId,
    handle: Weak<SessionHandle<C>>,
    tally: Mutex<Tally>,
    ops: mpsc::UnboundedSender<StoreOp>,
}

impl<C: ProtocolClient + 'static> EventRelay<C> {
    /// Build the relay and spawn the task applying its store updates.
    pub(crate) fn new<F, S>(
        manager: &Arc<SessionManager<F, S>>,
        handle: &Arc<SessionHandle<C>>,
    ) -> Self
    where
        F: ClientFactory<Client = C> + 'static,
        S: SessionStore + 'static,
    {
        let (ops, rx) = mpsc::unbounded_channel();
        tokio::spawn(apply_store_ops(Arc::downgrade(manager), handle.id(), rx));
        Self {
            session_id: handle.id(),
            handle: Arc::downgrade(handle),
            tally: Mutex::new(Tally::default()),
            ops,
        }
    }

    pub(crate) fn into_handler(self) -> EventHandler {
        Arc::new(move |event: ProtocolEvent| self.dispatch(event))
    }

    fn queue(&self, op: StoreOp) {
        if self.ops.send(op).is_err() {
            tracing::debug!(session_id = %self.session_id, "Store updates already closed");
        }
    }

    fn update_stats(&self, update: impl FnOnce(&mut Tally)) {
        let stats = {
            let mut tally = self.tally.lock().unwrap_or_else(PoisonError::into_inner);
            update(&mut tally);
            tally.stats()
        };
        self.queue(StoreOp::Stats(stats));
    }

    fn dispatch(&self, event: ProtocolEvent) {
        let id = self.session_id;
        let Some(handle) = self.handle.upgrade().filter(|h| !h.is_closed()) else {
            tracing::debug!(session_id = %id, event = event.kind(), "Event for a removed session");
            return;
        };

        match event {
            ProtocolEvent::Connected => {
                handle.set_connected(true);
                self.queue(StoreOp::Save(handle.identity()));
            }
            ProtocolEvent::Disconnected => {
                handle.set_connected(false);
            }
            ProtocolEvent::LoggedOut { reason } => {
                tracing::warn!(
                    session_id = %id,
                    reason = reason.as_deref().unwrap_or("unspecified"),
                    "Session logged out"
                );
                handle.mark_logged_out();
                self.queue(StoreOp::Purge);
            }
            ProtocolEvent::PairSuccess(identity) => {
                tracing::info!(
                    session_id = %id,
                    remote_id = %identity.remote_id,
                    "Pairing confirmed"
                );
                handle.set_identity(identity.clone());
                self.queue(StoreOp::Save(Some(identity)));
            }
            ProtocolEvent::Message { chat, sender } => {
                tracing::debug!(session_id = %id, chat = %chat, sender = %sender, "Message received");
                self.update_stats(|tally| {
                    tally.chats.insert(chat);
                });
            }
            ProtocolEvent::ContactsSynced { count } => {
                self.update_stats(|tally| tally.contacts = count);
            }
            ProtocolEvent::GroupsSynced { count } => {
                self.update_stats(|tally| tally.groups = count);
            }
            ProtocolEvent::QrShown => {
                tracing::debug!(session_id = %id, "QR code displayed by client");
            }
            ProtocolEvent::ConnectFailure { reason } => {
                tracing::warn!(session_id = %id, reason = %reason, "Server rejected connection");
            }
            ProtocolEvent::ClientOutdated => {
                tracing::warn!(session_id = %id, "Protocol client is outdated");
            }
            ProtocolEvent::Other(kind) => {
                tracing::debug!(session_id = %id, event = %kind, "Ignoring protocol event");
            }
        }
    }
}

/// Apply queued store updates until the relay is dropped or a purge runs.
async fn apply_store_ops<F, S>(
    manager: Weak<SessionManager<F, S>>,
    id: SessionId,
    mut ops: mpsc::UnboundedReceiver<StoreOp>,
) where
    F: ClientFactory + 'static,
    S: SessionStore + 'static,
{
    while let Some(op) = ops.recv().await {
        let Some(manager) = manager.upgrade() else {
            break;
        };
        if !matches!(op, StoreOp::Purge) && manager.get_session(id).await.is_err() {
            tracing::debug!(session_id = %id, ?op, "Dropping store update for a removed session");
            continue;
        }

        match op {
            StoreOp::Save(identity) => {
                let identity = identity.unwrap_or_default();
                let result = manager
                    .store()
                    .save_session(
                        id,
                        &manager.config().display_name,
                        &identity.remote_id,
                        &identity.phone_number,
                    )
                    .await;
                match result {
                    Ok(()) => tracing::debug!(session_id = %id, "Session persisted"),
                    Err(e) => tracing::error!(session_id = %id, "Failed to save session: {e}"),
                }
            }
            StoreOp::Stats(stats) => {
                if let Err(e) = manager.store().update_session_stats(id, stats).await {
                    tracing::error!(session_id = %id, "Failed to update session stats: {e}");
                }
            }
            StoreOp::Purge => {
                match manager.delete_session(id).await {
                    Ok(()) => tracing::info!(session_id = %id, "Logged out session purged"),
                    Err(e) => tracing::error!(session_id = %id, "Failed to purge logged out session: {e}"),
                }
                break;
            }
        }
    }
}
