//! Deferred removal of sessions that never finish pairing.

use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use qrlink_core::traits::{ClientFactory, SessionId, SessionStore};

use crate::{handle::SessionHandle, manager::SessionManager};

/// Schedule the single cleanup check of `handle`.
///
/// At `created_at + grace` the session is removed and its store file deleted
/// unless it connected in the meantime. The task ends early if the handle
/// is removed first.
pub(crate) fn schedule<F, S>(
    manager: Weak<SessionManager<F, S>>,
    handle: &SessionHandle<F::Client>,
    grace: Duration,
) where
    F: ClientFactory + 'static,
    S: SessionStore + 'static,
{
    let id = handle.id();
    let lifetime = handle.lifetime().clone();
    let expires_at = handle.created_at() + grace;

    tokio::spawn(async move {
        tokio::select! {
            () = lifetime.cancelled() => {
                tracing::debug!(session_id = %id, "Cleanup check dropped, session already removed");
                return;
            }
            () = tokio::time::sleep_until(expires_at) => {}
        }

        let Some(manager) = manager.upgrade() else {
            return;
        };
        expire_unpaired(&manager, id).await;
    });
}

async fn expire_unpaired<F, S>(manager: &Arc<SessionManager<F, S>>, id: SessionId)
where
    F: ClientFactory + 'static,
    S: SessionStore + 'static,
{
    if manager.remove_if_unconnected(id).await {
        tracing::info!(session_id = %id, "Removing session that did not finish pairing");
        manager.artifacts().purge(id).await;
    } else {
        tracing::debug!(session_id = %id, "Session connected or gone, cleanup skipped");
    }
}
