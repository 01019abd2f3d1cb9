//! Pairing flow: one QR code per pairing attempt.
//!
//! The raw QR stream of a client may carry several rotating codes and
//! terminal signals. The flow forwards codes onto a channel with a buffer of
//! one and hands the first code the caller is ready for back to it.
//!
//! The QR channel is always opened before connect is issued, so the first
//! code cannot be emitted before anyone listens.

use std::{sync::Arc, time::Duration};

use qrlink_core::{
    PairingContext, QrEvent, QrItem, SessionEventKind, SessionFeed,
    traits::{ClientFactory, ProtocolClient, ProtocolError, SessionId, SessionStore},
};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::{
    handle::SessionHandle,
    manager::{ManagerError, SessionManager},
};

/// Outward code channel capacity.
const CODE_BUFFER: usize = 1;

/// Result of a successful pairing request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PairingCode {
    pub session_id: SessionId,
    pub code: String,
}

impl<C: ProtocolClient + 'static> SessionHandle<C> {
    /// Open the client's QR channel and forward its codes.
    ///
    /// The returned channel closes when the raw stream closes or `ctx` is
    /// done. A code is never forwarded after that, and a full buffer never
    /// blocks the forwarder past the deadline.
    ///
    /// # Errors
    /// Returns `QrChannel` if the client refuses to open the channel.
    pub async fn qr_codes(
        &self,
        ctx: &PairingContext,
    ) -> Result<mpsc::Receiver<String>, ManagerError> {
        let raw = self
            .client()
            .qr_channel(ctx)
            .await
            .map_err(|source| ManagerError::QrChannel {
                session_id: self.id(),
                source,
            })?;

        let (tx, rx) = mpsc::channel(CODE_BUFFER);
        tokio::spawn(forward_codes(
            self.id(),
            raw,
            tx,
            ctx.clone(),
            Arc::clone(self.feed()),
        ));
        Ok(rx)
    }
}

async fn forward_codes(
    id: SessionId,
    mut raw: mpsc::Receiver<QrItem>,
    out: mpsc::Sender<String>,
    ctx: PairingContext,
    feed: Arc<SessionFeed>,
) {
    loop {
        let item = tokio::select! {
            biased;
            () = ctx.done() => {
                tracing::debug!(session_id = %id, "Pairing context done, closing QR channel");
                break;
            }
            item = raw.recv() => item,
        };
        let Some(item) = item else {
            tracing::debug!(session_id = %id, "Raw QR channel closed");
            break;
        };

        match item.event {
            QrEvent::Code => {
                tokio::select! {
                    biased;
                    () = ctx.done() => {
                        tracing::debug!(session_id = %id, "Pairing deadline passed with a code pending");
                        break;
                    }
                    sent = out.send(item.code.clone()) => {
                        if sent.is_err() {
                            tracing::debug!(session_id = %id, "QR consumer gone");
                            break;
                        }
                        feed.publish(id, SessionEventKind::QrCode { code: item.code });
                    }
                }
            }
            QrEvent::Success => {
                tracing::info!(session_id = %id, "QR pairing succeeded");
            }
            QrEvent::Timeout => {
                tracing::warn!(session_id = %id, "Client ran out of QR codes");
            }
            QrEvent::Other(event) => {
                tracing::debug!(session_id = %id, event = %event, "Ignoring QR event");
            }
        }
    }
}

impl<F, S> SessionManager<F, S>
where
    F: ClientFactory + 'static,
    S: SessionStore + 'static,
{
    /// Start a pairing attempt with the configured deadline.
    ///
    /// # Errors
    /// See [`SessionManager::start_pairing_with_timeout`].
    pub async fn start_pairing(self: &Arc<Self>) -> Result<PairingCode, ManagerError> {
        self.start_pairing_with_timeout(self.config().qr_timeout).await
    }

    /// Create a session and return its first pairing code.
    ///
    /// The session stays registered and keeps connecting on success. On any
    /// failure it is removed and its store file deleted.
    ///
    /// # Errors
    /// Returns `ProtocolInit`, `QrChannel`, `Connect`, `QrTimeout`,
    /// `QrChannelClosed`, or `NotFound` if the session was removed meanwhile.
    pub async fn start_pairing_with_timeout(
        self: &Arc<Self>,
        timeout: Duration,
    ) -> Result<PairingCode, ManagerError> {
        let handle = self.create_session().await?;
        let id = handle.id();
        let ctx = handle.pairing_context(timeout);

        match first_code(&handle, &ctx).await {
            Ok(code) => {
                tracing::info!(session_id = %id, "Pairing code issued");
                Ok(PairingCode {
                    session_id: id,
                    code,
                })
            }
            Err(e) => {
                tracing::warn!(session_id = %id, "Pairing failed: {e}");
                ctx.cancel();
                self.remove_session(id).await;
                self.artifacts().purge(id).await;
                Err(e)
            }
        }
    }
}

async fn first_code<C: ProtocolClient + 'static>(
    handle: &Arc<SessionHandle<C>>,
    ctx: &PairingContext,
) -> Result<String, ManagerError> {
    let id = handle.id();
    let mut codes = handle.qr_codes(ctx).await?;

    let mut connector = tokio::spawn({
        let handle = Arc::clone(handle);
        async move { handle.start_connect().await }
    });
    let mut connect_settled = false;

    loop {
        tokio::select! {
            biased;
            code = codes.recv() => {
                return match code {
                    Some(code) => Ok(code),
                    None if ctx.is_done() => Err(deadline_error(handle)),
                    None => Err(ManagerError::QrChannelClosed(id)),
                };
            }
            joined = &mut connector, if !connect_settled => {
                connect_settled = true;
                match joined {
                    Ok(Ok(())) => {
                        tracing::debug!(session_id = %id, "Connect issued, waiting for pairing code");
                    }
                    Ok(Err(e)) => return Err(e),
                    Err(e) => {
                        return Err(ManagerError::Connect {
                            session_id: id,
                            source: ProtocolError::Connect(format!("connect task failed: {e}")),
                        });
                    }
                }
            }
            () = ctx.done() => return Err(deadline_error(handle)),
        }
    }
}

fn deadline_error<C: ProtocolClient>(handle: &SessionHandle<C>) -> ManagerError {
    if handle.is_closed() {
        ManagerError::NotFound(handle.id())
    } else {
        ManagerError::QrTimeout(handle.id())
    }
}
