//! Session handle and its connection state machine.

use std::{
    fmt,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use qrlink_core::{
    PairingContext, SessionConfig, SessionEventKind, SessionFeed,
    traits::{DeviceIdentity, ProtocolClient, SessionId},
};
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::manager::ManagerError;

/// Connection state of a handle.
///
/// `Created -> Connecting -> Connected -> Disconnected`, or
/// `Created -> Connecting -> LoggedOut`. `LoggedOut` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Client allocated, connect not requested yet.
    Created,
    /// Connect issued, pairing may be outstanding.
    Connecting,
    /// Protocol confirmed an authenticated session.
    Connected,
    /// Was connected, or explicitly disconnected.
    Disconnected,
    /// Remote party revoked the session.
    LoggedOut,
}

impl ConnectionState {
    /// Value of the connectivity flag in this state.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }
}

/// Bounded polling applied after a successful `connect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl From<&SessionConfig> for ConnectPolicy {
    fn from(config: &SessionConfig) -> Self {
        Self {
            attempts: config.connect_attempts,
            interval: config.connect_poll_interval,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Transition {
    Connecting,
    Connected(bool),
    /// Undo a `Connecting` whose connect call failed.
    Revert(ConnectionState),
    LoggedOut,
}

/// One connection attempt: owns its protocol client and connectivity state.
///
/// The client is never shared. Mutating client calls go through the
/// handle so that `connect` and `disconnect` never overlap.
pub struct SessionHandle<C> {
    id: SessionId,
    created_at: Instant,
    client: C,
    state: Mutex<ConnectionState>,
    identity: Mutex<Option<DeviceIdentity>>,
    client_ops: tokio::sync::Mutex<()>,
    /// Cancelled on removal; parent of pairing contexts and the cleanup check.
    lifetime: CancellationToken,
    closed: AtomicBool,
    feed: Arc<SessionFeed>,
    policy: ConnectPolicy,
}

impl<C: ProtocolClient> SessionHandle<C> {
    pub(crate) fn new(
        id: SessionId,
        client: C,
        feed: Arc<SessionFeed>,
        policy: ConnectPolicy,
    ) -> Self {
        Self {
            id,
            created_at: Instant::now(),
            client,
            state: Mutex::new(ConnectionState::Created),
            identity: Mutex::new(None),
            client_ops: tokio::sync::Mutex::new(()),
            lifetime: CancellationToken::new(),
            closed: AtomicBool::new(false),
            feed,
            policy,
        }
    }

    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.id
    }

    #[must_use]
    pub const fn created_at(&self) -> Instant {
        self.created_at
    }

    /// The protocol client owned by this handle.
    #[must_use]
    pub const fn client(&self) -> &C {
        &self.client
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Connectivity flag.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Whether the handle was removed and its client shut down.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Identity reported by the last successful pairing.
    #[must_use]
    pub fn identity(&self) -> Option<DeviceIdentity> {
        self.identity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set_identity(&self, identity: DeviceIdentity) {
        *self.identity.lock().unwrap_or_else(PoisonError::into_inner) = Some(identity);
    }

    pub(crate) fn lifetime(&self) -> &CancellationToken {
        &self.lifetime
    }

    pub(crate) const fn feed(&self) -> &Arc<SessionFeed> {
        &self.feed
    }

    /// Pairing context bounded by `timeout` and by the handle's lifetime.
    #[must_use]
    pub fn pairing_context(&self, timeout: Duration) -> PairingContext {
        PairingContext::child_of(&self.lifetime, timeout)
    }

    /// Single writer of the connection state.
    ///
    /// A removed handle can only move away from `Connected`. Feed notifications are published while the state lock is held so
    /// edges reach subscribers in the order they happened.
    fn apply(&self, transition: Transition) -> (ConnectionState, ConnectionState) {
        use ConnectionState as S;

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let prev = *state;
        if self.is_closed()
            && matches!(transition, Transition::Connecting | Transition::Connected(true))
        {
            tracing::debug!(session_id = %self.id, ?transition, "Ignoring transition of a removed session");
            return (prev, prev);
        }
        let next = match (prev, transition) {
            (S::LoggedOut, _) => S::LoggedOut,
            (_, Transition::LoggedOut) => S::LoggedOut,
            (S::Connected, Transition::Connecting) => S::Connected,
            (_, Transition::Connecting) => S::Connecting,
            (_, Transition::Connected(true)) => S::Connected,
            (S::Connected, Transition::Connected(false)) => S::Disconnected,
            (S::Connecting, Transition::Revert(prior)) => prior,
            (other, Transition::Connected(false) | Transition::Revert(_)) => other,
        };
        *state = next;

        if prev != next {
            match next {
                S::Connecting => self.feed.publish(self.id, SessionEventKind::Connecting),
                S::LoggedOut => self.feed.publish(self.id, SessionEventKind::LoggedOut),
                _ => {}
            }
        }
        if prev.is_connected() != next.is_connected() {
            if next.is_connected() {
                tracing::info!(session_id = %self.id, "Session status changed to CONNECTED");
                self.feed.publish(self.id, SessionEventKind::Connected);
            } else {
                tracing::info!(session_id = %self.id, "Session status changed to DISCONNECTED");
                self.feed.publish(self.id, SessionEventKind::Disconnected);
            }
        }
        (prev, next)
    }

    /// Set the connectivity flag.
    ///
    /// Edge-triggered: returns whether the flag changed, and only a change
    /// is logged and published.
    pub fn set_connected(&self, connected: bool) -> bool {
        let (prev, next) = self.apply(Transition::Connected(connected));
        prev.is_connected() != next.is_connected()
    }

    pub(crate) fn mark_logged_out(&self) {
        self.set_connected(false);
        self.apply(Transition::LoggedOut);
    }

    /// Issue the protocol connect without waiting for confirmation.
    ///
    /// On failure the handle returns to the state it had before.
    ///
    /// # Errors
    /// Returns `NotFound` if the handle was removed, `Connect` if the client fails.
    pub async fn start_connect(&self) -> Result<(), ManagerError> {
        let _guard = self.client_ops.lock().await;
        if self.is_closed() {
            return Err(ManagerError::NotFound(self.id));
        }

        let (prior, _) = self.apply(Transition::Connecting);
        tracing::info!(session_id = %self.id, "Starting connection");

        if let Err(source) = self.client.connect().await {
            tracing::warn!(session_id = %self.id, "Connect failed: {source}");
            self.apply(Transition::Revert(prior));
            return Err(ManagerError::Connect {
                session_id: self.id,
                source,
            });
        }
        Ok(())
    }

    /// Connect and wait until the protocol reports a live connection.
    ///
    /// No-op if already connected. When polling runs out the connect attempt
    /// stays in flight and later protocol events still update the handle.
    ///
    /// # Errors
    /// Returns `Connect` if the client fails, `ConnectTimeout` if polling runs out.
    pub async fn connect(&self) -> Result<(), ManagerError> {
        if self.is_connected() {
            tracing::debug!(session_id = %self.id, "Already connected, ignoring connect request");
            return Ok(());
        }

        self.start_connect().await?;

        for attempt in 0..self.policy.attempts {
            if attempt > 0 {
                tokio::time::sleep(self.policy.interval).await;
            }
            if self.client.is_connected() {
                self.set_connected(true);
                tracing::info!(session_id = %self.id, "Connection established");
                return Ok(());
            }
        }

        tracing::warn!(
            session_id = %self.id,
            attempts = self.policy.attempts,
            "Timed out waiting for connection"
        );
        Err(ManagerError::ConnectTimeout {
            session_id: self.id,
            attempts: self.policy.attempts,
        })
    }

    /// Disconnect the client. No-op if not connected or already removed.
    pub async fn disconnect(&self) {
        let _guard = self.client_ops.lock().await;
        if self.is_closed() || !self.is_connected() {
            tracing::debug!(session_id = %self.id, "Disconnect requested on a session that is not connected");
            return;
        }

        tracing::info!(session_id = %self.id, "Disconnecting active session");
        self.client.disconnect().await;
        self.set_connected(false);
    }

    /// Tear the handle down: cancel its tasks and disconnect the client.
    ///
    /// Runs once; returns `false` on repeated calls.
    pub(crate) async fn shutdown(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.lifetime.cancel();
        {
            let _guard = self.client_ops.lock().await;
            self.client.disconnect().await;
        }
        self.set_connected(false);
        true
    }
}

impl<C> fmt::Debug for SessionHandle<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("state", &*self.state.lock().unwrap_or_else(PoisonError::into_inner))
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use qrlink_core::sim::{SimScript, SimulatedClient};
    use tokio_test::{assert_err, assert_ok};
    use uuid::Uuid;

    use super::*;

    fn handle_with(script: SimScript, policy: ConnectPolicy) -> SessionHandle<SimulatedClient> {
        let id = Uuid::new_v4();
        SessionHandle::new(
            id,
            SimulatedClient::new(format!("/tmp/{id}.db"), script),
            Arc::new(SessionFeed::new()),
            policy,
        )
    }

    fn handle() -> SessionHandle<SimulatedClient> {
        handle_with(
            SimScript::default(),
            ConnectPolicy::from(&SessionConfig::default()),
        )
    }

    fn connected_events(handle: &SessionHandle<SimulatedClient>) -> usize {
        handle
            .feed
            .history_for(handle.id())
            .iter()
            .filter(|k| **k == SessionEventKind::Connected)
            .count()
    }

    #[test]
    fn test_set_connected_is_edge_triggered() {
        let handle = handle();

        assert!(handle.set_connected(true));
        assert!(!handle.set_connected(true));
        assert!(handle.is_connected());
        assert_eq!(connected_events(&handle), 1);

        assert!(handle.set_connected(false));
        assert!(!handle.set_connected(false));
        assert_eq!(handle.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_disconnected_event_while_connecting_keeps_state() {
        let handle = handle();
        handle.apply(Transition::Connecting);
        assert!(!handle.set_connected(false));
        assert_eq!(handle.state(), ConnectionState::Connecting);
    }

    #[tokio::test]
    async fn test_connect_noop_when_connected() {
        let handle = handle();
        handle.set_connected(true);

        assert_ok!(handle.connect().await);
        assert_eq!(handle.client().connect_calls(), 0);
    }

    #[tokio::test]
    async fn test_connect_confirms_connection() {
        let handle = handle();

        assert_ok!(handle.connect().await);
        assert_eq!(handle.state(), ConnectionState::Connected);
        assert_eq!(
            handle.feed.history_for(handle.id()),
            vec![SessionEventKind::Connecting, SessionEventKind::Connected]
        );
    }

    #[tokio::test]
    async fn test_connect_failure_restores_prior_state() {
        let handle = handle_with(
            SimScript {
                fail_connect: Some("refused".to_string()),
                ..SimScript::default()
            },
            ConnectPolicy::from(&SessionConfig::default()),
        );

        let err = assert_err!(handle.connect().await);
        assert!(matches!(err, ManagerError::Connect { .. }));
        assert_eq!(handle.state(), ConnectionState::Created);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_leaves_attempt_in_flight() {
        let handle = handle_with(
            SimScript {
                confirm_connect: false,
                ..SimScript::default()
            },
            ConnectPolicy {
                attempts: 3,
                interval: Duration::from_secs(1),
            },
        );

        let started = Instant::now();
        let err = assert_err!(handle.connect().await);
        assert!(matches!(err, ManagerError::ConnectTimeout { attempts: 3, .. }));
        assert_eq!(started.elapsed(), Duration::from_secs(2));
        assert_eq!(handle.state(), ConnectionState::Connecting);

        // A later protocol confirmation is still honored.
        assert!(handle.set_connected(true));
        assert!(handle.is_connected());
    }

    #[tokio::test]
    async fn test_disconnect_only_when_connected() {
        let handle = handle();
        handle.disconnect().await;
        assert_eq!(handle.client().disconnect_calls(), 0);

        handle.set_connected(true);
        handle.disconnect().await;
        assert_eq!(handle.client().disconnect_calls(), 1);
        assert_eq!(handle.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_shutdown_runs_once() {
        let handle = handle();
        handle.set_connected(true);

        assert!(handle.shutdown().await);
        assert!(!handle.shutdown().await);
        assert_eq!(handle.client().disconnect_calls(), 1);
        assert!(handle.lifetime().is_cancelled());
        assert!(!handle.is_connected());

        let err = assert_err!(handle.start_connect().await);
        assert!(matches!(err, ManagerError::NotFound(_)));
        assert_eq!(handle.client().connect_calls(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_waiting_behind_shutdown_does_not_repeat() {
        let handle = Arc::new(handle());
        handle.set_connected(true);
        let guard = handle.client_ops.lock().await;

        let shutdown = tokio::spawn({
            let handle = Arc::clone(&handle);
            async move { handle.shutdown().await }
        });
        tokio::task::yield_now().await;
        let disconnect = tokio::spawn({
            let handle = Arc::clone(&handle);
            async move { handle.disconnect().await }
        });
        tokio::task::yield_now().await;

        drop(guard);
        assert!(shutdown.await.unwrap());
        disconnect.await.unwrap();
        assert_eq!(handle.client().disconnect_calls(), 1);
    }

    #[tokio::test]
    async fn test_removed_handle_stays_disconnected() {
        let handle = handle();
        handle.shutdown().await;

        assert!(!handle.set_connected(true));
        handle.apply(Transition::Connecting);
        assert_eq!(handle.state(), ConnectionState::Created);
        assert_eq!(connected_events(&handle), 0);
    }

    #[test]
    fn test_logged_out_is_terminal() {
        let handle = handle();
        handle.set_connected(true);
        handle.mark_logged_out();

        assert_eq!(handle.state(), ConnectionState::LoggedOut);
        assert!(!handle.set_connected(true));
        assert_eq!(handle.state(), ConnectionState::LoggedOut);
        assert_eq!(
            handle.feed.history_for(handle.id()),
            vec![
                SessionEventKind::Connected,
                SessionEventKind::Disconnected,
                SessionEventKind::LoggedOut,
            ]
        );
    }
}
