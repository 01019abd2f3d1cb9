//! Broadcast + history feed of session lifecycle events.

use std::{
    collections::VecDeque,
    sync::{PoisonError, RwLock},
};

use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::{SessionEvent, SessionEventKind, traits::SessionId};

/// Default history size limit (entries).
pub const DEFAULT_HISTORY: usize = 1024;

const CHANNEL_CAPACITY: usize = 256;

/// Feed with broadcast and history support.
///
/// Late subscribers receive the retained history, then live events.
pub struct SessionFeed {
    history: RwLock<VecDeque<SessionEvent>>,
    limit: usize,
    sender: broadcast::Sender<SessionEvent>,
}

impl Default for SessionFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionFeed {
    /// Create a feed with the default history limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_history(DEFAULT_HISTORY)
    }

    /// Create a feed retaining at most `limit` events.
    #[must_use]
    pub fn with_history(limit: usize) -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            history: RwLock::new(VecDeque::with_capacity(limit.min(64))),
            limit: limit.max(1),
            sender,
        }
    }

    /// Publish an event to live listeners and history.
    pub fn publish(&self, session_id: SessionId, kind: SessionEventKind) {
        tracing::debug!(session_id = %session_id, event = kind.name(), "session event");
        let event = SessionEvent { session_id, kind };
        let _ = self.sender.send(event.clone()); // live listeners

        let mut history = self
            .history
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        while history.len() >= self.limit {
            history.pop_front();
        }
        history.push_back(event);
    }

    /// Get a receiver for live updates.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }

    /// Get a snapshot of the history.
    #[must_use]
    pub fn history(&self) -> Vec<SessionEvent> {
        self.history
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// History of a single session, oldest first.
    #[must_use]
    pub fn history_for(&self, session_id: SessionId) -> Vec<SessionEventKind> {
        self.history
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| e.session_id == session_id)
            .map(|e| e.kind.clone())
            .collect()
    }

    /// Stream that yields history first, then live updates.
    ///
    /// Live events that lag behind the channel capacity are skipped.
    #[must_use]
    pub fn history_plus_stream(&self) -> futures::stream::BoxStream<'static, SessionEvent> {
        let (history, rx) = (self.history(), self.subscribe());

        let hist = futures::stream::iter(history);
        let live = BroadcastStream::new(rx).filter_map(|res| async move { res.ok() });

        Box::pin(hist.chain(live))
    }

    /// SSE stream (requires `sse` feature).
    #[cfg(feature = "sse")]
    #[must_use]
    pub fn sse_stream(
        &self,
    ) -> futures::stream::BoxStream<
        'static,
        Result<axum::response::sse::Event, std::convert::Infallible>,
    > {
        self.history_plus_stream()
            .map(|e| Ok(e.to_sse_event()))
            .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_history_is_bounded() {
        let feed = SessionFeed::with_history(2);
        let id = Uuid::new_v4();
        feed.publish(id, SessionEventKind::Created);
        feed.publish(id, SessionEventKind::Connecting);
        feed.publish(id, SessionEventKind::Connected);

        assert_eq!(
            feed.history_for(id),
            vec![SessionEventKind::Connecting, SessionEventKind::Connected]
        );
    }

    #[test]
    fn test_history_filtered_by_session() {
        let feed = SessionFeed::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        feed.publish(a, SessionEventKind::Created);
        feed.publish(b, SessionEventKind::Created);
        feed.publish(a, SessionEventKind::Removed);

        assert_eq!(
            feed.history_for(a),
            vec![SessionEventKind::Created, SessionEventKind::Removed]
        );
        assert_eq!(feed.history_for(b), vec![SessionEventKind::Created]);
        assert_eq!(feed.history().len(), 3);
    }

    #[tokio::test]
    async fn test_stream_replays_history_then_live() {
        let feed = SessionFeed::new();
        let id = Uuid::new_v4();
        feed.publish(id, SessionEventKind::Created);

        let mut stream = feed.history_plus_stream();
        feed.publish(id, SessionEventKind::Connected);

        let first = stream.next().await.unwrap();
        let second = stream.next().await.unwrap();
        assert_eq!(first.kind, SessionEventKind::Created);
        assert_eq!(second.kind, SessionEventKind::Connected);
    }
}
