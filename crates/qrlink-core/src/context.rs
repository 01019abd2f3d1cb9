//! Pairing context: a deadline plus a cancellation token.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Upper bound for deadlines that would overflow `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Time-bounded, cancellable context for one pairing attempt.
///
/// The context is done once its deadline passes or its token is cancelled,
/// whichever happens first. Clones share the same deadline and token.
#[derive(Debug, Clone)]
pub struct PairingContext {
    deadline: Instant,
    token: CancellationToken,
}

impl PairingContext {
    /// Create a root context expiring after `timeout`.
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::new(CancellationToken::new(), timeout)
    }

    /// Create a context that is also cancelled when `parent` is.
    #[must_use]
    pub fn child_of(parent: &CancellationToken, timeout: Duration) -> Self {
        Self::new(parent.child_token(), timeout)
    }

    fn new(token: CancellationToken, timeout: Duration) -> Self {
        let now = Instant::now();
        let deadline = now
            .checked_add(timeout)
            .unwrap_or_else(|| now + FAR_FUTURE);
        Self { deadline, token }
    }

    /// Instant at which the context expires.
    #[must_use]
    pub const fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Time left before the deadline.
    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Whether the deadline passed or the context was cancelled.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.token.is_cancelled() || Instant::now() >= self.deadline
    }

    /// Cancel the context and every context derived from it.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Cancellation token backing this context.
    #[must_use]
    pub const fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Resolve once the context is done.
    pub async fn done(&self) {
        tokio::select! {
            () = tokio::time::sleep_until(self.deadline) => {}
            () = self.token.cancelled() => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_done_at_deadline() {
        let ctx = PairingContext::with_timeout(Duration::from_secs(120));
        assert!(!ctx.is_done());

        let started = Instant::now();
        ctx.done().await;
        assert_eq!(started.elapsed(), Duration::from_secs(120));
        assert!(ctx.is_done());
        assert_eq!(ctx.remaining(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parent_cancellation_propagates() {
        let parent = CancellationToken::new();
        let ctx = PairingContext::child_of(&parent, Duration::from_secs(120));

        parent.cancel();
        tokio::time::timeout(Duration::from_secs(1), ctx.done())
            .await
            .expect("child context should finish with its parent");
        assert!(ctx.is_done());
    }

    #[tokio::test]
    async fn test_huge_timeout_does_not_overflow() {
        let ctx = PairingContext::with_timeout(Duration::MAX);
        assert!(!ctx.is_done());
        assert!(ctx.remaining() > Duration::from_secs(86_400));
    }
}
