use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Caller-side bound on an operation: an optional deadline plus a
/// cancellation token. Clones share the token.
#[derive(Clone, Debug, Default)]
pub struct Context {
    deadline: Option<Instant>,
    token: CancellationToken,
}

impl Context {
    /// No deadline, never cancelled unless [`Context::cancel`] is called.
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Context {
            deadline: Some(deadline),
            token: CancellationToken::new(),
        }
    }

    /// A context cancelled along with this one, with an optionally tighter deadline.
    pub fn child(&self, timeout: Option<Duration>) -> Self {
        let deadline = match (self.deadline, timeout.map(|t| Instant::now() + t)) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        Context {
            deadline,
            token: self.token.child_token(),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_is_shared_with_clones_and_children() {
        let ctx = Context::background();
        let clone = ctx.clone();
        let child = ctx.child(None);
        assert!(!child.is_cancelled());
        ctx.cancel();
        assert!(clone.is_cancelled());
        assert!(child.is_cancelled());
        clone.cancelled().await;
    }

    #[tokio::test]
    async fn child_cancel_does_not_reach_parent() {
        let ctx = Context::background();
        ctx.child(None).cancel();
        assert!(!ctx.is_cancelled());
    }

    #[tokio::test]
    async fn child_takes_earlier_deadline() {
        let ctx = Context::with_timeout(Duration::from_secs(60));
        let tighter = ctx.child(Some(Duration::from_secs(1)));
        assert!(tighter.deadline().unwrap() < ctx.deadline().unwrap());
        let looser = ctx.child(Some(Duration::from_secs(600)));
        assert_eq!(looser.deadline(), ctx.deadline());
        assert!(Context::background().deadline().is_none());
    }
}
