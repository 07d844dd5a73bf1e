//! Server lifecycle state machine.

use tokio::sync::watch;
use tracing::info;

/// Lifecycle of a [`Server`](crate::Server). States only move forward;
/// once shutdown starts there is no path back to `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LifecycleState {
    /// Listener not yet created.
    Initializing,
    /// Serving normally.
    Running,
    /// Closed for new accepts; draining in-flight connections.
    ShuttingDown,
    /// Drain complete; the serve call unblocks.
    Terminate,
}

/// Owner side of the lifecycle. Transitions are performed only by the
/// serve loop, so they are strictly ordered; observers watch a channel.
pub(crate) struct Lifecycle {
    tx: watch::Sender<LifecycleState>,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(LifecycleState::Initializing);
        Self { tx }
    }

    pub(crate) fn state(&self) -> LifecycleState {
        *self.tx.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.tx.subscribe()
    }

    pub(crate) fn advance(&self, next: LifecycleState) {
        let prev = self.state();
        assert!(
            next > prev,
            "lifecycle state may only move forward: {prev:?} -> {next:?}"
        );
        self.tx.send_replace(next);
        info!(from = ?prev, to = ?next, "lifecycle transition");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_transitions() {
        let lc = Lifecycle::new();
        assert_eq!(lc.state(), LifecycleState::Initializing);
        lc.advance(LifecycleState::Running);
        lc.advance(LifecycleState::ShuttingDown);
        lc.advance(LifecycleState::Terminate);
        assert_eq!(lc.state(), LifecycleState::Terminate);
    }

    #[test]
    fn test_skip_ahead_allowed() {
        // Running → Terminate without ShuttingDown is still forward.
        let lc = Lifecycle::new();
        lc.advance(LifecycleState::Running);
        lc.advance(LifecycleState::Terminate);
    }

    #[test]
    #[should_panic(expected = "only move forward")]
    fn test_backward_transition_panics() {
        let lc = Lifecycle::new();
        lc.advance(LifecycleState::ShuttingDown);
        lc.advance(LifecycleState::Running);
    }

    #[tokio::test]
    async fn test_watchers_observe_transitions() {
        let lc = Lifecycle::new();
        let mut rx = lc.subscribe();
        lc.advance(LifecycleState::Running);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), LifecycleState::Running);
    }
}
