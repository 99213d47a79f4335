//! Runtime restart tracking.
//!
//! An operator (or deploy hook) announces that the agent runtime is about to
//! restart; connected clients are told, and told again once the runtime is back.

use std::sync::atomic::{AtomicBool, Ordering};

use log::info;
use tokio::sync::broadcast;

/// A restart state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartTransition {
    Restarting,
    Ready,
}

#[derive(Debug)]
pub struct RestartState {
    restarting: AtomicBool,
    tx: broadcast::Sender<RestartTransition>,
}

impl Default for RestartState {
    fn default() -> Self {
        Self::new()
    }
}

impl RestartState {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(16);
        Self {
            restarting: AtomicBool::new(false),
            tx,
        }
    }

    pub fn is_restarting(&self) -> bool {
        self.restarting.load(Ordering::SeqCst)
    }

    /// Mark the runtime as restarting and announce it.
    pub fn begin_restart(&self) {
        self.restarting.store(true, Ordering::SeqCst);
        info!("Agent runtime restarting");
        let _ = self.tx.send(RestartTransition::Restarting);
    }

    /// Announce the runtime is back. No-op unless a restart is in progress.
    pub fn notify_ready(&self) -> bool {
        if !self.restarting.swap(false, Ordering::SeqCst) {
            return false;
        }
        info!("Agent runtime ready");
        let _ = self.tx.send(RestartTransition::Ready);
        true
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RestartTransition> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_restart_then_ready() {
        let state = RestartState::new();
        let mut rx = state.subscribe();

        state.begin_restart();
        assert!(state.is_restarting());
        assert!(state.notify_ready());
        assert!(!state.is_restarting());

        assert_eq!(rx.recv().await.unwrap(), RestartTransition::Restarting);
        assert_eq!(rx.recv().await.unwrap(), RestartTransition::Ready);
    }

    #[test]
    fn test_ready_without_restart_is_noop() {
        let state = RestartState::new();
        let mut rx = state.subscribe();

        assert!(!state.notify_ready());
        assert!(rx.try_recv().is_err());
    }
}
