//! Manage pipeline shutdown
//!
//! This crate provides a set of types for draining a consumer process gracefully.
//!
//! # Coordinate shutdown with the [`ShutdownManager`] type
//!
//! The [`ShutdownManager`] walks the process through the [`ShutdownState`] machine:
//! `Running -> Draining -> Stopped`. Shutdown is triggered either by an external signal, see
//! [`ControlSignals`], or by cancelling the root [`CancellationToken`] that the manager was
//! created with.
//!
//! Components that must finish their in-flight work before shared handles are closed can
//! [`register`][ShutdownManager::register] to receive a [`ShutdownToken`]. They use
//! [`wait_for_shutdown`][ShutdownToken::wait_for_shutdown] to learn that draining started and
//! signal back via [`complete`][ShutdownToken::complete] once they have returned. The owner of
//! the process then awaits [`join`][ShutdownManager::join] before closing anything those
//! components were still using, and finally calls [`stop`][ShutdownManager::stop].
use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use observability_deps::tracing::{info, warn};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::{
    sync::{CancellationToken, WaitForCancellationFuture},
    task::TaskTracker,
};

mod signal;

pub use signal::{ControlSignal, ControlSignals, wait_for_signal};

/// Default time to wait for registered components before logging that draining is slow.
pub const DEFAULT_DRAIN_WARNING: Duration = Duration::from_secs(30);

/// The observable state of a [`ShutdownManager`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    /// No shutdown has been requested
    Running,
    /// Shutdown was requested and registered components are returning
    Draining,
    /// All registered components returned and the owner released its handles
    Stopped,
}

/// Manage pipeline shutdown
#[derive(Debug)]
pub struct ShutdownManager {
    shutdown: CancellationToken,
    stopped: CancellationToken,
    tasks: TaskTracker,
    drain_warning: Duration,
}

impl ShutdownManager {
    /// Create a [`ShutdownManager`]
    ///
    /// Cancelling `shutdown` from the outside has the same effect as calling
    /// [`shutdown`][Self::shutdown].
    pub fn new(shutdown: CancellationToken) -> Self {
        Self {
            shutdown,
            stopped: CancellationToken::new(),
            tasks: TaskTracker::new(),
            drain_warning: DEFAULT_DRAIN_WARNING,
        }
    }

    /// Create a [`ShutdownManager`] for testing purposes
    pub fn new_testing() -> Self {
        Self::new(CancellationToken::new())
    }

    /// Log a warning if registered components have not returned after `drain_warning`
    pub fn with_drain_warning(mut self, drain_warning: Duration) -> Self {
        self.drain_warning = drain_warning;
        self
    }

    /// Register a component that needs to return before shared handles may be closed
    ///
    /// Provides a [`ShutdownToken`] which the caller is responsible for handling. The caller must
    /// invoke [`complete`][ShutdownToken::complete], or drop every clone of the token, for
    /// [`join`][Self::join] to return.
    pub fn register(&self) -> ShutdownToken {
        let (tx, rx) = oneshot::channel();
        self.tasks.spawn(rx);
        ShutdownToken::new(self.shutdown.clone(), tx)
    }

    /// A token that is cancelled once shutdown starts
    ///
    /// Loops that must observe shutdown should use a [`child_token`][CancellationToken::child_token]
    /// of this token so they can never cancel their siblings.
    pub fn token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Invoke shutdown, moving from [`ShutdownState::Running`] to [`ShutdownState::Draining`]
    ///
    /// Calling this more than once is harmless.
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            info!("shutdown requested, draining");
        }
        self.shutdown.cancel();
    }

    /// Future that completes when shutdown has been requested
    pub fn wait_for_shutdown(&self) -> WaitForCancellationFuture<'_> {
        self.shutdown.cancelled()
    }

    /// Wait for all registered components to complete
    ///
    /// This does not trigger shutdown by itself. The wait is not bounded: a component stuck in a
    /// network call delays the return, which is logged once the drain warning elapses.
    pub async fn join(&self) {
        self.tasks.close();
        let started = Instant::now();
        if tokio::time::timeout(self.drain_warning, self.tasks.wait())
            .await
            .is_err()
        {
            warn!(
                pending = self.tasks.len(),
                elapsed = ?started.elapsed(),
                "still waiting for components to drain"
            );
            self.tasks.wait().await;
        }
        info!(elapsed = ?started.elapsed(), "all components drained");
    }

    /// Mark the shutdown as finished, moving to [`ShutdownState::Stopped`]
    ///
    /// Call this after [`join`][Self::join] returned and every shared handle was closed.
    pub fn stop(&self) {
        self.shutdown.cancel();
        self.stopped.cancel();
    }

    /// Future that completes once [`stop`][Self::stop] was called
    pub fn wait_for_stop(&self) -> WaitForCancellationFuture<'_> {
        self.stopped.cancelled()
    }

    /// The current [`ShutdownState`]
    pub fn state(&self) -> ShutdownState {
        if self.stopped.is_cancelled() {
            ShutdownState::Stopped
        } else if self.shutdown.is_cancelled() {
            ShutdownState::Draining
        } else {
            ShutdownState::Running
        }
    }
}

/// A token that a component can obtain via [`register`][ShutdownManager::register]
///
/// This implements [`Clone`] so that a component that obtains it can make copies as needed for
/// sub-components or tasks that may be responsible for triggering a shutdown internally.
#[derive(Debug, Clone)]
pub struct ShutdownToken {
    token: CancellationToken,
    complete_tx: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

impl ShutdownToken {
    fn new(token: CancellationToken, complete_tx: oneshot::Sender<()>) -> Self {
        Self {
            token,
            complete_tx: Arc::new(Mutex::new(Some(complete_tx))),
        }
    }

    /// Trigger shutdown due to some unrecoverable state
    pub fn trigger_shutdown(&self) {
        self.token.cancel();
    }

    /// Future that completes when the [`ShutdownManager`] that issued this token starts draining
    pub async fn wait_for_shutdown(&self) {
        self.token.cancelled().await;
    }

    /// A child of the shutdown token, cancelled when draining starts
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// Signal back to the [`ShutdownManager`] that the component that owns this token returned
    pub fn complete(&self) {
        if let Some(s) = self.complete_tx.lock().take() {
            let _ = s.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicBool, Ordering},
        time::Duration,
    };

    use futures::FutureExt;
    use tokio_util::sync::CancellationToken;

    use super::*;

    #[tokio::test]
    async fn test_shutdown_order() {
        let shutdown_manager = ShutdownManager::new_testing();
        assert_eq!(shutdown_manager.state(), ShutdownState::Running);

        static CLEAN: AtomicBool = AtomicBool::new(false);

        let token = shutdown_manager.register();
        tokio::spawn(async move {
            loop {
                futures::select! {
                    _ = token.wait_for_shutdown().fuse() => {
                        CLEAN.store(true, Ordering::SeqCst);
                        token.complete();
                        break;
                    }
                    _ = tokio::time::sleep(Duration::from_millis(10)).fuse() => {}
                }
            }
        });

        shutdown_manager.shutdown();
        assert_eq!(shutdown_manager.state(), ShutdownState::Draining);
        shutdown_manager.join().await;
        assert!(
            CLEAN.load(Ordering::SeqCst),
            "registered component did not complete"
        );
        assert_eq!(shutdown_manager.state(), ShutdownState::Draining);

        shutdown_manager.stop();
        assert_eq!(shutdown_manager.state(), ShutdownState::Stopped);
    }

    #[tokio::test]
    async fn root_token_cancellation_starts_draining() {
        let root = CancellationToken::new();
        let shutdown_manager = ShutdownManager::new(root.clone());

        root.cancel();
        shutdown_manager.wait_for_shutdown().await;
        assert_eq!(shutdown_manager.state(), ShutdownState::Draining);
    }

    #[tokio::test]
    async fn trigger_from_component() {
        let shutdown_manager = ShutdownManager::new_testing();
        let token = shutdown_manager.register();

        tokio::spawn(async move {
            token.trigger_shutdown();
            token.complete();
        });

        shutdown_manager.wait_for_shutdown().await;
        shutdown_manager.join().await;
        assert_eq!(shutdown_manager.state(), ShutdownState::Draining);
    }

    #[test_log::test(tokio::test)]
    async fn dropped_token_counts_as_complete() {
        let shutdown_manager =
            ShutdownManager::new_testing().with_drain_warning(Duration::from_millis(5));
        let token = shutdown_manager.register();
        let child = token.child_token();

        tokio::spawn(async move {
            child.cancelled().await;
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(token);
        });

        shutdown_manager.shutdown();
        tokio::time::timeout(Duration::from_secs(5), shutdown_manager.join())
            .await
            .expect("join returns once the token is dropped");
    }

    #[tokio::test]
    async fn repeated_shutdown_is_harmless() {
        let shutdown_manager = ShutdownManager::new_testing();
        shutdown_manager.shutdown();
        shutdown_manager.shutdown();
        shutdown_manager.join().await;
        shutdown_manager.stop();
        shutdown_manager.stop();
        shutdown_manager.wait_for_stop().await;
        assert_eq!(shutdown_manager.state(), ShutdownState::Stopped);
    }
}
