//! One-shot readiness signalling per session.

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use tokio::sync::watch;

/// Creates a [`ReadyGate`] per join attempt and hands out [`Readiness`] observers
#[derive(Debug, Clone)]
pub(crate) struct ReadySource {
    generation: Arc<watch::Sender<Option<i32>>>,
    opened: Arc<AtomicUsize>,
}

impl ReadySource {
    pub(crate) fn new() -> Self {
        Self {
            generation: Arc::new(watch::channel(None).0),
            opened: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// A fresh gate for the next session
    pub(crate) fn gate(&self) -> ReadyGate {
        ReadyGate {
            generation: Arc::clone(&self.generation),
            opened: Arc::clone(&self.opened),
        }
    }

    pub(crate) fn readiness(&self) -> Readiness {
        Readiness {
            generation: self.generation.subscribe(),
            opened: Arc::clone(&self.opened),
        }
    }
}

/// Signals that a session holds its claims. Opening consumes the gate.
#[derive(Debug)]
pub struct ReadyGate {
    generation: Arc<watch::Sender<Option<i32>>>,
    opened: Arc<AtomicUsize>,
}

impl ReadyGate {
    pub fn open(self, generation: i32) {
        self.opened.fetch_add(1, Ordering::SeqCst);
        self.generation.send_replace(Some(generation));
    }
}

/// Observes the sessions of a [`Coordinator`](crate::Coordinator)
#[derive(Debug, Clone)]
pub struct Readiness {
    generation: watch::Receiver<Option<i32>>,
    opened: Arc<AtomicUsize>,
}

impl Readiness {
    /// Wait until the first session is established, returns its generation.
    ///
    /// Returns immediately if a session already exists, and `None` if the coordinator was
    /// dropped before any session was established.
    pub async fn wait(&mut self) -> Option<i32> {
        self.generation
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|generation| *generation)
    }

    /// Generation of the latest established session
    pub fn generation(&self) -> Option<i32> {
        *self.generation.borrow()
    }

    /// Number of sessions that signalled readiness so far
    pub fn sessions(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wait_returns_the_first_opened_generation() {
        let source = ReadySource::new();
        let mut readiness = source.readiness();
        assert_eq!(readiness.generation(), None);

        let waiter = tokio::spawn(async move { readiness.wait().await });
        source.gate().open(3);
        assert_eq!(waiter.await.unwrap(), Some(3));

        let readiness = source.readiness();
        source.gate().open(4);
        assert_eq!(readiness.generation(), Some(4));
        assert_eq!(readiness.sessions(), 2);
    }

    #[tokio::test]
    async fn wait_ends_when_the_source_is_gone() {
        let source = ReadySource::new();
        let mut readiness = source.readiness();
        let gate = source.gate();
        drop(source);
        drop(gate);
        assert_eq!(readiness.wait().await, None);
    }
}
