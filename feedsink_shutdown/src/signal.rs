//! OS signal handling for the control loop.

use futures::Stream;
use observability_deps::tracing::info;

/// Wait for a `SIGTERM` or `SIGINT` to stop the process on UNIX systems
#[cfg(unix)]
pub async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut term = signal(SignalKind::terminate()).expect("failed to register signal handler");
    let mut int = signal(SignalKind::interrupt()).expect("failed to register signal handler");

    tokio::select! {
        _ = term.recv() => info!("Received SIGTERM"),
        _ = int.recv() => info!("Received SIGINT"),
    }
}

/// Wait for a `ctrl+c` to stop the process on Windows systems
#[cfg(windows)]
pub async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Received SIGINT");
}

/// A runtime control request delivered to the process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    /// Drain and stop the process (`SIGTERM`, `SIGINT`)
    Terminate,
    /// Flip between paused and active consumption (`SIGUSR1`)
    TogglePause,
}

/// Listens for the signals that control a running consumer
#[derive(Debug)]
pub struct ControlSignals {
    #[cfg(unix)]
    term: tokio::signal::unix::Signal,
    #[cfg(unix)]
    int: tokio::signal::unix::Signal,
    #[cfg(unix)]
    usr1: tokio::signal::unix::Signal,
}

impl ControlSignals {
    /// Register the signal handlers
    #[cfg(unix)]
    pub fn new() -> std::io::Result<Self> {
        use tokio::signal::unix::{SignalKind, signal};

        Ok(Self {
            term: signal(SignalKind::terminate())?,
            int: signal(SignalKind::interrupt())?,
            usr1: signal(SignalKind::user_defined1())?,
        })
    }

    /// Register the signal handlers
    #[cfg(windows)]
    pub fn new() -> std::io::Result<Self> {
        Ok(Self {})
    }

    /// Wait for the next control signal
    ///
    /// Returns `None` once the signal streams are exhausted.
    #[cfg(unix)]
    pub async fn recv(&mut self) -> Option<ControlSignal> {
        tokio::select! {
            s = self.term.recv() => s.map(|_| {
                info!("Received SIGTERM");
                ControlSignal::Terminate
            }),
            s = self.int.recv() => s.map(|_| {
                info!("Received SIGINT");
                ControlSignal::Terminate
            }),
            s = self.usr1.recv() => s.map(|_| {
                info!("Received SIGUSR1");
                ControlSignal::TogglePause
            }),
        }
    }

    /// Wait for the next control signal
    ///
    /// Pause toggling has no signal on Windows, only `ctrl+c` is observed.
    #[cfg(windows)]
    pub async fn recv(&mut self) -> Option<ControlSignal> {
        tokio::signal::ctrl_c().await.ok().map(|_| {
            info!("Received SIGINT");
            ControlSignal::Terminate
        })
    }

    /// Turn the listener into a [`Stream`] of [`ControlSignal`]s
    pub fn into_stream(self) -> impl Stream<Item = ControlSignal> + Send + Unpin + 'static {
        Box::pin(futures::stream::unfold(self, |mut signals| async move {
            signals.recv().await.map(|s| (s, signals))
        }))
    }
}
