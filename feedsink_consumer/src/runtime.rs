use std::sync::Arc;

use feedsink_log::{ClaimHandler, ConsumerGroup, GroupError};
use feedsink_shutdown::{ControlSignal, ShutdownManager};
use futures::{Stream, StreamExt};
use observability_deps::tracing::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{Coordinator, Error, PauseControl, Readiness};

/// A consumer process: the consume loop, the error drain and the signal loop around one group
/// membership.
#[derive(Debug)]
pub struct ConsumerRuntime {
    group: Arc<dyn ConsumerGroup>,
    coordinator: Coordinator,
    pause: Arc<PauseControl>,
}

impl ConsumerRuntime {
    pub fn new(
        group: Arc<dyn ConsumerGroup>,
        topics: Vec<String>,
        handler: Arc<dyn ClaimHandler>,
    ) -> Self {
        Self {
            coordinator: Coordinator::new(Arc::clone(&group), topics, handler),
            pause: Arc::new(PauseControl::new(Arc::clone(&group))),
            group,
        }
    }

    pub fn pause_control(&self) -> Arc<PauseControl> {
        Arc::clone(&self.pause)
    }

    pub fn readiness(&self) -> Readiness {
        self.coordinator.readiness()
    }

    /// Run until `shutdown` starts draining, then stop in order.
    ///
    /// Shutdown starts on a [`ControlSignal::Terminate`], when the manager's root token is
    /// cancelled, or when the consume loop fails. The group is closed exactly once, after the
    /// consume loop returned, and the manager is stopped once every loop was joined.
    pub async fn run<S>(self, shutdown: &ShutdownManager, signals: S) -> Result<(), Error>
    where
        S: Stream<Item = ControlSignal> + Send + Unpin + 'static,
    {
        let Self {
            group,
            coordinator,
            pause,
        } = self;

        let errors = group.take_errors().ok_or(Error::ErrorsTaken)?;
        let drain = tokio::spawn(drain_errors(errors));

        let mut readiness = coordinator.readiness();
        let token = shutdown.register();
        let consume = tokio::spawn(async move {
            let res = coordinator.run(token.child_token()).await;
            if let Err(e) = &res {
                error!(error = %e, "consume loop failed");
                token.trigger_shutdown();
            }
            token.complete();
            res
        });

        let signal_loop = tokio::spawn(watch_signals(signals, pause, shutdown.token()));

        tokio::select! {
            generation = readiness.wait() => {
                if let Some(generation) = generation {
                    info!(generation, "consumer up and running");
                }
            }
            _ = shutdown.wait_for_shutdown() => {}
        }

        shutdown.wait_for_shutdown().await;
        shutdown.join().await;
        let res = consume.await.map_err(Error::from).and_then(|res| res);

        // no consume call is running anymore
        let closed = group.close().await;
        shutdown.stop();

        let signals = signal_loop.await;
        let drained = drain.await;
        info!("consumer stopped");

        res?;
        closed.map_err(Error::Close)?;
        signals?;
        drained?;
        Ok(())
    }
}

/// Log every asynchronous group error until the group is closed
async fn drain_errors(mut errors: mpsc::Receiver<GroupError>) {
    while let Some(e) = errors.recv().await {
        match e {
            GroupError::Rebalance(_) => warn!(error = %e, "rebalance failed"),
            e => error!(error = %e, "consumer group error"),
        }
    }
    debug!("consumer group error stream closed");
}

async fn watch_signals<S>(mut signals: S, pause: Arc<PauseControl>, shutdown: CancellationToken)
where
    S: Stream<Item = ControlSignal> + Send + Unpin,
{
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            signal = signals.next() => match signal {
                Some(ControlSignal::Terminate) => {
                    info!("terminating: via signal");
                    shutdown.cancel();
                    return;
                }
                Some(ControlSignal::TogglePause) => {
                    pause.toggle();
                }
                None => {
                    debug!("control signal stream ended");
                    return;
                }
            },
        }
    }
}
