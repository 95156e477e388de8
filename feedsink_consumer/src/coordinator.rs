use std::sync::Arc;

use async_trait::async_trait;
use feedsink_log::{Claim, ClaimHandler, ConsumerGroup, GroupError, HandlerError, Session};
use observability_deps::tracing::{debug, info};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::{
    Error,
    ready::{ReadyGate, ReadySource, Readiness},
};

/// Opens the session's gate before any claim is processed.
#[derive(Debug)]
struct GatedHandler {
    inner: Arc<dyn ClaimHandler>,
    gate: Mutex<Option<ReadyGate>>,
}

#[async_trait]
impl ClaimHandler for GatedHandler {
    async fn setup(&self, session: &Session) -> Result<(), HandlerError> {
        self.inner.setup(session).await?;
        if let Some(gate) = self.gate.lock().take() {
            gate.open(session.generation());
        }
        Ok(())
    }

    async fn cleanup(&self, session: &Session) -> Result<(), HandlerError> {
        self.inner.cleanup(session).await
    }

    async fn consume_claim(&self, session: Session, claim: Claim) -> Result<(), HandlerError> {
        self.inner.consume_claim(session, claim).await
    }
}

/// Keeps a member in its consumer group across rebalances.
///
/// [`run`](Self::run) joins the group, processes the session's claims with the handler and
/// rejoins whenever a session ends, until its token is cancelled.
#[derive(Debug)]
pub struct Coordinator {
    group: Arc<dyn ConsumerGroup>,
    topics: Vec<String>,
    handler: Arc<dyn ClaimHandler>,
    ready: ReadySource,
}

impl Coordinator {
    pub fn new(
        group: Arc<dyn ConsumerGroup>,
        topics: Vec<String>,
        handler: Arc<dyn ClaimHandler>,
    ) -> Self {
        Self {
            group,
            topics,
            handler,
            ready: ReadySource::new(),
        }
    }

    /// Observe when sessions are established
    pub fn readiness(&self) -> Readiness {
        self.ready.readiness()
    }

    /// Consume until `cancel` fires.
    ///
    /// Rebalances end a session and are followed by a new join. Any other consume error ends
    /// the loop and is returned.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), Error> {
        let mut joins = 0_u64;
        while !cancel.is_cancelled() {
            let handler = Arc::new(GatedHandler {
                inner: Arc::clone(&self.handler),
                gate: Mutex::new(Some(self.ready.gate())),
            });
            if joins > 0 {
                debug!(joins, "rejoining consumer group");
            }
            joins += 1;

            match self.group.consume(&self.topics, handler, cancel.clone()).await {
                Ok(()) => {}
                Err(GroupError::Closed) => {
                    info!("consumer group closed, stopping");
                    return Ok(());
                }
                Err(e) => return Err(Error::Consume(e)),
            }
        }
        debug!(joins, "consume loop cancelled");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{num::NonZeroU32, time::Duration};

    use feedsink_log::{
        GroupOptions, InitialOffset, Message,
        mock::{MockBroker, MockConsumerGroup},
    };
    use pretty_assertions::assert_eq;

    use super::*;

    /// Marks and records every message
    #[derive(Debug, Default)]
    struct Recorder {
        seen: Mutex<Vec<(String, Message)>>,
    }

    #[async_trait]
    impl ClaimHandler for Recorder {
        async fn consume_claim(
            &self,
            session: Session,
            mut claim: Claim,
        ) -> Result<(), HandlerError> {
            loop {
                tokio::select! {
                    biased;
                    _ = session.cancelled() => return Ok(()),
                    message = claim.next() => {
                        let Some(message) = message else { return Ok(()) };
                        session.mark_message(&message);
                        self.seen.lock().push((session.member_id().to_string(), message));
                    }
                }
            }
        }
    }

    fn earliest() -> GroupOptions {
        GroupOptions {
            initial_offset: InitialOffset::Earliest,
            ..Default::default()
        }
    }

    async fn wait_for(mut cond: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    fn start(
        group: &Arc<MockConsumerGroup>,
        handler: &Arc<Recorder>,
        cancel: &CancellationToken,
    ) -> (Readiness, tokio::task::JoinHandle<Result<(), Error>>) {
        let coordinator = Coordinator::new(
            Arc::clone(group) as _,
            vec!["wikimedia_updates".to_string()],
            Arc::clone(handler) as _,
        );
        let readiness = coordinator.readiness();
        let cancel = cancel.clone();
        let task = tokio::spawn(async move { coordinator.run(cancel).await });
        (readiness, task)
    }

    #[test_log::test(tokio::test)]
    async fn readiness_is_signalled_once_per_session() {
        let broker = MockBroker::new();
        broker.create_topic("wikimedia_updates", NonZeroU32::new(2).unwrap());
        let group = Arc::new(broker.consumer_group("OSPublisher", earliest()));
        let handler = Arc::new(Recorder::default());
        let cancel = CancellationToken::new();

        let (mut readiness, task) = start(&group, &handler, &cancel);
        assert_eq!(readiness.wait().await, Some(1));
        assert_eq!(readiness.sessions(), 1);

        broker.rebalance("OSPublisher");
        wait_for(|| readiness.generation() == Some(2)).await;
        assert_eq!(readiness.sessions(), 2);

        cancel.cancel();
        task.await.unwrap().unwrap();
        assert_eq!(readiness.sessions(), 2);
    }

    #[tokio::test]
    async fn rebalance_is_followed_by_a_rejoin_without_loss() {
        let broker = MockBroker::new();
        broker.create_topic("wikimedia_updates", NonZeroU32::new(4).unwrap());
        let handler = Arc::new(Recorder::default());
        let cancel = CancellationToken::new();

        let first = Arc::new(broker.consumer_group("OSPublisher", earliest()));
        let (mut first_ready, first_task) = start(&first, &handler, &cancel);
        first_ready.wait().await;

        for i in 0..40 {
            broker.append("wikimedia_updates", i % 4, None, format!("before {i}"));
        }
        wait_for(|| handler.seen.lock().len() == 40).await;

        let second = Arc::new(broker.consumer_group("OSPublisher", earliest()));
        let (mut second_ready, second_task) = start(&second, &handler, &cancel);
        second_ready.wait().await;
        wait_for(|| first_ready.generation() == Some(2)).await;

        for i in 0..40 {
            broker.append("wikimedia_updates", i % 4, None, format!("after {i}"));
        }
        wait_for(|| handler.seen.lock().len() == 80).await;

        // both members took part and nothing was delivered twice
        let seen = handler.seen.lock().clone();
        assert!(seen.iter().any(|(member, _)| member == second.member_id()));
        let mut offsets: Vec<(i32, i64)> = seen
            .iter()
            .map(|(_, m)| (m.partition(), m.offset()))
            .collect();
        offsets.sort_unstable();
        offsets.dedup();
        assert_eq!(offsets.len(), 80);

        cancel.cancel();
        first_task.await.unwrap().unwrap();
        second_task.await.unwrap().unwrap();
        for partition in 0..4 {
            assert_eq!(
                broker.committed("OSPublisher", "wikimedia_updates", partition),
                Some(20)
            );
        }
    }

    #[tokio::test]
    async fn closed_group_ends_the_loop() {
        let broker = MockBroker::new();
        broker.create_topic("wikimedia_updates", NonZeroU32::new(1).unwrap());
        let group = Arc::new(broker.consumer_group("OSPublisher", earliest()));
        group.close().await.unwrap();

        let handler = Arc::new(Recorder::default());
        let (_, task) = start(&group, &handler, &CancellationToken::new());
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn setup_failure_is_fatal() {
        #[derive(Debug)]
        struct FailingSetup;

        #[async_trait]
        impl ClaimHandler for FailingSetup {
            async fn setup(&self, _session: &Session) -> Result<(), HandlerError> {
                Err("no store".into())
            }

            async fn consume_claim(&self, _: Session, _: Claim) -> Result<(), HandlerError> {
                Ok(())
            }
        }

        let broker = MockBroker::new();
        broker.create_topic("wikimedia_updates", NonZeroU32::new(1).unwrap());
        let group: Arc<dyn ConsumerGroup> =
            Arc::new(broker.consumer_group("OSPublisher", earliest()));
        let coordinator = Coordinator::new(
            group,
            vec!["wikimedia_updates".to_string()],
            Arc::new(FailingSetup),
        );
        let readiness = coordinator.readiness();

        let err = coordinator.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::Consume(GroupError::Setup(_))));
        assert_eq!(readiness.sessions(), 0);
    }
}
