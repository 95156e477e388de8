//! Tail consumer: log to stdout

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use feedsink_clap_blocks::broker::BrokerConfig;
use feedsink_consumer::ConsumerRuntime;
use feedsink_log::{
    Claim, ClaimHandler, GroupError, GroupOptions, HandlerError, InitialOffset, Message, Session,
    kafka::KafkaConsumerGroup,
};
use feedsink_shutdown::{ControlSignals, ShutdownManager};
use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinError,
};
use tokio_util::sync::CancellationToken;
use trogging::cli::LoggingConfig;

#[derive(Debug, Error)]
pub(crate) enum Error {
    #[error("failed to create consumer group: {0}")]
    Group(#[source] GroupError),

    #[error("failed to register signal handlers: {0}")]
    Signals(#[source] std::io::Error),

    #[error(transparent)]
    Consumer(#[from] feedsink_consumer::Error),

    #[error("printer task failed: {0}")]
    Printer(#[from] JoinError),
}

pub(crate) type Result<T, E = Error> = std::result::Result<T, E>;

/// Lines waiting for the printer
const PRINT_QUEUE: usize = 64;

/// A formatted line and the acknowledgement the printer sends once it is written
type Line = (String, oneshot::Sender<()>);

#[derive(Debug, clap::Parser)]
pub(crate) struct Config {
    /// logging options
    #[clap(flatten)]
    pub(crate) logging_config: LoggingConfig,

    #[clap(flatten)]
    broker_config: BrokerConfig,

    /// Topic to print.
    #[clap(long = "topic", env = "FEEDSINK_TAIL_TOPIC", default_value = "test", action)]
    topic: String,

    /// Consumer group to join.
    #[clap(
        long = "group-id",
        env = "FEEDSINK_TAIL_GROUP_ID",
        default_value = "my-group",
        action
    )]
    group_id: String,

    /// Where to start when the group has no committed offset: earliest or latest.
    #[clap(long = "initial-offset", default_value = "earliest", action)]
    initial_offset: InitialOffset,

    /// How often printed offsets are committed.
    #[clap(
        long = "commit-interval",
        default_value = "1s",
        value_parser = humantime::parse_duration
    )]
    commit_interval: Duration,
}

/// The printed form of `message`
fn format_message(message: &Message) -> String {
    let key = message
        .key()
        .map(|key| String::from_utf8_lossy(key))
        .unwrap_or_default();
    format!(
        "message at offset {}: {} = {}, Partition: {}",
        message.offset(),
        key,
        String::from_utf8_lossy(message.value()),
        message.partition()
    )
}

/// Hands every message to the printer and marks it once printed
#[derive(Debug)]
struct TailHandler {
    lines: mpsc::Sender<Line>,
}

#[async_trait]
impl ClaimHandler for TailHandler {
    async fn consume_claim(&self, session: Session, mut claim: Claim) -> Result<(), HandlerError> {
        loop {
            tokio::select! {
                biased;
                _ = session.cancelled() => return Ok(()),
                message = claim.next() => {
                    let Some(message) = message else { return Ok(()) };
                    let (printed, ack) = oneshot::channel();
                    let handed_off = async {
                        self.lines.send((format_message(&message), printed)).await.ok()?;
                        ack.await.ok()
                    };
                    tokio::select! {
                        biased;
                        _ = session.cancelled() => return Ok(()),
                        res = handed_off => match res {
                            Some(()) => session.mark_message(&message),
                            None => return Err("printer stopped".into()),
                        },
                    }
                }
            }
        }
    }
}

pub(crate) async fn command(config: Config) -> Result<()> {
    let options = GroupOptions {
        initial_offset: config.initial_offset,
        commit_interval: config.commit_interval,
        ..Default::default()
    };
    let group = KafkaConsumerGroup::new(
        config.broker_config.bootstrap_servers(),
        config.group_id,
        options,
    )
    .map_err(Error::Group)?;

    let (lines, mut rx) = mpsc::channel::<Line>(PRINT_QUEUE);
    let printer = tokio::spawn(async move {
        while let Some((line, printed)) = rx.recv().await {
            println!("{line}");
            let _ = printed.send(());
        }
    });

    let runtime = ConsumerRuntime::new(
        Arc::new(group),
        vec![config.topic],
        Arc::new(TailHandler { lines }),
    );
    let signals = ControlSignals::new().map_err(Error::Signals)?.into_stream();
    let res = runtime
        .run(&ShutdownManager::new(CancellationToken::new()), signals)
        .await;

    // the runtime owned the last sender
    printer.await?;
    res?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU32;

    use tokio::time::timeout;

    use bytes::Bytes;
    use feedsink_log::mock::MockBroker;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn message_format() {
        let message = Message::new(
            "test",
            2,
            17,
            Some(Bytes::from("k")),
            Bytes::from("message 0 1"),
        );
        assert_eq!(
            format_message(&message),
            "message at offset 17: k = message 0 1, Partition: 2"
        );

        let unkeyed = Message::new("test", 0, 0, None, Bytes::from("v"));
        assert_eq!(
            format_message(&unkeyed),
            "message at offset 0:  = v, Partition: 0"
        );
    }

    #[test_log::test(tokio::test)]
    async fn prints_and_commits_every_message() {
        let broker = MockBroker::new();
        broker.create_topic("test", NonZeroU32::new(1).unwrap());
        for i in 0..3 {
            broker.append("test", 0, None, format!("message {i} 0"));
        }
        let group = broker.consumer_group(
            "my-group",
            GroupOptions {
                initial_offset: InitialOffset::Earliest,
                ..Default::default()
            },
        );

        let (lines, mut rx) = mpsc::channel::<Line>(1);
        let runtime = ConsumerRuntime::new(
            Arc::new(group),
            vec!["test".to_string()],
            Arc::new(TailHandler { lines }),
        );
        let shutdown = Arc::new(ShutdownManager::new_testing());
        let task = tokio::spawn({
            let shutdown = Arc::clone(&shutdown);
            async move {
                runtime
                    .run(&shutdown, futures::stream::pending())
                    .await
            }
        });

        let mut printed = vec![];
        for _ in 0..3 {
            let (line, ack) = rx.recv().await.unwrap();
            printed.push(line);
            ack.send(()).unwrap();
        }
        assert_eq!(
            printed,
            vec![
                "message at offset 0:  = message 0 0, Partition: 0",
                "message at offset 1:  = message 1 0, Partition: 0",
                "message at offset 2:  = message 2 0, Partition: 0",
            ]
        );

        shutdown.shutdown();
        task.await.unwrap().unwrap();
        assert_eq!(broker.committed("my-group", "test", 0), Some(3));
        assert!(rx.recv().await.is_none());
    }

    #[test_log::test(tokio::test)]
    async fn unprinted_messages_are_not_committed() {
        let broker = MockBroker::new();
        broker.create_topic("test", NonZeroU32::new(1).unwrap());
        for i in 0..3 {
            broker.append("test", 0, None, format!("message {i} 0"));
        }
        let group = broker.consumer_group(
            "my-group",
            GroupOptions {
                initial_offset: InitialOffset::Earliest,
                commit_interval: Duration::from_millis(10),
                ..Default::default()
            },
        );

        let (lines, mut rx) = mpsc::channel::<Line>(1);
        let runtime = ConsumerRuntime::new(
            Arc::new(group),
            vec!["test".to_string()],
            Arc::new(TailHandler { lines }),
        );
        let shutdown = Arc::new(ShutdownManager::new_testing());
        let task = tokio::spawn({
            let shutdown = Arc::clone(&shutdown);
            async move {
                runtime
                    .run(&shutdown, futures::stream::pending())
                    .await
            }
        });

        // the first line is printed, the second is still with the printer
        let (_, ack) = rx.recv().await.unwrap();
        ack.send(()).unwrap();
        let (second, _held) = rx.recv().await.unwrap();
        assert_eq!(second, "message at offset 1:  = message 1 0, Partition: 0");

        // the queue holds one line and the handler waits on the printer
        assert!(
            timeout(Duration::from_millis(100), rx.recv())
                .await
                .is_err()
        );
        assert_eq!(broker.committed("my-group", "test", 0), Some(1));

        shutdown.shutdown();
        task.await.unwrap().unwrap();
        assert_eq!(broker.committed("my-group", "test", 0), Some(1));
    }
}
