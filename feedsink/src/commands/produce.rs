//! Change feed producer: feed to log

use std::{sync::Arc, time::Duration};

use feedsink_clap_blocks::broker::{BrokerConfig, ProducerConfig};
use feedsink_log::{ProduceError, ProducerPool, PublishFailure, kafka::KafkaProducer};
use feedsink_shutdown::wait_for_signal;
use feedsink_source::{DEFAULT_FEED_URL, SseSource, publish};
use observability_deps::tracing::{error, info};
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinError};
use tokio_util::sync::CancellationToken;
use trogging::cli::LoggingConfig;

#[derive(Debug, Error)]
pub(crate) enum Error {
    #[error("failed to create producer: {0}")]
    Producer(#[source] ProduceError),

    #[error("source error: {0}")]
    Source(#[from] feedsink_source::Error),

    #[error("failed to flush the producer: {0}")]
    Flush(#[source] ProduceError),

    #[error("producer task failed: {0}")]
    Task(#[from] JoinError),
}

pub(crate) type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, clap::Parser)]
pub(crate) struct Config {
    /// logging options
    #[clap(flatten)]
    pub(crate) logging_config: LoggingConfig,

    #[clap(flatten)]
    broker_config: BrokerConfig,

    #[clap(flatten)]
    producer_config: ProducerConfig,

    /// Topic to publish the feed to.
    #[clap(
        long = "topic",
        env = "FEEDSINK_TOPIC",
        default_value = "wikimedia_updates",
        action
    )]
    topic: String,

    /// URL of the server-sent-events feed.
    #[clap(
        long = "feed-url",
        env = "FEEDSINK_FEED_URL",
        default_value = DEFAULT_FEED_URL,
        action
    )]
    feed_url: String,

    /// Delay before reconnecting to the feed, unless the feed asks for a different one.
    #[clap(
        long = "feed-reconnect-delay",
        env = "FEEDSINK_FEED_RECONNECT_DELAY",
        default_value = "3s",
        value_parser = humantime::parse_duration
    )]
    reconnect_delay: Duration,
}

pub(crate) async fn command(config: Config) -> Result<()> {
    let producer = KafkaProducer::new(
        config.broker_config.bootstrap_servers(),
        config.topic.clone(),
        config.producer_config.options(),
    )
    .map_err(Error::Producer)?;

    let (pool, failures) = ProducerPool::new(
        Arc::new(producer),
        config.producer_config.workers,
        config.producer_config.queue_depth,
        config.producer_config.queue_depth,
    );
    let drain = tokio::spawn(drain_failures(failures));

    let mut source =
        SseSource::new(config.feed_url.as_str())?.with_reconnect_delay(config.reconnect_delay);

    let cancel = CancellationToken::new();
    let signal_task = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            wait_for_signal().await;
            info!("terminating: via signal");
            cancel.cancel();
        }
    });

    let published = publish(&mut source, &pool, &cancel).await;
    signal_task.abort();

    // the queue is drained and the producer flushed even if the source failed
    let stats = pool
        .close(config.producer_config.flush_timeout)
        .await
        .map_err(Error::Flush)?;
    let failed = drain.await?;

    let published = published?;
    info!(
        published,
        delivered = stats.delivered,
        failed,
        "producer finished"
    );
    Ok(())
}

/// Log every record that could not be published
pub(crate) async fn drain_failures(mut failures: mpsc::Receiver<PublishFailure>) -> u64 {
    let mut count = 0;
    while let Some(PublishFailure { record, error }) = failures.recv().await {
        count += 1;
        error!(
            %error,
            key = ?record.key,
            bytes = record.value.len(),
            "failed to write message"
        );
    }
    count
}
