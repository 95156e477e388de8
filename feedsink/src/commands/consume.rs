//! Indexing consumer: log to document store

use std::{sync::Arc, time::Duration};

use feedsink_clap_blocks::{
    broker::{BrokerConfig, ConsumerGroupConfig},
    document_store::DocumentStoreConfig,
};
use feedsink_consumer::{ConsumerRuntime, IndexingHandler};
use feedsink_indexer::{DocumentStore, Indexer};
use feedsink_log::{GroupError, kafka::KafkaConsumerGroup};
use feedsink_shutdown::{ControlSignals, ShutdownManager};
use observability_deps::tracing::info;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use trogging::cli::LoggingConfig;

#[derive(Debug, Error)]
pub(crate) enum Error {
    #[error("invalid document store config: {0}")]
    Store(#[source] feedsink_indexer::Error),

    #[error("failed to prepare index '{index}': {source}")]
    EnsureIndex {
        index: String,
        #[source]
        source: feedsink_indexer::Error,
    },

    #[error("failed to create consumer group: {0}")]
    Group(#[source] GroupError),

    #[error("failed to register signal handlers: {0}")]
    Signals(#[source] std::io::Error),

    #[error(transparent)]
    Consumer(#[from] feedsink_consumer::Error),
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
    group_config: ConsumerGroupConfig,

    #[clap(flatten)]
    store_config: DocumentStoreConfig,

    /// Topic to consume.
    #[clap(
        long = "topic",
        env = "FEEDSINK_TOPIC",
        default_value = "wikimedia_updates",
        action
    )]
    topic: String,

    /// Log a warning when draining on shutdown takes longer than this.
    #[clap(
        long = "drain-warning",
        env = "FEEDSINK_DRAIN_WARNING",
        default_value = "30s",
        value_parser = humantime::parse_duration
    )]
    drain_warning: Duration,
}

pub(crate) async fn command(config: Config) -> Result<()> {
    let Config {
        logging_config: _,
        broker_config,
        group_config,
        store_config,
        topic,
        drain_warning,
    } = config;

    let store: Arc<dyn DocumentStore> = Arc::new(store_config.store().map_err(Error::Store)?);
    let indexer = Indexer::new(
        store,
        store_config.index.clone(),
        store_config.settings(),
        store_config.id_field,
    );
    // writes must never reach an index created with the store's default settings
    let status = indexer
        .ensure_index()
        .await
        .map_err(|source| Error::EnsureIndex {
            index: store_config.index.clone(),
            source,
        })?;
    info!(index = indexer.index(), ?status, "index available");

    let group = KafkaConsumerGroup::new(
        broker_config.bootstrap_servers(),
        group_config.group_id.clone(),
        group_config.options(),
    )
    .map_err(Error::Group)?;

    let handler = Arc::new(IndexingHandler::new(indexer));
    let runtime = ConsumerRuntime::new(Arc::new(group), vec![topic], Arc::clone(&handler) as _);
    let signals = ControlSignals::new().map_err(Error::Signals)?.into_stream();
    let shutdown =
        ShutdownManager::new(CancellationToken::new()).with_drain_warning(drain_warning);

    runtime.run(&shutdown, signals).await?;

    let stats = handler.stats();
    info!(
        indexed = stats.indexed,
        skipped = stats.skipped,
        rejected = stats.rejected,
        "consumer finished"
    );
    Ok(())
}
