//! Config for the log brokers, producers and consumer groups.

use std::{num::NonZeroUsize, time::Duration};

use feedsink_log::{
    AckMode, Backoff, Compression, GroupOptions, InitialOffset, Partitioner, ProducerOptions,
    RetryPolicy,
};

/// Where the log brokers are reachable.
#[derive(Debug, Clone, clap::Parser)]
pub struct BrokerConfig {
    /// Comma-separated list of `host:port` broker addresses.
    #[clap(
        long = "brokers",
        env = "FEEDSINK_BROKERS",
        default_value = "localhost:9094,localhost:9095,localhost:9096",
        value_delimiter = ',',
        action
    )]
    pub brokers: Vec<String>,
}

impl BrokerConfig {
    /// The broker list in the form librdkafka expects
    pub fn bootstrap_servers(&self) -> String {
        self.brokers.join(",")
    }
}

/// Reliability, batching and concurrency settings of a producer.
#[derive(Debug, Clone, clap::Parser)]
#[allow(missing_copy_implementations)]
pub struct ProducerConfig {
    /// Replicas that must acknowledge a write: none, leader or all.
    #[clap(
        long = "acks",
        env = "FEEDSINK_PRODUCER_ACKS",
        default_value = "all",
        action
    )]
    pub acks: AckMode,

    /// Suppress duplicates caused by retries. Requires `--acks all`.
    #[clap(
        long = "idempotent",
        env = "FEEDSINK_PRODUCER_IDEMPOTENT",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub idempotent: bool,

    /// Compression codec: none, gzip, snappy, lz4 or zstd.
    #[clap(
        long = "compression",
        env = "FEEDSINK_PRODUCER_COMPRESSION",
        default_value = "snappy",
        action
    )]
    pub compression: Compression,

    /// Partition assignment: random, consistent, consistent_random or murmur2_random.
    #[clap(
        long = "partitioner",
        env = "FEEDSINK_PRODUCER_PARTITIONER",
        default_value = "consistent_random",
        action
    )]
    pub partitioner: Partitioner,

    /// Retries of a failed publish before it is reported as failed.
    #[clap(
        long = "max-retries",
        env = "FEEDSINK_PRODUCER_MAX_RETRIES",
        default_value = "3",
        action
    )]
    pub max_retries: usize,

    /// Delay before the first retry.
    #[clap(
        long = "retry-backoff",
        env = "FEEDSINK_PRODUCER_RETRY_BACKOFF",
        default_value = "100ms",
        value_parser = humantime::parse_duration
    )]
    pub retry_backoff: Duration,

    /// Upper bound of the exponentially growing retry delay. Equal to `--retry-backoff` for
    /// a fixed delay.
    #[clap(
        long = "retry-backoff-max",
        env = "FEEDSINK_PRODUCER_RETRY_BACKOFF_MAX",
        default_value = "5s",
        value_parser = humantime::parse_duration
    )]
    pub retry_backoff_max: Duration,

    /// Maximum number of records per batch.
    #[clap(
        long = "batch-size",
        env = "FEEDSINK_PRODUCER_BATCH_SIZE",
        default_value = "10",
        action
    )]
    pub batch_size: NonZeroUsize,

    /// How long to wait for a batch to fill up.
    #[clap(
        long = "linger",
        env = "FEEDSINK_PRODUCER_LINGER",
        default_value = "5ms",
        value_parser = humantime::parse_duration
    )]
    pub linger: Duration,

    /// Upper bound on the time from submission to acknowledgement, retries included.
    #[clap(
        long = "delivery-timeout",
        env = "FEEDSINK_PRODUCER_DELIVERY_TIMEOUT",
        default_value = "30s",
        value_parser = humantime::parse_duration
    )]
    pub delivery_timeout: Duration,

    /// Number of concurrent publishing workers.
    #[clap(
        long = "producer-workers",
        env = "FEEDSINK_PRODUCER_WORKERS",
        default_value = "8",
        action
    )]
    pub workers: NonZeroUsize,

    /// Records queued for the workers before the source is throttled.
    #[clap(
        long = "producer-queue-depth",
        env = "FEEDSINK_PRODUCER_QUEUE_DEPTH",
        default_value = "1000",
        action
    )]
    pub queue_depth: NonZeroUsize,

    /// How long to wait for outstanding records on shutdown.
    #[clap(
        long = "flush-timeout",
        env = "FEEDSINK_PRODUCER_FLUSH_TIMEOUT",
        default_value = "10s",
        value_parser = humantime::parse_duration
    )]
    pub flush_timeout: Duration,
}

impl ProducerConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        let backoff = if self.retry_backoff_max <= self.retry_backoff {
            Backoff::Fixed(self.retry_backoff)
        } else {
            Backoff::Exponential {
                initial: self.retry_backoff,
                max: self.retry_backoff_max,
            }
        };
        RetryPolicy {
            max_retries: self.max_retries,
            backoff,
        }
    }

    pub fn options(&self) -> ProducerOptions {
        ProducerOptions {
            acks: self.acks,
            idempotent: self.idempotent,
            compression: self.compression,
            partitioner: self.partitioner,
            retry: self.retry_policy(),
            batch_size: self.batch_size.get(),
            linger: self.linger,
            delivery_timeout: self.delivery_timeout,
        }
    }
}

/// Membership settings of a consumer group.
#[derive(Debug, Clone, clap::Parser)]
pub struct ConsumerGroupConfig {
    /// Name of the consumer group to join.
    #[clap(
        long = "group-id",
        env = "FEEDSINK_GROUP_ID",
        default_value = "OSPublisher",
        action
    )]
    pub group_id: String,

    /// Where to start when the group has no committed offset: earliest or latest.
    #[clap(
        long = "initial-offset",
        env = "FEEDSINK_INITIAL_OFFSET",
        default_value = "latest",
        action
    )]
    pub initial_offset: InitialOffset,

    /// How often processed offsets are committed.
    #[clap(
        long = "commit-interval",
        env = "FEEDSINK_COMMIT_INTERVAL",
        default_value = "1s",
        value_parser = humantime::parse_duration
    )]
    pub commit_interval: Duration,

    /// Time without heartbeats after which the broker removes the member from the group.
    #[clap(
        long = "session-timeout",
        env = "FEEDSINK_SESSION_TIMEOUT",
        default_value = "10s",
        value_parser = humantime::parse_duration
    )]
    pub session_timeout: Duration,
}

impl ConsumerGroupConfig {
    pub fn options(&self) -> GroupOptions {
        GroupOptions {
            initial_offset: self.initial_offset,
            commit_interval: self.commit_interval,
            session_timeout: self.session_timeout,
            ..Default::default()
        }
    }
}
