//! Producer side of the log: acknowledgement, idempotency, compression and retry settings.

use std::{fmt::Display, str::FromStr, time::Duration};

use async_trait::async_trait;
use rdkafka::{error::KafkaError, types::RDKafkaErrorCode};

use crate::{Record, retry::RetryPolicy};

#[derive(Debug, thiserror::Error)]
pub enum ProduceError {
    #[error("kafka delivery failed: {0}")]
    Kafka(#[from] KafkaError),

    #[error("transient broker failure: {0}")]
    Transient(String),

    #[error("gave up after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: usize,
        #[source]
        source: Box<ProduceError>,
    },

    #[error("idempotent producers require acks=all, got acks={0}")]
    IdempotenceRequiresAllAcks(AckMode),

    #[error("producer queue is closed")]
    QueueClosed,

    #[error("flushing the producer failed: {0}")]
    Flush(#[source] KafkaError),

    #[error("producer task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl ProduceError {
    /// Whether a later attempt of the same request can succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transient(_) => true,
            Self::Kafka(e) => e
                .rdkafka_error_code()
                .map(|code| {
                    matches!(
                        code,
                        RDKafkaErrorCode::MessageTimedOut
                            | RDKafkaErrorCode::RequestTimedOut
                            | RDKafkaErrorCode::NotEnoughReplicas
                            | RDKafkaErrorCode::NotEnoughReplicasAfterAppend
                            | RDKafkaErrorCode::LeaderNotAvailable
                            | RDKafkaErrorCode::NotLeaderForPartition
                            | RDKafkaErrorCode::NetworkException
                            | RDKafkaErrorCode::QueueFull
                    )
                })
                .unwrap_or(false),
            _ => false,
        }
    }
}

/// How many replicas must acknowledge a write before it counts as delivered
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AckMode {
    /// Fire and forget
    None,
    /// The partition leader persisted the write
    Leader,
    /// All in-sync replicas persisted the write
    #[default]
    All,
}

impl AckMode {
    /// Value of the librdkafka `request.required.acks` setting
    pub fn as_config_value(&self) -> &'static str {
        match self {
            Self::None => "0",
            Self::Leader => "1",
            Self::All => "all",
        }
    }
}

impl Display for AckMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Leader => write!(f, "leader"),
            Self::All => write!(f, "all"),
        }
    }
}

impl FromStr for AckMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "0" => Ok(Self::None),
            "leader" | "1" => Ok(Self::Leader),
            "all" | "-1" => Ok(Self::All),
            other => Err(format!(
                "unknown ack mode '{other}', expected one of: none, leader, all"
            )),
        }
    }
}

/// Compression codec applied to produced batches
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    #[default]
    Snappy,
    Lz4,
    Zstd,
}

impl Display for Compression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::Gzip => "gzip",
            Self::Snappy => "snappy",
            Self::Lz4 => "lz4",
            Self::Zstd => "zstd",
        };
        f.write_str(s)
    }
}

impl FromStr for Compression {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "gzip" => Ok(Self::Gzip),
            "snappy" => Ok(Self::Snappy),
            "lz4" => Ok(Self::Lz4),
            "zstd" => Ok(Self::Zstd),
            other => Err(format!(
                "unknown compression '{other}', expected one of: none, gzip, snappy, lz4, zstd"
            )),
        }
    }
}

/// How records are assigned to partitions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Partitioner {
    /// Every record goes to a random partition, keys are ignored
    Random,
    /// Keyed records are hashed, unkeyed records all share one partition
    Consistent,
    /// Keyed records are hashed, unkeyed records are spread out
    #[default]
    ConsistentRandom,
    /// Keyed records are hashed the way the Java client does, unkeyed records are spread out
    Murmur2Random,
}

impl Display for Partitioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Random => "random",
            Self::Consistent => "consistent",
            Self::ConsistentRandom => "consistent_random",
            Self::Murmur2Random => "murmur2_random",
        };
        f.write_str(s)
    }
}

impl FromStr for Partitioner {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "random" => Ok(Self::Random),
            "consistent" => Ok(Self::Consistent),
            "consistent_random" => Ok(Self::ConsistentRandom),
            "murmur2_random" => Ok(Self::Murmur2Random),
            other => Err(format!(
                "unknown partitioner '{other}', expected one of: random, consistent, \
                 consistent_random, murmur2_random"
            )),
        }
    }
}

/// Reliability and batching settings shared by all producer implementations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProducerOptions {
    pub acks: AckMode,
    /// Suppress duplicates caused by retries, limits each partition to one in-flight batch
    pub idempotent: bool,
    pub compression: Compression,
    pub partitioner: Partitioner,
    pub retry: RetryPolicy,
    /// Maximum number of records per batch
    pub batch_size: usize,
    /// How long to wait for a batch to fill up before sending it
    pub linger: Duration,
    /// Upper bound on the time from submission to acknowledgement, retries included
    pub delivery_timeout: Duration,
}

impl Default for ProducerOptions {
    fn default() -> Self {
        Self {
            acks: AckMode::All,
            idempotent: true,
            compression: Compression::default(),
            partitioner: Partitioner::default(),
            retry: RetryPolicy::default(),
            batch_size: 10,
            linger: Duration::from_millis(5),
            delivery_timeout: Duration::from_secs(30),
        }
    }
}

impl ProducerOptions {
    /// Reject combinations the broker would refuse or that break duplicate suppression
    pub fn validate(&self) -> Result<(), ProduceError> {
        if self.idempotent && self.acks != AckMode::All {
            return Err(ProduceError::IdempotenceRequiresAllAcks(self.acks));
        }
        Ok(())
    }
}

/// Where a record ended up once the log acknowledged it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub partition: i32,
    /// `-1` when the producer does not wait for acknowledgements
    pub offset: i64,
}

/// Publishes [`Record`]s onto a single topic.
///
/// Implementations retry transient failures themselves according to their [`RetryPolicy`], an
/// error returned from [`produce`][LogProducer::produce] is final for that record.
#[async_trait]
pub trait LogProducer: Sync + Send + std::fmt::Debug + 'static {
    /// Publish a record, waiting for the configured acknowledgement.
    async fn produce(&self, record: Record) -> Result<Delivery, ProduceError>;

    /// Wait for all outstanding records to be delivered.
    async fn flush(&self, timeout: Duration) -> Result<(), ProduceError>;

    /// The topic records are published to.
    fn topic(&self) -> &str;
}
