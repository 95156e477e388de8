//! Client side of the partitioned log.
//!
//! Publishing goes through a [`LogProducer`], usually wrapped in a [`ProducerPool`] that bounds
//! the number of queued and in-flight records. Consuming goes through a [`ConsumerGroup`], which
//! hands out per-partition [`Claim`]s to a [`ClaimHandler`] for every session generation.
//!
//! Two implementations exist for both sides: [`kafka`] talks to a real broker via librdkafka and
//! [`mock`] keeps everything in memory for tests.

use bytes::Bytes;

pub mod group;
pub mod kafka;
pub mod mock;
pub mod pool;
pub mod producer;
pub mod retry;

pub use group::{
    Claim, ClaimHandler, ConsumerGroup, GroupError, GroupOptions, HandlerError, InitialOffset,
    OffsetMarker, Session,
};
pub use pool::{ProducerPool, PublishFailure};
pub use producer::{
    AckMode, Compression, Delivery, LogProducer, Partitioner, ProduceError, ProducerOptions,
};
pub use retry::{Backoff, Exhausted, RetryPolicy};

/// A record read from the log
///
/// Messages are never mutated once read, the accessors hand out shared views of the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    topic: String,
    partition: i32,
    offset: i64,
    key: Option<Bytes>,
    value: Bytes,
}

impl Message {
    pub fn new(
        topic: impl Into<String>,
        partition: i32,
        offset: i64,
        key: Option<Bytes>,
        value: Bytes,
    ) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            key,
            value,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    /// Position of this message within its partition
    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn key(&self) -> Option<&Bytes> {
        self.key.as_ref()
    }

    pub fn value(&self) -> &Bytes {
        &self.value
    }
}

/// A record to be published onto the producer's topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Routing key, records with the same key land on the same partition
    pub key: Option<Bytes>,
    pub value: Bytes,
}

impl Record {
    pub fn new(value: impl Into<Bytes>) -> Self {
        Self {
            key: None,
            value: value.into(),
        }
    }

    pub fn with_key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = Some(key.into());
        self
    }
}
