//! Consumer group abstractions: sessions, claims and the handler that processes them.
//!
//! A [`ConsumerGroup`] is driven by repeatedly calling [`consume`][ConsumerGroup::consume]. Each
//! call joins the group, establishes one [`Session`] for the current generation and runs the
//! [`ClaimHandler`] against every partition [`Claim`] of that session. The call returns once the
//! generation ends, which happens on a rebalance, when every claim returned, or when the
//! cancellation token fires.

use std::{collections::BTreeMap, fmt::Debug, str::FromStr, sync::Arc, time::Duration};

use async_trait::async_trait;
use rdkafka::error::KafkaError;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::Message;

/// Generic boxed error type returned by [`ClaimHandler`] implementations.
///
/// The dynamic boxing lets handlers report errors from any sink without this crate knowing them.
pub type HandlerError = Box<dyn std::error::Error + Sync + Send>;

#[derive(Debug, thiserror::Error)]
pub enum GroupError {
    #[error("consumer group is closed")]
    Closed,

    #[error("no topics to consume")]
    NoTopics,

    #[error("kafka consumer error: {0}")]
    Kafka(#[from] KafkaError),

    #[error("rebalance failed: {0}")]
    Rebalance(String),

    #[error("session setup failed: {0}")]
    Setup(#[source] HandlerError),

    #[error("session cleanup failed: {0}")]
    Cleanup(#[source] HandlerError),

    #[error("processing claim {topic}/{partition} failed: {source}")]
    Claim {
        topic: String,
        partition: i32,
        #[source]
        source: HandlerError,
    },

    #[error("claim task panicked: {0}")]
    ClaimPanicked(String),
}

/// Where to start reading a partition the group has no committed offset for
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum InitialOffset {
    Earliest,
    #[default]
    Latest,
}

impl FromStr for InitialOffset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "earliest" | "oldest" => Ok(Self::Earliest),
            "latest" | "newest" => Ok(Self::Latest),
            other => Err(format!(
                "unknown initial offset '{other}', expected earliest or latest"
            )),
        }
    }
}

impl std::fmt::Display for InitialOffset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Earliest => f.write_str("earliest"),
            Self::Latest => f.write_str("latest"),
        }
    }
}

/// Settings shared by all consumer group implementations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupOptions {
    pub initial_offset: InitialOffset,
    /// How often marked offsets are committed, they are also committed when a session ends
    pub commit_interval: Duration,
    pub session_timeout: Duration,
    /// Messages buffered per claim before delivery to the handler blocks
    pub claim_buffer: usize,
    /// Errors buffered before the group blocks on an undrained error stream
    pub error_buffer: usize,
}

impl Default for GroupOptions {
    fn default() -> Self {
        Self {
            initial_offset: InitialOffset::Latest,
            commit_interval: Duration::from_secs(1),
            session_timeout: Duration::from_secs(10),
            claim_buffer: 256,
            error_buffer: 64,
        }
    }
}

/// Records the offset a partition should resume from.
pub trait OffsetMarker: Send + Sync + Debug + 'static {
    /// Remember `next_offset` as the position to resume `topic`/`partition` from.
    fn mark(&self, topic: &str, partition: i32, next_offset: i64);
}

#[derive(Debug)]
struct SessionInner {
    generation: i32,
    member_id: String,
    claims: BTreeMap<String, Vec<i32>>,
    token: CancellationToken,
    marker: Arc<dyn OffsetMarker>,
}

/// One generation of group membership
///
/// Cloning is cheap, every claim task of the session holds a clone.
#[derive(Debug, Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    pub fn new(
        generation: i32,
        member_id: impl Into<String>,
        claims: BTreeMap<String, Vec<i32>>,
        token: CancellationToken,
        marker: Arc<dyn OffsetMarker>,
    ) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                generation,
                member_id: member_id.into(),
                claims,
                token,
                marker,
            }),
        }
    }

    pub fn generation(&self) -> i32 {
        self.inner.generation
    }

    pub fn member_id(&self) -> &str {
        &self.inner.member_id
    }

    /// Partitions claimed by this session, per topic
    pub fn claims(&self) -> &BTreeMap<String, Vec<i32>> {
        &self.inner.claims
    }

    /// Completes when the session ends, either through a rebalance or shutdown
    pub async fn cancelled(&self) {
        self.inner.token.cancelled().await
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Mark `message` as processed
    ///
    /// The group resumes from the offset after the marked message. Marks are committed
    /// periodically and when the session ends, so a message must only be marked after it was
    /// handed off.
    pub fn mark_message(&self, message: &Message) {
        self.inner
            .marker
            .mark(message.topic(), message.partition(), message.offset() + 1);
    }
}

/// The messages of one partition for one session, in offset order
#[derive(Debug)]
pub struct Claim {
    topic: String,
    partition: i32,
    initial_offset: i64,
    messages: mpsc::Receiver<Message>,
}

impl Claim {
    pub fn new(
        topic: impl Into<String>,
        partition: i32,
        initial_offset: i64,
        messages: mpsc::Receiver<Message>,
    ) -> Self {
        Self {
            topic: topic.into(),
            partition,
            initial_offset,
            messages,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    /// The offset the claim started at, `-1` if the broker decides
    pub fn initial_offset(&self) -> i64 {
        self.initial_offset
    }

    /// The next message, or `None` once the claim was revoked
    pub async fn next(&mut self) -> Option<Message> {
        self.messages.recv().await
    }
}

/// Processes the claims of every session a [`ConsumerGroup`] establishes.
#[async_trait]
pub trait ClaimHandler: Send + Sync + Debug + 'static {
    /// Called once per session before any claim is processed.
    async fn setup(&self, _session: &Session) -> Result<(), HandlerError> {
        Ok(())
    }

    /// Called once per session after every claim task returned.
    async fn cleanup(&self, _session: &Session) -> Result<(), HandlerError> {
        Ok(())
    }

    /// Process the messages of a single claim.
    ///
    /// Must return when the claim yields `None` or when the session is cancelled. Runs
    /// concurrently with the other claims of the same session. An error ends the whole session,
    /// the next session resumes every partition from its committed offset.
    async fn consume_claim(&self, session: Session, claim: Claim) -> Result<(), HandlerError>;
}

/// Membership of a consumer group.
#[async_trait]
pub trait ConsumerGroup: Send + Sync + Debug + 'static {
    /// Join the group and run `handler` for the session of the current generation.
    ///
    /// Blocks until at least one partition is claimed, then until the session ends. Returns
    /// `Ok(())` on a rebalance, a failed claim or cancellation, the caller is expected to call this again in a
    /// loop until `cancel` fired. Returns [`GroupError::Closed`] once the group was closed.
    async fn consume(
        &self,
        topics: &[String],
        handler: Arc<dyn ClaimHandler>,
        cancel: CancellationToken,
    ) -> Result<(), GroupError>;

    /// The asynchronous error stream, which must be drained continuously.
    ///
    /// Can only be taken once, later calls return `None`. The stream ends when the group is
    /// closed.
    fn take_errors(&self) -> Option<mpsc::Receiver<GroupError>>;

    /// Stop fetching from every claimed partition without leaving the group.
    fn pause_all(&self);

    /// Resume fetching from every claimed partition.
    fn resume_all(&self);

    /// Leave the group and release the client.
    ///
    /// Must not be called while [`consume`][Self::consume] is running.
    async fn close(&self) -> Result<(), GroupError>;
}
