//! The upstream side of the pipeline: reading a change feed and publishing it onto the log.
//!
//! An [`EventSource`] turns an external feed into [`SourceEvent`]s, each an opaque payload with
//! a routing key. [`publish`] hands them to a [`ProducerPool`] until the feed ends or the
//! process shuts down.

use std::fmt::Debug;

use async_trait::async_trait;
use bytes::Bytes;
use feedsink_log::{ProduceError, ProducerPool, Record};
use observability_deps::tracing::{debug, info};
use reqwest::StatusCode;
use tokio_util::sync::CancellationToken;

pub mod http;
pub mod sse;

pub use http::SseSource;
pub use sse::{SseDecoder, SseEvent};

/// The public change feed of the Wikimedia projects
pub const DEFAULT_FEED_URL: &str = "https://stream.wikimedia.org/v2/stream/recentchange";

/// Routing key of payloads that do not name their server
pub const UNKNOWN_KEY: &str = "unknown";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("feed URL error: {0}")]
    FeedUrl(#[source] reqwest::Error),

    #[error("failed to build the HTTP client: {0}")]
    HttpClient(#[source] reqwest::Error),

    #[error("failed to connect to {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("feed {url} responded with status {code}")]
    UnexpectedStatus { url: String, code: StatusCode },

    #[error("failed to submit event: {0}")]
    Submit(#[from] ProduceError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A payload read from the feed, routed by `key`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceEvent {
    pub key: String,
    pub payload: Bytes,
}

impl SourceEvent {
    /// Wrap `payload`, deriving the routing key from its content
    pub fn new(payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        Self {
            key: routing_key(&payload),
            payload,
        }
    }

    pub fn into_record(self) -> Record {
        Record::new(self.payload).with_key(self.key)
    }
}

/// The `server_name` of a JSON payload, [`UNKNOWN_KEY`] if there is none
pub fn routing_key(payload: &[u8]) -> String {
    serde_json::from_slice::<serde_json::Value>(payload)
        .ok()
        .as_ref()
        .and_then(|value| value.get("server_name"))
        .and_then(|name| name.as_str())
        .unwrap_or(UNKNOWN_KEY)
        .to_string()
}

/// A feed of events
#[async_trait]
pub trait EventSource: Debug + Send {
    /// The next event, `None` once the feed ended for good.
    async fn next_event(&mut self) -> Result<Option<SourceEvent>>;
}

/// Submit every event of `source` to `pool` until the feed ends or `cancel` fires.
///
/// Submission waits while the pool's queue is full, which throttles reading from the feed.
/// Returns the number of submitted events.
pub async fn publish(
    source: &mut dyn EventSource,
    pool: &ProducerPool,
    cancel: &CancellationToken,
) -> Result<u64> {
    let mut published = 0_u64;
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!(published, "stopping source");
                return Ok(published);
            }
            event = source.next_event() => event?,
        };
        let Some(event) = event else {
            info!(published, "source exhausted");
            return Ok(published);
        };

        debug!(key = %event.key, bytes = event.payload.len(), "submitting event");
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!(published, "stopping source while the queue is full");
                return Ok(published);
            }
            res = pool.submit(event.into_record()) => res?,
        }
        published += 1;
    }
}
