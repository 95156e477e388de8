//! Writing log messages into a searchable document store.
//!
//! The [`Indexer`] makes sure the target index exists before any write and upserts every
//! message under an identifier derived from its content, so delivering a message twice
//! overwrites the same document.

use std::fmt::Debug;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Method;
pub use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

pub mod http;
pub mod id;
pub mod indexer;
pub mod memory;

pub use http::HttpDocumentStore;
pub use id::{DocumentId, IdError, IdField};
pub use indexer::{IndexStatus, Indexer, ensure_index};
pub use memory::MemoryDocumentStore;

/// Primary error type of the document stores
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("base URL error: {0}")]
    BaseUrl(#[source] reqwest::Error),

    #[error("base URL '{0}' cannot carry a path")]
    CannotBeABase(String),

    #[error("failed to build the HTTP client: {0}")]
    HttpClient(#[source] reqwest::Error),

    #[error("failed to read the response bytes: {0}")]
    Bytes(#[source] reqwest::Error),

    #[error("failed to serialize request body: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("store responded with error [{code}]: {message}")]
    ApiError { code: StatusCode, message: String },

    #[error("failed to send {method} {url} request: {source}")]
    RequestSend {
        method: Method,
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("'{0}' can not be used as a path segment")]
    DotSegment(String),

    #[error("gave up after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: usize,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    fn request_send(method: Method, url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::RequestSend {
            method,
            url: url.into(),
            source,
        }
    }

    /// Whether repeating the request can succeed
    ///
    /// Transport failures, throttling and server errors are transient, and so are rejections
    /// that concern the store rather than the document: missing credentials or permissions and
    /// a missing index resolve once the store is fixed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::RequestSend { .. } | Self::Unavailable(_) => true,
            Self::ApiError { code, .. } => {
                (code.is_client_error() || code.is_server_error()) && !rejects_document(*code)
            }
            Self::RetriesExhausted { source, .. } => source.is_transient(),
            _ => false,
        }
    }

    /// Whether the store refused this particular document, any other document may still succeed
    pub fn is_document_rejection(&self) -> bool {
        match self {
            Self::ApiError { code, .. } => rejects_document(*code),
            Self::DotSegment(_) => true,
            Self::RetriesExhausted { source, .. } => source.is_document_rejection(),
            _ => false,
        }
    }
}

/// Mapping or parse failures, version conflicts and oversized documents
fn rejects_document(code: StatusCode) -> bool {
    matches!(
        code,
        StatusCode::BAD_REQUEST | StatusCode::CONFLICT | StatusCode::PAYLOAD_TOO_LARGE
    )
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Settings applied when an index is created, never to an existing one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSettings {
    pub number_of_shards: u32,
    pub number_of_replicas: u32,
}

impl Default for IndexSettings {
    fn default() -> Self {
        Self {
            number_of_shards: 1,
            number_of_replicas: 0,
        }
    }
}

#[derive(Debug, Serialize)]
struct CreateIndexBody {
    settings: IndexBody,
}

#[derive(Debug, Serialize)]
struct IndexBody {
    index: IndexSettings,
}

impl IndexSettings {
    /// The body of an index creation request
    pub fn to_create_body(self) -> serde_json::Value {
        serde_json::json!(CreateIndexBody {
            settings: IndexBody { index: self }
        })
    }
}

/// A store of JSON documents grouped into indices.
#[async_trait]
pub trait DocumentStore: Debug + Send + Sync + 'static {
    async fn index_exists(&self, index: &str) -> Result<bool>;

    /// Create `index`. Succeeds if another writer created it concurrently.
    async fn create_index(&self, index: &str, settings: IndexSettings) -> Result<()>;

    /// Insert `document` under `id`, replacing any previous version.
    async fn upsert(&self, index: &str, id: &DocumentId, document: Bytes) -> Result<()>;
}
