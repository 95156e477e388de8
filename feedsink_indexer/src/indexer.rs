use std::sync::Arc;

use bytes::Bytes;
use feedsink_log::{Exhausted, RetryPolicy};
use observability_deps::tracing::{debug, info};

use crate::{DocumentId, DocumentStore, Error, IdError, IdField, IndexSettings, Result};

/// Whether [`ensure_index`] had to create the index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexStatus {
    Existed,
    Created,
}

/// Create `index` with `settings` unless it already exists.
///
/// Calling this any number of times leaves exactly one index, an existing index keeps its
/// settings.
pub async fn ensure_index(
    store: &dyn DocumentStore,
    index: &str,
    settings: IndexSettings,
) -> Result<IndexStatus> {
    if store.index_exists(index).await? {
        debug!(index, "index exists");
        return Ok(IndexStatus::Existed);
    }
    store.create_index(index, settings).await?;
    info!(index, shards = settings.number_of_shards, replicas = settings.number_of_replicas, "index ready");
    Ok(IndexStatus::Created)
}

/// Writes message payloads into one index of a [`DocumentStore`]
#[derive(Debug, Clone)]
pub struct Indexer {
    store: Arc<dyn DocumentStore>,
    index: String,
    settings: IndexSettings,
    id_field: IdField,
    retry: RetryPolicy,
}

impl Indexer {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        index: impl Into<String>,
        settings: IndexSettings,
        id_field: IdField,
    ) -> Self {
        Self {
            store,
            index: index.into(),
            settings,
            id_field,
            retry: RetryPolicy::default(),
        }
    }

    /// Set how transient store failures are retried
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn index(&self) -> &str {
        &self.index
    }

    /// Make sure the target index exists, transient failures are retried.
    pub async fn ensure_index(&self) -> Result<IndexStatus> {
        self.retry
            .run(
                "ensure index",
                || ensure_index(self.store.as_ref(), &self.index, self.settings),
                Error::is_transient,
            )
            .await
            .map_err(exhausted)
    }

    /// The identifier of the document `payload` is stored as
    pub fn document_id(&self, payload: &[u8]) -> Result<DocumentId, IdError> {
        self.id_field.extract(payload)
    }

    /// Upsert `document` under `id`.
    ///
    /// Transient failures are retried, once the retries are spent the last error is returned
    /// wrapped in [`Error::RetriesExhausted`]. Permanent rejections are returned as is.
    pub async fn upsert(&self, id: &DocumentId, document: Bytes) -> Result<()> {
        self.retry
            .run(
                "upsert document",
                || self.store.upsert(&self.index, id, document.clone()),
                Error::is_transient,
            )
            .await
            .map_err(exhausted)
    }
}

fn exhausted(Exhausted { attempts, error }: Exhausted<Error>) -> Error {
    if error.is_transient() {
        Error::RetriesExhausted {
            attempts,
            source: Box::new(error),
        }
    } else {
        error
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use feedsink_log::Backoff;
    use pretty_assertions::assert_eq;
    use reqwest::StatusCode;

    use crate::MemoryDocumentStore;

    use super::*;

    fn indexer(store: &MemoryDocumentStore) -> Indexer {
        Indexer::new(
            Arc::new(store.clone()),
            "wikimedia",
            IndexSettings::default(),
            IdField::MetaId,
        )
        .with_retry(RetryPolicy {
            max_retries: 2,
            backoff: Backoff::Fixed(Duration::from_millis(1)),
        })
    }

    #[test_log::test(tokio::test)]
    async fn index_creation_is_idempotent() {
        let store = MemoryDocumentStore::new();
        let indexer = indexer(&store);

        assert_eq!(indexer.ensure_index().await.unwrap(), IndexStatus::Created);
        assert_eq!(indexer.ensure_index().await.unwrap(), IndexStatus::Existed);
        assert_eq!(
            ensure_index(
                &store,
                "wikimedia",
                IndexSettings {
                    number_of_shards: 5,
                    number_of_replicas: 2
                }
            )
            .await
            .unwrap(),
            IndexStatus::Existed
        );

        assert_eq!(store.create_calls(), 1);
        assert_eq!(store.settings("wikimedia"), Some(IndexSettings::default()));
    }

    #[tokio::test]
    async fn upserting_twice_keeps_one_document() {
        let store = MemoryDocumentStore::new();
        let indexer = indexer(&store);
        let id = DocumentId::new("a");

        indexer.upsert(&id, Bytes::from(r#"{"v":1}"#)).await.unwrap();
        indexer.upsert(&id, Bytes::from(r#"{"v":2}"#)).await.unwrap();

        let documents = store.documents("wikimedia");
        assert_eq!(documents.len(), 1);
        assert_eq!(documents[&id], Bytes::from(r#"{"v":2}"#));
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let store = MemoryDocumentStore::new();
        store.fail_next_unavailable();
        store.fail_next(Error::Unavailable("connection reset".into()));

        indexer(&store)
            .upsert(&DocumentId::new("a"), Bytes::from("{}"))
            .await
            .unwrap();
        assert!(store.document("wikimedia", "a").is_some());
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let store = MemoryDocumentStore::new();
        for _ in 0..3 {
            store.fail_next_unavailable();
        }

        let err = indexer(&store)
            .upsert(&DocumentId::new("a"), Bytes::from("{}"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RetriesExhausted { attempts: 3, .. }));
        assert!(err.is_transient());
        assert!(store.documents("wikimedia").is_empty());
    }

    #[tokio::test]
    async fn rejections_are_not_retried() {
        let store = MemoryDocumentStore::new();
        store.fail_next(Error::ApiError {
            code: StatusCode::BAD_REQUEST,
            message: "mapper_parsing_exception".into(),
        });

        let err = indexer(&store)
            .upsert(&DocumentId::new("a"), Bytes::from("{}"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ApiError { code: StatusCode::BAD_REQUEST, .. }));
        // the fault was consumed by the single attempt
        indexer(&store)
            .upsert(&DocumentId::new("a"), Bytes::from("{}"))
            .await
            .unwrap();
    }
}
