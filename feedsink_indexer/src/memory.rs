//! An in-memory [`DocumentStore`] for tests.

use std::{
    collections::{BTreeMap, VecDeque},
    sync::Arc,
};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use reqwest::StatusCode;

use crate::{DocumentId, DocumentStore, Error, IndexSettings, Result};

#[derive(Debug, Default)]
struct Index {
    settings: Option<IndexSettings>,
    documents: BTreeMap<DocumentId, Bytes>,
}

#[derive(Debug, Default)]
struct State {
    indices: BTreeMap<String, Index>,
    /// Every successful upsert in the order it happened
    writes: Vec<(String, DocumentId)>,
    create_calls: usize,
    faults: VecDeque<Error>,
    /// Failures reserved for upserts of one document
    document_faults: BTreeMap<DocumentId, VecDeque<Error>>,
}

/// Keeps indices and documents in memory.
///
/// Clones share the same state. Failures can be queued with [`fail_next`](Self::fail_next), each
/// one is returned by the next request of any kind.
#[derive(Debug, Clone, Default)]
pub struct MemoryDocumentStore {
    state: Arc<Mutex<State>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next request fail with `error`
    pub fn fail_next(&self, error: Error) {
        self.state.lock().faults.push_back(error);
    }

    /// Make the next upsert of document `id` fail with `error`, other requests are unaffected
    pub fn fail_next_upsert_of(&self, id: &str, error: Error) {
        self.state
            .lock()
            .document_faults
            .entry(DocumentId::new(id))
            .or_default()
            .push_back(error);
    }

    /// Make the next request fail as if the store was overloaded
    pub fn fail_next_unavailable(&self) {
        self.fail_next(Error::ApiError {
            code: StatusCode::SERVICE_UNAVAILABLE,
            message: "store unavailable".into(),
        });
    }

    pub fn document(&self, index: &str, id: &str) -> Option<Bytes> {
        self.state
            .lock()
            .indices
            .get(index)
            .and_then(|i| i.documents.get(&DocumentId::new(id)).cloned())
    }

    /// All documents of `index` ordered by identifier
    pub fn documents(&self, index: &str) -> BTreeMap<DocumentId, Bytes> {
        self.state
            .lock()
            .indices
            .get(index)
            .map(|i| i.documents.clone())
            .unwrap_or_default()
    }

    /// Identifiers in the order they were written to `index`
    pub fn writes(&self, index: &str) -> Vec<DocumentId> {
        self.state
            .lock()
            .writes
            .iter()
            .filter(|(i, _)| i == index)
            .map(|(_, id)| id.clone())
            .collect()
    }

    pub fn settings(&self, index: &str) -> Option<IndexSettings> {
        self.state
            .lock()
            .indices
            .get(index)
            .and_then(|i| i.settings)
    }

    /// Number of create requests that actually created an index
    pub fn create_calls(&self) -> usize {
        self.state.lock().create_calls
    }

    fn take_fault(state: &mut State) -> Result<()> {
        match state.faults.pop_front() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn index_exists(&self, index: &str) -> Result<bool> {
        let mut state = self.state.lock();
        Self::take_fault(&mut state)?;
        Ok(state.indices.contains_key(index))
    }

    async fn create_index(&self, index: &str, settings: IndexSettings) -> Result<()> {
        let mut state = self.state.lock();
        Self::take_fault(&mut state)?;
        if !state.indices.contains_key(index) {
            state.create_calls += 1;
            state.indices.insert(
                index.to_string(),
                Index {
                    settings: Some(settings),
                    documents: BTreeMap::new(),
                },
            );
        }
        Ok(())
    }

    async fn upsert(&self, index: &str, id: &DocumentId, document: Bytes) -> Result<()> {
        let mut state = self.state.lock();
        Self::take_fault(&mut state)?;
        if let Some(error) = state
            .document_faults
            .get_mut(id)
            .and_then(VecDeque::pop_front)
        {
            return Err(error);
        }
        // like the REST API, writing to a missing index creates it with default settings
        state
            .indices
            .entry(index.to_string())
            .or_default()
            .documents
            .insert(id.clone(), document);
        state.writes.push((index.to_string(), id.clone()));
        Ok(())
    }
}
