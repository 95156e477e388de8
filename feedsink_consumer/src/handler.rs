use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use async_trait::async_trait;
use feedsink_indexer::Indexer;
use feedsink_log::{Claim, ClaimHandler, HandlerError, Message, Session};
use observability_deps::tracing::{debug, error, info, warn};

/// Counters of an [`IndexingHandler`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandlerStats {
    /// Messages written to the store
    pub indexed: u64,
    /// Messages without a usable document identifier
    pub skipped: u64,
    /// Messages the store refused permanently
    pub rejected: u64,
}

#[derive(Debug, Default)]
struct Counters {
    indexed: AtomicU64,
    skipped: AtomicU64,
    rejected: AtomicU64,
}

/// Indexes every message of a claim, in offset order, and marks it once handed off.
///
/// A message without a document identifier, or a document the store refuses (bad mapping,
/// version conflict, too large), is logged, skipped and marked so it can not stall its
/// partition. Any other failure, such as an unavailable store or rejected credentials, ends the
/// claim without marking, the message is delivered again once the group rejoins.
#[derive(Debug)]
pub struct IndexingHandler {
    indexer: Indexer,
    counters: Arc<Counters>,
}

impl IndexingHandler {
    pub fn new(indexer: Indexer) -> Self {
        Self {
            indexer,
            counters: Default::default(),
        }
    }

    pub fn stats(&self) -> HandlerStats {
        HandlerStats {
            indexed: self.counters.indexed.load(Ordering::Relaxed),
            skipped: self.counters.skipped.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
        }
    }

    /// Hand a single message to the indexer. Returns an error only if the message must be
    /// delivered again.
    async fn handle(&self, session: &Session, message: &Message) -> Result<(), HandlerError> {
        let id = match self.indexer.document_id(message.value()) {
            Ok(id) => id,
            Err(e) => {
                warn!(
                    error = %e,
                    topic = message.topic(),
                    partition = message.partition(),
                    offset = message.offset(),
                    "skipping message without document id"
                );
                self.counters.skipped.fetch_add(1, Ordering::Relaxed);
                session.mark_message(message);
                return Ok(());
            }
        };

        match self.indexer.upsert(&id, message.value().clone()).await {
            Ok(()) => {
                self.counters.indexed.fetch_add(1, Ordering::Relaxed);
                debug!(
                    document_id = %id,
                    partition = message.partition(),
                    offset = message.offset(),
                    "indexed document"
                );
            }
            Err(e) if e.is_document_rejection() => {
                error!(
                    error = %e,
                    document_id = %id,
                    partition = message.partition(),
                    offset = message.offset(),
                    "document rejected by the store, skipping"
                );
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                error!(
                    error = %e,
                    document_id = %id,
                    partition = message.partition(),
                    offset = message.offset(),
                    "document store failed, releasing claim"
                );
                return Err(Box::new(e));
            }
        }
        session.mark_message(message);
        Ok(())
    }
}

#[async_trait]
impl ClaimHandler for IndexingHandler {
    async fn consume_claim(&self, session: Session, mut claim: Claim) -> Result<(), HandlerError> {
        info!(
            topic = claim.topic(),
            partition = claim.partition(),
            generation = session.generation(),
            "claim started"
        );
        loop {
            let message = tokio::select! {
                biased;
                _ = session.cancelled() => {
                    debug!(partition = claim.partition(), "session ended, releasing claim");
                    return Ok(());
                }
                message = claim.next() => match message {
                    Some(message) => message,
                    None => {
                        debug!(partition = claim.partition(), "claim closed");
                        return Ok(());
                    }
                },
            };
            // an in-flight message is always finished, cancellation is observed between messages
            self.handle(&session, &message).await?;
        }
    }
}
