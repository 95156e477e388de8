//! A bounded pool of workers publishing records on behalf of a source.
//!
//! The source submits into a bounded queue and blocks once it is full, so a slow log throttles
//! the source instead of growing an unbounded number of in-flight publishes. Records that could
//! not be delivered after the producer's retries are reported on the failure channel returned by
//! [`ProducerPool::new`], which must be drained by the caller.

use std::{
    num::NonZeroUsize,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use observability_deps::tracing::{debug, info};
use tokio::sync::{Mutex, mpsc};
use tokio_util::task::TaskTracker;

use crate::{
    Record,
    producer::{LogProducer, ProduceError},
};

/// A record that could not be published
#[derive(Debug)]
pub struct PublishFailure {
    pub record: Record,
    pub error: ProduceError,
}

/// Counters of a [`ProducerPool`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub delivered: u64,
    pub failed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    delivered: AtomicU64,
    failed: AtomicU64,
}

/// Fixed-size set of publishing workers fed from a bounded queue
#[derive(Debug)]
pub struct ProducerPool {
    producer: Arc<dyn LogProducer>,
    queue: mpsc::Sender<Record>,
    workers: TaskTracker,
    counters: Arc<Counters>,
}

impl ProducerPool {
    /// Start `workers` publishing tasks
    ///
    /// `queue_depth` bounds the number of records waiting for a worker, `failure_buffer` bounds
    /// the number of undrained [`PublishFailure`]s. Workers stall once the failure channel is
    /// full, so the returned receiver must be drained continuously.
    pub fn new(
        producer: Arc<dyn LogProducer>,
        workers: NonZeroUsize,
        queue_depth: NonZeroUsize,
        failure_buffer: NonZeroUsize,
    ) -> (Self, mpsc::Receiver<PublishFailure>) {
        let (queue, rx) = mpsc::channel(queue_depth.get());
        let (failures, failures_rx) = mpsc::channel(failure_buffer.get());
        let rx = Arc::new(Mutex::new(rx));
        let counters = Arc::new(Counters::default());
        let tracker = TaskTracker::new();

        for worker in 0..workers.get() {
            tracker.spawn(run_worker(
                worker,
                Arc::clone(&producer),
                Arc::clone(&rx),
                failures.clone(),
                Arc::clone(&counters),
            ));
        }

        (
            Self {
                producer,
                queue,
                workers: tracker,
                counters,
            },
            failures_rx,
        )
    }

    /// Queue a record for publishing, waiting while the queue is full
    pub async fn submit(&self, record: Record) -> Result<(), ProduceError> {
        self.queue
            .send(record)
            .await
            .map_err(|_| ProduceError::QueueClosed)
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting records, wait for the queue to drain and flush the producer
    pub async fn close(self, flush_timeout: Duration) -> Result<PoolStats, ProduceError> {
        let Self {
            producer,
            queue,
            workers,
            counters,
        } = self;

        drop(queue);
        workers.close();
        workers.wait().await;
        producer.flush(flush_timeout).await?;

        let stats = PoolStats {
            delivered: counters.delivered.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
        };
        info!(
            topic = producer.topic(),
            delivered = stats.delivered,
            failed = stats.failed,
            "producer pool closed"
        );
        Ok(stats)
    }
}

async fn run_worker(
    worker: usize,
    producer: Arc<dyn LogProducer>,
    queue: Arc<Mutex<mpsc::Receiver<Record>>>,
    failures: mpsc::Sender<PublishFailure>,
    counters: Arc<Counters>,
) {
    loop {
        // only hold the lock while waiting for the next record, not while publishing it
        let next = queue.lock().await.recv().await;
        let Some(record) = next else {
            debug!(worker, "producer queue closed, worker exiting");
            return;
        };

        match producer.produce(record.clone()).await {
            Ok(delivery) => {
                counters.delivered.fetch_add(1, Ordering::Relaxed);
                debug!(
                    worker,
                    partition = delivery.partition,
                    offset = delivery.offset,
                    "record delivered"
                );
            }
            Err(error) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                // blocks while the failure channel is full; a dropped receiver discards failures
                let _ = failures.send(PublishFailure { record, error }).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU32;

    use crate::{
        mock::{AppendFault, MockBroker},
        producer::ProducerOptions,
        retry::RetryPolicy,
    };

    use super::*;

    fn nz(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).unwrap()
    }

    #[tokio::test]
    async fn publishes_every_submitted_record() {
        let broker = MockBroker::new();
        broker.create_topic("test", NonZeroU32::new(3).unwrap());
        let producer = Arc::new(broker.producer("test", ProducerOptions::default()));

        let (pool, mut failures) = ProducerPool::new(producer, nz(4), nz(2), nz(8));
        for i in 0..100 {
            pool.submit(Record::new(format!("message {i}"))).await.unwrap();
        }
        let stats = pool.close(Duration::from_secs(1)).await.unwrap();

        assert_eq!(stats, PoolStats { delivered: 100, failed: 0 });
        assert!(failures.recv().await.is_none());
        let total: usize = (0..3).map(|p| broker.messages("test", p).len()).sum();
        assert_eq!(total, 100);
    }

    #[tokio::test]
    async fn exhausted_records_are_reported() {
        let broker = MockBroker::new();
        broker.create_topic("test", NonZeroU32::new(1).unwrap());
        for _ in 0..3 {
            broker.inject_fault(AppendFault::Reject);
        }
        let options = ProducerOptions {
            retry: RetryPolicy {
                max_retries: 2,
                ..RetryPolicy::never()
            },
            ..Default::default()
        };
        let producer = Arc::new(broker.producer("test", options));

        let (pool, mut failures) = ProducerPool::new(producer, nz(1), nz(1), nz(1));
        pool.submit(Record::new("doomed")).await.unwrap();

        let failure = failures.recv().await.unwrap();
        assert_eq!(failure.record, Record::new("doomed"));
        assert!(matches!(
            failure.error,
            ProduceError::RetriesExhausted { attempts: 3, .. }
        ));

        let stats = pool.close(Duration::from_secs(1)).await.unwrap();
        assert_eq!(stats, PoolStats { delivered: 0, failed: 1 });
        assert!(broker.messages("test", 0).is_empty());
    }

    #[tokio::test]
    async fn submit_blocks_when_the_queue_is_full() {
        let broker = MockBroker::new();
        broker.create_topic("test", NonZeroU32::new(1).unwrap());
        let gate = broker.hold_appends();
        let producer = Arc::new(broker.producer("test", ProducerOptions::default()));

        let (pool, _failures) = ProducerPool::new(producer, nz(1), nz(1), nz(1));
        // one record held by the worker, one in the queue
        pool.submit(Record::new("a")).await.unwrap();
        pool.submit(Record::new("b")).await.unwrap();

        let blocked =
            tokio::time::timeout(Duration::from_millis(50), pool.submit(Record::new("c"))).await;
        assert!(blocked.is_err(), "submit should wait for queue capacity");

        drop(gate);
        pool.submit(Record::new("c")).await.unwrap();
        let stats = pool.close(Duration::from_secs(1)).await.unwrap();
        assert_eq!(stats.delivered, 3);
    }
}
