//! Kafka implementations of [`LogProducer`] and [`ConsumerGroup`] on top of librdkafka.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicI32, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use observability_deps::tracing::{debug, info, warn};
use parking_lot::Mutex;
use rdkafka::{
    ClientConfig, ClientContext, Message as _, Offset, TopicPartitionList,
    consumer::{CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer},
    error::{KafkaError, KafkaResult},
    message::BorrowedMessage,
    producer::{FutureProducer, FutureRecord, Producer},
    types::RDKafkaErrorCode,
    util::Timeout,
};
use tokio::{
    sync::mpsc,
    task::{JoinError, JoinSet},
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    Message, Record,
    group::{
        Claim, ClaimHandler, ConsumerGroup, GroupError, GroupOptions, HandlerError,
        InitialOffset, OffsetMarker, Session,
    },
    producer::{Delivery, LogProducer, ProduceError, ProducerOptions},
};

/// Publishes records to a Kafka topic.
///
/// Retries happen inside librdkafka, configured from the [`ProducerOptions`].
pub struct KafkaProducer {
    brokers: String,
    topic: String,
    options: ProducerOptions,
    producer: FutureProducer,
}

// Needed because rdkafka's FutureProducer doesn't impl Debug
impl std::fmt::Debug for KafkaProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KafkaProducer")
            .field("brokers", &self.brokers)
            .field("topic", &self.topic)
            .field("options", &self.options)
            .finish()
    }
}

impl KafkaProducer {
    pub fn new(
        brokers: impl Into<String>,
        topic: impl Into<String>,
        options: ProducerOptions,
    ) -> Result<Self, ProduceError> {
        options.validate()?;
        let brokers = brokers.into();
        let topic = topic.into();

        let producer: FutureProducer = Self::client_config(&brokers, &options).create()?;
        info!(%brokers, %topic, acks = %options.acks, idempotent = options.idempotent, "kafka producer created");

        Ok(Self {
            brokers,
            topic,
            options,
            producer,
        })
    }

    /// The librdkafka settings derived from `options`
    pub fn client_config(brokers: &str, options: &ProducerOptions) -> ClientConfig {
        let mut cfg = ClientConfig::new();
        cfg.set("bootstrap.servers", brokers);
        cfg.set("request.required.acks", options.acks.as_config_value());
        cfg.set("enable.idempotence", options.idempotent.to_string());
        if options.idempotent {
            cfg.set("max.in.flight.requests.per.connection", "1");
        }
        cfg.set("compression.type", options.compression.to_string());
        cfg.set("batch.num.messages", options.batch_size.max(1).to_string());
        cfg.set("linger.ms", options.linger.as_millis().to_string());
        cfg.set(
            "message.timeout.ms",
            options.delivery_timeout.as_millis().to_string(),
        );
        cfg.set(
            "message.send.max.retries",
            options.retry.max_retries.to_string(),
        );
        cfg.set(
            "retry.backoff.ms",
            options.retry.backoff.initial().as_millis().to_string(),
        );
        cfg.set(
            "retry.backoff.max.ms",
            options.retry.backoff.max().as_millis().to_string(),
        );
        cfg.set("partitioner", options.partitioner.to_string());
        cfg
    }
}

#[async_trait]
impl LogProducer for KafkaProducer {
    async fn produce(&self, record: Record) -> Result<Delivery, ProduceError> {
        let mut kafka_record: FutureRecord<'_, [u8], [u8]> =
            FutureRecord::to(&self.topic).payload(record.value.as_ref());
        if let Some(key) = &record.key {
            kafka_record = kafka_record.key(key.as_ref());
        }

        match self.producer.send(kafka_record, Timeout::Never).await {
            Ok((partition, offset)) => {
                debug!(topic = %self.topic, partition, offset, size = record.value.len(), "wrote to kafka");
                Ok(Delivery { partition, offset })
            }
            Err((e, _owned_message)) => {
                let error = ProduceError::Kafka(e);
                if error.is_retryable() {
                    Err(ProduceError::RetriesExhausted {
                        attempts: self.options.retry.max_retries + 1,
                        source: Box::new(error),
                    })
                } else {
                    Err(error)
                }
            }
        }
    }

    async fn flush(&self, timeout: Duration) -> Result<(), ProduceError> {
        let producer = self.producer.clone();
        // librdkafka's flush blocks the calling thread
        tokio::task::spawn_blocking(move || producer.flush(timeout))
            .await?
            .map_err(ProduceError::Flush)
    }

    fn topic(&self) -> &str {
        &self.topic
    }
}

#[derive(Debug)]
enum RebalanceEvent {
    Assigned(Vec<(String, i32)>),
    Revoked(Vec<(String, i32)>),
    Failed(String),
}

fn partitions(tpl: &TopicPartitionList) -> Vec<(String, i32)> {
    tpl.elements()
        .iter()
        .map(|e| (e.topic().to_string(), e.partition()))
        .collect()
}

/// Forwards rebalance callbacks from the librdkafka poll loop to the consume loop.
struct GroupContext {
    events: mpsc::UnboundedSender<RebalanceEvent>,
}

impl ClientContext for GroupContext {}

impl ConsumerContext for GroupContext {
    fn pre_rebalance(&self, rebalance: &Rebalance<'_>) {
        if let Rebalance::Revoke(tpl) = rebalance {
            let _ = self.events.send(RebalanceEvent::Revoked(partitions(tpl)));
        }
    }

    fn post_rebalance(&self, rebalance: &Rebalance<'_>) {
        let event = match rebalance {
            Rebalance::Assign(tpl) => RebalanceEvent::Assigned(partitions(tpl)),
            Rebalance::Revoke(_) => return,
            Rebalance::Error(e) => RebalanceEvent::Failed(e.to_string()),
        };
        let _ = self.events.send(event);
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        match result {
            Ok(()) => debug!(partitions = offsets.count(), "committed offsets"),
            Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => {}
            Err(e) => warn!(%e, "offset commit failed"),
        }
    }
}

type GroupConsumer = StreamConsumer<GroupContext>;

/// Stores marked offsets on the consumer, librdkafka commits them on its own schedule.
struct KafkaOffsetMarker {
    consumer: Arc<GroupConsumer>,
}

// Needed because rdkafka's StreamConsumer doesn't impl Debug
impl std::fmt::Debug for KafkaOffsetMarker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KafkaOffsetMarker").finish_non_exhaustive()
    }
}

impl OffsetMarker for KafkaOffsetMarker {
    fn mark(&self, topic: &str, partition: i32, next_offset: i64) {
        let mut tpl = TopicPartitionList::new();
        let res = tpl
            .add_partition_offset(topic, partition, Offset::Offset(next_offset))
            .and_then(|_| self.consumer.store_offsets(&tpl));
        if let Err(e) = res {
            warn!(%e, topic, partition, next_offset, "failed to store offset");
        }
    }
}

/// How a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    Cancelled,
    Rebalance,
    ClaimsReturned,
    ClaimFailed,
}

/// A member of a Kafka consumer group.
///
/// Marked offsets are stored on the consumer and committed every
/// [`commit_interval`][GroupOptions::commit_interval] as well as when a session ends.
pub struct KafkaConsumerGroup {
    brokers: String,
    group_id: String,
    member_id: String,
    consumer: Arc<GroupConsumer>,
    events: tokio::sync::Mutex<mpsc::UnboundedReceiver<RebalanceEvent>>,
    assigned: Mutex<BTreeSet<(String, i32)>>,
    subscribed: Mutex<Option<Vec<String>>>,
    generation: AtomicI32,
    paused: AtomicBool,
    closed: AtomicBool,
    claim_buffer: usize,
    errors_tx: Mutex<Option<mpsc::Sender<GroupError>>>,
    errors_rx: Mutex<Option<mpsc::Receiver<GroupError>>>,
}

// Needed because rdkafka's StreamConsumer doesn't impl Debug
impl std::fmt::Debug for KafkaConsumerGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KafkaConsumerGroup")
            .field("brokers", &self.brokers)
            .field("group_id", &self.group_id)
            .field("member_id", &self.member_id)
            .field("generation", &self.generation)
            .field("paused", &self.paused)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl KafkaConsumerGroup {
    pub fn new(
        brokers: impl Into<String>,
        group_id: impl Into<String>,
        options: GroupOptions,
    ) -> Result<Self, GroupError> {
        let brokers = brokers.into();
        let group_id = group_id.into();
        let member_id = format!("{group_id}-{}", Uuid::new_v4());

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let consumer: GroupConsumer = Self::client_config(&brokers, &group_id, &member_id, &options)
            .create_with_context(GroupContext { events: events_tx })?;
        let (errors_tx, errors_rx) = mpsc::channel(options.error_buffer.max(1));
        info!(%brokers, %group_id, %member_id, "kafka consumer created");

        Ok(Self {
            brokers,
            group_id,
            member_id,
            consumer: Arc::new(consumer),
            events: tokio::sync::Mutex::new(events_rx),
            assigned: Mutex::new(BTreeSet::new()),
            subscribed: Mutex::new(None),
            generation: AtomicI32::new(0),
            paused: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            claim_buffer: options.claim_buffer.max(1),
            errors_tx: Mutex::new(Some(errors_tx)),
            errors_rx: Mutex::new(Some(errors_rx)),
        })
    }

    /// The librdkafka settings derived from `options`
    pub fn client_config(
        brokers: &str,
        group_id: &str,
        member_id: &str,
        options: &GroupOptions,
    ) -> ClientConfig {
        let mut cfg = ClientConfig::new();
        cfg.set("bootstrap.servers", brokers);
        cfg.set("group.id", group_id);
        cfg.set("client.id", member_id);
        cfg.set("enable.auto.commit", "true");
        cfg.set(
            "auto.commit.interval.ms",
            options.commit_interval.as_millis().to_string(),
        );
        // offsets are only stored once the handler marked a message
        cfg.set("enable.auto.offset.store", "false");
        cfg.set(
            "auto.offset.reset",
            match options.initial_offset {
                InitialOffset::Earliest => "earliest",
                InitialOffset::Latest => "latest",
            },
        );
        cfg.set(
            "session.timeout.ms",
            options.session_timeout.as_millis().to_string(),
        );
        cfg
    }

    fn ensure_subscribed(&self, topics: &[String]) -> Result<(), GroupError> {
        let mut subscribed = self.subscribed.lock();
        if subscribed.as_deref() == Some(topics) {
            return Ok(());
        }
        let names: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer.subscribe(&names)?;
        info!(group_id = %self.group_id, ?topics, "subscribed");
        *subscribed = Some(topics.to_vec());
        Ok(())
    }

    /// Drop the subscription so positions are reset to the committed offsets on the next join
    fn resubscribe_later(&self) {
        self.consumer.unsubscribe();
        self.subscribed.lock().take();
        self.assigned.lock().clear();
    }

    async fn apply(&self, event: RebalanceEvent) {
        match event {
            RebalanceEvent::Assigned(partitions) => {
                let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
                info!(group_id = %self.group_id, generation, ?partitions, "partitions assigned");
                self.assigned.lock().extend(partitions.iter().cloned());
                if self.paused.load(Ordering::SeqCst) {
                    self.pause_partitions(&partitions);
                }
            }
            RebalanceEvent::Revoked(partitions) => {
                info!(group_id = %self.group_id, ?partitions, "partitions revoked");
                let mut assigned = self.assigned.lock();
                for p in &partitions {
                    assigned.remove(p);
                }
            }
            RebalanceEvent::Failed(e) => self.report(GroupError::Rebalance(e)).await,
        }
    }

    fn pause_partitions(&self, partitions: &[(String, i32)]) {
        let mut tpl = TopicPartitionList::new();
        for (topic, partition) in partitions {
            tpl.add_partition(topic, *partition);
        }
        if let Err(e) = self.consumer.pause(&tpl) {
            warn!(%e, "failed to pause partitions");
        }
    }

    async fn report(&self, error: GroupError) {
        let tx = self.errors_tx.lock().clone();
        match tx {
            Some(tx) => {
                let _ = tx.send(error).await;
            }
            None => warn!(%error, "consumer group error after close"),
        }
    }

    /// Forward a failed claim to the error stream, returns whether it failed
    async fn report_claim(
        &self,
        res: Result<(String, i32, Result<(), HandlerError>), JoinError>,
    ) -> bool {
        let error = match res {
            Ok((_, _, Ok(()))) => return false,
            Ok((topic, partition, Err(source))) => GroupError::Claim {
                topic,
                partition,
                source,
            },
            Err(e) => GroupError::ClaimPanicked(e.to_string()),
        };
        self.report(error).await;
        true
    }

    fn commit(&self) {
        match self.consumer.commit_consumer_state(CommitMode::Sync) {
            Ok(()) | Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => {}
            Err(e) => warn!(%e, group_id = %self.group_id, "final offset commit failed"),
        }
    }
}

fn to_message(m: &BorrowedMessage<'_>) -> Message {
    Message::new(
        m.topic(),
        m.partition(),
        m.offset(),
        m.key().map(Bytes::copy_from_slice),
        m.payload().map(Bytes::copy_from_slice).unwrap_or_default(),
    )
}

#[async_trait]
impl ConsumerGroup for KafkaConsumerGroup {
    async fn consume(
        &self,
        topics: &[String],
        handler: Arc<dyn ClaimHandler>,
        cancel: CancellationToken,
    ) -> Result<(), GroupError> {
        if topics.is_empty() {
            return Err(GroupError::NoTopics);
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(GroupError::Closed);
        }
        let mut events = self.events.lock().await;
        self.ensure_subscribed(topics)?;

        // rebalance callbacks run while polling, so keep polling until something is assigned
        let mut early = None;
        loop {
            while let Ok(event) = events.try_recv() {
                self.apply(event).await;
            }
            if !self.assigned.lock().is_empty() {
                break;
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                Some(event) = events.recv() => self.apply(event).await,
                res = self.consumer.recv() => match res {
                    Ok(m) => early = Some(to_message(&m)),
                    Err(e) => self.report(e.into()).await,
                },
            }
        }

        let partitions: Vec<(String, i32)> = self.assigned.lock().iter().cloned().collect();
        let generation = self.generation.load(Ordering::SeqCst);
        let token = cancel.child_token();
        let mut claims: BTreeMap<String, Vec<i32>> = BTreeMap::new();
        for (topic, partition) in &partitions {
            claims.entry(topic.clone()).or_default().push(*partition);
        }
        let marker = Arc::new(KafkaOffsetMarker {
            consumer: Arc::clone(&self.consumer),
        });
        let session = Session::new(
            generation,
            self.member_id.clone(),
            claims,
            token.clone(),
            marker,
        );
        info!(group_id = %self.group_id, member_id = %self.member_id, generation, "session established");

        if let Err(e) = handler.setup(&session).await {
            token.cancel();
            return Err(GroupError::Setup(e));
        }

        let mut senders = BTreeMap::new();
        let mut claim_tasks = JoinSet::new();
        for (topic, partition) in &partitions {
            let (topic, partition) = (topic.clone(), *partition);
            let (tx, rx) = mpsc::channel(self.claim_buffer);
            senders.insert((topic.clone(), partition), tx);

            let claim = Claim::new(topic.clone(), partition, -1, rx);
            let handler = Arc::clone(&handler);
            let session = session.clone();
            claim_tasks.spawn(async move {
                let res = handler.consume_claim(session, claim).await;
                (topic, partition, res)
            });
        }

        let mut next = early;
        let end = 'session: loop {
            if let Some(message) = next.take() {
                let key = (message.topic().to_string(), message.partition());
                if let Some(tx) = senders.get(&key) {
                    tokio::select! {
                        _ = cancel.cancelled() => break 'session SessionEnd::Cancelled,
                        res = tx.send(message) => {
                            if res.is_err() {
                                debug!(topic = %key.0, partition = key.1, "claim already returned, dropping message");
                            }
                        }
                    }
                }
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break SessionEnd::Cancelled,
                Some(event) = events.recv() => {
                    self.apply(event).await;
                    break SessionEnd::Rebalance;
                }
                Some(res) = claim_tasks.join_next() => {
                    if self.report_claim(res).await {
                        break SessionEnd::ClaimFailed;
                    }
                    if claim_tasks.is_empty() {
                        break SessionEnd::ClaimsReturned;
                    }
                }
                res = self.consumer.recv() => match res {
                    Ok(m) => {
                        let message = to_message(&m);
                        // a rebalance triggered by this poll ends the session before routing
                        let mut rebalanced = false;
                        while let Ok(event) = events.try_recv() {
                            self.apply(event).await;
                            rebalanced = true;
                        }
                        if rebalanced {
                            break SessionEnd::Rebalance;
                        }
                        next = Some(message);
                    }
                    Err(e) => self.report(e.into()).await,
                },
            }
        };

        token.cancel();
        drop(senders);
        while let Some(res) = claim_tasks.join_next().await {
            self.report_claim(res).await;
        }
        if let Err(e) = handler.cleanup(&session).await {
            self.report(GroupError::Cleanup(e)).await;
        }
        self.commit();

        match end {
            SessionEnd::Rebalance => {
                info!(group_id = %self.group_id, generation, "session ended by rebalance")
            }
            SessionEnd::ClaimsReturned => {
                info!(group_id = %self.group_id, generation, "all claims returned, rejoining");
                self.resubscribe_later();
            }
            SessionEnd::ClaimFailed => {
                // fetch positions are past the unmarked messages of the failed claim
                warn!(group_id = %self.group_id, generation, "claim failed, rejoining from the committed offsets");
                self.resubscribe_later();
            }
            SessionEnd::Cancelled => debug!(group_id = %self.group_id, generation, "session ended"),
        }
        Ok(())
    }

    fn take_errors(&self) -> Option<mpsc::Receiver<GroupError>> {
        self.errors_rx.lock().take()
    }

    fn pause_all(&self) {
        self.paused.store(true, Ordering::SeqCst);
        let partitions: Vec<_> = self.assigned.lock().iter().cloned().collect();
        self.pause_partitions(&partitions);
    }

    fn resume_all(&self) {
        self.paused.store(false, Ordering::SeqCst);
        match self.consumer.assignment() {
            Ok(tpl) => {
                if let Err(e) = self.consumer.resume(&tpl) {
                    warn!(%e, "failed to resume partitions");
                }
            }
            Err(e) => warn!(%e, "failed to read assignment"),
        }
    }

    async fn close(&self) -> Result<(), GroupError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(GroupError::Closed);
        }
        self.commit();
        self.consumer.unsubscribe();
        self.errors_tx.lock().take();
        info!(group_id = %self.group_id, member_id = %self.member_id, "left consumer group");
        Ok(())
    }
}

/// Returns the broker address for integration tests, or skips the test when they are disabled.
#[macro_export]
macro_rules! maybe_skip_kafka_integration {
    () => {{
        use std::env;
        dotenvy::dotenv().ok();

        match (
            env::var("TEST_INTEGRATION").is_ok(),
            env::var("KAFKA_CONNECT").ok(),
        ) {
            (true, Some(kafka_connection)) => kafka_connection,
            (true, None) => {
                panic!(
                    "TEST_INTEGRATION is set which requires running integration tests, but \
                    KAFKA_CONNECT is not set. Start a broker and set KAFKA_CONNECT to its \
                    host and port, e.g. `localhost:9094`."
                )
            }
            (false, Some(_)) => {
                eprintln!("skipping Kafka integration tests - set TEST_INTEGRATION to run");
                return;
            }
            (false, None) => {
                eprintln!(
                    "skipping Kafka integration tests - set TEST_INTEGRATION and KAFKA_CONNECT to \
                    run"
                );
                return;
            }
        }
    }};
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;

    use rdkafka::{
        admin::{AdminClient, AdminOptions, NewTopic, TopicReplication},
        client::DefaultClientContext,
    };

    use crate::{
        maybe_skip_kafka_integration,
        pool::ProducerPool,
        producer::{AckMode, Compression, Partitioner},
        retry::{Backoff, RetryPolicy},
    };

    use super::*;

    #[test]
    fn producer_config_reflects_options() {
        let options = ProducerOptions {
            acks: AckMode::All,
            idempotent: true,
            compression: Compression::Zstd,
            partitioner: Partitioner::Murmur2Random,
            retry: RetryPolicy {
                max_retries: 7,
                backoff: Backoff::Exponential {
                    initial: Duration::from_millis(50),
                    max: Duration::from_secs(2),
                },
            },
            batch_size: 10,
            linger: Duration::from_millis(20),
            delivery_timeout: Duration::from_secs(30),
        };
        let cfg = KafkaProducer::client_config("localhost:9094", &options);

        assert_eq!(cfg.get("bootstrap.servers"), Some("localhost:9094"));
        assert_eq!(cfg.get("request.required.acks"), Some("all"));
        assert_eq!(cfg.get("enable.idempotence"), Some("true"));
        assert_eq!(cfg.get("max.in.flight.requests.per.connection"), Some("1"));
        assert_eq!(cfg.get("compression.type"), Some("zstd"));
        assert_eq!(cfg.get("batch.num.messages"), Some("10"));
        assert_eq!(cfg.get("linger.ms"), Some("20"));
        assert_eq!(cfg.get("message.timeout.ms"), Some("30000"));
        assert_eq!(cfg.get("message.send.max.retries"), Some("7"));
        assert_eq!(cfg.get("retry.backoff.ms"), Some("50"));
        assert_eq!(cfg.get("retry.backoff.max.ms"), Some("2000"));
        assert_eq!(cfg.get("partitioner"), Some("murmur2_random"));
    }

    #[test]
    fn non_idempotent_producer_allows_pipelining() {
        let options = ProducerOptions {
            acks: AckMode::Leader,
            idempotent: false,
            ..Default::default()
        };
        let cfg = KafkaProducer::client_config("localhost:9094", &options);
        assert_eq!(cfg.get("request.required.acks"), Some("1"));
        assert_eq!(cfg.get("enable.idempotence"), Some("false"));
        assert_eq!(cfg.get("max.in.flight.requests.per.connection"), None);
    }

    #[test]
    fn idempotent_producer_rejects_weak_acks() {
        let options = ProducerOptions {
            acks: AckMode::None,
            ..Default::default()
        };
        let err = KafkaProducer::new("localhost:9094", "test", options).unwrap_err();
        assert!(matches!(err, ProduceError::IdempotenceRequiresAllAcks(AckMode::None)));
    }

    #[test]
    fn consumer_config_stores_offsets_manually() {
        let options = GroupOptions {
            initial_offset: InitialOffset::Earliest,
            commit_interval: Duration::from_millis(1500),
            ..Default::default()
        };
        let cfg = KafkaConsumerGroup::client_config("localhost:9094", "OSPublisher", "m-1", &options);

        assert_eq!(cfg.get("group.id"), Some("OSPublisher"));
        assert_eq!(cfg.get("client.id"), Some("m-1"));
        assert_eq!(cfg.get("enable.auto.commit"), Some("true"));
        assert_eq!(cfg.get("enable.auto.offset.store"), Some("false"));
        assert_eq!(cfg.get("auto.commit.interval.ms"), Some("1500"));
        assert_eq!(cfg.get("auto.offset.reset"), Some("earliest"));
        assert_eq!(cfg.get("session.timeout.ms"), Some("10000"));
    }

    #[derive(Debug)]
    struct Forward {
        tx: mpsc::Sender<Message>,
    }

    #[async_trait]
    impl ClaimHandler for Forward {
        async fn consume_claim(
            &self,
            session: Session,
            mut claim: Claim,
        ) -> Result<(), HandlerError> {
            loop {
                tokio::select! {
                    biased;
                    _ = session.cancelled() => return Ok(()),
                    message = claim.next() => {
                        let Some(message) = message else { return Ok(()) };
                        session.mark_message(&message);
                        if self.tx.send(message).await.is_err() {
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    #[tokio::test]
    async fn produce_and_consume_through_a_group() {
        let conn = maybe_skip_kafka_integration!();

        let topic = format!("test_topic_{}", Uuid::new_v4());
        let mut cfg = ClientConfig::new();
        cfg.set("bootstrap.servers", &conn);
        let admin: AdminClient<DefaultClientContext> = cfg.create().unwrap();
        admin
            .create_topics(
                &[NewTopic::new(&topic, 2, TopicReplication::Fixed(1))],
                &AdminOptions::default(),
            )
            .await
            .unwrap();

        let producer = Arc::new(KafkaProducer::new(&conn, &topic, ProducerOptions::default()).unwrap());
        let nz = |n| NonZeroUsize::new(n).unwrap();
        let (pool, _failures) = ProducerPool::new(producer, nz(2), nz(4), nz(4));
        for i in 0..10 {
            pool.submit(Record::new(format!("message {i}")).with_key(format!("key {}", i % 3)))
                .await
                .unwrap();
        }
        let stats = pool.close(Duration::from_secs(10)).await.unwrap();
        assert_eq!(stats.delivered, 10);

        let options = GroupOptions {
            initial_offset: InitialOffset::Earliest,
            ..Default::default()
        };
        let group = Arc::new(
            KafkaConsumerGroup::new(&conn, format!("group_{}", Uuid::new_v4()), options).unwrap(),
        );
        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let group = Arc::clone(&group);
            let cancel = cancel.clone();
            async move {
                while !cancel.is_cancelled() {
                    group
                        .consume(&[topic.clone()], Arc::new(Forward { tx: tx.clone() }), cancel.clone())
                        .await
                        .unwrap();
                }
            }
        });

        for _ in 0..10 {
            tokio::time::timeout(Duration::from_secs(30), rx.recv())
                .await
                .unwrap()
                .unwrap();
        }
        cancel.cancel();
        task.await.unwrap();
        group.close().await.unwrap();
    }
}
