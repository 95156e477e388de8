//! An in-memory log broker.
//!
//! [`MockBroker`] is cheap to clone, all clones share the same topics, committed offsets and
//! group memberships. Producers and consumer groups created from it behave like their Kafka
//! counterparts closely enough to test rebalances, pausing and offset commits without a broker.

use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    num::NonZeroU32,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use observability_deps::tracing::{debug, info, warn};
use parking_lot::Mutex;
use tokio::{
    sync::{Notify, OwnedRwLockWriteGuard, RwLock, mpsc, watch},
    task::{JoinError, JoinSet},
};
use tokio_util::sync::CancellationToken;
use twox_hash::XxHash64;

use crate::{
    Message, Record,
    group::{
        Claim, ClaimHandler, ConsumerGroup, GroupError, GroupOptions, HandlerError,
        InitialOffset, OffsetMarker, Session,
    },
    producer::{AckMode, Delivery, LogProducer, Partitioner, ProduceError, ProducerOptions},
    retry::Exhausted,
};

/// Messages read from a partition log per fetch.
const FETCH_BATCH: usize = 64;

/// A failure injected into the next append
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendFault {
    /// The append is refused and nothing is written
    Reject,
    /// The append is written but the acknowledgement never reaches the producer
    LoseAck,
}

#[derive(Debug)]
struct GroupState {
    generation: i32,
    /// Subscribed topics per member
    members: BTreeMap<String, Vec<String>>,
    /// Which member currently holds a claim on a partition
    owners: BTreeMap<(String, i32), String>,
    generation_tx: watch::Sender<i32>,
}

impl GroupState {
    fn new() -> Self {
        Self {
            generation: 0,
            members: BTreeMap::new(),
            owners: BTreeMap::new(),
            generation_tx: watch::channel(0).0,
        }
    }

    fn bump(&mut self) {
        self.generation += 1;
        self.generation_tx.send_replace(self.generation);
    }
}

#[derive(Debug, Default)]
struct BrokerState {
    topics: BTreeMap<String, Vec<Vec<Message>>>,
    /// Next offset to read, per (group, topic, partition)
    committed: BTreeMap<(String, String, i32), i64>,
    groups: BTreeMap<String, GroupState>,
    /// Last accepted sequence number and its offset, per (producer, topic, partition)
    sequences: BTreeMap<(u64, String, i32), (u64, i64)>,
    next_producer_id: u64,
    next_member_id: u64,
    faults: VecDeque<AppendFault>,
}

/// Blocks every append until dropped, see [`MockBroker::hold_appends`]
#[derive(Debug)]
pub struct AppendHold {
    _guard: OwnedRwLockWriteGuard<()>,
}

/// Shared in-memory state of topics, offsets and groups
#[derive(Debug, Clone, Default)]
pub struct MockBroker {
    state: Arc<Mutex<BrokerState>>,
    /// Notified whenever a message is appended or a claim is released
    changed: Arc<Notify>,
    holds: Arc<RwLock<()>>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a topic with `partitions` empty partitions.
    ///
    /// # Panics
    /// - when the topic already exists
    pub fn create_topic(&self, topic: &str, partitions: NonZeroU32) {
        let mut state = self.state.lock();
        assert!(
            !state.topics.contains_key(topic),
            "topic {topic} already exists"
        );
        state.topics.insert(
            topic.to_string(),
            (0..partitions.get()).map(|_| Vec::new()).collect(),
        );
    }

    pub fn partition_count(&self, topic: &str) -> Option<usize> {
        self.state.lock().topics.get(topic).map(Vec::len)
    }

    /// Append a message directly, bypassing producers and injected faults.
    ///
    /// # Panics
    /// - when the topic or partition does not exist
    pub fn append(
        &self,
        topic: &str,
        partition: i32,
        key: Option<Bytes>,
        value: impl Into<Bytes>,
    ) -> i64 {
        let offset = {
            let mut state = self.state.lock();
            let log = partition_log(&mut state, topic, partition).expect("unknown partition");
            let offset = log.len() as i64;
            log.push(Message::new(topic, partition, offset, key, value.into()));
            offset
        };
        self.changed.notify_waiters();
        offset
    }

    /// All messages of a partition.
    ///
    /// # Panics
    /// - when the topic or partition does not exist
    pub fn messages(&self, topic: &str, partition: i32) -> Vec<Message> {
        let mut state = self.state.lock();
        partition_log(&mut state, topic, partition)
            .expect("unknown partition")
            .clone()
    }

    /// The committed position of a group, i.e. the next offset it will read.
    pub fn committed(&self, group_id: &str, topic: &str, partition: i32) -> Option<i64> {
        self.state
            .lock()
            .committed
            .get(&(group_id.to_string(), topic.to_string(), partition))
            .copied()
    }

    /// Current members of a group.
    pub fn members(&self, group_id: &str) -> Vec<String> {
        self.state
            .lock()
            .groups
            .get(group_id)
            .map(|g| g.members.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn generation(&self, group_id: &str) -> i32 {
        self.state
            .lock()
            .groups
            .get(group_id)
            .map(|g| g.generation)
            .unwrap_or_default()
    }

    /// Start a new generation of a group, as if a member had timed out and come back.
    pub fn rebalance(&self, group_id: &str) {
        if let Some(group) = self.state.lock().groups.get_mut(group_id) {
            group.bump();
        }
    }

    /// Make the next append through a producer fail with `fault`.
    pub fn inject_fault(&self, fault: AppendFault) {
        self.state.lock().faults.push_back(fault);
    }

    /// Block all producer appends until the returned guard is dropped.
    ///
    /// # Panics
    /// - when appends are already held
    pub fn hold_appends(&self) -> AppendHold {
        AppendHold {
            _guard: Arc::clone(&self.holds)
                .try_write_owned()
                .expect("appends already held"),
        }
    }

    /// A producer publishing to `topic`.
    ///
    /// # Panics
    /// - when the topic does not exist
    pub fn producer(&self, topic: &str, options: ProducerOptions) -> MockProducer {
        let partitions = self.partition_count(topic).expect("unknown topic");
        let producer_id = {
            let mut state = self.state.lock();
            state.next_producer_id += 1;
            state.next_producer_id
        };
        MockProducer {
            broker: self.clone(),
            topic: topic.to_string(),
            options,
            producer_id,
            sequences: Mutex::new(BTreeMap::new()),
            in_flight: (0..partitions).map(|_| tokio::sync::Mutex::new(())).collect(),
            round_robin: AtomicUsize::new(0),
        }
    }

    /// A new member of `group_id`.
    pub fn consumer_group(&self, group_id: &str, options: GroupOptions) -> MockConsumerGroup {
        let member_id = {
            let mut state = self.state.lock();
            state.next_member_id += 1;
            format!("{group_id}-member-{}", state.next_member_id)
        };
        let (errors_tx, errors_rx) = mpsc::channel(options.error_buffer.max(1));
        MockConsumerGroup {
            broker: self.clone(),
            group_id: group_id.to_string(),
            member_id,
            options,
            paused: watch::channel(false).0,
            errors_tx: Mutex::new(Some(errors_tx)),
            errors_rx: Mutex::new(Some(errors_rx)),
            closed: AtomicBool::new(false),
            consuming: AtomicBool::new(false),
            close_calls: AtomicUsize::new(0),
            closed_while_consuming: AtomicBool::new(false),
            pause_calls: AtomicUsize::new(0),
            resume_calls: AtomicUsize::new(0),
        }
    }

    async fn append_record(
        &self,
        topic: &str,
        partition: i32,
        record: &Record,
        sequence: Option<(u64, u64)>,
    ) -> Result<i64, ProduceError> {
        let _hold = self.holds.read().await;

        let (offset, fault) = {
            let mut state = self.state.lock();
            let fault = state.faults.pop_front();
            if fault == Some(AppendFault::Reject) {
                return Err(ProduceError::Transient("append rejected".into()));
            }

            let duplicate = sequence.and_then(|(producer_id, seq)| {
                state
                    .sequences
                    .get(&(producer_id, topic.to_string(), partition))
                    .filter(|(last_seq, _)| *last_seq >= seq)
                    .map(|(_, offset)| *offset)
            });

            let offset = match duplicate {
                Some(offset) => {
                    debug!(topic, partition, offset, "suppressed duplicate append");
                    offset
                }
                None => {
                    let log = partition_log(&mut state, topic, partition).ok_or_else(|| {
                        ProduceError::Transient(format!("unknown partition {topic}/{partition}"))
                    })?;
                    let offset = log.len() as i64;
                    log.push(Message::new(
                        topic,
                        partition,
                        offset,
                        record.key.clone(),
                        record.value.clone(),
                    ));
                    if let Some((producer_id, seq)) = sequence {
                        state
                            .sequences
                            .insert((producer_id, topic.to_string(), partition), (seq, offset));
                    }
                    offset
                }
            };
            (offset, fault)
        };
        self.changed.notify_waiters();

        match fault {
            Some(AppendFault::LoseAck) => {
                Err(ProduceError::Transient("acknowledgement lost".into()))
            }
            _ => Ok(offset),
        }
    }

    fn read(&self, topic: &str, partition: i32, from: i64, max: usize) -> Vec<Message> {
        let mut state = self.state.lock();
        partition_log(&mut state, topic, partition)
            .map(|log| {
                log.iter()
                    .skip(from.max(0) as usize)
                    .take(max)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn commit(&self, group_id: &str, topic: &str, partition: i32, next_offset: i64) {
        self.state.lock().committed.insert(
            (group_id.to_string(), topic.to_string(), partition),
            next_offset,
        );
    }

    fn start_offset(
        &self,
        group_id: &str,
        topic: &str,
        partition: i32,
        initial: InitialOffset,
    ) -> i64 {
        let mut state = self.state.lock();
        if let Some(offset) =
            state
                .committed
                .get(&(group_id.to_string(), topic.to_string(), partition))
        {
            return *offset;
        }
        match initial {
            InitialOffset::Earliest => 0,
            InitialOffset::Latest => partition_log(&mut state, topic, partition)
                .map(|log| log.len() as i64)
                .unwrap_or_default(),
        }
    }

    /// Register a member, starting a new generation if the membership changed.
    fn join(&self, group_id: &str, member_id: &str, topics: &[String]) -> watch::Receiver<i32> {
        let mut state = self.state.lock();
        let group = state
            .groups
            .entry(group_id.to_string())
            .or_insert_with(GroupState::new);
        let topics = topics.to_vec();
        if group.members.get(member_id) != Some(&topics) {
            group.members.insert(member_id.to_string(), topics);
            group.bump();
            info!(group_id, member_id, generation = group.generation, "member joined");
        }
        group.generation_tx.subscribe()
    }

    fn leave(&self, group_id: &str, member_id: &str) {
        let mut state = self.state.lock();
        if let Some(group) = state.groups.get_mut(group_id) {
            if group.members.remove(member_id).is_some() {
                group.owners.retain(|_, owner| owner != member_id);
                group.bump();
                info!(group_id, member_id, generation = group.generation, "member left");
            }
        }
        drop(state);
        self.changed.notify_waiters();
    }

    /// Round-robin assignment of each topic's partitions over its subscribed members.
    fn assignment(&self, group_id: &str, member_id: &str) -> Vec<(String, i32)> {
        let state = self.state.lock();
        let Some(group) = state.groups.get(group_id) else {
            return vec![];
        };
        let topics: BTreeSet<&String> = group.members.values().flatten().collect();

        let mut assigned = vec![];
        for topic in topics {
            let subscribers: Vec<&String> = group
                .members
                .iter()
                .filter(|(_, topics)| topics.contains(topic))
                .map(|(member, _)| member)
                .collect();
            let partitions = state.topics.get(topic).map(Vec::len).unwrap_or_default();
            for partition in 0..partitions {
                if subscribers[partition % subscribers.len()] == member_id {
                    assigned.push((topic.clone(), partition as i32));
                }
            }
        }
        assigned
    }

    /// Take ownership of all `partitions`, or of none if any is still held by another member.
    fn try_acquire(&self, group_id: &str, member_id: &str, partitions: &[(String, i32)]) -> bool {
        let mut state = self.state.lock();
        let Some(group) = state.groups.get_mut(group_id) else {
            return false;
        };
        let free = partitions.iter().all(|p| {
            group
                .owners
                .get(p)
                .is_none_or(|owner| owner == member_id)
        });
        if free {
            for p in partitions {
                group.owners.insert(p.clone(), member_id.to_string());
            }
        }
        free
    }

    fn release(&self, group_id: &str, member_id: &str, partitions: &[(String, i32)]) {
        {
            let mut state = self.state.lock();
            if let Some(group) = state.groups.get_mut(group_id) {
                for p in partitions {
                    if group.owners.get(p).is_some_and(|owner| owner == member_id) {
                        group.owners.remove(p);
                    }
                }
            }
        }
        self.changed.notify_waiters();
    }
}

fn partition_log<'a>(
    state: &'a mut BrokerState,
    topic: &str,
    partition: i32,
) -> Option<&'a mut Vec<Message>> {
    state
        .topics
        .get_mut(topic)
        .and_then(|partitions| partitions.get_mut(usize::try_from(partition).ok()?))
}

/// A [`LogProducer`] appending to a [`MockBroker`] topic
///
/// Retries follow the configured [`RetryPolicy`][crate::RetryPolicy]. When idempotence is
/// enabled every record gets a per-partition sequence number that is kept across retries, and
/// only one record per partition is in flight at a time.
#[derive(Debug)]
pub struct MockProducer {
    broker: MockBroker,
    topic: String,
    options: ProducerOptions,
    producer_id: u64,
    sequences: Mutex<BTreeMap<i32, u64>>,
    in_flight: Vec<tokio::sync::Mutex<()>>,
    round_robin: AtomicUsize,
}

impl MockProducer {
    fn partition_for(&self, record: &Record) -> i32 {
        let partitions = self.in_flight.len();
        let hashed = |key: &[u8]| (XxHash64::oneshot(0, key) % partitions as u64) as usize;
        let index = match (&record.key, self.options.partitioner) {
            (Some(key), p) if p != Partitioner::Random => hashed(key.as_ref()),
            (None, Partitioner::Consistent) => hashed(b""),
            _ => self.round_robin.fetch_add(1, Ordering::Relaxed) % partitions,
        };
        index as i32
    }
}

#[async_trait]
impl LogProducer for MockProducer {
    async fn produce(&self, record: Record) -> Result<Delivery, ProduceError> {
        let partition = self.partition_for(&record);

        let _in_flight = match self.options.idempotent {
            true => Some(self.in_flight[partition as usize].lock().await),
            false => None,
        };
        let sequence = self.options.idempotent.then(|| {
            let mut sequences = self.sequences.lock();
            let next = sequences.entry(partition).or_default();
            let seq = *next;
            *next += 1;
            (self.producer_id, seq)
        });

        let res = self
            .options
            .retry
            .run(
                "produce record",
                || {
                    self.broker
                        .append_record(&self.topic, partition, &record, sequence)
                },
                ProduceError::is_retryable,
            )
            .await;

        match res {
            Ok(_) | Err(_) if self.options.acks == AckMode::None => Ok(Delivery {
                partition,
                offset: -1,
            }),
            Ok(offset) => Ok(Delivery { partition, offset }),
            Err(Exhausted { attempts, error }) if error.is_retryable() => {
                Err(ProduceError::RetriesExhausted {
                    attempts,
                    source: Box::new(error),
                })
            }
            Err(Exhausted { error, .. }) => Err(error),
        }
    }

    async fn flush(&self, _timeout: Duration) -> Result<(), ProduceError> {
        Ok(())
    }

    fn topic(&self) -> &str {
        &self.topic
    }
}

#[derive(Debug)]
struct MockMarker {
    broker: MockBroker,
    group_id: String,
}

impl OffsetMarker for MockMarker {
    fn mark(&self, topic: &str, partition: i32, next_offset: i64) {
        self.broker
            .commit(&self.group_id, topic, partition, next_offset);
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

/// Sets a flag for as long as it is alive
struct ConsumingGuard<'a>(&'a AtomicBool);

impl<'a> ConsumingGuard<'a> {
    fn new(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for ConsumingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// A member of a consumer group on a [`MockBroker`]
///
/// Marked offsets are committed immediately. Besides the [`ConsumerGroup`] interface it records
/// how it was used, so tests can assert on pause calls and on the close sequence.
#[derive(Debug)]
pub struct MockConsumerGroup {
    broker: MockBroker,
    group_id: String,
    member_id: String,
    options: GroupOptions,
    paused: watch::Sender<bool>,
    errors_tx: Mutex<Option<mpsc::Sender<GroupError>>>,
    errors_rx: Mutex<Option<mpsc::Receiver<GroupError>>>,
    closed: AtomicBool,
    consuming: AtomicBool,
    close_calls: AtomicUsize,
    closed_while_consuming: AtomicBool,
    pause_calls: AtomicUsize,
    resume_calls: AtomicUsize,
}

impl MockConsumerGroup {
    pub fn member_id(&self) -> &str {
        &self.member_id
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    /// Whether [`close`][ConsumerGroup::close] was ever called during a running `consume`
    pub fn closed_while_consuming(&self) -> bool {
        self.closed_while_consuming.load(Ordering::SeqCst)
    }

    pub fn is_consuming(&self) -> bool {
        self.consuming.load(Ordering::SeqCst)
    }

    pub fn pause_calls(&self) -> usize {
        self.pause_calls.load(Ordering::SeqCst)
    }

    pub fn resume_calls(&self) -> usize {
        self.resume_calls.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
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
}

#[async_trait]
impl ConsumerGroup for MockConsumerGroup {
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
        let _consuming = ConsumingGuard::new(&self.consuming);
        let mut generations = self.broker.join(&self.group_id, &self.member_id, topics);

        // wait for an assignment whose partitions were released by their previous owners
        let (generation, partitions) = loop {
            let generation = *generations.borrow_and_update();
            let released = self.broker.changed.notified();
            let partitions = self.broker.assignment(&self.group_id, &self.member_id);
            if !partitions.is_empty()
                && self
                    .broker
                    .try_acquire(&self.group_id, &self.member_id, &partitions)
            {
                break (generation, partitions);
            }
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                res = generations.changed() => {
                    if res.is_err() {
                        return Err(GroupError::Closed);
                    }
                }
                _ = released => {}
            }
        };

        let token = cancel.child_token();
        let mut claims: BTreeMap<String, Vec<i32>> = BTreeMap::new();
        for (topic, partition) in &partitions {
            claims.entry(topic.clone()).or_default().push(*partition);
        }
        let marker = Arc::new(MockMarker {
            broker: self.broker.clone(),
            group_id: self.group_id.clone(),
        });
        let session = Session::new(
            generation,
            self.member_id.clone(),
            claims,
            token.clone(),
            marker,
        );
        info!(
            group_id = %self.group_id,
            member_id = %self.member_id,
            generation,
            ?partitions,
            "session established"
        );

        if let Err(e) = handler.setup(&session).await {
            token.cancel();
            self.broker
                .release(&self.group_id, &self.member_id, &partitions);
            return Err(GroupError::Setup(e));
        }

        let mut feeders = JoinSet::new();
        let mut claim_tasks = JoinSet::new();
        for (topic, partition) in &partitions {
            let (topic, partition) = (topic.clone(), *partition);
            let start = self.broker.start_offset(
                &self.group_id,
                &topic,
                partition,
                self.options.initial_offset,
            );
            let (tx, rx) = mpsc::channel(self.options.claim_buffer.max(1));
            feeders.spawn(feed(
                self.broker.clone(),
                topic.clone(),
                partition,
                start,
                tx,
                self.paused.subscribe(),
                token.clone(),
            ));

            let claim = Claim::new(topic.clone(), partition, start, rx);
            let handler = Arc::clone(&handler);
            let session = session.clone();
            claim_tasks.spawn(async move {
                let res = handler.consume_claim(session, claim).await;
                (topic, partition, res)
            });
        }

        let end = loop {
            tokio::select! {
                _ = cancel.cancelled() => break SessionEnd::Cancelled,
                res = generations.changed() => {
                    if res.is_err() || *generations.borrow_and_update() != generation {
                        break SessionEnd::Rebalance;
                    }
                }
                Some(res) = claim_tasks.join_next() => {
                    if self.report_claim(res).await {
                        break SessionEnd::ClaimFailed;
                    }
                    if claim_tasks.is_empty() {
                        break SessionEnd::ClaimsReturned;
                    }
                }
            }
        };

        token.cancel();
        feeders.shutdown().await;
        while let Some(res) = claim_tasks.join_next().await {
            self.report_claim(res).await;
        }
        if let Err(e) = handler.cleanup(&session).await {
            self.report(GroupError::Cleanup(e)).await;
        }
        self.broker
            .release(&self.group_id, &self.member_id, &partitions);

        match end {
            SessionEnd::Rebalance => {
                info!(member_id = %self.member_id, generation, "session ended by rebalance")
            }
            SessionEnd::ClaimFailed => {
                warn!(member_id = %self.member_id, generation, "claim failed, rejoining from the committed offsets")
            }
            SessionEnd::Cancelled | SessionEnd::ClaimsReturned => {
                debug!(member_id = %self.member_id, generation, "session ended")
            }
        }
        Ok(())
    }

    fn take_errors(&self) -> Option<mpsc::Receiver<GroupError>> {
        self.errors_rx.lock().take()
    }

    fn pause_all(&self) {
        self.pause_calls.fetch_add(1, Ordering::SeqCst);
        self.paused.send_replace(true);
    }

    fn resume_all(&self) {
        self.resume_calls.fetch_add(1, Ordering::SeqCst);
        self.paused.send_replace(false);
    }

    async fn close(&self) -> Result<(), GroupError> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        if self.consuming.load(Ordering::SeqCst) {
            self.closed_while_consuming.store(true, Ordering::SeqCst);
        }
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(GroupError::Closed);
        }
        self.broker.leave(&self.group_id, &self.member_id);
        self.errors_tx.lock().take();
        Ok(())
    }
}

/// Copy messages of one partition into a claim, starting at `next`, until the token fires.
async fn feed(
    broker: MockBroker,
    topic: String,
    partition: i32,
    mut next: i64,
    claim: mpsc::Sender<Message>,
    mut paused: watch::Receiver<bool>,
    token: CancellationToken,
) {
    loop {
        if *paused.borrow_and_update() {
            tokio::select! {
                _ = token.cancelled() => return,
                res = paused.changed() => {
                    if res.is_err() {
                        return;
                    }
                }
            }
            continue;
        }

        let appended = broker.changed.notified();
        let batch = broker.read(&topic, partition, next, FETCH_BATCH);
        if batch.is_empty() {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = appended => {}
                res = paused.changed() => {
                    if res.is_err() {
                        return;
                    }
                }
            }
            continue;
        }

        for message in batch {
            if *paused.borrow() {
                break;
            }
            let offset = message.offset();
            tokio::select! {
                _ = token.cancelled() => return,
                res = claim.send(message) => {
                    if res.is_err() {
                        return;
                    }
                }
            }
            next = offset + 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use crate::retry::RetryPolicy;

    use super::*;

    fn nz(n: u32) -> NonZeroU32 {
        NonZeroU32::new(n).unwrap()
    }

    fn earliest() -> GroupOptions {
        GroupOptions {
            initial_offset: InitialOffset::Earliest,
            ..Default::default()
        }
    }

    /// Collects every delivered message and marks it.
    #[derive(Debug, Default)]
    struct Collect {
        seen: Mutex<Vec<Message>>,
    }

    #[async_trait]
    impl ClaimHandler for Collect {
        async fn consume_claim(&self, session: Session, mut claim: Claim) -> Result<(), HandlerError> {
            loop {
                tokio::select! {
                    biased;
                    _ = session.cancelled() => return Ok(()),
                    message = claim.next() => {
                        let Some(message) = message else { return Ok(()) };
                        session.mark_message(&message);
                        self.seen.lock().push(message);
                    }
                }
            }
        }
    }

    async fn wait_for(mut cond: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn idempotent_producer_suppresses_duplicates_from_lost_acks() {
        let broker = MockBroker::new();
        broker.create_topic("test", nz(1));
        broker.inject_fault(AppendFault::LoseAck);

        let producer = broker.producer("test", ProducerOptions::default());
        let delivery = producer.produce(Record::new("once")).await.unwrap();

        assert_eq!(delivery, Delivery { partition: 0, offset: 0 });
        assert_eq!(broker.messages("test", 0).len(), 1);
    }

    #[tokio::test]
    async fn non_idempotent_producer_duplicates_on_lost_acks() {
        let broker = MockBroker::new();
        broker.create_topic("test", nz(1));
        broker.inject_fault(AppendFault::LoseAck);

        let options = ProducerOptions {
            idempotent: false,
            ..Default::default()
        };
        let producer = broker.producer("test", options);
        producer.produce(Record::new("twice")).await.unwrap();

        assert_eq!(broker.messages("test", 0).len(), 2);
    }

    #[tokio::test]
    async fn fire_and_forget_ignores_failures() {
        let broker = MockBroker::new();
        broker.create_topic("test", nz(1));
        broker.inject_fault(AppendFault::Reject);

        let options = ProducerOptions {
            acks: AckMode::None,
            idempotent: false,
            retry: RetryPolicy::never(),
            ..Default::default()
        };
        let producer = broker.producer("test", options);
        let delivery = producer.produce(Record::new("lost")).await.unwrap();

        assert_eq!(delivery.offset, -1);
        assert!(broker.messages("test", 0).is_empty());
    }

    #[tokio::test]
    async fn keyed_records_stick_to_a_partition() {
        let broker = MockBroker::new();
        broker.create_topic("test", nz(4));
        let producer = broker.producer("test", ProducerOptions::default());

        let mut partitions = BTreeSet::new();
        for i in 0..10 {
            let record = Record::new(format!("edit {i}")).with_key("en.wikipedia.org");
            partitions.insert(producer.produce(record).await.unwrap().partition);
        }
        assert_eq!(partitions.len(), 1);
    }

    #[tokio::test]
    async fn partitioner_decides_for_unkeyed_records() {
        let broker = MockBroker::new();
        broker.create_topic("test", nz(4));

        let spread = broker.producer("test", ProducerOptions::default());
        let consistent = broker.producer(
            "test",
            ProducerOptions {
                partitioner: Partitioner::Consistent,
                ..Default::default()
            },
        );

        let mut spread_partitions = BTreeSet::new();
        let mut consistent_partitions = BTreeSet::new();
        for i in 0..8 {
            let record = Record::new(format!("edit {i}"));
            spread_partitions.insert(spread.produce(record.clone()).await.unwrap().partition);
            consistent_partitions.insert(consistent.produce(record).await.unwrap().partition);
        }
        assert_eq!(spread_partitions.len(), 4);
        assert_eq!(consistent_partitions.len(), 1);
    }

    #[tokio::test]
    async fn group_delivers_and_commits() {
        let broker = MockBroker::new();
        broker.create_topic("test", nz(2));
        for i in 0..3 {
            broker.append("test", 0, None, format!("p0-{i}"));
            broker.append("test", 1, None, format!("p1-{i}"));
        }

        let group = Arc::new(broker.consumer_group("g", earliest()));
        let handler = Arc::new(Collect::default());
        let cancel = CancellationToken::new();

        let task = tokio::spawn({
            let group = Arc::clone(&group);
            let handler = Arc::clone(&handler) as Arc<dyn ClaimHandler>;
            let cancel = cancel.clone();
            async move { group.consume(&["test".to_string()], handler, cancel).await }
        });

        wait_for(|| handler.seen.lock().len() == 6).await;
        cancel.cancel();
        task.await.unwrap().unwrap();

        assert_eq!(broker.committed("g", "test", 0), Some(3));
        assert_eq!(broker.committed("g", "test", 1), Some(3));
        group.close().await.unwrap();
        assert!(!group.closed_while_consuming());
        assert!(matches!(group.close().await, Err(GroupError::Closed)));
        assert_eq!(group.close_calls(), 2);
        assert!(broker.members("g").is_empty());
    }

    #[tokio::test]
    async fn latest_skips_existing_messages() {
        let broker = MockBroker::new();
        broker.create_topic("test", nz(1));
        broker.append("test", 0, None, "old");

        let group = Arc::new(broker.consumer_group("g", GroupOptions::default()));
        let handler = Arc::new(Collect::default());
        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let group = Arc::clone(&group);
            let handler = Arc::clone(&handler) as Arc<dyn ClaimHandler>;
            let cancel = cancel.clone();
            async move { group.consume(&["test".to_string()], handler, cancel).await }
        });

        wait_for(|| broker.generation("g") == 1).await;
        // the claim starts at the end of the log once the session exists
        tokio::time::sleep(Duration::from_millis(20)).await;
        broker.append("test", 0, None, "new");
        wait_for(|| handler.seen.lock().len() == 1).await;
        cancel.cancel();
        task.await.unwrap().unwrap();

        assert_eq!(handler.seen.lock()[0].value(), &Bytes::from("new"));
    }

    #[tokio::test]
    async fn second_member_triggers_rebalance_and_splits_partitions() {
        let broker = MockBroker::new();
        broker.create_topic("test", nz(4));
        let topics = vec!["test".to_string()];

        let first = Arc::new(broker.consumer_group("g", earliest()));
        let second = Arc::new(broker.consumer_group("g", earliest()));
        let cancel = CancellationToken::new();
        let handler: Arc<dyn ClaimHandler> = Arc::new(Collect::default());

        let first_task = tokio::spawn({
            let (group, handler, cancel, topics) =
                (Arc::clone(&first), Arc::clone(&handler), cancel.clone(), topics.clone());
            async move { group.consume(&topics, handler, cancel).await }
        });
        wait_for(|| broker.generation("g") == 1).await;

        let second_task = tokio::spawn({
            let (group, handler, cancel, topics) =
                (Arc::clone(&second), Arc::clone(&handler), cancel.clone(), topics.clone());
            async move { group.consume(&topics, handler, cancel).await }
        });

        // the first session ends because of the new generation
        tokio::time::timeout(Duration::from_secs(5), first_task)
            .await
            .expect("first session ends on rebalance")
            .unwrap()
            .unwrap();
        assert_eq!(broker.generation("g"), 2);
        assert_eq!(broker.members("g").len(), 2);

        let first_share = broker.assignment("g", first.member_id());
        let second_share = broker.assignment("g", second.member_id());
        assert_eq!(first_share.len(), 2);
        assert_eq!(second_share.len(), 2);
        assert!(first_share.iter().all(|p| !second_share.contains(p)));

        cancel.cancel();
        second_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn pause_survives_a_rebalance() {
        let broker = MockBroker::new();
        broker.create_topic("test", nz(1));
        broker.append("test", 0, None, "before");

        let group = Arc::new(broker.consumer_group("g", earliest()));
        let handler = Arc::new(Collect::default());
        let cancel = CancellationToken::new();
        // rejoin after every rebalance until cancelled
        let task = tokio::spawn({
            let group = Arc::clone(&group);
            let handler = Arc::clone(&handler);
            let cancel = cancel.clone();
            async move {
                while !cancel.is_cancelled() {
                    let handler = Arc::clone(&handler) as Arc<dyn ClaimHandler>;
                    group
                        .consume(&["test".to_string()], handler, cancel.clone())
                        .await?;
                }
                Ok::<_, GroupError>(())
            }
        });
        wait_for(|| handler.seen.lock().len() == 1).await;

        group.pause_all();
        broker.rebalance("g");
        wait_for(|| broker.generation("g") == 2).await;
        broker.append("test", 0, None, "while paused");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(handler.seen.lock().len(), 1);
        assert!(group.is_paused());

        group.resume_all();
        wait_for(|| handler.seen.lock().len() == 2).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        task.await.unwrap().unwrap();

        let values: Vec<_> = handler
            .seen
            .lock()
            .iter()
            .map(|m| m.value().clone())
            .collect();
        assert_eq!(
            values,
            vec![Bytes::from("before"), Bytes::from("while paused")]
        );
        assert_eq!(broker.committed("g", "test", 0), Some(2));
    }

    #[tokio::test]
    async fn consume_after_close_fails() {
        let broker = MockBroker::new();
        broker.create_topic("test", nz(1));
        let group = broker.consumer_group("g", GroupOptions::default());
        let errors = group.take_errors();
        assert!(errors.is_some());
        assert!(group.take_errors().is_none());

        group.close().await.unwrap();
        let res = group
            .consume(
                &["test".to_string()],
                Arc::new(Collect::default()),
                CancellationToken::new(),
            )
            .await;
        assert!(matches!(res, Err(GroupError::Closed)));

        // the error stream ends once the group is closed
        assert!(errors.unwrap().recv().await.is_none());
    }
}
