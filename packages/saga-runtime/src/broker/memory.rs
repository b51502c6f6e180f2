//! In-process log broker.
//!
//! Implements every broker collaborator trait against shared in-memory state so
//! the runtime can be exercised end to end without a cluster. Used by the tests
//! and by the `saga-demo` binary.
//!
//! Semantics follow a partitioned log closely enough for the runtime's needs:
//!
//! - subscriptions only see records appended after they were opened
//! - records are partitioned by key hash and carry per-partition offsets
//! - batch sends and transaction commits are all-or-nothing
//!
//! Fault injection hooks let tests drive the runtime's recovery paths:
//! [`InMemoryBroker::fail_next_sends`], [`InMemoryBroker::expire_producer_sessions`]
//! and [`InMemoryBroker::set_auto_create_topics`].

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::{
    BrokerClient, BrokerConsumer, BrokerError, BrokerProducer, InboundRecord, OutboundMessage,
    ProducerTransaction, RecordStream, SendOptions, TopicAdmin, TopicMessages,
};

/// In-process broker shared by every client handle cloned from it.
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
}

struct BrokerState {
    topics: Mutex<HashMap<String, TopicLog>>,
    auto_create_topics: AtomicBool,
    default_partitions: i32,
    injected_failures: Mutex<VecDeque<BrokerError>>,
    sessions_opened: AtomicUsize,
    /// Sessions numbered below this are fenced.
    session_floor: AtomicUsize,
    send_requests: AtomicUsize,
    aborted_transactions: AtomicUsize,
}

struct TopicLog {
    next_offsets: Vec<i64>,
    records: Vec<InboundRecord>,
    subscribers: Vec<mpsc::UnboundedSender<InboundRecord>>,
}

impl TopicLog {
    fn new(partitions: i32) -> Self {
        Self {
            next_offsets: vec![0; partitions.max(1) as usize],
            records: Vec::new(),
            subscribers: Vec::new(),
        }
    }

    fn append(&mut self, topic: &str, message: OutboundMessage) -> InboundRecord {
        let partition = partition_for(message.key.as_ref(), self.next_offsets.len());
        let offset = self.next_offsets[partition];
        self.next_offsets[partition] += 1;

        let record = InboundRecord {
            topic: topic.to_string(),
            partition: partition as i32,
            offset,
            key: message.key,
            value: message.value,
            headers: message.headers,
            timestamp: Utc::now(),
        };

        self.records.push(record.clone());
        self.subscribers
            .retain(|subscriber| subscriber.send(record.clone()).is_ok());
        record
    }
}

fn partition_for(key: Option<&Bytes>, partitions: usize) -> usize {
    match key {
        Some(key) => {
            let mut hasher = DefaultHasher::new();
            key.hash(&mut hasher);
            (hasher.finish() % partitions as u64) as usize
        }
        None => 0,
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    /// Create a broker with topic auto-creation enabled and one partition per
    /// auto-created topic.
    pub fn new() -> Self {
        Self::with_partitions(1)
    }

    pub fn with_partitions(default_partitions: i32) -> Self {
        Self {
            state: Arc::new(BrokerState {
                topics: Mutex::new(HashMap::new()),
                auto_create_topics: AtomicBool::new(true),
                default_partitions: default_partitions.max(1),
                injected_failures: Mutex::new(VecDeque::new()),
                sessions_opened: AtomicUsize::new(0),
                session_floor: AtomicUsize::new(0),
                send_requests: AtomicUsize::new(0),
                aborted_transactions: AtomicUsize::new(0),
            }),
        }
    }

    /// When disabled, sends and subscriptions to missing topics fail with
    /// [`BrokerError::UnknownTopicOrPartition`].
    pub fn set_auto_create_topics(&self, enabled: bool) {
        self.state
            .auto_create_topics
            .store(enabled, Ordering::SeqCst);
    }

    /// Fail the next `times` send requests (including transactional sends and
    /// batch sends) with `error`.
    pub fn fail_next_sends(&self, error: BrokerError, times: usize) {
        let mut failures = self
            .state
            .injected_failures
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        failures.extend(std::iter::repeat(error).take(times));
    }

    /// Fence every producer session opened so far.
    pub fn expire_producer_sessions(&self) {
        let opened = self.state.sessions_opened.load(Ordering::SeqCst);
        self.state.session_floor.store(opened, Ordering::SeqCst);
        debug!(fenced_sessions = opened, "expired producer sessions");
    }

    /// Number of producer sessions ever opened.
    pub fn producer_sessions(&self) -> usize {
        self.state.sessions_opened.load(Ordering::SeqCst)
    }

    /// Number of send requests that reached the broker, failed or not.
    pub fn send_requests(&self) -> usize {
        self.state.send_requests.load(Ordering::SeqCst)
    }

    pub fn aborted_transactions(&self) -> usize {
        self.state.aborted_transactions.load(Ordering::SeqCst)
    }

    pub fn topic_exists(&self, topic: &str) -> bool {
        self.topics().contains_key(topic)
    }

    /// Every record appended to `topic`, in append order.
    pub fn records(&self, topic: &str) -> Vec<InboundRecord> {
        self.topics()
            .get(topic)
            .map(|log| log.records.clone())
            .unwrap_or_default()
    }

    /// Number of live subscriptions on `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics()
            .get(topic)
            .map(|log| {
                log.subscribers
                    .iter()
                    .filter(|subscriber| !subscriber.is_closed())
                    .count()
            })
            .unwrap_or(0)
    }

    /// Append one message directly, bypassing producer sessions and fault
    /// injection. Creates the topic if needed.
    pub fn append(&self, topic: &str, message: OutboundMessage) -> InboundRecord {
        let mut topics = self.topics();
        topics
            .entry(topic.to_string())
            .or_insert_with(|| TopicLog::new(self.state.default_partitions))
            .append(topic, message)
    }

    fn topics(&self) -> std::sync::MutexGuard<'_, HashMap<String, TopicLog>> {
        self.state.topics.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn auto_create(&self) -> bool {
        self.state.auto_create_topics.load(Ordering::SeqCst)
    }

    fn take_injected_failure(&self) -> Result<(), BrokerError> {
        self.state.send_requests.fetch_add(1, Ordering::SeqCst);
        let mut failures = self
            .state
            .injected_failures
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        match failures.pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn append_batches(&self, batches: Vec<TopicMessages>) -> Result<(), BrokerError> {
        let mut topics = self.topics();

        for batch in &batches {
            if !topics.contains_key(&batch.topic) {
                if !self.auto_create() {
                    return Err(BrokerError::UnknownTopicOrPartition {
                        topic: batch.topic.clone(),
                    });
                }
                topics.insert(
                    batch.topic.clone(),
                    TopicLog::new(self.state.default_partitions),
                );
            }
        }

        for batch in batches {
            if let Some(log) = topics.get_mut(&batch.topic) {
                for message in batch.messages {
                    let record = log.append(&batch.topic, message);
                    trace!(
                        topic = %record.topic,
                        partition = record.partition,
                        offset = record.offset,
                        "record appended"
                    );
                }
            }
        }
        Ok(())
    }

    fn open_session(&self) -> usize {
        self.state.sessions_opened.fetch_add(1, Ordering::SeqCst)
    }

    fn check_session(&self, session: usize) -> Result<(), BrokerError> {
        if session < self.state.session_floor.load(Ordering::SeqCst) {
            return Err(BrokerError::StaleProducerSession {
                reason: format!("producer session {session} has been fenced"),
            });
        }
        Ok(())
    }
}

impl BrokerClient for InMemoryBroker {
    fn consumer(&self, group_id: &str) -> Arc<dyn BrokerConsumer> {
        trace!(group_id, "opening in-memory consumer");
        Arc::new(MemoryConsumer {
            broker: self.clone(),
        })
    }

    fn producer(&self, client_id: &str) -> Arc<dyn BrokerProducer> {
        let session = self.open_session();
        trace!(client_id, session, "opening in-memory producer session");
        Arc::new(MemoryProducer {
            broker: self.clone(),
            session,
        })
    }

    fn admin(&self) -> Arc<dyn TopicAdmin> {
        Arc::new(MemoryAdmin {
            broker: self.clone(),
        })
    }
}

// =============================================================================
// Consumer
// =============================================================================

struct MemoryConsumer {
    broker: InMemoryBroker,
}

#[async_trait]
impl BrokerConsumer for MemoryConsumer {
    async fn connect(&self) -> Result<(), BrokerError> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BrokerError> {
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<RecordStream, BrokerError> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut topics = self.broker.topics();
            let log = match topics.get_mut(topic) {
                Some(log) => log,
                None if self.broker.auto_create() => topics
                    .entry(topic.to_string())
                    .or_insert_with(|| TopicLog::new(self.broker.state.default_partitions)),
                None => {
                    return Err(BrokerError::UnknownTopicOrPartition {
                        topic: topic.to_string(),
                    })
                }
            };
            log.subscribers.push(tx);
        }

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|record| (record, rx))
        });
        Ok(stream.boxed())
    }
}

// =============================================================================
// Producer
// =============================================================================

struct MemoryProducer {
    broker: InMemoryBroker,
    session: usize,
}

#[async_trait]
impl BrokerProducer for MemoryProducer {
    async fn connect(&self) -> Result<(), BrokerError> {
        self.broker.check_session(self.session)
    }

    async fn disconnect(&self) -> Result<(), BrokerError> {
        Ok(())
    }

    async fn send(
        &self,
        topic: &str,
        messages: Vec<OutboundMessage>,
        options: SendOptions,
    ) -> Result<(), BrokerError> {
        self.send_batch(
            vec![TopicMessages {
                topic: topic.to_string(),
                messages,
            }],
            options,
        )
        .await
    }

    async fn send_batch(
        &self,
        batches: Vec<TopicMessages>,
        _options: SendOptions,
    ) -> Result<(), BrokerError> {
        self.broker.check_session(self.session)?;
        self.broker.take_injected_failure()?;
        self.broker.append_batches(batches)
    }

    async fn begin_transaction(&self) -> Result<Box<dyn ProducerTransaction>, BrokerError> {
        self.broker.check_session(self.session)?;
        Ok(Box::new(MemoryTransaction {
            broker: self.broker.clone(),
            session: self.session,
            staged: Vec::new(),
        }))
    }
}

struct MemoryTransaction {
    broker: InMemoryBroker,
    session: usize,
    staged: Vec<TopicMessages>,
}

#[async_trait]
impl ProducerTransaction for MemoryTransaction {
    async fn send(
        &mut self,
        topic: &str,
        messages: Vec<OutboundMessage>,
        _options: SendOptions,
    ) -> Result<(), BrokerError> {
        self.broker.check_session(self.session)?;
        self.broker.take_injected_failure()?;
        self.staged.push(TopicMessages {
            topic: topic.to_string(),
            messages,
        });
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), BrokerError> {
        let MemoryTransaction {
            broker,
            session,
            staged,
        } = *self;
        broker.check_session(session)?;
        broker.append_batches(staged)
    }

    async fn abort(self: Box<Self>) -> Result<(), BrokerError> {
        self.broker
            .state
            .aborted_transactions
            .fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// =============================================================================
// Admin
// =============================================================================

struct MemoryAdmin {
    broker: InMemoryBroker,
}

#[async_trait]
impl TopicAdmin for MemoryAdmin {
    async fn create_topic(&self, topic: &str, partitions: i32) -> Result<(), BrokerError> {
        let mut topics = self.broker.topics();
        if topics.contains_key(topic) {
            return Err(BrokerError::TopicAlreadyExists {
                topic: topic.to_string(),
            });
        }
        topics.insert(topic.to_string(), TopicLog::new(partitions));
        debug!(topic, partitions, "topic created");
        Ok(())
    }

    async fn delete_topic(&self, topic: &str) -> Result<(), BrokerError> {
        match self.broker.topics().remove(topic) {
            Some(_) => Ok(()),
            None => Err(BrokerError::UnknownTopicOrPartition {
                topic: topic.to_string(),
            }),
        }
    }
}
