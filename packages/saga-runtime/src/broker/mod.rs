//! Broker client abstraction.
//!
//! The runtime never talks to a concrete log broker directly. It is written
//! against the traits in this module so a real client and the in-process
//! [`memory::InMemoryBroker`] are interchangeable.
//!
//! # Collaborators
//!
//! ```text
//! BrokerClient ──► consumer(group)  ──► BrokerConsumer  (subscribe → RecordStream)
//!              ├─► producer(client) ──► BrokerProducer  (send / send_batch / begin_transaction)
//!              └─► admin()          ──► TopicAdmin      (create_topic / delete_topic)
//! ```
//!
//! Every call to [`BrokerClient::producer`] opens a fresh producer session.
//! That is how publishers recover from [`BrokerError::StaleProducerSession`].

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use thiserror::Error;

use crate::action::Headers;

/// Stream of records delivered to a subscription.
pub type RecordStream = BoxStream<'static, InboundRecord>;

// =============================================================================
// Records
// =============================================================================

/// A record as delivered by a consumer subscription.
#[derive(Debug, Clone)]
pub struct InboundRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Bytes>,
    pub value: Bytes,
    pub headers: Headers,
    pub timestamp: DateTime<Utc>,
}

/// A record handed to a producer.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub key: Option<Bytes>,
    pub value: Bytes,
    pub headers: Headers,
}

/// Messages bound for one topic inside a batch send.
#[derive(Debug, Clone, PartialEq)]
pub struct TopicMessages {
    pub topic: String,
    pub messages: Vec<OutboundMessage>,
}

/// Acknowledgment level requested for a send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Acks {
    /// Fire and forget.
    None,
    /// Partition leader only.
    Leader,
    /// Every in-sync replica.
    #[default]
    All,
}

/// Compression codec requested for a send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    #[default]
    None,
    Gzip,
    Snappy,
    Lz4,
    Zstd,
}

/// Per-send options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SendOptions {
    pub acks: Acks,
    pub compression: Compression,
}

// =============================================================================
// Errors
// =============================================================================

/// Errors reported by broker collaborators.
///
/// `Clone` so that one failed batch can reject every queued record with the
/// same cause.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    /// The topic (or one of its partitions) does not exist.
    #[error("unknown topic or partition: {topic}")]
    UnknownTopicOrPartition { topic: String },

    /// The producer session was fenced or expired and must be recreated.
    #[error("stale producer session: {reason}")]
    StaleProducerSession { reason: String },

    /// The topic already exists.
    #[error("topic already exists: {topic}")]
    TopicAlreadyExists { topic: String },

    /// The client is not connected.
    #[error("broker client is not connected")]
    NotConnected,

    /// Any other broker-side failure.
    #[error("broker request failed: {0}")]
    Request(String),
}

impl BrokerError {
    /// Returns true for conditions the runtime knows how to recover from.
    pub fn is_retriable(&self) -> bool {
        self.is_unknown_topic() || self.is_stale_session()
    }

    pub fn is_unknown_topic(&self) -> bool {
        matches!(self, BrokerError::UnknownTopicOrPartition { .. })
    }

    pub fn is_stale_session(&self) -> bool {
        matches!(self, BrokerError::StaleProducerSession { .. })
    }
}

// =============================================================================
// Collaborator Traits
// =============================================================================

/// Consumer side of the broker.
#[async_trait]
pub trait BrokerConsumer: Send + Sync {
    async fn connect(&self) -> Result<(), BrokerError>;

    async fn disconnect(&self) -> Result<(), BrokerError>;

    /// Open a subscription. The stream yields records produced after this
    /// call returns.
    async fn subscribe(&self, topic: &str) -> Result<RecordStream, BrokerError>;
}

/// One producer session.
#[async_trait]
pub trait BrokerProducer: Send + Sync {
    async fn connect(&self) -> Result<(), BrokerError>;

    async fn disconnect(&self) -> Result<(), BrokerError>;

    async fn send(
        &self,
        topic: &str,
        messages: Vec<OutboundMessage>,
        options: SendOptions,
    ) -> Result<(), BrokerError>;

    /// Send messages for several topics as one request. All or nothing.
    async fn send_batch(
        &self,
        batches: Vec<TopicMessages>,
        options: SendOptions,
    ) -> Result<(), BrokerError>;

    async fn begin_transaction(&self) -> Result<Box<dyn ProducerTransaction>, BrokerError>;
}

/// An open producer transaction. Consumed by `commit` or `abort`.
#[async_trait]
pub trait ProducerTransaction: Send {
    async fn send(
        &mut self,
        topic: &str,
        messages: Vec<OutboundMessage>,
        options: SendOptions,
    ) -> Result<(), BrokerError>;

    async fn commit(self: Box<Self>) -> Result<(), BrokerError>;

    async fn abort(self: Box<Self>) -> Result<(), BrokerError>;
}

/// Topic administration.
#[async_trait]
pub trait TopicAdmin: Send + Sync {
    async fn create_topic(&self, topic: &str, partitions: i32) -> Result<(), BrokerError>;

    async fn delete_topic(&self, topic: &str) -> Result<(), BrokerError>;
}

/// Factory for consumers, producer sessions and the admin client.
pub trait BrokerClient: Send + Sync {
    fn consumer(&self, group_id: &str) -> Arc<dyn BrokerConsumer>;

    /// Open a new producer session. Each call returns a distinct session.
    fn producer(&self, client_id: &str) -> Arc<dyn BrokerProducer>;

    fn admin(&self) -> Arc<dyn TopicAdmin>;
}

/// Create a topic, treating "already exists" as success.
pub(crate) async fn ensure_topic(
    admin: &dyn TopicAdmin,
    topic: &str,
    partitions: i32,
) -> Result<(), BrokerError> {
    match admin.create_topic(topic, partitions).await {
        Ok(()) | Err(BrokerError::TopicAlreadyExists { .. }) => Ok(()),
        Err(e) => Err(e),
    }
}
