//! Publishers deliver outbound actions to the broker.
//!
//! [`ActionPublisher`] is the seam the runtime publishes through. Two
//! implementations ship with the crate:
//!
//! - [`ProducerBus`]: sends each action right away, either as a plain send
//!   with recovery of retriable errors, or wrapped in a broker transaction
//!   with no retry at all
//! - [`ThrottledPublisher`]: queues actions and flushes them in batches on a
//!   timer
//!
//! # Recovery (direct sends)
//!
//! | Failure | Recovery |
//! |---------|----------|
//! | unknown topic | create topic, retry once |
//! | stale producer session | new session, retry up to `max_send_retries` |
//! | anything else | surfaced |

mod throttled;

pub use throttled::{ThrottleConfig, ThrottledPublisher};

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::action::Action;
use crate::broker::{ensure_topic, BrokerClient, BrokerError, BrokerProducer, SendOptions};
use crate::config::{DeliveryMode, RuntimeConfig};

/// Why an action could not be published.
///
/// `Clone` so one failed batch can reject every record queued in it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// The publisher was disconnected before the action was flushed.
    #[error("publisher is disconnected")]
    Disconnected,
}

/// Publishing seam used by the runtime and the compensator.
#[async_trait]
pub trait ActionPublisher: Send + Sync {
    async fn connect(&self) -> Result<(), PublishError>;

    /// Publish one action. Resolves once the broker has accepted it.
    async fn put_action(&self, action: Action) -> Result<(), PublishError>;

    async fn disconnect(&self) -> Result<(), PublishError>;
}

// =============================================================================
// Shared producer slot
// =============================================================================

/// The current producer session, replaceable when the broker fences it.
pub(crate) struct ProducerSlot {
    client: Arc<dyn BrokerClient>,
    client_id: String,
    producer: RwLock<Arc<dyn BrokerProducer>>,
}

impl ProducerSlot {
    pub(crate) fn new(client: Arc<dyn BrokerClient>, client_id: impl Into<String>) -> Self {
        let client_id = client_id.into();
        let producer = client.producer(&client_id);
        Self {
            client,
            client_id,
            producer: RwLock::new(producer),
        }
    }

    pub(crate) fn current(&self) -> Arc<dyn BrokerProducer> {
        Arc::clone(&self.producer.read().unwrap_or_else(|e| e.into_inner()))
    }

    /// Open and connect a fresh session, then swap it in.
    pub(crate) async fn recreate(&self) -> Result<(), BrokerError> {
        let fresh = self.client.producer(&self.client_id);
        fresh.connect().await?;
        let stale = {
            let mut slot = self.producer.write().unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut *slot, fresh)
        };
        if let Err(e) = stale.disconnect().await {
            debug!(error = %e, "stale producer did not disconnect cleanly");
        }
        debug!(client_id = %self.client_id, "producer session recreated");
        Ok(())
    }

    pub(crate) fn client(&self) -> &dyn BrokerClient {
        self.client.as_ref()
    }
}

// =============================================================================
// ProducerBus
// =============================================================================

/// Immediate publisher: one broker request per action.
pub struct ProducerBus {
    slot: ProducerSlot,
    transactional: bool,
    options: SendOptions,
    max_send_retries: u32,
    topic_partitions: i32,
}

impl ProducerBus {
    /// Build from runtime config. `DeliveryMode::Transactional` selects
    /// transactional sends; any other mode sends directly.
    pub fn new(client: Arc<dyn BrokerClient>, config: &RuntimeConfig) -> Self {
        Self {
            slot: ProducerSlot::new(client, config.client_id.clone()),
            transactional: config.delivery_mode == DeliveryMode::Transactional,
            options: config.send_options(),
            max_send_retries: config.max_send_retries,
            topic_partitions: config.topic_partitions,
        }
    }

    pub fn is_transactional(&self) -> bool {
        self.transactional
    }

    /// Send one action outside a transaction, recovering retriable failures.
    pub async fn send_action(&self, action: &Action) -> Result<(), PublishError> {
        let message = action.to_outbound();
        let mut created_topic = false;
        let mut attempts = 0u32;

        loop {
            let producer = self.slot.current();
            match producer
                .send(action.topic(), vec![message.clone()], self.options)
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) if e.is_unknown_topic() && !created_topic => {
                    warn!(topic = action.topic(), "topic missing, creating it before resending");
                    created_topic = true;
                    let admin = self.slot.client().admin();
                    ensure_topic(admin.as_ref(), action.topic(), self.topic_partitions).await?;
                }
                Err(e) if e.is_stale_session() && attempts < self.max_send_retries => {
                    attempts += 1;
                    warn!(
                        topic = action.topic(),
                        attempt = attempts,
                        max_attempts = self.max_send_retries,
                        "stale producer session, recreating"
                    );
                    self.slot.recreate().await?;
                }
                Err(e) => {
                    error!(
                        topic = action.topic(),
                        transaction_id = %action.transaction_id(),
                        error = %e,
                        "send failed"
                    );
                    return Err(e.into());
                }
            }
        }
    }

    /// Send one action inside a broker transaction. Aborts and surfaces on
    /// any failure; never retries.
    pub async fn send_transactional(&self, action: &Action) -> Result<(), PublishError> {
        let producer = self.slot.current();
        let mut transaction = producer.begin_transaction().await?;

        if let Err(e) = transaction
            .send(action.topic(), vec![action.to_outbound()], self.options)
            .await
        {
            warn!(
                topic = action.topic(),
                transaction_id = %action.transaction_id(),
                error = %e,
                "transactional send failed, aborting"
            );
            if let Err(abort_err) = transaction.abort().await {
                error!(error = %abort_err, "abort failed");
            }
            return Err(e.into());
        }

        transaction.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl ActionPublisher for ProducerBus {
    async fn connect(&self) -> Result<(), PublishError> {
        self.slot.current().connect().await?;
        Ok(())
    }

    async fn put_action(&self, action: Action) -> Result<(), PublishError> {
        if self.transactional {
            self.send_transactional(&action).await
        } else {
            self.send_action(&action).await
        }
    }

    async fn disconnect(&self) -> Result<(), PublishError> {
        self.slot.current().disconnect().await?;
        Ok(())
    }
}
