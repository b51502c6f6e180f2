//! Message router: consumer-side bus routing inbound actions to transactions.
//!
//! The router owns two tables:
//!
//! - the **observer registry**: transaction id → topic → ordered observers
//! - the **subscription table**: topic → delivery loop task
//!
//! A transaction must be started before anything under its id reaches an
//! observer. Records for unknown transactions are dropped silently.
//!
//! # Example
//!
//! ```ignore
//! let router = MessageRouter::new(client.consumer("sagas"), client.admin(), 1);
//!
//! router.start_transaction(&tx)?;
//! router.register_topic_observer(&tx, "payments.settled", ActionObserver::new(|action| {
//!     tracing::info!(payload = %action.payload(), "settled");
//! }))?;
//! router.stream_actions_from_topic("payments.settled").await?;
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::action::{Action, TransactionId};
use crate::broker::{ensure_topic, BrokerConsumer, BrokerError, RecordStream, TopicAdmin};
use crate::buffer::SharedBuffer;
use crate::error::SagaError;

// =============================================================================
// Observers
// =============================================================================

/// Callback invoked for every action routed to a (transaction, topic) pair.
#[derive(Clone)]
pub struct ActionObserver(Arc<dyn Fn(Action) + Send + Sync>);

impl ActionObserver {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(Action) + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// Observer that forwards every action into `buffer`.
    pub fn into_buffer(buffer: SharedBuffer) -> Self {
        Self::new(move |action| buffer.put(action))
    }

    /// Observer that forwards only actions matching `predicate` into `buffer`.
    pub fn into_buffer_filtered<P>(buffer: SharedBuffer, predicate: P) -> Self
    where
        P: Fn(&Action) -> bool + Send + Sync + 'static,
    {
        Self::new(move |action| {
            if predicate(&action) {
                buffer.put(action);
            }
        })
    }

    pub fn notify(&self, action: Action) {
        (self.0)(action)
    }

    /// True when both handles are clones of the same observer.
    pub fn same_as(&self, other: &ActionObserver) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for ActionObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ActionObserver")
    }
}

type ObserverRegistry = HashMap<TransactionId, HashMap<String, Vec<ActionObserver>>>;

// =============================================================================
// Router
// =============================================================================

/// Consumer bus routing inbound actions to per-transaction observers.
pub struct MessageRouter {
    consumer: Arc<dyn BrokerConsumer>,
    admin: Arc<dyn TopicAdmin>,
    topic_partitions: i32,
    registry: Arc<Mutex<ObserverRegistry>>,
    streams: tokio::sync::Mutex<HashMap<String, JoinHandle<()>>>,
}

impl MessageRouter {
    pub fn new(
        consumer: Arc<dyn BrokerConsumer>,
        admin: Arc<dyn TopicAdmin>,
        topic_partitions: i32,
    ) -> Self {
        Self {
            consumer,
            admin,
            topic_partitions,
            registry: Arc::new(Mutex::new(HashMap::new())),
            streams: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub async fn connect(&self) -> Result<(), SagaError> {
        self.consumer.connect().await?;
        Ok(())
    }

    /// Stop every delivery loop, clear both tables and disconnect the consumer.
    pub async fn disconnect(&self) -> Result<(), SagaError> {
        let handles: Vec<(String, JoinHandle<()>)> = self.streams.lock().await.drain().collect();
        for (topic, handle) in handles {
            handle.abort();
            debug!(topic = %topic, "delivery loop stopped");
        }
        self.registry().clear();
        self.consumer.disconnect().await?;
        info!("message router disconnected");
        Ok(())
    }

    /// Mark a transaction active.
    ///
    /// # Errors
    ///
    /// Returns [`SagaError::DuplicateTransaction`] if it is already active.
    pub fn start_transaction(&self, transaction_id: &TransactionId) -> Result<(), SagaError> {
        let mut registry = self.registry();
        if registry.contains_key(transaction_id) {
            return Err(SagaError::DuplicateTransaction {
                transaction_id: transaction_id.clone(),
            });
        }
        registry.insert(transaction_id.clone(), HashMap::new());
        debug!(transaction_id = %transaction_id, "transaction started");
        Ok(())
    }

    /// Deregister a transaction and drop its observers. No-op if unknown.
    pub fn stop_transaction(&self, transaction_id: &TransactionId) {
        if self.registry().remove(transaction_id).is_some() {
            debug!(transaction_id = %transaction_id, "transaction stopped");
        }
    }

    pub fn is_transaction_active(&self, transaction_id: &TransactionId) -> bool {
        self.registry().contains_key(transaction_id)
    }

    /// Append an observer for (transaction, topic). Observers fire in
    /// registration order.
    ///
    /// # Errors
    ///
    /// Returns [`SagaError::TransactionNotActive`] if the transaction was never
    /// started (or was already stopped).
    pub fn register_topic_observer(
        &self,
        transaction_id: &TransactionId,
        topic: &str,
        observer: ActionObserver,
    ) -> Result<(), SagaError> {
        let mut registry = self.registry();
        let topics =
            registry
                .get_mut(transaction_id)
                .ok_or_else(|| SagaError::TransactionNotActive {
                    transaction_id: transaction_id.clone(),
                })?;
        topics.entry(topic.to_string()).or_default().push(observer);
        trace!(transaction_id = %transaction_id, topic, "observer registered");
        Ok(())
    }

    /// Remove one registration of `observer` for (transaction, topic).
    /// No-op if the transaction is gone or the observer was never added.
    pub fn remove_topic_observer(
        &self,
        transaction_id: &TransactionId,
        topic: &str,
        observer: &ActionObserver,
    ) {
        let mut registry = self.registry();
        let Some(topics) = registry.get_mut(transaction_id) else {
            return;
        };
        if let Some(observers) = topics.get_mut(topic) {
            if let Some(position) = observers.iter().position(|o| o.same_as(observer)) {
                observers.remove(position);
                trace!(transaction_id = %transaction_id, topic, "observer removed");
            }
            if observers.is_empty() {
                topics.remove(topic);
            }
        }
    }

    /// Number of observers registered for (transaction, topic).
    pub fn observer_count(&self, transaction_id: &TransactionId, topic: &str) -> usize {
        self.registry()
            .get(transaction_id)
            .and_then(|topics| topics.get(topic))
            .map_or(0, Vec::len)
    }

    /// Ensure `topic` has a running delivery loop. Idempotent.
    ///
    /// A missing topic is created through the admin client and the subscribe
    /// retried once.
    pub async fn stream_actions_from_topic(&self, topic: &str) -> Result<(), SagaError> {
        let mut streams = self.streams.lock().await;
        if streams.contains_key(topic) {
            return Ok(());
        }

        let stream = self.subscribe_creating_topic(topic).await?;
        let handle = tokio::spawn(deliver(
            topic.to_string(),
            stream,
            Arc::clone(&self.registry),
        ));
        streams.insert(topic.to_string(), handle);
        info!(topic, "streaming actions from topic");
        Ok(())
    }

    /// Topics with a running delivery loop.
    pub async fn streaming_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.streams.lock().await.keys().cloned().collect();
        topics.sort();
        topics
    }

    async fn subscribe_creating_topic(&self, topic: &str) -> Result<RecordStream, BrokerError> {
        match self.consumer.subscribe(topic).await {
            Err(e) if e.is_unknown_topic() => {
                warn!(topic, "topic missing, creating it before subscribing");
                ensure_topic(self.admin.as_ref(), topic, self.topic_partitions).await?;
                self.consumer.subscribe(topic).await
            }
            result => result,
        }
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, ObserverRegistry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for MessageRouter {
    fn drop(&mut self) {
        for handle in self.streams.get_mut().values() {
            handle.abort();
        }
    }
}

async fn deliver(topic: String, mut stream: RecordStream, registry: Arc<Mutex<ObserverRegistry>>) {
    while let Some(record) = stream.next().await {
        match Action::from_record(&record) {
            Ok(action) => route(&registry, action),
            Err(err) => error!(
                topic = %topic,
                partition = record.partition,
                offset = record.offset,
                error = %err,
                "skipping malformed record"
            ),
        }
    }
    debug!(topic = %topic, "subscription stream ended");
}

fn route(registry: &Mutex<ObserverRegistry>, action: Action) {
    let observers = {
        let registry = registry.lock().unwrap_or_else(|e| e.into_inner());
        registry
            .get(action.transaction_id())
            .and_then(|topics| topics.get(action.topic()))
            .cloned()
    };

    let Some(observers) = observers else {
        trace!(
            transaction_id = %action.transaction_id(),
            topic = action.topic(),
            "no observers, action dropped"
        );
        return;
    };

    for observer in &observers {
        observer.notify(action.clone());
    }
}
