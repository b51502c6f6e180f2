//! Batched, timer-flushed publisher.
//!
//! `put_action` enqueues a record and resolves only once that record has been
//! flushed to the broker. A background timer drains up to `max_batch_size`
//! records per tick and sends them as one `send_batch` request.
//!
//! # Flush outcomes
//!
//! - **Success**: every record in the batch resolves, `sent_count` grows by the
//!   batch size
//! - **Stale producer session**: the session is recreated and the *same* batch
//!   is retried after `min(step * attempt, cap)`; the batch's futures stay
//!   pending until the retry settles
//! - **Anything else**: every record in the batch is rejected with the error
//!
//! At most one flush runs at a time. A flush that finds another in progress
//! returns immediately without touching the queue.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};

use super::{ActionPublisher, ProducerSlot, PublishError};
use crate::action::Action;
use crate::broker::{BrokerClient, OutboundMessage, SendOptions, TopicMessages};
use crate::config::RuntimeConfig;

/// Shortest period the flush timer runs at. Zero is raised to this.
pub const MIN_FLUSH_INTERVAL: Duration = Duration::from_millis(1);

/// Batching and retry knobs.
#[derive(Debug, Clone)]
pub struct ThrottleConfig {
    pub flush_interval: Duration,
    pub max_batch_size: usize,
    pub retry_backoff_step: Duration,
    pub max_retry_backoff: Duration,
    pub send_options: SendOptions,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        ThrottleConfig::from(&RuntimeConfig::default())
    }
}

impl From<&RuntimeConfig> for ThrottleConfig {
    fn from(config: &RuntimeConfig) -> Self {
        Self {
            flush_interval: config.flush_interval.max(MIN_FLUSH_INTERVAL),
            max_batch_size: config.max_batch_size.max(1),
            retry_backoff_step: config.retry_backoff_step,
            max_retry_backoff: config.max_retry_backoff,
            send_options: config.send_options(),
        }
    }
}

impl ThrottleConfig {
    /// Delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.retry_backoff_step
            .saturating_mul(attempt)
            .min(self.max_retry_backoff)
    }
}

/// A record waiting for a flush.
struct QueuedRecord {
    resolve: oneshot::Sender<Result<(), PublishError>>,
    topic: String,
    message: OutboundMessage,
}

/// Publisher that batches actions and flushes them on a timer.
#[derive(Clone)]
pub struct ThrottledPublisher {
    inner: Arc<ThrottleInner>,
}

struct ThrottleInner {
    slot: ProducerSlot,
    config: ThrottleConfig,
    queue: Mutex<VecDeque<QueuedRecord>>,
    flushing: AtomicBool,
    closed: AtomicBool,
    sent: AtomicU64,
    timer: Mutex<Option<JoinHandle<()>>>,
}

/// Releases the flush guard on drop, including when a flush is cancelled.
struct FlushGuard<'a>(&'a AtomicBool);

impl<'a> FlushGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FlushGuard(flag))
    }
}

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl ThrottledPublisher {
    pub fn new(
        client: Arc<dyn BrokerClient>,
        client_id: impl Into<String>,
        config: ThrottleConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ThrottleInner {
                slot: ProducerSlot::new(client, client_id),
                config,
                queue: Mutex::new(VecDeque::new()),
                flushing: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                sent: AtomicU64::new(0),
                timer: Mutex::new(None),
            }),
        }
    }

    /// Start the flush timer. Calling it again while running is a no-op.
    ///
    /// The first flush fires one `flush_interval` after this call.
    pub fn start(&self) {
        let mut timer = self.inner.timer.lock().unwrap_or_else(|e| e.into_inner());
        if timer.is_some() {
            return;
        }
        self.inner.closed.store(false, Ordering::SeqCst);

        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.config.flush_interval.max(MIN_FLUSH_INTERVAL);
        *timer = Some(tokio::spawn(run_timer(weak, period)));
        debug!(interval_ms = period.as_millis() as u64, "flush timer started");
    }

    /// Records queued and not yet flushed.
    pub fn pending_count(&self) -> usize {
        self.inner.queue().len()
    }

    /// Total records successfully flushed. Never decreases.
    pub fn sent_count(&self) -> u64 {
        self.inner.sent.load(Ordering::SeqCst)
    }

    /// Flush one batch now. Returns the number of records sent, or 0 if the
    /// queue was empty, the batch was rejected, or another flush is running.
    pub async fn flush(&self) -> usize {
        self.inner.flush().await
    }
}

async fn run_timer(inner: Weak<ThrottleInner>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        tokio::spawn(async move {
            inner.flush().await;
        });
    }
}

impl ThrottleInner {
    fn queue(&self) -> std::sync::MutexGuard<'_, VecDeque<QueuedRecord>> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn flush(&self) -> usize {
        let Some(_guard) = FlushGuard::acquire(&self.flushing) else {
            trace!("flush already in progress, skipping");
            return 0;
        };

        let batch: Vec<QueuedRecord> = {
            let mut queue = self.queue();
            let size = queue.len().min(self.config.max_batch_size);
            queue.drain(..size).collect()
        };
        if batch.is_empty() {
            return 0;
        }

        let request = group_by_topic(&batch);
        let mut attempt = 0u32;

        loop {
            let producer = self.slot.current();
            match producer
                .send_batch(request.clone(), self.config.send_options)
                .await
            {
                Ok(()) => {
                    let size = batch.len();
                    self.sent.fetch_add(size as u64, Ordering::SeqCst);
                    for record in batch {
                        let _ = record.resolve.send(Ok(()));
                    }
                    debug!(batch_size = size, "batch flushed");
                    return size;
                }
                Err(e) if e.is_stale_session() => {
                    attempt += 1;
                    let delay = self.config.backoff(attempt);
                    warn!(
                        attempt,
                        batch_size = batch.len(),
                        delay_ms = delay.as_millis() as u64,
                        "stale producer session during flush, retrying batch"
                    );
                    tokio::time::sleep(delay).await;
                    if let Err(e) = self.slot.recreate().await {
                        warn!(error = %e, "could not recreate producer session");
                    }
                }
                Err(e) => {
                    error!(batch_size = batch.len(), error = %e, "batch rejected");
                    let err = PublishError::from(e);
                    for record in batch {
                        let _ = record.resolve.send(Err(err.clone()));
                    }
                    return 0;
                }
            }
        }
    }
}

/// Group a batch into per-topic message lists, preserving first-seen topic
/// order and per-topic record order.
fn group_by_topic(batch: &[QueuedRecord]) -> Vec<TopicMessages> {
    let mut grouped: Vec<TopicMessages> = Vec::new();
    for record in batch {
        match grouped.iter_mut().find(|group| group.topic == record.topic) {
            Some(group) => group.messages.push(record.message.clone()),
            None => grouped.push(TopicMessages {
                topic: record.topic.clone(),
                messages: vec![record.message.clone()],
            }),
        }
    }
    grouped
}

#[async_trait]
impl ActionPublisher for ThrottledPublisher {
    async fn connect(&self) -> Result<(), PublishError> {
        self.inner.slot.current().connect().await?;
        self.start();
        Ok(())
    }

    async fn put_action(&self, action: Action) -> Result<(), PublishError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(PublishError::Disconnected);
        }

        let (resolve, flushed) = oneshot::channel();
        self.inner.queue().push_back(QueuedRecord {
            resolve,
            topic: action.topic().to_string(),
            message: action.to_outbound(),
        });
        trace!(topic = action.topic(), transaction_id = %action.transaction_id(), "action queued");

        flushed.await.unwrap_or(Err(PublishError::Disconnected))
    }

    /// Stop the timer, flush everything still queued, then disconnect the
    /// producer.
    async fn disconnect(&self) -> Result<(), PublishError> {
        self.inner.closed.store(true, Ordering::SeqCst);
        let timer = self
            .inner
            .timer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(timer) = timer {
            timer.abort();
        }

        while self.pending_count() > 0 || self.inner.flushing.load(Ordering::Acquire) {
            if self.flush().await == 0 {
                tokio::time::sleep(self.inner.config.retry_backoff_step).await;
            }
        }

        self.inner.slot.current().disconnect().await?;
        info!(sent = self.sent_count(), "throttled publisher disconnected");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::TransactionId;
    use crate::broker::memory::InMemoryBroker;
    use crate::broker::BrokerError;
    use serde_json::json;

    fn config(interval_ms: u64, max_batch_size: usize) -> ThrottleConfig {
        ThrottleConfig {
            flush_interval: Duration::from_millis(interval_ms),
            max_batch_size,
            retry_backoff_step: Duration::from_millis(100),
            max_retry_backoff: Duration::from_millis(250),
            send_options: SendOptions::default(),
        }
    }

    fn publisher(broker: &InMemoryBroker, config: ThrottleConfig) -> ThrottledPublisher {
        ThrottledPublisher::new(Arc::new(broker.clone()), "test", config)
    }

    fn action(topic: &str, n: i64) -> Action {
        Action::new(topic, TransactionId::from("tx"), json!(n))
    }

    #[test]
    fn test_backoff_grows_linearly_to_cap() {
        let config = config(1000, 10);
        assert_eq!(config.backoff(1), Duration::from_millis(100));
        assert_eq!(config.backoff(2), Duration::from_millis(200));
        assert_eq!(config.backoff(3), Duration::from_millis(250));
        assert_eq!(config.backoff(50), Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn test_put_resolves_only_after_timer_flush() {
        let broker = InMemoryBroker::new();
        let publisher = publisher(&broker, config(1000, 100));
        publisher.connect().await.unwrap();

        let handle = {
            let publisher = publisher.clone();
            tokio::spawn(async move { publisher.put_action(action("orders", 1)).await })
        };

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!handle.is_finished());
        assert_eq!(publisher.pending_count(), 1);
        assert_eq!(publisher.sent_count(), 0);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(handle.is_finished());
        handle.await.unwrap().unwrap();
        assert_eq!(publisher.sent_count(), 1);
        assert_eq!(broker.records("orders").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_flush_interval_still_flushes() {
        let broker = InMemoryBroker::new();
        let publisher = publisher(&broker, config(0, 100));
        publisher.connect().await.unwrap();

        tokio::time::timeout(
            Duration::from_millis(50),
            publisher.put_action(action("orders", 1)),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(publisher.sent_count(), 1);

        let from_config = ThrottleConfig::from(&RuntimeConfig {
            flush_interval: Duration::ZERO,
            ..RuntimeConfig::default()
        });
        assert_eq!(from_config.flush_interval, MIN_FLUSH_INTERVAL);
    }

    #[tokio::test]
    async fn test_flush_drains_at_most_max_batch_size() {
        let broker = InMemoryBroker::new();
        let publisher = publisher(&broker, config(60_000, 2));

        let mut handles = Vec::new();
        for n in 0..5 {
            let publisher = publisher.clone();
            handles.push(tokio::spawn(async move {
                publisher.put_action(action("orders", n)).await
            }));
        }
        while publisher.pending_count() < 5 {
            tokio::task::yield_now().await;
        }

        assert_eq!(publisher.flush().await, 2);
        assert_eq!(publisher.pending_count(), 3);
        assert_eq!(publisher.flush().await, 2);
        assert_eq!(publisher.flush().await, 1);
        assert_eq!(publisher.flush().await, 0);
        assert_eq!(publisher.sent_count(), 5);

        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        let payloads: Vec<i64> = broker
            .records("orders")
            .iter()
            .map(|r| {
                let v: serde_json::Value = serde_json::from_slice(&r.value).unwrap();
                v["payload"].as_i64().unwrap()
            })
            .collect();
        assert_eq!(payloads, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_batch_groups_topics_into_one_request() {
        let broker = InMemoryBroker::new();
        let publisher = publisher(&broker, config(60_000, 10));

        let mut handles = Vec::new();
        for (topic, n) in [("a", 1), ("b", 2), ("a", 3)] {
            let publisher = publisher.clone();
            handles.push(tokio::spawn(async move {
                publisher.put_action(action(topic, n)).await
            }));
        }
        while publisher.pending_count() < 3 {
            tokio::task::yield_now().await;
        }

        assert_eq!(publisher.flush().await, 3);
        assert_eq!(broker.send_requests(), 1);
        assert_eq!(broker.records("a").len(), 2);
        assert_eq!(broker.records("b").len(), 1);
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_session_retries_same_batch() {
        let broker = InMemoryBroker::new();
        let publisher = publisher(&broker, config(60_000, 10));
        broker.fail_next_sends(
            BrokerError::StaleProducerSession {
                reason: "fenced".into(),
            },
            2,
        );

        let handle = {
            let publisher = publisher.clone();
            tokio::spawn(async move { publisher.put_action(action("orders", 1)).await })
        };
        while publisher.pending_count() < 1 {
            tokio::task::yield_now().await;
        }

        let flushing = {
            let publisher = publisher.clone();
            tokio::spawn(async move { publisher.flush().await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished(), "future stays pending during retry");

        assert_eq!(flushing.await.unwrap(), 1);
        handle.await.unwrap().unwrap();
        assert_eq!(broker.producer_sessions(), 3);
        assert_eq!(broker.send_requests(), 3);
        assert_eq!(publisher.sent_count(), 1);
    }

    #[tokio::test]
    async fn test_other_failure_rejects_whole_batch() {
        let broker = InMemoryBroker::new();
        let publisher = publisher(&broker, config(60_000, 10));
        let failure = BrokerError::Request("disk full".into());
        broker.fail_next_sends(failure.clone(), 1);

        let mut handles = Vec::new();
        for n in 0..3 {
            let publisher = publisher.clone();
            handles.push(tokio::spawn(async move {
                publisher.put_action(action("orders", n)).await
            }));
        }
        while publisher.pending_count() < 3 {
            tokio::task::yield_now().await;
        }

        assert_eq!(publisher.flush().await, 0);
        for handle in handles {
            assert_eq!(
                handle.await.unwrap(),
                Err(PublishError::Broker(failure.clone()))
            );
        }
        assert_eq!(publisher.sent_count(), 0);
        assert_eq!(publisher.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_flush_is_suppressed() {
        let broker = InMemoryBroker::new();
        let publisher = publisher(&broker, config(60_000, 1));
        broker.fail_next_sends(
            BrokerError::StaleProducerSession {
                reason: "fenced".into(),
            },
            1,
        );

        let mut handles = Vec::new();
        for n in 0..2 {
            let publisher = publisher.clone();
            handles.push(tokio::spawn(async move {
                publisher.put_action(action("orders", n)).await
            }));
        }
        while publisher.pending_count() < 2 {
            tokio::task::yield_now().await;
        }

        let first = {
            let publisher = publisher.clone();
            tokio::spawn(async move { publisher.flush().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(publisher.flush().await, 0, "re-entrant flush is a no-op");
        assert_eq!(publisher.pending_count(), 1);

        assert_eq!(first.await.unwrap(), 1);
        assert_eq!(publisher.flush().await, 1);
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn test_disconnect_drains_queue_and_refuses_new_actions() {
        let broker = InMemoryBroker::new();
        let publisher = publisher(&broker, config(60_000, 2));
        publisher.connect().await.unwrap();

        let mut handles = Vec::new();
        for n in 0..3 {
            let publisher = publisher.clone();
            handles.push(tokio::spawn(async move {
                publisher.put_action(action("orders", n)).await
            }));
        }
        while publisher.pending_count() < 3 {
            tokio::task::yield_now().await;
        }

        publisher.disconnect().await.unwrap();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(publisher.sent_count(), 3);
        assert_eq!(
            publisher.put_action(action("orders", 9)).await,
            Err(PublishError::Disconnected)
        );
    }
}
