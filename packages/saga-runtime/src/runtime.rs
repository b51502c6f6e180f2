//! Saga runtime: drives workflows and interprets their effects.
//!
//! [`SagaRuntime`] owns one instance of every component and is the only
//! thing a caller needs:
//!
//! ```text
//! run_saga(workflow, action)
//!     │
//!     ├─ start_transaction
//!     ├─ drive loop ── resume coroutine ── yielded effect
//!     │                    ▲                    │
//!     │                    │              middleware chain
//!     │                    │                    │
//!     │                    └──── output ── dispatcher ──► router / publisher / compensator
//!     └─ stop_transaction (success or failure)
//! ```
//!
//! A failed effect is thrown back into the workflow, so the workflow decides
//! whether it recovers. Only an error the workflow lets escape fails
//! `run_saga`.
//!
//! # Example
//!
//! ```ignore
//! let runtime = SagaRuntimeBuilder::new(Arc::new(broker))
//!     .with_config(RuntimeConfig::from_env()?)
//!     .with_middleware(TracingMiddleware)
//!     .build();
//! runtime.connect().await?;
//!
//! let result = runtime
//!     .run_saga(&workflow, action, SagaOptions::default())
//!     .await?;
//! ```

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures::future::{select_all, try_join_all};
use futures::FutureExt;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::action::{Action, Headers, Identity, TransactionId};
use crate::broker::{BrokerClient, InboundRecord};
use crate::compensation::Compensator;
use crate::config::{DeliveryMode, RuntimeConfig};
use crate::context::SagaScope;
use crate::coroutine::{Coroutine, Resume, SagaDriver, Step, Workflow};
use crate::effect::{
    ActionChannel, CombinatorKind, EffectDescription, EffectOutput, EffectSet, Invocation,
    SagaBody,
};
use crate::error::SagaError;
use crate::middleware::{compose, Dispatch, Middleware};
use crate::publisher::{ActionPublisher, ProducerBus, ThrottleConfig, ThrottledPublisher};
use crate::router::{ActionObserver, MessageRouter};

/// Per-run inputs besides the initial action.
#[derive(Debug, Clone, Default)]
pub struct SagaOptions {
    /// Headers the saga runs under. Identity headers here are copied onto
    /// every action the saga publishes.
    pub headers: Headers,
    /// Inbound record that triggered the run, if any.
    pub original_message: Option<InboundRecord>,
}

struct RuntimeInner {
    router: MessageRouter,
    publisher: Arc<dyn ActionPublisher>,
    compensator: Compensator,
    dispatch: Dispatch,
    config: RuntimeConfig,
}

/// The saga runner and the public runtime surface.
#[derive(Clone)]
pub struct SagaRuntime {
    inner: Arc<RuntimeInner>,
}

// =============================================================================
// Builder
// =============================================================================

/// Wires a broker client, publisher, middleware and config into a runtime.
pub struct SagaRuntimeBuilder {
    client: Arc<dyn BrokerClient>,
    config: RuntimeConfig,
    middleware: Vec<Arc<dyn Middleware>>,
    publisher: Option<Arc<dyn ActionPublisher>>,
}

impl SagaRuntimeBuilder {
    pub fn new(client: Arc<dyn BrokerClient>) -> Self {
        Self {
            client,
            config: RuntimeConfig::default(),
            middleware: Vec::new(),
            publisher: None,
        }
    }

    pub fn with_config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Append a middleware. The first one added is outermost.
    pub fn with_middleware(mut self, middleware: impl Middleware) -> Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    /// Use a custom publisher instead of the one `delivery_mode` selects.
    pub fn with_publisher(mut self, publisher: Arc<dyn ActionPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn build(self) -> SagaRuntime {
        let Self {
            client,
            config,
            middleware,
            publisher,
        } = self;

        let publisher = publisher.unwrap_or_else(|| default_publisher(&client, &config));
        let router = MessageRouter::new(
            client.consumer(&config.consumer_group),
            client.admin(),
            config.topic_partitions,
        );
        let compensator = Compensator::new(Arc::clone(&publisher));

        let inner = Arc::new_cyclic(|weak: &Weak<RuntimeInner>| RuntimeInner {
            router,
            publisher,
            compensator,
            dispatch: compose(&middleware, terminal(weak.clone())),
            config,
        });
        info!(
            delivery_mode = ?inner.config.delivery_mode,
            middleware = middleware.len(),
            "saga runtime built"
        );
        SagaRuntime { inner }
    }
}

fn default_publisher(
    client: &Arc<dyn BrokerClient>,
    config: &RuntimeConfig,
) -> Arc<dyn ActionPublisher> {
    match config.delivery_mode {
        DeliveryMode::Throttled => Arc::new(ThrottledPublisher::new(
            Arc::clone(client),
            config.client_id.clone(),
            ThrottleConfig::from(config),
        )),
        DeliveryMode::Direct | DeliveryMode::Transactional => {
            Arc::new(ProducerBus::new(Arc::clone(client), config))
        }
    }
}

/// The innermost dispatch function: interprets the effect.
fn terminal(runtime: Weak<RuntimeInner>) -> Dispatch {
    Arc::new(move |effect: EffectDescription, scope: SagaScope| {
        let runtime = runtime.clone();
        async move {
            let inner = runtime.upgrade().ok_or(SagaError::RuntimeShutdown)?;
            SagaRuntime { inner }.execute(effect, scope).await
        }
        .boxed()
    })
}

// =============================================================================
// Public surface
// =============================================================================

impl SagaRuntime {
    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub fn compensator(&self) -> &Compensator {
        &self.inner.compensator
    }

    /// Connect the consumer and the publisher.
    pub async fn connect(&self) -> Result<(), SagaError> {
        self.inner.router.connect().await?;
        self.inner.publisher.connect().await?;
        info!(client_id = %self.inner.config.client_id, "saga runtime connected");
        Ok(())
    }

    /// Stop routing and flush/close the publisher.
    pub async fn disconnect(&self) -> Result<(), SagaError> {
        self.inner.router.disconnect().await?;
        self.inner.publisher.disconnect().await?;
        info!("saga runtime disconnected");
        Ok(())
    }

    /// Activate a transaction and give it an empty compensation chain.
    ///
    /// # Errors
    ///
    /// Returns [`SagaError::DuplicateTransaction`] if it is already active.
    pub fn start_transaction(&self, transaction_id: &TransactionId) -> Result<(), SagaError> {
        self.inner.router.start_transaction(transaction_id)?;
        self.inner
            .compensator
            .initialize_compensation_chain(transaction_id);
        Ok(())
    }

    /// Deactivate a transaction, dropping its observers and compensation chain.
    pub fn stop_transaction(&self, transaction_id: &TransactionId) {
        self.inner.router.stop_transaction(transaction_id);
        self.inner.compensator.discard(transaction_id);
    }

    pub fn is_transaction_active(&self, transaction_id: &TransactionId) -> bool {
        self.inner.router.is_transaction_active(transaction_id)
    }

    pub fn register_topic_observer(
        &self,
        transaction_id: &TransactionId,
        topic: &str,
        observer: ActionObserver,
    ) -> Result<(), SagaError> {
        self.inner
            .router
            .register_topic_observer(transaction_id, topic, observer)
    }

    pub async fn stream_actions_from_topic(&self, topic: &str) -> Result<(), SagaError> {
        self.inner.router.stream_actions_from_topic(topic).await
    }

    pub async fn streaming_topics(&self) -> Vec<String> {
        self.inner.router.streaming_topics().await
    }

    pub async fn put_action(&self, action: Action) -> Result<(), SagaError> {
        self.inner.publisher.put_action(action).await?;
        Ok(())
    }

    /// Run one effect through the middleware chain and the dispatcher.
    pub async fn dispatch(
        &self,
        effect: EffectDescription,
        scope: SagaScope,
    ) -> Result<EffectOutput, SagaError> {
        (self.inner.dispatch)(effect, scope).await
    }

    /// Run a workflow to completion under the action's transaction.
    ///
    /// The transaction is started first and stopped when the run ends, so
    /// observers and the compensation chain never outlive it. Dropping the
    /// returned future mid-run (a consumer timeout, say) stops it as well.
    pub async fn run_saga(
        &self,
        workflow: &Workflow,
        action: Action,
        options: SagaOptions,
    ) -> Result<Value, SagaError> {
        let transaction_id = action.transaction_id().clone();
        self.start_transaction(&transaction_id)?;
        let _active = ActiveTransaction {
            runtime: self,
            transaction_id: transaction_id.clone(),
        };

        let mut scope = SagaScope::new(transaction_id.clone())
            .with_headers(options.headers)
            .with_compensation(self.inner.compensator.clone());
        if let Some(record) = options.original_message {
            scope = scope.with_original_message(record);
        }

        info!(
            transaction_id = %transaction_id,
            workflow = workflow.name(),
            topic = action.topic(),
            "saga started"
        );
        let result = self.drive_saga(scope, workflow.body(action)).await;

        match &result {
            Ok(_) => info!(transaction_id = %transaction_id, workflow = workflow.name(), "saga completed"),
            Err(e) => warn!(
                transaction_id = %transaction_id,
                workflow = workflow.name(),
                error = %e,
                kind = %e.kind(),
                "saga failed"
            ),
        }
        result
    }

    /// Parse an inbound record and run the workflow for it, with the record's
    /// headers as the saga headers.
    pub async fn run_saga_for_record(
        &self,
        workflow: &Workflow,
        record: InboundRecord,
    ) -> Result<Value, SagaError> {
        let action = Action::from_record(&record)?;
        let options = SagaOptions {
            headers: record.headers.clone(),
            original_message: Some(record),
        };
        self.run_saga(workflow, action, options).await
    }

    /// Drive a body through the step loop until it returns.
    ///
    /// Used for top-level runs, nested sagas returned by `Call`, and saga
    /// compensation handlers. Does not touch transaction state.
    pub async fn drive_saga(&self, scope: SagaScope, body: SagaBody) -> Result<Value, SagaError> {
        let scope = if scope.compensation().is_some() {
            scope
        } else {
            scope.with_compensation(self.inner.compensator.clone())
        };

        let mut coroutine = Coroutine::new(scope.clone(), body);
        let mut input = Resume::Start;
        loop {
            match coroutine.resume(input).await {
                Step::Complete(result) => {
                    debug!(
                        transaction_id = %scope.transaction_id(),
                        state = ?coroutine.state(),
                        "coroutine finished"
                    );
                    return result;
                }
                Step::Yielded(effect) => {
                    input = match self.dispatch(effect, scope.clone()).await {
                        Ok(output) => Resume::Next(output),
                        Err(e) => Resume::Throw(e),
                    };
                }
            }
        }
    }
}

// =============================================================================
// Dispatcher
// =============================================================================

impl SagaRuntime {
    async fn execute(
        &self,
        effect: EffectDescription,
        scope: SagaScope,
    ) -> Result<EffectOutput, SagaError> {
        match effect {
            EffectDescription::Put {
                transaction_id,
                pattern,
                payload,
            } => {
                let mut action = Action::new(pattern, transaction_id, payload);
                if let Some(identity) = Identity::from_headers(scope.headers()) {
                    action = action.with_identity(identity);
                }
                self.inner.publisher.put_action(action).await?;
                Ok(EffectOutput::Empty)
            }

            EffectDescription::Take {
                transaction_id,
                topics,
                buffer,
                observer,
                ..
            } => {
                let registration = TakeRegistration {
                    router: &self.inner.router,
                    transaction_id,
                    topics,
                    observer,
                };
                self.observe(
                    &registration.transaction_id,
                    &registration.topics,
                    &registration.observer,
                )
                .await?;
                let action = buffer.take().await?;
                Ok(EffectOutput::Action(action))
            }

            EffectDescription::ActionChannel {
                transaction_id,
                topics,
                buffer,
                observer,
                ..
            } => {
                self.observe(&transaction_id, &topics, &observer).await?;
                Ok(EffectOutput::Channel(ActionChannel::new(topics, buffer)))
            }

            EffectDescription::TakeActionChannel { buffer, .. } => {
                Ok(EffectOutput::Action(buffer.take().await?))
            }

            EffectDescription::Call { effect, args, .. } => {
                let value = match effect.invoke(args) {
                    Invocation::Ready(future) => future.await.map_err(SagaError::Call)?,
                    Invocation::Saga(body) => {
                        debug!(callable = effect.name(), "driving nested saga");
                        self.drive_saga(scope, body).await?
                    }
                };
                Ok(EffectOutput::Value(value))
            }

            EffectDescription::Delay {
                duration, payload, ..
            } => {
                tokio::time::sleep(duration).await;
                Ok(payload.map_or(EffectOutput::Empty, EffectOutput::Value))
            }

            EffectDescription::Combinator {
                effects,
                combinator,
                ..
            } => match combinator {
                CombinatorKind::All => self.all(effects, scope).await,
                CombinatorKind::Race => self.race(effects, scope).await,
            },

            EffectDescription::AddCompensation {
                transaction_id,
                plan,
            } => {
                self.compensator_for(&scope).add_compensation(
                    &transaction_id,
                    plan,
                    scope.headers().clone(),
                );
                Ok(EffectOutput::Empty)
            }

            EffectDescription::RunCompensation {
                transaction_id,
                config,
            } => {
                self.compensator_for(&scope)
                    .compensate(&transaction_id, config, self, &scope)
                    .await?;
                Ok(EffectOutput::Empty)
            }

            EffectDescription::ClearCompensation { transaction_id } => {
                self.compensator_for(&scope)
                    .initialize_compensation_chain(&transaction_id);
                Ok(EffectOutput::Empty)
            }

            EffectDescription::ViewCompensationChain { transaction_id } => Ok(
                EffectOutput::Chain(self.compensator_for(&scope).chain(&transaction_id)),
            ),
        }
    }

    fn compensator_for<'a>(&'a self, scope: &'a SagaScope) -> &'a Compensator {
        scope.compensation().unwrap_or(&self.inner.compensator)
    }

    /// Register the observer on every topic and make sure each is streaming.
    async fn observe(
        &self,
        transaction_id: &TransactionId,
        topics: &[String],
        observer: &ActionObserver,
    ) -> Result<(), SagaError> {
        for topic in topics {
            self.inner
                .router
                .register_topic_observer(transaction_id, topic, observer.clone())?;
            self.inner.router.stream_actions_from_topic(topic).await?;
        }
        Ok(())
    }

    async fn all(&self, effects: EffectSet, scope: SagaScope) -> Result<EffectOutput, SagaError> {
        match effects {
            EffectSet::List(effects) => {
                let outputs = try_join_all(
                    effects
                        .into_iter()
                        .map(|effect| self.dispatch(effect, scope.clone())),
                )
                .await?;
                Ok(EffectOutput::List(outputs))
            }
            EffectSet::Record(effects) => {
                let (keys, effects): (Vec<String>, Vec<EffectDescription>) =
                    effects.into_iter().unzip();
                let outputs = try_join_all(
                    effects
                        .into_iter()
                        .map(|effect| self.dispatch(effect, scope.clone())),
                )
                .await?;
                Ok(EffectOutput::Record(keys.into_iter().zip(outputs).collect()))
            }
        }
    }

    /// Settle on the first inner effect to finish. Losers are dropped.
    async fn race(&self, effects: EffectSet, scope: SagaScope) -> Result<EffectOutput, SagaError> {
        if effects.is_empty() {
            return Err(SagaError::EmptyRace);
        }
        match effects {
            EffectSet::List(effects) => {
                let racers = effects
                    .into_iter()
                    .map(|effect| self.dispatch(effect, scope.clone()).boxed());
                let (winner, _, _) = select_all(racers).await;
                winner
            }
            EffectSet::Record(effects) => {
                let (keys, effects): (Vec<String>, Vec<EffectDescription>) =
                    effects.into_iter().unzip();
                let racers = effects
                    .into_iter()
                    .map(|effect| self.dispatch(effect, scope.clone()).boxed());
                let (winner, index, _) = select_all(racers).await;
                let winner = winner?;

                let mut record = BTreeMap::new();
                let mut winner = Some(winner);
                for (position, key) in keys.into_iter().enumerate() {
                    let output = if position == index {
                        winner.take().unwrap_or(EffectOutput::Empty)
                    } else {
                        EffectOutput::Empty
                    };
                    record.insert(key, output);
                }
                Ok(EffectOutput::Record(record))
            }
        }
    }
}

/// Stops its transaction when dropped, whether the run finished or was cancelled.
struct ActiveTransaction<'a> {
    runtime: &'a SagaRuntime,
    transaction_id: TransactionId,
}

impl Drop for ActiveTransaction<'_> {
    fn drop(&mut self) {
        self.runtime.stop_transaction(&self.transaction_id);
    }
}

/// Observer a single Take registered. Removed once the take resolves, fails
/// or loses a race, so looping takes on one topic do not pile up buffers.
struct TakeRegistration<'a> {
    router: &'a MessageRouter,
    transaction_id: TransactionId,
    topics: Vec<String>,
    observer: ActionObserver,
}

impl Drop for TakeRegistration<'_> {
    fn drop(&mut self) {
        for topic in &self.topics {
            self.router
                .remove_topic_observer(&self.transaction_id, topic, &self.observer);
        }
    }
}

#[async_trait]
impl SagaDriver for SagaRuntime {
    async fn drive(&self, scope: SagaScope, body: SagaBody) -> Result<Value, SagaError> {
        self.drive_saga(scope, body).await
    }
}

impl std::fmt::Debug for SagaRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SagaRuntime")
            .field("client_id", &self.inner.config.client_id)
            .field("delivery_mode", &self.inner.config.delivery_mode)
            .field("compensator", &self.inner.compensator)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ROLES_HEADER, USER_ID_HEADER};
    use crate::broker::memory::InMemoryBroker;
    use crate::effect::{Callable, CompensationConfig, CompensationHandler, CompensationPlan};
    use crate::middleware::from_fn;
    use crate::middleware::Next;
    use crate::testing::RecordingPublisher;
    use bytes::Bytes;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::time::Instant;

    fn runtime() -> (SagaRuntime, InMemoryBroker, Arc<RecordingPublisher>) {
        let broker = InMemoryBroker::new();
        let publisher = Arc::new(RecordingPublisher::new());
        let runtime = SagaRuntimeBuilder::new(Arc::new(broker.clone()))
            .with_publisher(publisher.clone())
            .build();
        (runtime, broker, publisher)
    }

    fn start(tx: &str) -> Action {
        Action::new("saga.start", TransactionId::from(tx), json!({}))
    }

    /// Wait until `topic` has a delivery loop, i.e. a take is listening.
    async fn wait_for_stream(runtime: &SagaRuntime, topic: &str) {
        while !runtime.streaming_topics().await.iter().any(|t| t == topic) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    #[tokio::test]
    async fn test_put_attaches_identity_from_headers() {
        let (runtime, _, publisher) = runtime();
        let workflow = Workflow::new("identity", |_action, ctx| async move {
            ctx.put("audit", json!({"event": "login"})).await?;
            Ok(Value::Null)
        });

        let mut headers = Headers::new();
        headers.insert(USER_ID_HEADER.into(), Bytes::from_static(b"u-7"));
        headers.insert(ROLES_HEADER.into(), Bytes::from_static(b"admin, ops"));
        runtime
            .run_saga(
                &workflow,
                start("tx-id"),
                SagaOptions {
                    headers,
                    ..SagaOptions::default()
                },
            )
            .await
            .unwrap();

        let published = publisher.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic(), "audit");
        assert_eq!(published[0].user_id(), Some("u-7"));
        assert_eq!(
            published[0].user_roles(),
            Some(&["admin".to_string(), "ops".to_string()][..])
        );
    }

    #[tokio::test]
    async fn test_put_without_identity_headers_leaves_action_anonymous() {
        let (runtime, _, publisher) = runtime();
        let workflow = Workflow::new("anon", |_action, ctx| async move {
            ctx.put("audit", json!(1)).await?;
            Ok(Value::Null)
        });

        let mut headers = Headers::new();
        headers.insert(USER_ID_HEADER.into(), Bytes::from_static(b"u-7"));
        runtime
            .run_saga(
                &workflow,
                start("tx-anon"),
                SagaOptions {
                    headers,
                    ..SagaOptions::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(publisher.published()[0].user_id(), None);
    }

    #[tokio::test]
    async fn test_take_receives_reply_for_its_transaction() {
        let (runtime, broker, _) = runtime();
        let workflow = Workflow::new("await-reply", |_action, ctx| async move {
            let reply = ctx.take("inventory.reserved").await?;
            Ok(reply.into_payload())
        });

        let saga = {
            let runtime = runtime.clone();
            tokio::spawn(async move {
                runtime
                    .run_saga(&workflow, start("tx-take"), SagaOptions::default())
                    .await
            })
        };
        wait_for_stream(&runtime, "inventory.reserved").await;

        let other = Action::new("inventory.reserved", TransactionId::from("tx-other"), json!("no"));
        broker.append("inventory.reserved", other.to_outbound());
        let mine = Action::new("inventory.reserved", TransactionId::from("tx-take"), json!("yes"));
        broker.append("inventory.reserved", mine.to_outbound());

        assert_eq!(saga.await.unwrap().unwrap(), json!("yes"));
        assert!(!runtime.is_transaction_active(&TransactionId::from("tx-take")));
    }

    #[tokio::test]
    async fn test_action_channel_can_be_taken_repeatedly() {
        let (runtime, broker, _) = runtime();
        let workflow = Workflow::new("channel", |_action, ctx| async move {
            let channel = ctx.action_channel("events").await?;
            let first = ctx.take_from(&channel).await?;
            let second = ctx.take_from(&channel).await?;
            Ok(json!([first.into_payload(), second.into_payload()]))
        });

        let saga = {
            let runtime = runtime.clone();
            tokio::spawn(async move {
                runtime
                    .run_saga(&workflow, start("tx-chan"), SagaOptions::default())
                    .await
            })
        };
        wait_for_stream(&runtime, "events").await;

        for n in 1..=2 {
            let action = Action::new("events", TransactionId::from("tx-chan"), json!(n));
            broker.append("events", action.to_outbound());
        }

        assert_eq!(saga.await.unwrap().unwrap(), json!([1, 2]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_race_resolves_with_fastest_branch() {
        let (runtime, _, _) = runtime();
        let workflow = Workflow::new("race", |_action, ctx| async move {
            let fx = &ctx.effects;
            let winner = ctx
                .race(vec![
                    fx.delay_with(Duration::from_millis(10), json!("fast")),
                    fx.delay_with(Duration::from_millis(2000), json!("slow")),
                ])
                .await?;
            winner.into_value()
        });

        let started = Instant::now();
        let value = runtime
            .run_saga(&workflow, start("tx-race"), SagaOptions::default())
            .await
            .unwrap();

        assert_eq!(value, json!("fast"));
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_race_record_marks_losers_empty() {
        let (runtime, _, _) = runtime();
        let workflow = Workflow::new("race-record", |_action, ctx| async move {
            let fx = &ctx.effects;
            let record = ctx
                .race_record([
                    ("fast", fx.delay_with(Duration::from_millis(10), json!("f"))),
                    ("slow", fx.delay_with(Duration::from_millis(2000), json!("s"))),
                ])
                .await?;
            Ok(json!({
                "fast": record["fast"].clone().into_value()?,
                "slow": record["slow"].clone().into_value()?,
            }))
        });

        let value = runtime
            .run_saga(&workflow, start("tx-race-rec"), SagaOptions::default())
            .await
            .unwrap();
        assert_eq!(value, json!({"fast": "f", "slow": null}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_waits_for_every_branch_and_keeps_order() {
        let (runtime, _, _) = runtime();
        let workflow = Workflow::new("all", |_action, ctx| async move {
            let fx = &ctx.effects;
            let outputs = ctx
                .all(vec![
                    fx.delay_with(Duration::from_millis(300), json!("a")),
                    fx.delay_with(Duration::from_millis(10), json!("b")),
                ])
                .await?;
            let values = outputs
                .into_iter()
                .map(EffectOutput::into_value)
                .collect::<Result<Vec<_>, _>>()?;

            let record = ctx
                .all_record([
                    ("x", fx.delay_with(Duration::from_millis(5), json!(1))),
                    ("y", fx.delay(Duration::from_millis(1))),
                ])
                .await?;
            Ok(json!({
                "list": values,
                "x": record["x"].clone().into_value()?,
                "y_empty": record["y"].is_empty(),
            }))
        });

        let started = Instant::now();
        let value = runtime
            .run_saga(&workflow, start("tx-all"), SagaOptions::default())
            .await
            .unwrap();

        assert!(started.elapsed() >= Duration::from_millis(300));
        assert_eq!(value, json!({"list": ["a", "b"], "x": 1, "y_empty": true}));
    }

    #[tokio::test]
    async fn test_empty_race_is_thrown_into_workflow() {
        let (runtime, _, _) = runtime();
        let workflow = Workflow::new("empty-race", |_action, ctx| async move {
            match ctx.race(vec![]).await {
                Err(SagaError::EmptyRace) => Ok(json!("caught")),
                other => Ok(json!(format!("unexpected: {other:?}"))),
            }
        });

        let value = runtime
            .run_saga(&workflow, start("tx-empty"), SagaOptions::default())
            .await
            .unwrap();
        assert_eq!(value, json!("caught"));
    }

    #[tokio::test]
    async fn test_call_drives_nested_saga() {
        let (runtime, _, publisher) = runtime();
        let reserve = Callable::from_saga("reserve", |args: Vec<Value>, ctx| async move {
            ctx.put("inventory.reserve", args[0].clone()).await?;
            Ok(json!({"reserved": args[0]}))
        });
        let workflow = Workflow::new("nested", move |_action, ctx| {
            let reserve = reserve.clone();
            async move { ctx.call(&reserve, vec![json!("sku-1")]).await }
        });

        let value = runtime
            .run_saga(&workflow, start("tx-nested"), SagaOptions::default())
            .await
            .unwrap();

        assert_eq!(value, json!({"reserved": "sku-1"}));
        let published = publisher.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].transaction_id().as_str(), "tx-nested");
    }

    #[tokio::test]
    async fn test_failed_call_can_be_recovered_by_workflow() {
        let (runtime, _, _) = runtime();
        let charge = Callable::from_async("charge", |_args| async {
            anyhow::bail!("card declined")
        });
        let workflow = Workflow::new("recover", move |_action, ctx| {
            let charge = charge.clone();
            async move {
                match ctx.call(&charge, vec![]).await {
                    Ok(_) => Ok(json!("charged")),
                    Err(e) => Ok(json!(format!("fallback after: {e}"))),
                }
            }
        });

        let value = runtime
            .run_saga(&workflow, start("tx-recover"), SagaOptions::default())
            .await
            .unwrap();
        assert_eq!(value, json!("fallback after: call effect failed: card declined"));
    }

    #[tokio::test]
    async fn test_uncaught_failure_propagates_and_tears_down() {
        let (runtime, _, _) = runtime();
        let charge = Callable::from_async("charge", |_args| async {
            anyhow::bail!("card declined")
        });
        let workflow = Workflow::new("fail", move |_action, ctx| {
            let charge = charge.clone();
            async move {
                ctx.add_compensation(CompensationPlan::remote("undo", json!(1)))
                    .await?;
                ctx.call(&charge, vec![]).await
            }
        });

        let tx = TransactionId::from("tx-fail");
        let err = runtime
            .run_saga(&workflow, start("tx-fail"), SagaOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, SagaError::Call(_)));
        assert!(!runtime.is_transaction_active(&tx));
        assert!(runtime.compensator().chain(&tx).is_empty());

        // Teardown leaves the id free for a redelivery.
        let retry = Workflow::new("retry", |_action, _ctx| async { Ok(json!("ok")) });
        assert_eq!(
            runtime
                .run_saga(&retry, start("tx-fail"), SagaOptions::default())
                .await
                .unwrap(),
            json!("ok")
        );
    }

    #[tokio::test]
    async fn test_duplicate_transaction_is_rejected() {
        let (runtime, _, _) = runtime();
        let tx = TransactionId::from("tx-dup");
        runtime.start_transaction(&tx).unwrap();

        let workflow = Workflow::new("dup", |_action, _ctx| async { Ok(Value::Null) });
        let err = runtime
            .run_saga(&workflow, start("tx-dup"), SagaOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, SagaError::DuplicateTransaction { .. }));
        assert!(err.is_logic_error());
        // The first owner keeps the transaction.
        assert!(runtime.is_transaction_active(&tx));
    }

    #[tokio::test]
    async fn test_compensation_effects() {
        let (runtime, _, publisher) = runtime();
        let log = Arc::new(Mutex::new(Vec::new()));
        let undo = {
            let log = Arc::clone(&log);
            CompensationHandler::from_async(move |payload: Value| {
                let log = Arc::clone(&log);
                async move {
                    log.lock().unwrap().push(payload);
                    Ok(Value::Null)
                }
            })
        };

        let workflow = Workflow::new("rollback", move |_action, ctx| {
            let undo = undo.clone();
            async move {
                ctx.add_compensation(CompensationPlan::immediate(undo.clone(), json!("A")))
                    .await?;
                ctx.add_compensation(CompensationPlan::immediate(undo, json!("B")))
                    .await?;
                ctx.add_compensation(CompensationPlan::remote("payments.refund", json!("C")))
                    .await?;
                let before = ctx.view_compensation_chain().await?.len();

                ctx.run_compensation(CompensationConfig::default()).await?;
                ctx.clear_compensation().await?;
                let after = ctx.view_compensation_chain().await?.len();
                Ok(json!([before, after]))
            }
        });

        let value = runtime
            .run_saga(&workflow, start("tx-comp"), SagaOptions::default())
            .await
            .unwrap();

        assert_eq!(value, json!([3, 0]));
        assert_eq!(*log.lock().unwrap(), vec![json!("B"), json!("A")]);
        let published = publisher.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic(), "payments.refund");
    }

    #[tokio::test]
    async fn test_middleware_sees_nested_effects() {
        let broker = InMemoryBroker::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = {
            let seen = Arc::clone(&seen);
            from_fn(move |effect: EffectDescription, scope: SagaScope, next: Next| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.lock().unwrap().push(effect.kind().to_string());
                    next.run(effect, scope).await
                }
            })
        };
        let runtime = SagaRuntimeBuilder::new(Arc::new(broker))
            .with_publisher(Arc::new(RecordingPublisher::new()))
            .with_middleware(recorder)
            .build();

        let workflow = Workflow::new("observed", |_action, ctx| async move {
            let fx = &ctx.effects;
            ctx.all(vec![fx.delay(Duration::ZERO), fx.put("t", json!(1))])
                .await?;
            Ok(Value::Null)
        });
        runtime
            .run_saga(&workflow, start("tx-mw"), SagaOptions::default())
            .await
            .unwrap();

        let mut seen = seen.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen, vec!["combinator", "delay", "put"]);
    }

    #[tokio::test]
    async fn test_run_saga_for_record_uses_record_headers() {
        let (runtime, broker, publisher) = runtime();
        let mut action = Action::new("orders.created", TransactionId::from("tx-rec"), json!(5));
        let mut headers = Headers::new();
        headers.insert(USER_ID_HEADER.into(), Bytes::from_static(b"u-1"));
        headers.insert(ROLES_HEADER.into(), Bytes::from_static(b"buyer"));
        action = action.with_headers(headers);
        let record = broker.append("orders.created", action.to_outbound());

        let workflow = Workflow::new("from-record", |action, ctx| async move {
            assert_eq!(ctx.original_message().map(|r| r.topic.as_str()), Some("orders.created"));
            ctx.put("orders.ack", action.payload().clone()).await?;
            Ok(Value::Null)
        });
        runtime.run_saga_for_record(&workflow, record).await.unwrap();

        assert_eq!(publisher.published()[0].user_id(), Some("u-1"));
    }

    #[tokio::test]
    async fn test_malformed_record_is_a_logic_error() {
        let (runtime, broker, _) = runtime();
        let record = broker.append(
            "orders.created",
            crate::broker::OutboundMessage {
                key: None,
                value: Bytes::from_static(b"not json"),
                headers: Headers::new(),
            },
        );
        let workflow = Workflow::new("never", |_action, _ctx| async { Ok(Value::Null) });

        let err = runtime
            .run_saga_for_record(&workflow, record)
            .await
            .unwrap_err();
        assert!(matches!(err, SagaError::MalformedMessage { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_run_releases_transaction() {
        let (runtime, _, _) = runtime();
        let tx = TransactionId::from("tx-cancel");
        let blocked = Workflow::new("blocked", |_action, ctx| async move {
            ctx.add_compensation(CompensationPlan::remote("inventory.release", json!(1)))
                .await?;
            ctx.take("never.answered").await?;
            Ok(Value::Null)
        });

        let timed_out = tokio::time::timeout(
            Duration::from_millis(50),
            runtime.run_saga(&blocked, start("tx-cancel"), SagaOptions::default()),
        )
        .await;
        assert!(timed_out.is_err());
        assert!(!runtime.is_transaction_active(&tx));
        assert!(runtime.compensator().chain(&tx).is_empty());

        // A consumer redelivering the message can run the saga again.
        let retry = Workflow::new("retry", |_action, _ctx| async { Ok(json!("redelivered")) });
        assert_eq!(
            runtime
                .run_saga(&retry, start("tx-cancel"), SagaOptions::default())
                .await
                .unwrap(),
            json!("redelivered")
        );
    }

    #[tokio::test]
    async fn test_saga_compensation_handler_publishes_through_runtime() {
        let (runtime, _, publisher) = runtime();
        let undo = CompensationHandler::from_saga(|payload, ctx| async move {
            ctx.put("undo.topic", payload).await?;
            Ok(Value::Null)
        });
        let workflow = Workflow::new("saga-undo", move |_action, ctx| {
            let undo = undo.clone();
            async move {
                ctx.add_compensation(CompensationPlan::immediate(undo, json!({"sku": "widget"})))
                    .await?;
                ctx.run_compensation(CompensationConfig {
                    parallel: true,
                    ..CompensationConfig::default()
                })
                .await?;
                Ok(Value::Null)
            }
        });

        runtime
            .run_saga(&workflow, start("tx-saga-undo"), SagaOptions::default())
            .await
            .unwrap();

        let published = publisher.published();
        assert_eq!(publisher.topics(), vec!["undo.topic"]);
        assert_eq!(published[0].transaction_id().as_str(), "tx-saga-undo");
        assert_eq!(published[0].payload(), &json!({"sku": "widget"}));
    }

    #[tokio::test]
    async fn test_take_over_several_topics_settles_on_first_arrival() {
        let (runtime, broker, _) = runtime();
        let workflow = Workflow::new("multi-take", |_action, ctx| async move {
            let action = ctx.take(["a", "b"]).await?;
            let topic = action.topic().to_string();
            Ok(json!([topic, action.into_payload()]))
        });

        let saga = {
            let runtime = runtime.clone();
            tokio::spawn(async move {
                runtime
                    .run_saga(&workflow, start("tx-multi"), SagaOptions::default())
                    .await
            })
        };
        wait_for_stream(&runtime, "b").await;

        let reply = Action::new("b", TransactionId::from("tx-multi"), json!(9));
        broker.append("b", reply.to_outbound());

        assert_eq!(saga.await.unwrap().unwrap(), json!(["b", 9]));
        assert_eq!(
            runtime.streaming_topics().await,
            vec!["a".to_string(), "b".to_string()]
        );
    }

    #[tokio::test]
    async fn test_settled_takes_release_their_observers() {
        let (runtime, broker, _) = runtime();
        let tx = TransactionId::from("tx-loop");
        let workflow = Workflow::new("loop", |_action, ctx| async move {
            ctx.take("t").await?;
            let fx = &ctx.effects;
            ctx.race(vec![
                fx.take("x"),
                fx.delay_with(Duration::from_millis(10), json!("timeout")),
            ])
            .await?;
            let done = ctx.take("done").await?;
            Ok(done.into_payload())
        });

        let saga = {
            let runtime = runtime.clone();
            tokio::spawn(async move {
                runtime
                    .run_saga(&workflow, start("tx-loop"), SagaOptions::default())
                    .await
            })
        };
        wait_for_stream(&runtime, "t").await;
        broker.append("t", Action::new("t", tx.clone(), json!(1)).to_outbound());
        wait_for_stream(&runtime, "done").await;

        // The resolved take and the race loser are gone; only the live take remains.
        let router = &runtime.inner.router;
        assert_eq!(router.observer_count(&tx, "t"), 0);
        assert_eq!(router.observer_count(&tx, "x"), 0);
        assert_eq!(router.observer_count(&tx, "done"), 1);

        broker.append("done", Action::new("done", tx.clone(), json!("ok")).to_outbound());
        assert_eq!(saga.await.unwrap().unwrap(), json!("ok"));
    }
}
