//! The context a workflow body runs with.
//!
//! [`SagaScope`] is the data a saga executes under: transaction id, headers,
//! the inbound record that triggered it, and the compensator. The runtime
//! passes it to middleware and clones it into nested sagas.
//!
//! [`SagaContext`] is what a workflow body receives: the scope, an
//! [`EffectBuilder`] bound to its transaction, and a private channel back to
//! the coroutine driving it. Every `ctx.perform(effect).await` suspends the
//! body until the runtime resumes it with the effect's output or error.
//!
//! # Example
//!
//! ```ignore
//! let workflow = Workflow::new("reserve", |action, ctx| async move {
//!     ctx.put("inventory.reserve", action.payload().clone()).await?;
//!     let reply = ctx.take("inventory.reserved").await?;
//!     Ok(reply.into_payload())
//! });
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::action::{Action, Headers, TransactionId};
use crate::broker::InboundRecord;
use crate::builder::EffectBuilder;
use crate::compensation::Compensator;
use crate::effect::{
    ActionChannel, Callable, CompensationConfig, CompensationEntry, CompensationPlan,
    EffectDescription, EffectOutput, EffectSet, TopicPattern,
};
use crate::error::SagaError;

// =============================================================================
// Scope
// =============================================================================

/// Data a saga executes under.
#[derive(Clone, Debug)]
pub struct SagaScope {
    transaction_id: TransactionId,
    headers: Headers,
    original_message: Option<Arc<InboundRecord>>,
    compensation: Option<Compensator>,
}

impl SagaScope {
    pub fn new(transaction_id: TransactionId) -> Self {
        Self {
            transaction_id,
            headers: Headers::new(),
            original_message: None,
            compensation: None,
        }
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_original_message(mut self, record: InboundRecord) -> Self {
        self.original_message = Some(Arc::new(record));
        self
    }

    pub fn with_compensation(mut self, compensator: Compensator) -> Self {
        self.compensation = Some(compensator);
        self
    }

    pub fn transaction_id(&self) -> &TransactionId {
        &self.transaction_id
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn original_message(&self) -> Option<&InboundRecord> {
        self.original_message.as_deref()
    }

    pub fn compensation(&self) -> Option<&Compensator> {
        self.compensation.as_ref()
    }
}

// =============================================================================
// Yield channel
// =============================================================================

/// One suspended `perform` call: the effect and where to send its result.
pub(crate) struct Yield {
    pub(crate) effect: EffectDescription,
    pub(crate) resume: oneshot::Sender<Result<EffectOutput, SagaError>>,
}

#[derive(Clone)]
pub(crate) struct Yielder(mpsc::UnboundedSender<Yield>);

impl Yielder {
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<Yield>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self(tx), rx)
    }

    async fn suspend(&self, effect: EffectDescription) -> Result<EffectOutput, SagaError> {
        let (resume, resumed) = oneshot::channel();
        self.0
            .send(Yield { effect, resume })
            .map_err(|_| SagaError::CoroutineDetached)?;
        resumed.await.map_err(|_| SagaError::CoroutineDetached)?
    }
}

// =============================================================================
// Context
// =============================================================================

/// Context handed to a workflow body.
#[derive(Clone)]
pub struct SagaContext {
    /// Effect builder bound to this saga's transaction.
    pub effects: EffectBuilder,
    scope: SagaScope,
    yielder: Yielder,
}

impl SagaContext {
    pub(crate) fn new(scope: SagaScope, yielder: Yielder) -> Self {
        Self {
            effects: EffectBuilder::new(scope.transaction_id.clone()),
            scope,
            yielder,
        }
    }

    pub fn transaction_id(&self) -> &TransactionId {
        self.scope.transaction_id()
    }

    pub fn headers(&self) -> &Headers {
        self.scope.headers()
    }

    pub fn original_message(&self) -> Option<&InboundRecord> {
        self.scope.original_message()
    }

    pub fn compensation(&self) -> Option<&Compensator> {
        self.scope.compensation()
    }

    pub fn scope(&self) -> &SagaScope {
        &self.scope
    }

    /// Yield an effect to the runtime and wait for its output.
    ///
    /// A failed effect comes back as `Err`, so ordinary `match`/`?` decides
    /// whether the workflow recovers or fails.
    pub async fn perform(&self, effect: EffectDescription) -> Result<EffectOutput, SagaError> {
        self.yielder.suspend(effect).await
    }

    pub async fn put(&self, topic: impl Into<String>, payload: Value) -> Result<(), SagaError> {
        self.perform(self.effects.put(topic, payload)).await?;
        Ok(())
    }

    pub async fn take(&self, pattern: impl Into<TopicPattern>) -> Result<Action, SagaError> {
        self.perform(self.effects.take(pattern)).await?.into_action()
    }

    pub async fn call(&self, callable: &Callable, args: Vec<Value>) -> Result<Value, SagaError> {
        self.perform(self.effects.call(callable.clone(), args))
            .await?
            .into_value()
    }

    pub async fn delay(&self, duration: Duration) -> Result<(), SagaError> {
        self.perform(self.effects.delay(duration)).await?;
        Ok(())
    }

    pub async fn action_channel(
        &self,
        pattern: impl Into<TopicPattern>,
    ) -> Result<ActionChannel, SagaError> {
        self.perform(self.effects.action_channel(pattern))
            .await?
            .into_channel()
    }

    pub async fn take_from(&self, channel: &ActionChannel) -> Result<Action, SagaError> {
        self.perform(self.effects.take_action_channel(channel))
            .await?
            .into_action()
    }

    /// Race a list of effects; resolves with the winner's output.
    pub async fn race(&self, effects: Vec<EffectDescription>) -> Result<EffectOutput, SagaError> {
        self.perform(self.effects.race(effects)).await
    }

    /// Race keyed effects; losers are `Empty` in the returned record.
    pub async fn race_record<K, I>(
        &self,
        effects: I,
    ) -> Result<BTreeMap<String, EffectOutput>, SagaError>
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, EffectDescription)>,
    {
        self.perform(self.effects.race(EffectSet::record(effects)))
            .await?
            .into_record()
    }

    pub async fn all(&self, effects: Vec<EffectDescription>) -> Result<Vec<EffectOutput>, SagaError> {
        self.perform(self.effects.all(effects)).await?.into_list()
    }

    pub async fn all_record<K, I>(
        &self,
        effects: I,
    ) -> Result<BTreeMap<String, EffectOutput>, SagaError>
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, EffectDescription)>,
    {
        self.perform(self.effects.all(EffectSet::record(effects)))
            .await?
            .into_record()
    }

    pub async fn add_compensation(&self, plan: CompensationPlan) -> Result<(), SagaError> {
        self.perform(self.effects.add_compensation(plan)).await?;
        Ok(())
    }

    pub async fn run_compensation(&self, config: CompensationConfig) -> Result<(), SagaError> {
        self.perform(self.effects.run_compensation(config)).await?;
        Ok(())
    }

    pub async fn clear_compensation(&self) -> Result<(), SagaError> {
        self.perform(self.effects.clear_compensation()).await?;
        Ok(())
    }

    pub async fn view_compensation_chain(&self) -> Result<Vec<CompensationEntry>, SagaError> {
        self.perform(self.effects.view_compensation_chain())
            .await?
            .into_chain()
    }
}

impl std::fmt::Debug for SagaContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SagaContext")
            .field("transaction_id", self.transaction_id())
            .finish()
    }
}
