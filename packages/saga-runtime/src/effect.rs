//! Effect descriptions: declarative data describing one workflow step.
//!
//! A workflow never performs I/O itself. It builds an [`EffectDescription`]
//! (usually through [`EffectBuilder`](crate::EffectBuilder)) and hands it to the
//! runtime, which interprets it and resumes the workflow with an
//! [`EffectOutput`].
//!
//! | Effect | Output |
//! |--------|--------|
//! | `Put` | `Empty` |
//! | `Take` / `TakeActionChannel` | `Action` |
//! | `Call` | `Value` |
//! | `Delay` | `Value` if a payload was given, else `Empty` |
//! | `ActionChannel` | `Channel` |
//! | `Combinator(All)` | `List` / `Record` mirroring the input |
//! | `Combinator(Race)` | winner's output (list) or `Record` with `Empty` losers |
//! | compensation ops | `Empty`, or `Chain` for `ViewCompensationChain` |

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;

use crate::action::{Action, Headers, TransactionId};
use crate::buffer::SharedBuffer;
use crate::context::SagaContext;
use crate::error::SagaError;
use crate::router::ActionObserver;

/// A workflow body ready to be driven as a coroutine.
pub type SagaBody = Box<dyn FnOnce(SagaContext) -> BoxFuture<'static, Result<Value, SagaError>> + Send>;

// =============================================================================
// Invocations
// =============================================================================

/// What a callable or compensation handler returns when invoked.
pub enum Invocation {
    /// A plain future. Awaited and its value returned.
    Ready(BoxFuture<'static, anyhow::Result<Value>>),
    /// A nested workflow. Driven through the runtime like any saga.
    Saga(SagaBody),
}

impl Invocation {
    pub fn future<F>(future: F) -> Self
    where
        F: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Invocation::Ready(future.boxed())
    }

    pub fn value(value: Value) -> Self {
        Invocation::Ready(futures::future::ready(Ok(value)).boxed())
    }

    pub fn saga<F, Fut>(body: F) -> Self
    where
        F: FnOnce(SagaContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value, SagaError>> + Send + 'static,
    {
        Invocation::Saga(Box::new(move |ctx| body(ctx).boxed()))
    }
}

impl fmt::Debug for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Invocation::Ready(_) => f.write_str("Invocation::Ready"),
            Invocation::Saga(_) => f.write_str("Invocation::Saga"),
        }
    }
}

/// A function a `Call` effect invokes with its arguments.
#[derive(Clone)]
pub struct Callable {
    name: Arc<str>,
    func: Arc<dyn Fn(Vec<Value>) -> Invocation + Send + Sync>,
}

impl Callable {
    pub fn new<F>(name: impl Into<Arc<str>>, func: F) -> Self
    where
        F: Fn(Vec<Value>) -> Invocation + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            func: Arc::new(func),
        }
    }

    /// Callable returning a plain future.
    pub fn from_async<F, Fut>(name: impl Into<Arc<str>>, func: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self::new(name, move |args| Invocation::future(func(args)))
    }

    /// Callable returning a nested workflow.
    pub fn from_saga<F, Fut>(name: impl Into<Arc<str>>, func: F) -> Self
    where
        F: Fn(Vec<Value>, SagaContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, SagaError>> + Send + 'static,
    {
        let func = Arc::new(func);
        Self::new(name, move |args| {
            let func = Arc::clone(&func);
            Invocation::saga(move |ctx| func(args, ctx))
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn invoke(&self, args: Vec<Value>) -> Invocation {
        (self.func)(args)
    }
}

impl fmt::Debug for Callable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callable").field("name", &self.name).finish()
    }
}

// =============================================================================
// Compensation data
// =============================================================================

/// Handler of an immediate compensation plan.
#[derive(Clone)]
pub struct CompensationHandler(Arc<dyn Fn(Value) -> Invocation + Send + Sync>);

impl CompensationHandler {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(Value) -> Invocation + Send + Sync + 'static,
    {
        Self(Arc::new(handler))
    }

    pub fn from_async<F, Fut>(handler: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self::new(move |payload| Invocation::future(handler(payload)))
    }

    pub fn from_saga<F, Fut>(handler: F) -> Self
    where
        F: Fn(Value, SagaContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, SagaError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        Self::new(move |payload| {
            let handler = Arc::clone(&handler);
            Invocation::saga(move |ctx| handler(payload, ctx))
        })
    }

    pub fn invoke(&self, payload: Value) -> Invocation {
        (self.0)(payload)
    }
}

impl fmt::Debug for CompensationHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CompensationHandler")
    }
}

/// How to undo one step of a saga.
#[derive(Debug, Clone)]
pub enum CompensationPlan {
    /// Invoke a handler in-process.
    Immediate {
        handler: CompensationHandler,
        payload: Value,
    },
    /// Publish an action so a saga in another process resumes under the same
    /// transaction id.
    RemoteRetrigger { topic: String, payload: Value },
}

impl CompensationPlan {
    pub fn immediate(handler: CompensationHandler, payload: Value) -> Self {
        CompensationPlan::Immediate { handler, payload }
    }

    pub fn remote(topic: impl Into<String>, payload: Value) -> Self {
        CompensationPlan::RemoteRetrigger {
            topic: topic.into(),
            payload,
        }
    }
}

/// One recorded compensation with the headers current when it was added.
#[derive(Debug, Clone)]
pub struct CompensationEntry {
    pub plan: CompensationPlan,
    pub headers: Headers,
}

/// Traversal options for running a compensation chain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompensationConfig {
    /// Run every entry concurrently.
    pub parallel: bool,
    /// Sequential runs follow insertion order instead of reverse order.
    pub dont_reverse: bool,
}

// =============================================================================
// Effect descriptions
// =============================================================================

/// One topic or several.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicPattern {
    Single(String),
    Many(Vec<String>),
}

impl TopicPattern {
    pub fn topics(&self) -> Vec<String> {
        match self {
            TopicPattern::Single(topic) => vec![topic.clone()],
            TopicPattern::Many(topics) => topics.clone(),
        }
    }
}

impl From<&str> for TopicPattern {
    fn from(topic: &str) -> Self {
        TopicPattern::Single(topic.to_string())
    }
}

impl From<String> for TopicPattern {
    fn from(topic: String) -> Self {
        TopicPattern::Single(topic)
    }
}

impl From<Vec<String>> for TopicPattern {
    fn from(topics: Vec<String>) -> Self {
        TopicPattern::Many(topics)
    }
}

impl From<Vec<&str>> for TopicPattern {
    fn from(topics: Vec<&str>) -> Self {
        TopicPattern::Many(topics.into_iter().map(str::to_string).collect())
    }
}

impl<const N: usize> From<[&str; N]> for TopicPattern {
    fn from(topics: [&str; N]) -> Self {
        TopicPattern::Many(topics.into_iter().map(str::to_string).collect())
    }
}

/// Shape of a combinator's inner effects.
#[derive(Debug, Clone)]
pub enum EffectSet {
    List(Vec<EffectDescription>),
    Record(BTreeMap<String, EffectDescription>),
}

impl EffectSet {
    pub fn record<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, EffectDescription)>,
    {
        EffectSet::Record(entries.into_iter().map(|(k, e)| (k.into(), e)).collect())
    }

    pub fn len(&self) -> usize {
        match self {
            EffectSet::List(effects) => effects.len(),
            EffectSet::Record(effects) => effects.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<Vec<EffectDescription>> for EffectSet {
    fn from(effects: Vec<EffectDescription>) -> Self {
        EffectSet::List(effects)
    }
}

impl From<BTreeMap<String, EffectDescription>> for EffectSet {
    fn from(effects: BTreeMap<String, EffectDescription>) -> Self {
        EffectSet::Record(effects)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CombinatorKind {
    Race,
    All,
}

/// Discriminator of an [`EffectDescription`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EffectKind {
    Put,
    Take,
    Call,
    Delay,
    ActionChannel,
    TakeActionChannel,
    Combinator,
    AddCompensation,
    RunCompensation,
    ClearCompensation,
    ViewCompensationChain,
}

impl EffectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EffectKind::Put => "put",
            EffectKind::Take => "take",
            EffectKind::Call => "call",
            EffectKind::Delay => "delay",
            EffectKind::ActionChannel => "action_channel",
            EffectKind::TakeActionChannel => "take_action_channel",
            EffectKind::Combinator => "combinator",
            EffectKind::AddCompensation => "add_compensation",
            EffectKind::RunCompensation => "run_compensation",
            EffectKind::ClearCompensation => "clear_compensation",
            EffectKind::ViewCompensationChain => "view_compensation_chain",
        }
    }
}

impl fmt::Display for EffectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declarative description of one workflow step, tagged with its transaction.
#[derive(Debug, Clone)]
pub enum EffectDescription {
    Put {
        transaction_id: TransactionId,
        pattern: String,
        payload: Value,
    },
    Take {
        transaction_id: TransactionId,
        patterns: TopicPattern,
        topics: Vec<String>,
        buffer: SharedBuffer,
        observer: ActionObserver,
    },
    Call {
        transaction_id: TransactionId,
        effect: Callable,
        args: Vec<Value>,
    },
    Delay {
        transaction_id: TransactionId,
        duration: Duration,
        payload: Option<Value>,
    },
    ActionChannel {
        transaction_id: TransactionId,
        pattern: TopicPattern,
        topics: Vec<String>,
        buffer: SharedBuffer,
        observer: ActionObserver,
    },
    TakeActionChannel {
        transaction_id: TransactionId,
        buffer: SharedBuffer,
        topics: Vec<String>,
    },
    Combinator {
        transaction_id: TransactionId,
        effects: EffectSet,
        combinator: CombinatorKind,
    },
    AddCompensation {
        transaction_id: TransactionId,
        plan: CompensationPlan,
    },
    RunCompensation {
        transaction_id: TransactionId,
        config: CompensationConfig,
    },
    ClearCompensation {
        transaction_id: TransactionId,
    },
    ViewCompensationChain {
        transaction_id: TransactionId,
    },
}

impl EffectDescription {
    pub fn kind(&self) -> EffectKind {
        match self {
            EffectDescription::Put { .. } => EffectKind::Put,
            EffectDescription::Take { .. } => EffectKind::Take,
            EffectDescription::Call { .. } => EffectKind::Call,
            EffectDescription::Delay { .. } => EffectKind::Delay,
            EffectDescription::ActionChannel { .. } => EffectKind::ActionChannel,
            EffectDescription::TakeActionChannel { .. } => EffectKind::TakeActionChannel,
            EffectDescription::Combinator { .. } => EffectKind::Combinator,
            EffectDescription::AddCompensation { .. } => EffectKind::AddCompensation,
            EffectDescription::RunCompensation { .. } => EffectKind::RunCompensation,
            EffectDescription::ClearCompensation { .. } => EffectKind::ClearCompensation,
            EffectDescription::ViewCompensationChain { .. } => EffectKind::ViewCompensationChain,
        }
    }

    pub fn transaction_id(&self) -> &TransactionId {
        match self {
            EffectDescription::Put { transaction_id, .. }
            | EffectDescription::Take { transaction_id, .. }
            | EffectDescription::Call { transaction_id, .. }
            | EffectDescription::Delay { transaction_id, .. }
            | EffectDescription::ActionChannel { transaction_id, .. }
            | EffectDescription::TakeActionChannel { transaction_id, .. }
            | EffectDescription::Combinator { transaction_id, .. }
            | EffectDescription::AddCompensation { transaction_id, .. }
            | EffectDescription::RunCompensation { transaction_id, .. }
            | EffectDescription::ClearCompensation { transaction_id }
            | EffectDescription::ViewCompensationChain { transaction_id } => transaction_id,
        }
    }
}

// =============================================================================
// Outputs
// =============================================================================

/// A long-lived subscription that can be taken from repeatedly.
#[derive(Debug, Clone)]
pub struct ActionChannel {
    topics: Vec<String>,
    buffer: SharedBuffer,
}

impl ActionChannel {
    pub fn new(topics: Vec<String>, buffer: SharedBuffer) -> Self {
        Self { topics, buffer }
    }

    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    pub fn buffer(&self) -> &SharedBuffer {
        &self.buffer
    }
}

/// Result of interpreting one effect.
#[derive(Debug, Clone)]
pub enum EffectOutput {
    Empty,
    Value(Value),
    Action(Action),
    Channel(ActionChannel),
    List(Vec<EffectOutput>),
    Record(BTreeMap<String, EffectOutput>),
    Chain(Vec<CompensationEntry>),
}

impl EffectOutput {
    pub fn shape(&self) -> &'static str {
        match self {
            EffectOutput::Empty => "empty",
            EffectOutput::Value(_) => "value",
            EffectOutput::Action(_) => "action",
            EffectOutput::Channel(_) => "channel",
            EffectOutput::List(_) => "list",
            EffectOutput::Record(_) => "record",
            EffectOutput::Chain(_) => "chain",
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, EffectOutput::Empty)
    }

    /// Plain value. `Empty` reads as `null`.
    pub fn into_value(self) -> Result<Value, SagaError> {
        match self {
            EffectOutput::Value(value) => Ok(value),
            EffectOutput::Empty => Ok(Value::Null),
            other => Err(SagaError::unexpected_output("value", other.shape())),
        }
    }

    pub fn into_action(self) -> Result<Action, SagaError> {
        match self {
            EffectOutput::Action(action) => Ok(action),
            other => Err(SagaError::unexpected_output("action", other.shape())),
        }
    }

    pub fn into_channel(self) -> Result<ActionChannel, SagaError> {
        match self {
            EffectOutput::Channel(channel) => Ok(channel),
            other => Err(SagaError::unexpected_output("channel", other.shape())),
        }
    }

    pub fn into_list(self) -> Result<Vec<EffectOutput>, SagaError> {
        match self {
            EffectOutput::List(outputs) => Ok(outputs),
            other => Err(SagaError::unexpected_output("list", other.shape())),
        }
    }

    pub fn into_record(self) -> Result<BTreeMap<String, EffectOutput>, SagaError> {
        match self {
            EffectOutput::Record(outputs) => Ok(outputs),
            other => Err(SagaError::unexpected_output("record", other.shape())),
        }
    }

    pub fn into_chain(self) -> Result<Vec<CompensationEntry>, SagaError> {
        match self {
            EffectOutput::Chain(entries) => Ok(entries),
            other => Err(SagaError::unexpected_output("chain", other.shape())),
        }
    }
}
