//! Resumable workflow state machine.
//!
//! A workflow body is an ordinary `async` block. Every `ctx.perform(effect)`
//! inside it sends the effect over a channel and parks on a oneshot. The
//! [`Coroutine`] turns that into an explicit step function:
//!
//! ```text
//! resume(Start | Next(output) | Throw(error))
//!     │
//!     ├─► body parks on perform()  ──► Step::Yielded(effect)      state: Dispatching
//!     └─► body returns             ──► Step::Complete(result)     state: Completed | Failed
//! ```
//!
//! `Throw` delivers the error as the `Err` of the pending `perform`, so a
//! workflow's own `match`/`?` decides whether the failure is recovered.
//!
//! The body only makes progress inside `resume`. Between steps it is
//! suspended, which is what lets the runtime interpret one effect at a time.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::trace;

use crate::action::Action;
use crate::context::{SagaContext, SagaScope, Yield, Yielder};
use crate::effect::{EffectDescription, EffectOutput, SagaBody};
use crate::error::SagaError;

/// Input to [`Coroutine::resume`].
#[derive(Debug)]
pub enum Resume {
    /// First resume. Runs the body up to its first yield.
    Start,
    /// Resume the pending `perform` with an output.
    Next(EffectOutput),
    /// Resume the pending `perform` with an error.
    Throw(SagaError),
}

/// Output of [`Coroutine::resume`].
#[derive(Debug)]
pub enum Step {
    /// The body yielded an effect and is suspended until the next resume.
    Yielded(EffectDescription),
    /// The body returned.
    Complete(Result<Value, SagaError>),
}

/// Lifecycle of a driven workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SagaState {
    /// Body is executing or waiting to be resumed.
    Running,
    /// Body is suspended on a yielded effect the runner is evaluating.
    Dispatching,
    /// Body returned a value.
    Completed,
    /// Body returned an error.
    Failed,
}

impl SagaState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SagaState::Completed | SagaState::Failed)
    }
}

/// A workflow body wrapped as a step function.
pub struct Coroutine {
    body: Option<BoxFuture<'static, Result<Value, SagaError>>>,
    yields: mpsc::UnboundedReceiver<Yield>,
    pending: Option<oneshot::Sender<Result<EffectOutput, SagaError>>>,
    state: SagaState,
}

impl Coroutine {
    /// Construct the coroutine. The body does not run until the first resume.
    pub fn new(scope: SagaScope, body: SagaBody) -> Self {
        let (yielder, yields) = Yielder::channel();
        let ctx = SagaContext::new(scope, yielder);
        Self {
            body: Some(body(ctx)),
            yields,
            pending: None,
            state: SagaState::Running,
        }
    }

    pub fn state(&self) -> SagaState {
        self.state
    }

    /// Advance the body to its next yield or to completion.
    pub async fn resume(&mut self, input: Resume) -> Step {
        match input {
            Resume::Start => {}
            Resume::Next(output) => self.answer(Ok(output)),
            Resume::Throw(error) => self.answer(Err(error)),
        }

        let Some(body) = self.body.as_mut() else {
            return Step::Complete(Err(SagaError::CoroutineDetached));
        };
        self.state = SagaState::Running;

        let finished = tokio::select! {
            biased;
            yielded = self.yields.recv() => match yielded {
                Some(Yield { effect, resume }) => {
                    self.pending = Some(resume);
                    self.state = SagaState::Dispatching;
                    trace!(kind = %effect.kind(), "workflow yielded");
                    return Step::Yielded(effect);
                }
                // Every context clone was dropped; the body can only finish.
                None => body.await,
            },
            result = &mut *body => result,
        };

        self.body = None;
        self.state = if finished.is_ok() {
            SagaState::Completed
        } else {
            SagaState::Failed
        };
        Step::Complete(finished)
    }

    fn answer(&mut self, result: Result<EffectOutput, SagaError>) {
        if let Some(resume) = self.pending.take() {
            // The body may have been dropped between steps; nothing to resume.
            let _ = resume.send(result);
        }
    }
}

// =============================================================================
// Workflow
// =============================================================================

type WorkflowFn =
    dyn Fn(Action, SagaContext) -> BoxFuture<'static, Result<Value, SagaError>> + Send + Sync;

/// A named workflow function `(initial action, context) -> result`.
#[derive(Clone)]
pub struct Workflow {
    name: Arc<str>,
    func: Arc<WorkflowFn>,
}

impl Workflow {
    pub fn new<F, Fut>(name: impl Into<Arc<str>>, func: F) -> Self
    where
        F: Fn(Action, SagaContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, SagaError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            func: Arc::new(move |action, ctx| func(action, ctx).boxed()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bind the initial action, producing a body ready to drive.
    pub fn body(&self, action: Action) -> SagaBody {
        let func = Arc::clone(&self.func);
        Box::new(move |ctx| func(action, ctx))
    }
}

impl std::fmt::Debug for Workflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workflow").field("name", &self.name).finish()
    }
}

/// Something that can drive a saga body to completion.
#[async_trait]
pub trait SagaDriver: Send + Sync {
    async fn drive(&self, scope: SagaScope, body: SagaBody) -> Result<Value, SagaError>;
}
