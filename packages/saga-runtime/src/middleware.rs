//! Middleware - wrap effect dispatch without touching workflows.
//!
//! Every effect a workflow yields passes through an ordered list of
//! middleware before reaching the dispatcher. The list is composed once, when
//! the runtime is built, into a single dispatch function.
//!
//! # Execution Order
//!
//! ```text
//! yield effect
//!  → middleware[0]   (outermost)
//!  → middleware[1]
//!  → ...
//!  → dispatcher      ← Put/Take/Call/Delay/... interpreted here
//! ```
//!
//! Each layer receives a [`Next`] continuation and may:
//! - inspect or rewrite the effect before calling `next`
//! - short-circuit by returning without calling `next`
//! - observe or transform the output on the way back
//!
//! Effects nested inside `race`/`all` re-enter the chain from the top.
//!
//! # Example
//!
//! ```ignore
//! use saga_runtime::{Middleware, Next};
//!
//! struct DenyPublishes;
//!
//! #[async_trait]
//! impl Middleware for DenyPublishes {
//!     async fn handle(&self, effect: EffectDescription, scope: SagaScope, next: Next)
//!         -> Result<EffectOutput, SagaError>
//!     {
//!         if effect.kind() == EffectKind::Put {
//!             return Ok(EffectOutput::Empty);
//!         }
//!         next.run(effect, scope).await
//!     }
//! }
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{debug, warn};

use crate::context::SagaScope;
use crate::effect::{EffectDescription, EffectOutput};
use crate::error::SagaError;

/// A composed dispatch function.
pub type Dispatch = Arc<
    dyn Fn(EffectDescription, SagaScope) -> BoxFuture<'static, Result<EffectOutput, SagaError>>
        + Send
        + Sync,
>;

/// The rest of the chain after the current middleware.
#[derive(Clone)]
pub struct Next {
    dispatch: Dispatch,
}

impl Next {
    pub async fn run(
        self,
        effect: EffectDescription,
        scope: SagaScope,
    ) -> Result<EffectOutput, SagaError> {
        (self.dispatch)(effect, scope).await
    }
}

/// One layer of the dispatch chain.
#[async_trait]
pub trait Middleware: Send + Sync + 'static {
    async fn handle(
        &self,
        effect: EffectDescription,
        scope: SagaScope,
        next: Next,
    ) -> Result<EffectOutput, SagaError>;
}

/// Fold `layers` around `terminal`. The first layer ends up outermost.
pub(crate) fn compose(layers: &[Arc<dyn Middleware>], terminal: Dispatch) -> Dispatch {
    layers.iter().rev().fold(terminal, |next, layer| {
        let layer = Arc::clone(layer);
        let dispatch: Dispatch = Arc::new(move |effect: EffectDescription, scope: SagaScope| {
            let layer = Arc::clone(&layer);
            let next = Next {
                dispatch: Arc::clone(&next),
            };
            async move { layer.handle(effect, scope, next).await }.boxed()
        });
        dispatch
    })
}

// =============================================================================
// Closure middleware
// =============================================================================

/// Middleware built from an async closure.
pub struct FnMiddleware<F> {
    func: F,
}

/// Wrap an async closure as middleware.
pub fn from_fn<F, Fut>(func: F) -> FnMiddleware<F>
where
    F: Fn(EffectDescription, SagaScope, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<EffectOutput, SagaError>> + Send + 'static,
{
    FnMiddleware { func }
}

#[async_trait]
impl<F, Fut> Middleware for FnMiddleware<F>
where
    F: Fn(EffectDescription, SagaScope, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<EffectOutput, SagaError>> + Send + 'static,
{
    async fn handle(
        &self,
        effect: EffectDescription,
        scope: SagaScope,
        next: Next,
    ) -> Result<EffectOutput, SagaError> {
        (self.func)(effect, scope, next).await
    }
}

// =============================================================================
// Tracing middleware
// =============================================================================

/// Logs every dispatched effect with its transaction id and duration.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMiddleware;

#[async_trait]
impl Middleware for TracingMiddleware {
    async fn handle(
        &self,
        effect: EffectDescription,
        scope: SagaScope,
        next: Next,
    ) -> Result<EffectOutput, SagaError> {
        let kind = effect.kind();
        let transaction_id = effect.transaction_id().clone();
        let start = Instant::now();

        let result = next.run(effect, scope).await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        match &result {
            Ok(output) => debug!(
                transaction_id = %transaction_id,
                kind = %kind,
                output = output.shape(),
                elapsed_ms,
                "effect dispatched"
            ),
            Err(e) => warn!(
                transaction_id = %transaction_id,
                kind = %kind,
                error = %e,
                elapsed_ms,
                "effect failed"
            ),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::TransactionId;
    use crate::builder::EffectBuilder;
    use crate::effect::EffectKind;
    use serde_json::json;
    use std::sync::Mutex;

    fn echo_terminal(log: Arc<Mutex<Vec<String>>>) -> Dispatch {
        Arc::new(move |effect: EffectDescription, _scope: SagaScope| {
            let log = Arc::clone(&log);
            async move {
                log.lock().unwrap().push(format!("dispatch:{}", effect.kind()));
                match effect {
                    EffectDescription::Put { payload, .. } => Ok(EffectOutput::Value(payload)),
                    _ => Ok(EffectOutput::Empty),
                }
            }
            .boxed()
        })
    }

    fn recording(log: Arc<Mutex<Vec<String>>>, name: &'static str) -> Arc<dyn Middleware> {
        Arc::new(from_fn(move |effect: EffectDescription, scope: SagaScope, next: Next| {
            let log = Arc::clone(&log);
            async move {
                log.lock().unwrap().push(format!("{name}:before"));
                let result = next.run(effect, scope).await;
                log.lock().unwrap().push(format!("{name}:after"));
                result
            }
        }))
    }

    fn scope() -> SagaScope {
        SagaScope::new(TransactionId::from("tx-mw"))
    }

    fn effects() -> EffectBuilder {
        EffectBuilder::new(TransactionId::from("tx-mw"))
    }

    #[tokio::test]
    async fn test_first_layer_is_outermost() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = compose(
            &[recording(log.clone(), "outer"), recording(log.clone(), "inner")],
            echo_terminal(log.clone()),
        );

        chain(effects().put("t", json!(1)), scope()).await.unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "outer:before",
                "inner:before",
                "dispatch:put",
                "inner:after",
                "outer:after"
            ]
        );
    }

    #[tokio::test]
    async fn test_layer_can_short_circuit() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let deny_puts: Arc<dyn Middleware> = Arc::new(from_fn(|effect: EffectDescription, scope: SagaScope, next: Next| async move {
            if effect.kind() == EffectKind::Put {
                return Ok(EffectOutput::Value(json!("blocked")));
            }
            next.run(effect, scope).await
        }));
        let chain = compose(&[deny_puts], echo_terminal(log.clone()));

        let out = chain(effects().put("t", json!(1)), scope()).await.unwrap();
        assert_eq!(out.into_value().unwrap(), json!("blocked"));
        assert!(log.lock().unwrap().is_empty());

        chain(effects().clear_compensation(), scope()).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["dispatch:clear_compensation"]);
    }

    #[tokio::test]
    async fn test_layer_can_rewrite_effect() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let rewrite: Arc<dyn Middleware> = Arc::new(from_fn(|effect: EffectDescription, scope: SagaScope, next: Next| async move {
            let effect = match effect {
                EffectDescription::Put {
                    transaction_id,
                    pattern,
                    ..
                } => EffectDescription::Put {
                    transaction_id,
                    pattern,
                    payload: json!("rewritten"),
                },
                other => other,
            };
            next.run(effect, scope).await
        }));
        let chain = compose(&[rewrite, Arc::new(TracingMiddleware)], echo_terminal(log));

        let out = chain(effects().put("t", json!("original")), scope())
            .await
            .unwrap();
        assert_eq!(out.into_value().unwrap(), json!("rewritten"));
    }

    #[tokio::test]
    async fn test_empty_chain_is_terminal() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = compose(&[], echo_terminal(log.clone()));
        chain(effects().delay(std::time::Duration::ZERO), scope())
            .await
            .unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["dispatch:delay"]);
    }
}
