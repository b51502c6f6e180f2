//! # Saga Runtime
//!
//! Long-running, multi-step distributed transactions written as straight-line
//! async workflows over a partitioned topic log.
//!
//! ## Core Concepts
//!
//! A workflow never talks to the broker. It yields **effects**, declarative
//! descriptions of one step, and the runtime interprets them:
//! - [`EffectDescription`] = what to do (publish, wait, call, delay, race, undo)
//! - [`EffectOutput`] = what came back
//!
//! Every effect carries the **transaction id** of the saga that yielded it.
//! Inbound actions are routed to observers by transaction id, so concurrent
//! sagas listening on the same topic never see each other's messages.
//!
//! ## Architecture
//!
//! ```text
//!              run_saga(workflow, action)
//!                        │
//!                        ▼
//!   Coroutine ◄──── resume(output | error) ────┐
//!       │                                      │
//!       ▼ yield effect                         │
//!   Middleware chain                           │
//!       │                                      │
//!       ▼                                      │
//!   Dispatcher ──┬─► Publisher ──► broker      │
//!                │                             │
//!                ├─► MessageRouter ◄── broker  │
//!                │        │                    │
//!                │        ▼ observer           │
//!                │     Buffer ── take ─────────┤
//!                │                             │
//!                └─► Compensator ──────────────┘
//! ```
//!
//! ## Key Invariants
//!
//! 1. **One transaction id, one active saga** - starting it twice is an error
//! 2. **Teardown always runs** - observers and compensation chains are
//!    dropped when `run_saga` returns, success or failure
//! 3. **Failures are resumable** - a failed effect is thrown into the workflow
//! 4. **Compensation failures surface** - partial rollback is never hidden
//! 5. **FIFO buffers** - the k-th take receives the k-th put
//! 6. **Only live messages** - records published before a topic is streamed
//!    are not delivered
//!
//! ## Example
//!
//! ```ignore
//! use saga_runtime::{
//!     Action, CompensationPlan, InMemoryBroker, SagaOptions, SagaRuntimeBuilder, Workflow,
//! };
//!
//! let workflow = Workflow::new("order", |action, ctx| async move {
//!     ctx.put("inventory.reserve", action.payload().clone()).await?;
//!     let reply = ctx.take(["inventory.reserved", "inventory.rejected"]).await?;
//!     if reply.topic() == "inventory.rejected" {
//!         ctx.run_compensation(Default::default()).await?;
//!         return Ok(json!("rejected"));
//!     }
//!     ctx.add_compensation(CompensationPlan::remote("inventory.release", reply.into_payload()))
//!         .await?;
//!     Ok(json!("reserved"))
//! });
//!
//! let runtime = SagaRuntimeBuilder::new(Arc::new(InMemoryBroker::new())).build();
//! runtime.connect().await?;
//! runtime.run_saga(&workflow, action, SagaOptions::default()).await?;
//! ```

// Core modules
mod action;
mod buffer;
mod builder;
mod compensation;
mod config;
mod context;
mod coroutine;
mod effect;
mod error;
mod middleware;
mod router;
mod runtime;

// Broker collaborator seam and the in-memory broker
pub mod broker;

// Outbound delivery
pub mod publisher;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;


// Re-export action types
pub use action::{Action, Headers, Identity, TransactionId, ROLES_HEADER, USER_ID_HEADER};

// Re-export broker types used by the runtime surface
pub use broker::memory::InMemoryBroker;
pub use broker::{BrokerClient, BrokerError, InboundRecord};

// Re-export buffer types
pub use buffer::{ActionChannelBuffer, Buffer, EphemeralBuffer, SharedBuffer};

// Re-export effect types
pub use builder::EffectBuilder;
pub use effect::{
    ActionChannel, Callable, CombinatorKind, CompensationConfig, CompensationEntry,
    CompensationHandler, CompensationPlan, EffectDescription, EffectKind, EffectOutput,
    EffectSet, Invocation, SagaBody, TopicPattern,
};

// Re-export workflow types
pub use context::{SagaContext, SagaScope};
pub use coroutine::{Coroutine, Resume, SagaDriver, SagaState, Step, Workflow};

// Re-export middleware types
pub use middleware::{from_fn, Dispatch, FnMiddleware, Middleware, Next, TracingMiddleware};

// Re-export component types
pub use compensation::Compensator;
pub use publisher::{ActionPublisher, ProducerBus, PublishError, ThrottleConfig, ThrottledPublisher};
pub use router::{ActionObserver, MessageRouter};

// Re-export runtime types (primary entry point)
pub use runtime::{SagaOptions, SagaRuntime, SagaRuntimeBuilder};

// Re-export config types
pub use config::{DeliveryMode, RuntimeConfig};

// Re-export error types
pub use error::{ErrorKind, SagaError, SagaResult};

// Re-export commonly used external types
pub use async_trait::async_trait;
