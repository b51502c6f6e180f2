//! Structured error types for the saga runtime.
//!
//! `SagaError` provides pattern-matchable errors instead of generic `anyhow::Error`.
//! Every variant belongs to exactly one class of the runtime's error taxonomy,
//! exposed through [`SagaError::kind`].
//!
//! # The Error Boundary Rule
//!
//! > **User code speaks `anyhow`, the runtime speaks `SagaError`.**
//!
//! - Workflow bodies and callables return `anyhow::Result` for ergonomics
//! - Anything the runtime itself detects is a typed `SagaError` variant
//! - `anyhow::Error` converts into [`SagaError::Workflow`] so `?` works inside
//!   workflow bodies
//!
//! # Example
//!
//! ```ignore
//! use saga_runtime::{ErrorKind, SagaError};
//!
//! match runtime.run_saga(&workflow, action, SagaOptions::default()).await {
//!     Ok(value) => tracing::info!(%value, "saga completed"),
//!     Err(e) if e.kind() == ErrorKind::Logic => tracing::error!(error = %e, "bad input"),
//!     Err(e) => return Err(e.into()),
//! }
//! ```

use std::fmt;

use thiserror::Error;

use crate::action::TransactionId;
use crate::broker::BrokerError;
use crate::publisher::PublishError;

/// Convenience alias used throughout the crate.
pub type SagaResult<T> = Result<T, SagaError>;

// =============================================================================
// Error Kind
// =============================================================================

/// Taxonomy class of a [`SagaError`].
///
/// - `Logic`: caller mistakes (duplicate transaction start, malformed input).
///   Surfaced synchronously, never retried by the runtime.
/// - `Retriable`: transient broker conditions the caller may retry.
/// - `Effect`: a yielded effect failed (publish rejected, call rejected).
///   Fed back into the workflow as a resumable exception.
/// - `Compensation`: a rollback step failed. Never suppressed.
/// - `Runtime`: the runtime itself is shutting down or was misused internally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Caller mistake detected synchronously.
    Logic,
    /// Transient broker condition.
    Retriable,
    /// Failure of a dispatched effect.
    Effect,
    /// Failure while executing a compensation chain.
    Compensation,
    /// Runtime lifecycle failure.
    Runtime,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Logic => write!(f, "logic_error"),
            ErrorKind::Retriable => write!(f, "retriable"),
            ErrorKind::Effect => write!(f, "effect_failed"),
            ErrorKind::Compensation => write!(f, "compensation_failed"),
            ErrorKind::Runtime => write!(f, "runtime_error"),
        }
    }
}

// =============================================================================
// Saga Error
// =============================================================================

/// Structured error type for saga runtime operations.
#[derive(Debug, Error)]
pub enum SagaError {
    /// `start_transaction` was called for an id that is already active.
    #[error("transaction {transaction_id} is already active")]
    DuplicateTransaction {
        /// The offending transaction id.
        transaction_id: TransactionId,
    },

    /// An observer was registered for a transaction that was never started.
    #[error("transaction {transaction_id} is not active")]
    TransactionNotActive {
        /// The transaction id that has no registry entry.
        transaction_id: TransactionId,
    },

    /// An inbound record did not parse as `{transaction_id, payload}`.
    #[error("malformed message on topic {topic}: {source}")]
    MalformedMessage {
        /// Topic the record arrived on.
        topic: String,
        /// The JSON decoding failure.
        #[source]
        source: serde_json::Error,
    },

    /// The broker collaborator failed.
    #[error("broker operation failed: {0}")]
    Broker(#[from] BrokerError),

    /// Publishing an action failed.
    #[error("publish failed: {0}")]
    Publish(#[from] PublishError),

    /// A buffer was dropped while a taker was still waiting on it.
    #[error("buffer closed before an action arrived")]
    BufferClosed,

    /// A `Call` effect's function rejected.
    #[error("call effect failed: {0}")]
    Call(#[source] anyhow::Error),

    /// A compensation step failed.
    #[error("compensation for transaction {transaction_id} failed: {source}")]
    Compensation {
        /// The transaction whose chain was being executed.
        transaction_id: TransactionId,
        /// The step failure.
        #[source]
        source: Box<SagaError>,
    },

    /// An effect output was read as the wrong shape.
    #[error("expected {expected} effect output, found {found}")]
    UnexpectedOutput {
        /// Shape the caller asked for.
        expected: &'static str,
        /// Shape actually produced.
        found: &'static str,
    },

    /// `race` was given no effects to race.
    #[error("race requires at least one effect")]
    EmptyRace,

    /// The workflow coroutine went away while the runtime was resuming it.
    #[error("workflow coroutine detached from its runner")]
    CoroutineDetached,

    /// The runtime was dropped while an effect was being dispatched.
    #[error("saga runtime has shut down")]
    RuntimeShutdown,

    /// Error raised by workflow-authored code.
    #[error(transparent)]
    Workflow(#[from] anyhow::Error),
}

impl SagaError {
    /// Return the taxonomy class of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SagaError::DuplicateTransaction { .. }
            | SagaError::TransactionNotActive { .. }
            | SagaError::MalformedMessage { .. }
            | SagaError::UnexpectedOutput { .. }
            | SagaError::EmptyRace => ErrorKind::Logic,
            SagaError::Broker(e) if e.is_retriable() => ErrorKind::Retriable,
            SagaError::Publish(PublishError::Broker(e)) if e.is_retriable() => {
                ErrorKind::Retriable
            }
            SagaError::Broker(_)
            | SagaError::Publish(_)
            | SagaError::Call(_)
            | SagaError::Workflow(_) => ErrorKind::Effect,
            SagaError::Compensation { .. } => ErrorKind::Compensation,
            SagaError::BufferClosed
            | SagaError::CoroutineDetached
            | SagaError::RuntimeShutdown => ErrorKind::Runtime,
        }
    }

    /// Returns true if this is a caller mistake rather than an I/O failure.
    pub fn is_logic_error(&self) -> bool {
        self.kind() == ErrorKind::Logic
    }

    pub(crate) fn unexpected_output(expected: &'static str, found: &'static str) -> Self {
        SagaError::UnexpectedOutput { expected, found }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_transaction_display() {
        let err = SagaError::DuplicateTransaction {
            transaction_id: TransactionId::from("tx-1"),
        };
        assert!(err.to_string().contains("already active"));
        assert!(err.to_string().contains("tx-1"));
        assert_eq!(err.kind(), ErrorKind::Logic);
    }

    #[test]
    fn test_retriable_broker_errors_are_classified() {
        let err: SagaError = BrokerError::StaleProducerSession {
            reason: "epoch fenced".into(),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::Retriable);

        let err: SagaError = PublishError::Broker(BrokerError::UnknownTopicOrPartition {
            topic: "orders".into(),
        })
        .into();
        assert_eq!(err.kind(), ErrorKind::Retriable);

        let err: SagaError = BrokerError::Request("disk full".into()).into();
        assert_eq!(err.kind(), ErrorKind::Effect);
    }

    #[test]
    fn test_compensation_error_keeps_source() {
        let err = SagaError::Compensation {
            transaction_id: TransactionId::from("tx-9"),
            source: Box::new(SagaError::Call(anyhow::anyhow!("refund service down"))),
        };
        assert_eq!(err.kind(), ErrorKind::Compensation);
        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert!(source.unwrap_or_default().contains("refund service down"));
    }

    #[test]
    fn test_anyhow_converts_to_workflow_error() {
        fn body() -> SagaResult<()> {
            Err(anyhow::anyhow!("business rule violated"))?;
            Ok(())
        }

        match body() {
            Err(SagaError::Workflow(e)) => assert_eq!(e.to_string(), "business rule violated"),
            other => panic!("expected workflow error, got {:?}", other),
        }
    }
}
