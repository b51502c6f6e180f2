//! Compensator: per-transaction chains of undo steps.
//!
//! Workflows record a [`CompensationPlan`] after each step that may need
//! undoing. When the workflow decides to roll back it runs the chain:
//!
//! | Config | Traversal |
//! |--------|-----------|
//! | `parallel` | every entry at once, completion order unspecified |
//! | default | sequential, last added first |
//! | `dont_reverse` | sequential, insertion order |
//!
//! Immediate plans run in-process (nested workflows are driven through the
//! runtime). Remote plans publish an action under the same transaction id so
//! a saga in another process can undo its part.
//!
//! Failures are never swallowed: the first failing step aborts the run and
//! its error is returned wrapped in [`SagaError::Compensation`].

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::try_join_all;
use tracing::{debug, info, warn};

use crate::action::{Action, Headers, TransactionId};
use crate::context::SagaScope;
use crate::coroutine::SagaDriver;
use crate::effect::{CompensationConfig, CompensationEntry, CompensationPlan, Invocation};
use crate::error::SagaError;
use crate::publisher::ActionPublisher;

/// Owner of every transaction's compensation chain.
#[derive(Clone)]
pub struct Compensator {
    chains: Arc<DashMap<TransactionId, Vec<CompensationEntry>>>,
    publisher: Arc<dyn ActionPublisher>,
}

impl Compensator {
    pub fn new(publisher: Arc<dyn ActionPublisher>) -> Self {
        Self {
            chains: Arc::new(DashMap::new()),
            publisher,
        }
    }

    /// Append a plan to the chain.
    pub fn add_compensation(
        &self,
        transaction_id: &TransactionId,
        plan: CompensationPlan,
        headers: Headers,
    ) {
        let mut chain = self.chains.entry(transaction_id.clone()).or_default();
        chain.push(CompensationEntry { plan, headers });
        debug!(transaction_id = %transaction_id, entries = chain.len(), "compensation added");
    }

    /// Reset the chain to empty.
    pub fn initialize_compensation_chain(&self, transaction_id: &TransactionId) {
        self.chains.insert(transaction_id.clone(), Vec::new());
    }

    /// Snapshot of the chain in insertion order.
    pub fn chain(&self, transaction_id: &TransactionId) -> Vec<CompensationEntry> {
        self.chains
            .get(transaction_id)
            .map(|chain| chain.clone())
            .unwrap_or_default()
    }

    /// Drop the chain entirely.
    pub fn discard(&self, transaction_id: &TransactionId) {
        self.chains.remove(transaction_id);
    }

    /// Execute the chain.
    ///
    /// The chain itself is left in place; clear it explicitly if the rollback
    /// should not be repeatable.
    pub async fn compensate(
        &self,
        transaction_id: &TransactionId,
        config: CompensationConfig,
        driver: &dyn SagaDriver,
        scope: &SagaScope,
    ) -> Result<(), SagaError> {
        let mut entries = self.chain(transaction_id);
        info!(
            transaction_id = %transaction_id,
            entries = entries.len(),
            parallel = config.parallel,
            reverse = !config.dont_reverse,
            "running compensation chain"
        );

        let result = if config.parallel {
            try_join_all(
                entries
                    .into_iter()
                    .map(|entry| self.execute(transaction_id, entry, driver, scope)),
            )
            .await
            .map(|_| ())
        } else {
            if !config.dont_reverse {
                entries.reverse();
            }
            self.execute_in_order(transaction_id, entries, driver, scope)
                .await
        };

        if let Err(e) = &result {
            warn!(transaction_id = %transaction_id, error = %e, "compensation failed");
        }
        result
    }

    async fn execute_in_order(
        &self,
        transaction_id: &TransactionId,
        entries: Vec<CompensationEntry>,
        driver: &dyn SagaDriver,
        scope: &SagaScope,
    ) -> Result<(), SagaError> {
        for entry in entries {
            self.execute(transaction_id, entry, driver, scope).await?;
        }
        Ok(())
    }

    async fn execute(
        &self,
        transaction_id: &TransactionId,
        entry: CompensationEntry,
        driver: &dyn SagaDriver,
        scope: &SagaScope,
    ) -> Result<(), SagaError> {
        let failed = |source: SagaError| SagaError::Compensation {
            transaction_id: transaction_id.clone(),
            source: Box::new(source),
        };

        match entry.plan {
            CompensationPlan::Immediate { handler, payload } => match handler.invoke(payload) {
                Invocation::Ready(future) => {
                    future.await.map_err(|e| failed(SagaError::Call(e)))?;
                }
                Invocation::Saga(body) => {
                    driver.drive(scope.clone(), body).await.map_err(failed)?;
                }
            },
            CompensationPlan::RemoteRetrigger { topic, payload } => {
                let action =
                    Action::new(topic, transaction_id.clone(), payload).with_headers(entry.headers);
                self.publisher
                    .put_action(action)
                    .await
                    .map_err(|e| failed(e.into()))?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Compensator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Compensator")
            .field("transactions", &self.chains.len())
            .finish()
    }
}
