//! Test doubles for code built on the saga runtime.
//!
//! # Feature Flag
//!
//! This module is only available with the `testing` feature:
//!
//! ```toml
//! [dev-dependencies]
//! saga-runtime = { version = "0.1", features = ["testing"] }
//! ```
//!
//! # Recording published actions
//!
//! ```ignore
//! use saga_runtime::testing::RecordingPublisher;
//!
//! let publisher = Arc::new(RecordingPublisher::new());
//! let runtime = SagaRuntimeBuilder::new(Arc::new(InMemoryBroker::new()))
//!     .with_publisher(publisher.clone())
//!     .build();
//!
//! runtime.run_saga(&workflow, action, SagaOptions::default()).await?;
//!
//! publisher.wait_for(2).await;
//! assert_eq!(publisher.topics(), vec!["inventory.reserve", "payments.charge"]);
//! ```

use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::action::Action;
use crate::publisher::{ActionPublisher, PublishError};

/// Publisher that keeps every action in memory instead of sending it.
#[derive(Debug, Default)]
pub struct RecordingPublisher {
    published: Mutex<Vec<Action>>,
    failure: Mutex<Option<PublishError>>,
    notify: Notify,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every subsequent `put_action` with `error` until cleared.
    pub fn fail_with(&self, error: PublishError) {
        *self.failure.lock().unwrap_or_else(|e| e.into_inner()) = Some(error);
    }

    pub fn clear_failure(&self) {
        *self.failure.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Snapshot of accepted actions in publish order.
    pub fn published(&self) -> Vec<Action> {
        self.published
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn topics(&self) -> Vec<String> {
        self.published()
            .iter()
            .map(|action| action.topic().to_string())
            .collect()
    }

    /// Resolve once at least `count` actions have been accepted.
    pub async fn wait_for(&self, count: usize) {
        loop {
            let notified = self.notify.notified();
            if self.published.lock().unwrap_or_else(|e| e.into_inner()).len() >= count {
                return;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl ActionPublisher for RecordingPublisher {
    async fn connect(&self) -> Result<(), PublishError> {
        Ok(())
    }

    async fn put_action(&self, action: Action) -> Result<(), PublishError> {
        if let Some(error) = self
            .failure
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
        {
            return Err(error);
        }
        self.published
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(action);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), PublishError> {
        Ok(())
    }
}
