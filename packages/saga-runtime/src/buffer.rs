//! Buffers bridge asynchronous message arrival and a blocking "wait for next".
//!
//! # Contract
//!
//! - `put` never blocks
//! - `take` registers the caller immediately and returns a future resolved at
//!   most once
//!
//! # Variants
//!
//! | Buffer | Unmatched `put` | Unmatched `take` |
//! |--------|-----------------|------------------|
//! | [`ActionChannelBuffer`] | queued until a taker arrives | queued until an action arrives |
//! | [`EphemeralBuffer`] | discarded | waits for the next `put` |
//!
//! `ActionChannelBuffer` pairs the k-th `put` with the k-th `take`. It is the
//! default for every Take and ActionChannel effect.
//!
//! `EphemeralBuffer` broadcasts each `put` to the takers registered before it
//! and to no others.

use std::cell::Cell;
use std::collections::VecDeque;
use std::fmt;
use std::mem;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::oneshot;
use tracing::trace;

use crate::action::Action;
use crate::error::SagaError;

/// Shared handle to a buffer.
pub type SharedBuffer = Arc<dyn Buffer>;

/// Minimal put/take primitive.
pub trait Buffer: Send + Sync + fmt::Debug {
    /// Offer an action. Never blocks.
    fn put(&self, action: Action);

    /// Register a taker now and resolve with the action it is paired with.
    fn take(&self) -> BoxFuture<'static, Result<Action, SagaError>>;

    /// Returns true if no action is waiting for a taker.
    fn is_empty(&self) -> bool;
}

fn receive(rx: oneshot::Receiver<Action>) -> BoxFuture<'static, Result<Action, SagaError>> {
    async move { rx.await.map_err(|_| SagaError::BufferClosed) }.boxed()
}

// =============================================================================
// ActionChannelBuffer
// =============================================================================

/// Lossless FIFO buffer pairing actions with takers in arrival order.
#[derive(Default)]
pub struct ActionChannelBuffer {
    state: Mutex<ChannelState>,
}

#[derive(Default)]
struct ChannelState {
    actions: VecDeque<Action>,
    takers: VecDeque<oneshot::Sender<Action>>,
}

thread_local! {
    static PAIRING: Cell<bool> = const { Cell::new(false) };
}

/// Marks this thread as inside a pairing pass.
///
/// Entered before the state lock is taken, so a put or take issued from
/// inside a pass panics here instead of deadlocking on the mutex. Other
/// threads simply wait on the lock.
struct PairingPass;

impl PairingPass {
    fn enter() -> Self {
        let nested = PAIRING.with(|pairing| pairing.replace(true));
        assert!(
            !nested,
            "ActionChannelBuffer pairing pass re-entered; queue order would be corrupted"
        );
        PairingPass
    }
}

impl Drop for PairingPass {
    fn drop(&mut self) {
        PAIRING.with(|pairing| pairing.set(false));
    }
}

impl ChannelState {
    /// Pair the oldest action with the oldest live taker until one side runs
    /// out.
    fn pair_off(&mut self) {
        while !self.actions.is_empty() {
            let Some(taker) = self.takers.pop_front() else {
                break;
            };
            let Some(action) = self.actions.pop_front() else {
                break;
            };
            // A taker whose future was dropped (a race loser) hands its action
            // back to the head of the queue for the next taker.
            if let Err(action) = taker.send(action) {
                trace!("dropped taker skipped");
                self.actions.push_front(action);
            }
        }
    }
}

impl ActionChannelBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a shared handle.
    pub fn shared() -> SharedBuffer {
        Arc::new(Self::new())
    }

    /// Number of actions waiting for a taker.
    pub fn len(&self) -> usize {
        self.lock().actions.len()
    }

    /// Number of takers waiting for an action.
    pub fn pending_takers(&self) -> usize {
        self.lock()
            .takers
            .iter()
            .filter(|taker| !taker.is_closed())
            .count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Buffer for ActionChannelBuffer {
    fn put(&self, action: Action) {
        let _pass = PairingPass::enter();
        let mut state = self.lock();
        state.actions.push_back(action);
        state.pair_off();
    }

    fn take(&self) -> BoxFuture<'static, Result<Action, SagaError>> {
        let (tx, rx) = oneshot::channel();
        {
            let _pass = PairingPass::enter();
            let mut state = self.lock();
            state.takers.retain(|taker| !taker.is_closed());
            state.takers.push_back(tx);
            state.pair_off();
        }
        receive(rx)
    }

    fn is_empty(&self) -> bool {
        self.lock().actions.is_empty()
    }
}

impl fmt::Debug for ActionChannelBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("ActionChannelBuffer")
            .field("actions", &state.actions.len())
            .field("takers", &state.takers.len())
            .finish()
    }
}

// =============================================================================
// EphemeralBuffer
// =============================================================================

/// Broadcast-to-current-listeners buffer. Keeps no history.
#[derive(Default)]
pub struct EphemeralBuffer {
    takers: Mutex<Vec<oneshot::Sender<Action>>>,
}

impl EphemeralBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedBuffer {
        Arc::new(Self::new())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<oneshot::Sender<Action>>> {
        self.takers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Buffer for EphemeralBuffer {
    fn put(&self, action: Action) {
        let takers = mem::take(&mut *self.lock());
        if takers.is_empty() {
            trace!(topic = %action.topic(), "no listeners, action discarded");
            return;
        }
        for taker in takers {
            let _ = taker.send(action.clone());
        }
    }

    fn take(&self) -> BoxFuture<'static, Result<Action, SagaError>> {
        let (tx, rx) = oneshot::channel();
        self.lock().push(tx);
        receive(rx)
    }

    fn is_empty(&self) -> bool {
        true
    }
}

impl fmt::Debug for EphemeralBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EphemeralBuffer")
            .field("takers", &self.lock().len())
            .finish()
    }
}
