//! End barrier: every known participant must ask to end before any of them
//! is released.
//!
//! The known set can still grow while callers wait, so the release condition
//! is re-evaluated on every change to either set. Release is broadcast once
//! through a `watch` channel and is final.

use std::collections::HashSet;

use tokio::sync::{Mutex, watch};

#[derive(Debug, Default)]
struct BarrierState {
    known: HashSet<String>,
    ended: HashSet<String>,
}

impl BarrierState {
    /// `ended ⊆ known` always holds, so equal sizes means equal sets.
    fn satisfied(&self) -> bool {
        !self.known.is_empty() && self.known.len() == self.ended.len()
    }
}

/// Outcome of [`EndBarrier::request_end`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndOutcome {
    /// This call completed the barrier and released everyone.
    Released,
    /// Released by another participant's request.
    Joined,
}

#[derive(Debug)]
pub struct EndBarrier {
    state: Mutex<BarrierState>,
    released: watch::Sender<bool>,
}

impl Default for EndBarrier {
    fn default() -> Self {
        Self::new()
    }
}

impl EndBarrier {
    pub fn new() -> Self {
        let (released, _) = watch::channel(false);
        Self {
            state: Mutex::new(BarrierState::default()),
            released,
        }
    }

    /// Add a participant to the known set. Returns `true` if it was new.
    pub async fn register(&self, id: &str) -> bool {
        let mut state = self.state.lock().await;
        let inserted = state.known.insert(id.to_string());
        if inserted && self.is_released() {
            tracing::warn!(id = %id, "participant joined after the end barrier released");
        }
        self.check(&state);
        inserted
    }

    /// Mark `id` as ended and wait until every known participant has done
    /// the same. An id not yet known is registered first. Repeated calls
    /// with the same id do not change the release condition.
    ///
    /// Cancel-safe: dropping the future leaves `id` in the ended set.
    pub async fn request_end(&self, id: &str) -> EndOutcome {
        let mut rx = {
            let mut state = self.state.lock().await;
            state.known.insert(id.to_string());
            state.ended.insert(id.to_string());
            tracing::info!(
                id = %id,
                ended = state.ended.len(),
                known = state.known.len(),
                "end requested"
            );
            if self.check(&state) {
                return EndOutcome::Released;
            }
            self.released.subscribe()
        };
        // The sender lives as long as `self`, so this only fails after release.
        let _ = rx.wait_for(|released| *released).await;
        EndOutcome::Joined
    }

    /// Release waiters if the condition holds. Returns `true` only for the
    /// call that performed the release.
    fn check(&self, state: &BarrierState) -> bool {
        if self.is_released() || !state.satisfied() {
            return false;
        }
        self.released.send_replace(true);
        tracing::info!(participants = state.known.len(), "end barrier released");
        true
    }

    pub fn is_released(&self) -> bool {
        *self.released.borrow()
    }

    pub async fn known_count(&self) -> usize {
        self.state.lock().await.known.len()
    }

    pub async fn ended_count(&self) -> usize {
        self.state.lock().await.ended.len()
    }
}
