//! The status store: current run state plus the latest fragment.
//!
//! Reads are available to anyone holding the store. Writes are crate-private:
//! run state is written only by the supervisor, the latest fragment only by
//! the publisher.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;
use simrelay_core::{RunId, RunState, StatusSnapshot};
use tokio::sync::watch;

#[derive(Debug, Default)]
struct StatusInner {
    state: RunState,
    latest: Option<Value>,
    run_id: Option<RunId>,
    started_at: Option<DateTime<Utc>>,
    fragments: u64,
    last_error: Option<String>,
}

/// Shared, cloneable status store.
#[derive(Debug, Clone)]
pub struct StatusStore {
    inner: Arc<RwLock<StatusInner>>,
    state_tx: Arc<watch::Sender<RunState>>,
}

impl Default for StatusStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusStore {
    /// Create a store in the `Idle` state.
    pub fn new() -> Self {
        let (state_tx, _rx) = watch::channel(RunState::Idle);
        Self {
            inner: Arc::new(RwLock::new(StatusInner::default())),
            state_tx: Arc::new(state_tx),
        }
    }

    /// Point-in-time copy of the store.
    pub fn snapshot(&self) -> StatusSnapshot {
        let inner = self.inner.read();
        StatusSnapshot {
            running: inner.state.is_active(),
            state: inner.state.clone(),
            latest: inner.latest.clone(),
            run_id: inner.run_id,
            started_at: inner.started_at,
            fragments: inner.fragments,
            last_error: inner.last_error.clone(),
        }
    }

    /// Current run state.
    pub fn state(&self) -> RunState {
        self.inner.read().state.clone()
    }

    /// Watch run state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<RunState> {
        self.state_tx.subscribe()
    }

    /// Reset for a new run and mark it `Running`.
    pub(crate) fn begin_run(&self, run_id: RunId, started_at: DateTime<Utc>) {
        {
            let mut inner = self.inner.write();
            inner.state = RunState::Running;
            inner.latest = None;
            inner.run_id = Some(run_id);
            inner.started_at = Some(started_at);
            inner.fragments = 0;
            inner.last_error = None;
        }
        self.state_tx.send_replace(RunState::Running);
    }

    /// Replace the run state of the current run.
    pub(crate) fn set_state(&self, state: RunState) {
        self.inner.write().state = state.clone();
        self.state_tx.send_replace(state);
    }

    /// Record a start failure without touching the run state.
    pub(crate) fn record_error(&self, message: impl Into<String>) {
        self.inner.write().last_error = Some(message.into());
    }

    /// Overwrite the latest fragment. Writes from a stale run are ignored.
    ///
    /// Returns false if the write was ignored.
    pub(crate) fn set_latest(&self, run_id: RunId, payload: Value) -> bool {
        let mut inner = self.inner.write();
        if inner.run_id != Some(run_id) {
            return false;
        }
        inner.latest = Some(payload);
        inner.fragments += 1;
        true
    }
}
