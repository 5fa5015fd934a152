//! Run-scoped context: cancellation, deadline and a telemetry map.
//!
//! One [`RunContext`] is created per invocation and passed explicitly to
//! everything that runs on its behalf. Clones share state.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// Reason recorded when a deadline passes.
pub const DEADLINE_EXCEEDED: &str = "deadline exceeded";

#[derive(Debug)]
struct ContextInner {
    token: CancellationToken,
    reason: Mutex<Option<String>>,
    telemetry: Mutex<BTreeMap<String, Value>>,
    deadline: Option<Instant>,
}

#[derive(Debug, Clone)]
pub struct RunContext {
    inner: Arc<ContextInner>,
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new()
    }
}

impl RunContext {
    #[must_use]
    pub fn new() -> Self {
        Self::build(None)
    }

    /// A context that reports itself cancelled once `deadline` passes.
    #[must_use]
    pub fn with_deadline(deadline: Instant) -> Self {
        Self::build(Some(deadline))
    }

    fn build(deadline: Option<Instant>) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                token: CancellationToken::new(),
                reason: Mutex::new(None),
                telemetry: Mutex::new(BTreeMap::new()),
                deadline,
            }),
        }
    }

    /// Broadcast cancellation. The first reason wins.
    pub fn cancel(&self, reason: impl Into<String>) {
        if let Ok(mut slot) = self.inner.reason.lock() {
            if slot.is_none() {
                *slot = Some(reason.into());
            }
        }
        self.inner.token.cancel();
    }

    /// Level-triggered: stays true once cancelled or past the deadline.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.token.is_cancelled() || self.deadline_passed()
    }

    fn deadline_passed(&self) -> bool {
        self.inner
            .deadline
            .is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// Why the run was cancelled, if it was.
    #[must_use]
    pub fn cancellation_reason(&self) -> Option<String> {
        if self.inner.token.is_cancelled() {
            let reason = self.inner.reason.lock().ok().and_then(|r| r.clone());
            return Some(reason.unwrap_or_else(|| "cancelled".to_string()));
        }
        if self.deadline_passed() {
            return Some(DEADLINE_EXCEEDED.to_string());
        }
        None
    }

    /// Resolves when the run is cancelled or the deadline passes.
    pub async fn cancelled(&self) {
        match self.inner.deadline {
            Some(deadline) => {
                tokio::select! {
                    () = self.inner.token.cancelled() => {}
                    () = tokio::time::sleep_until(deadline.into()) => {}
                }
            }
            None => self.inner.token.cancelled().await,
        }
    }

    pub fn set_telemetry(&self, key: impl Into<String>, value: impl Into<Value>) {
        if let Ok(mut map) = self.inner.telemetry.lock() {
            map.insert(key.into(), value.into());
        }
    }

    #[must_use]
    pub fn telemetry(&self) -> BTreeMap<String, Value> {
        self.inner
            .telemetry
            .lock()
            .map(|map| map.clone())
            .unwrap_or_default()
    }
}
