//! Deferred cleanup actions.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// A deferred action, run at most once.
pub type CleanupAction = Box<dyn FnOnce() + Send + 'static>;

type RegisterFn = dyn Fn(String, CleanupAction) + Send + Sync;

/// Handle through which connectors defer work to task finalization.
#[derive(Clone)]
pub struct CleanupHandle {
    register: Arc<RegisterFn>,
}

impl std::fmt::Debug for CleanupHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupHandle").finish_non_exhaustive()
    }
}

impl CleanupHandle {
    pub fn new(register: impl Fn(String, CleanupAction) + Send + Sync + 'static) -> Self {
        Self {
            register: Arc::new(register),
        }
    }

    /// A handle that drops every action unrun.
    #[must_use]
    pub fn discard() -> Self {
        Self::new(|_, _| {})
    }

    pub fn register(&self, label: impl Into<String>, action: impl FnOnce() + Send + 'static) {
        (self.register)(label.into(), Box::new(action));
    }
}

/// Ordered list of pending actions. Draining empties it, so a second
/// pass finds nothing to run.
#[derive(Default)]
pub(crate) struct CleanupList {
    actions: Vec<(String, CleanupAction)>,
}

impl CleanupList {
    pub(crate) fn push(&mut self, label: String, action: CleanupAction) {
        self.actions.push((label, action));
    }

    pub(crate) fn len(&self) -> usize {
        self.actions.len()
    }

    pub(crate) fn drain(&mut self) -> Vec<(String, CleanupAction)> {
        std::mem::take(&mut self.actions)
    }
}

/// Run actions in registration order. A panicking action is logged and
/// does not stop the rest.
pub(crate) fn run_actions(actions: Vec<(String, CleanupAction)>) -> usize {
    let mut ran = 0;
    for (label, action) in actions {
        match catch_unwind(AssertUnwindSafe(action)) {
            Ok(()) => tracing::debug!(action = %label, "Cleanup action completed"),
            Err(_) => tracing::warn!(action = %label, "Cleanup action panicked"),
        }
        ran += 1;
    }
    ran
}
