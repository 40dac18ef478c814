//! Admission policies: which pending page may start next.

use super::state::QueueState;
use crate::store::TranslationStore;

/// What a policy may look at when deciding whether a page can start.
pub struct AdmissionContext<'a> {
    state: &'a QueueState,
    store: &'a dyn TranslationStore,
}

impl<'a> AdmissionContext<'a> {
    pub(crate) fn new(state: &'a QueueState, store: &'a dyn TranslationStore) -> Self {
        Self { state, store }
    }

    /// Pending, or waiting to be re-queued once its aborted run settles.
    pub fn is_queued(&self, page: usize) -> bool {
        self.state.is_pending(page) || self.state.awaits_resubmit(page)
    }

    pub fn is_in_flight(&self, page: usize) -> bool {
        self.state.is_in_flight(page)
    }

    pub fn is_translated(&self, page: usize) -> bool {
        self.store.is_translated(page)
    }
}

/// Dependency predicate consulted by the pump for every pending page, in
/// queue order. The first page it admits starts.
pub trait AdmissionPolicy: Send + Sync {
    fn may_admit(&self, page: usize, ctx: &AdmissionContext<'_>) -> bool;
}

/// Page `p > 1` starts only once page `p - 1` is translated, or when
/// `p - 1` is neither queued nor running (it failed, was stopped, or was
/// never requested).
#[derive(Debug, Default, Clone, Copy)]
pub struct SequentialDependency;

impl AdmissionPolicy for SequentialDependency {
    fn may_admit(&self, page: usize, ctx: &AdmissionContext<'_>) -> bool {
        if page <= 1 {
            return true;
        }
        let prev = page - 1;
        ctx.is_translated(prev) || (!ctx.is_in_flight(prev) && !ctx.is_queued(prev))
    }
}

/// Every page may start as soon as a slot is free.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unordered;

impl AdmissionPolicy for Unordered {
    fn may_admit(&self, _page: usize, _ctx: &AdmissionContext<'_>) -> bool {
        true
    }
}
