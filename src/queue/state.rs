//! Scheduler bookkeeping. Everything here runs under the queue mutex.

use super::policy::{AdmissionContext, AdmissionPolicy};
use super::Priority;
use crate::store::TranslationStore;
use std::collections::{HashMap, HashSet, VecDeque};
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
struct InFlight {
    /// Identifies the admission that created this entry.
    ticket: u64,
    token: CancellationToken,
}

/// A forced re-queue waiting for the page's aborted run to settle.
#[derive(Debug)]
struct Resubmit {
    priority: Priority,
    extra_instruction: Option<String>,
}

/// Pending list, in-flight registry and counters.
///
/// Invariants kept by every method:
/// * `active == in_flight.len()`
/// * a page is never both pending and in flight
/// * `pending` and `pending_set` hold the same pages
#[derive(Debug, Default)]
pub(crate) struct QueueState {
    pending: VecDeque<usize>,
    pending_set: HashSet<usize>,
    instructions: HashMap<usize, String>,
    in_flight: HashMap<usize, InFlight>,
    resubmits: HashMap<usize, Resubmit>,
    active: usize,
    paused: bool,
    next_ticket: u64,
}

/// A page taken off the pending list by the pump.
#[derive(Debug)]
pub(crate) struct Admission {
    pub page: usize,
    pub ticket: u64,
    pub token: CancellationToken,
    pub extra_instruction: Option<String>,
}

impl QueueState {
    pub fn is_pending(&self, page: usize) -> bool {
        self.pending_set.contains(&page)
    }

    pub fn is_in_flight(&self, page: usize) -> bool {
        self.in_flight.contains_key(&page)
    }

    pub fn awaits_resubmit(&self, page: usize) -> bool {
        self.resubmits.contains_key(&page)
    }

    pub fn active(&self) -> usize {
        self.active
    }

    pub fn paused(&self) -> bool {
        self.paused
    }

    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }

    /// Pages waiting to start, including those awaiting resubmission.
    pub fn queued(&self) -> usize {
        self.pending.len() + self.resubmits.len()
    }

    pub fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.in_flight.is_empty() && self.resubmits.is_empty()
    }

    pub fn pending_pages(&self) -> Vec<usize> {
        self.pending.iter().copied().collect()
    }

    pub fn in_flight_pages(&self) -> Vec<usize> {
        let mut pages: Vec<usize> = self.in_flight.keys().copied().collect();
        pages.sort_unstable();
        pages
    }

    pub fn resubmit_pages(&self) -> Vec<usize> {
        let mut pages: Vec<usize> = self.resubmits.keys().copied().collect();
        pages.sort_unstable();
        pages
    }

    pub fn token(&self, page: usize) -> Option<CancellationToken> {
        self.in_flight.get(&page).map(|e| e.token.clone())
    }

    /// Append or prepend a page that is neither pending nor in flight.
    pub fn push(&mut self, page: usize, priority: Priority, extra_instruction: Option<String>) {
        debug_assert!(!self.is_in_flight(page));
        if !self.pending_set.insert(page) {
            return;
        }
        match priority {
            Priority::Front => self.pending.push_front(page),
            Priority::Back => self.pending.push_back(page),
        }
        if let Some(extra) = extra_instruction {
            self.instructions.insert(page, extra);
        }
    }

    /// Move an already pending page to the head of the list.
    pub fn move_to_front(&mut self, page: usize) {
        if let Some(idx) = self.pending.iter().position(|&p| p == page) {
            self.pending.remove(idx);
            self.pending.push_front(page);
        }
    }

    /// Replace the instruction the page will consume at its next admission.
    pub fn stash_instruction(&mut self, page: usize, extra_instruction: String) {
        self.instructions.insert(page, extra_instruction);
    }

    /// Record that a forced re-queue must happen when the page's current run settles.
    ///
    /// A later request for the same page keeps `Front` if either asked for it
    /// and replaces the instruction only when it carries one.
    pub fn schedule_resubmit(&mut self, page: usize, priority: Priority, extra_instruction: Option<String>) {
        let entry = self.resubmits.entry(page).or_insert(Resubmit {
            priority,
            extra_instruction: None,
        });
        if priority == Priority::Front {
            entry.priority = Priority::Front;
        }
        if extra_instruction.is_some() {
            entry.extra_instruction = extra_instruction;
        }
    }

    /// Drop a page from the pending list (and anything waiting for it).
    pub fn remove_pending(&mut self, page: usize) -> bool {
        self.instructions.remove(&page);
        let resubmit = self.resubmits.remove(&page).is_some();
        if self.pending_set.remove(&page) {
            self.pending.retain(|&p| p != page);
            true
        } else {
            resubmit
        }
    }

    /// Register a running page. Returns its ticket.
    pub fn register(&mut self, page: usize, token: CancellationToken) -> u64 {
        self.next_ticket += 1;
        let ticket = self.next_ticket;
        self.in_flight.insert(page, InFlight { ticket, token });
        self.active += 1;
        ticket
    }

    /// Release the in-flight entry created by `ticket`.
    ///
    /// Returns false when the entry was already cleared (abort) or belongs to
    /// a newer admission; counters are left alone in that case. A pending
    /// resubmission moves to the pending list once the entry is gone.
    pub fn release(&mut self, page: usize, ticket: u64) -> bool {
        match self.in_flight.get(&page) {
            Some(entry) if entry.ticket == ticket => {}
            _ => return false,
        }
        self.in_flight.remove(&page);
        self.active = self.active.saturating_sub(1);
        if let Some(resubmit) = self.resubmits.remove(&page) {
            self.push(page, resubmit.priority, resubmit.extra_instruction);
        }
        true
    }

    /// Take the first pending page the policy admits, if a slot is free.
    pub fn admit_next(
        &mut self,
        cap: usize,
        policy: &dyn AdmissionPolicy,
        store: &dyn TranslationStore,
    ) -> Option<Admission> {
        if self.paused || self.active >= cap || self.pending.is_empty() {
            return None;
        }
        let idx = {
            let ctx = AdmissionContext::new(self, store);
            self.pending.iter().position(|&p| policy.may_admit(p, &ctx))?
        };
        let page = self.pending.remove(idx)?;
        self.pending_set.remove(&page);
        let extra_instruction = self.instructions.remove(&page);
        let token = CancellationToken::new();
        let ticket = self.register(page, token.clone());
        Some(Admission {
            page,
            ticket,
            token,
            extra_instruction,
        })
    }

    /// Cancel every in-flight token and forget everything.
    pub fn abort_all(&mut self) -> usize {
        let cancelled = self.in_flight.len();
        for entry in self.in_flight.values() {
            entry.token.cancel();
        }
        self.in_flight.clear();
        self.pending.clear();
        self.pending_set.clear();
        self.instructions.clear();
        self.resubmits.clear();
        self.active = 0;
        cancelled
    }

    #[cfg(test)]
    pub fn check_invariants(&self) {
        assert_eq!(self.active, self.in_flight.len(), "active != |in_flight|");
        assert_eq!(self.pending.len(), self.pending_set.len());
        for page in &self.pending {
            assert!(self.pending_set.contains(page));
            assert!(!self.in_flight.contains_key(page), "page {page} pending and in flight");
        }
        for page in self.resubmits.keys() {
            assert!(self.in_flight.contains_key(page), "resubmit without a running page {page}");
        }
    }
}
