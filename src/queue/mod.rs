//! Translation queue / scheduler.
//!
//! Pages are requested with [`TranslationQueue::enqueue`] and started by a
//! *pump*: a bounded dispatch step that runs under the queue mutex and admits
//! pending pages while
//!
//! * the queue is not paused,
//! * fewer than `concurrency` pages are running, and
//! * the [`AdmissionPolicy`] accepts the page (by default
//!   [`SequentialDependency`]: page `p` waits for page `p - 1`).
//!
//! Each admitted page runs on its own tokio task with a fresh
//! [`CancellationToken`]. When the task settles (success, error, timeout or
//! abort) it releases its in-flight entry and runs the pump again. The pump
//! never awaits, so holding the mutex for the whole pass keeps it from ever
//! running concurrently with itself.
//!
//! The scheduler does not interpret processor results. It reports them on
//! the progress channel and keeps its bookkeeping consistent.

mod policy;
mod state;

pub use policy::{AdmissionContext, AdmissionPolicy, SequentialDependency, Unordered};

use crate::config::QueueConfig;
use crate::error::PageError;
use crate::progress::ProgressCallback;
use crate::store::TranslationStore;
use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use state::{Admission, QueueState};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Produces and stores the translation of one page.
///
/// The queue treats a call as one opaque operation. `cancel` fires when the
/// page is stopped, replaced or aborted; the queue also drops the future at
/// that point, so an implementation cannot publish results after it.
#[async_trait]
pub trait PageProcessor: Send + Sync {
    async fn process_page(
        &self,
        page: usize,
        cancel: CancellationToken,
        extra_instruction: Option<String>,
    ) -> Result<(), PageError>;
}

/// Where an enqueued page goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Front,
    #[default]
    Back,
}

/// Options for [`TranslationQueue::enqueue`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnqueueRequest {
    pub priority: Priority,
    /// Re-run even if the page is translated or running.
    pub force: bool,
    /// Consumed exactly once, at the page's next admission.
    pub extra_instruction: Option<String>,
}

impl EnqueueRequest {
    pub fn back() -> Self {
        Self::default()
    }

    pub fn front() -> Self {
        Self {
            priority: Priority::Front,
            ..Self::default()
        }
    }

    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }

    pub fn with_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.extra_instruction = Some(instruction.into());
        self
    }
}

/// What an enqueue request did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnqueueOutcome {
    /// Added to the pending list.
    Queued,
    /// Already pending; moved to the head.
    MovedToFront,
    /// Already pending; nothing changed.
    AlreadyQueued,
    /// Running and the request was not forced; ignored.
    AlreadyRunning,
    /// Translated and the request was not forced; ignored.
    AlreadyTranslated,
    /// Running run cancelled; the page re-enters the queue when it settles.
    Replaced,
    /// The queue no longer exists.
    Closed,
}

impl EnqueueOutcome {
    /// Whether the page will (re)run because of this request.
    pub fn scheduled(self) -> bool {
        matches!(
            self,
            EnqueueOutcome::Queued | EnqueueOutcome::MovedToFront | EnqueueOutcome::Replaced
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub queued: usize,
    pub active: usize,
}

/// Full view of the scheduler, for diagnostics and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueSnapshot {
    /// Pending pages in admission order.
    pub pending: Vec<usize>,
    pub in_flight: Vec<usize>,
    /// Running pages that a forced request will re-queue once they settle.
    pub awaiting_resubmit: Vec<usize>,
    pub active: usize,
    pub paused: bool,
}

/// Re-queue entry point handed to components the queue itself owns.
pub trait Requeue: Send + Sync {
    fn requeue(&self, page: usize, request: EnqueueRequest) -> EnqueueOutcome;
}

/// Non-owning handle to a [`TranslationQueue`].
///
/// Components built inside [`TranslationQueue::new_cyclic`] hold this
/// instead of the queue, so the queue → processor → verifier → queue cycle
/// does not leak.
#[derive(Clone)]
pub struct QueueHandle {
    inner: Weak<QueueInner>,
}

impl QueueHandle {
    pub fn stats(&self) -> Option<QueueStats> {
        self.inner.upgrade().map(|q| q.stats())
    }
}

impl Requeue for QueueHandle {
    fn requeue(&self, page: usize, request: EnqueueRequest) -> EnqueueOutcome {
        match self.inner.upgrade() {
            Some(inner) => inner.enqueue(page, request),
            None => EnqueueOutcome::Closed,
        }
    }
}

impl std::fmt::Debug for QueueHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueHandle")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}

/// The page scheduler.
#[derive(Clone)]
pub struct TranslationQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    config: QueueConfig,
    policy: Arc<dyn AdmissionPolicy>,
    store: Arc<dyn TranslationStore>,
    processor: Arc<dyn PageProcessor>,
    progress: ProgressCallback,
    state: Mutex<QueueState>,
    idle: Notify,
}

/// How one page run ended.
enum Settlement {
    Completed,
    Failed(PageError),
    TimedOut,
    Cancelled,
}

impl TranslationQueue {
    pub fn new(
        config: QueueConfig,
        policy: Arc<dyn AdmissionPolicy>,
        store: Arc<dyn TranslationStore>,
        progress: ProgressCallback,
        processor: Arc<dyn PageProcessor>,
    ) -> Self {
        Self::new_cyclic(config, policy, store, progress, |_| processor)
    }

    /// Build a queue whose processor needs to re-enqueue pages.
    ///
    /// `make_processor` receives a [`QueueHandle`] to this queue. The handle
    /// cannot enqueue until construction returns.
    pub fn new_cyclic<F>(
        config: QueueConfig,
        policy: Arc<dyn AdmissionPolicy>,
        store: Arc<dyn TranslationStore>,
        progress: ProgressCallback,
        make_processor: F,
    ) -> Self
    where
        F: FnOnce(QueueHandle) -> Arc<dyn PageProcessor>,
    {
        let inner = Arc::new_cyclic(|weak| QueueInner {
            processor: make_processor(QueueHandle {
                inner: weak.clone(),
            }),
            config,
            policy,
            store,
            progress,
            state: Mutex::new(QueueState::default()),
            idle: Notify::new(),
        });
        Self { inner }
    }

    pub fn handle(&self) -> QueueHandle {
        QueueHandle {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Request a page. See [`EnqueueOutcome`] for what can happen.
    pub fn enqueue(&self, page: usize, request: EnqueueRequest) -> EnqueueOutcome {
        self.inner.enqueue(page, request)
    }

    /// Cancel the page's running task and drop it from the pending list.
    ///
    /// Counters and the in-flight entry are left to the task's settlement.
    pub fn stop(&self, page: usize) -> bool {
        let (cancelled, removed) = {
            let mut state = self.inner.state.lock();
            let removed = state.remove_pending(page);
            let cancelled = match state.token(page) {
                Some(token) => {
                    token.cancel();
                    true
                }
                None => false,
            };
            self.inner.notify_if_idle(&state);
            (cancelled, removed)
        };
        if cancelled || removed {
            info!("Page {}: stopped", page);
            self.inner.progress.on_page_status(page, "Stopped");
        }
        cancelled || removed
    }

    /// Cancel everything and reset all counters (document switch, teardown).
    pub fn abort_all(&self) {
        let cancelled = {
            let mut state = self.inner.state.lock();
            let n = state.abort_all();
            self.inner.notify_if_idle(&state);
            n
        };
        info!("queue aborted ({} running page(s) cancelled)", cancelled);
    }

    pub fn pause(&self) {
        self.inner.state.lock().set_paused(true);
        debug!("queue paused");
    }

    pub fn resume(&self) {
        let mut state = self.inner.state.lock();
        state.set_paused(false);
        self.inner.pump(&mut state);
        debug!("queue resumed");
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.inner.stats()
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let state = self.inner.state.lock();
        QueueSnapshot {
            pending: state.pending_pages(),
            in_flight: state.in_flight_pages(),
            awaiting_resubmit: state.resubmit_pages(),
            active: state.active(),
            paused: state.paused(),
        }
    }

    /// Clone of the running page's cancellation token.
    pub fn in_flight_token(&self, page: usize) -> Option<CancellationToken> {
        self.inner.state.lock().token(page)
    }

    /// Resolves once nothing is pending, running or awaiting resubmission.
    ///
    /// Never resolves while the queue is paused with pages pending.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.state.lock().is_idle() {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for TranslationQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranslationQueue")
            .field("config", &self.inner.config)
            .field("stats", &self.inner.stats())
            .finish()
    }
}

impl QueueInner {
    fn stats(&self) -> QueueStats {
        let state = self.state.lock();
        QueueStats {
            queued: state.queued(),
            active: state.active(),
        }
    }

    fn enqueue(self: &Arc<Self>, page: usize, request: EnqueueRequest) -> EnqueueOutcome {
        let EnqueueRequest {
            priority,
            force,
            extra_instruction,
        } = request;

        let outcome = {
            let mut state = self.state.lock();
            let outcome = if let Some(token) = state.token(page) {
                if force {
                    token.cancel();
                    state.schedule_resubmit(page, priority, extra_instruction);
                    EnqueueOutcome::Replaced
                } else {
                    EnqueueOutcome::AlreadyRunning
                }
            } else if state.is_pending(page) {
                if force {
                    if let Some(extra) = extra_instruction {
                        state.stash_instruction(page, extra);
                    }
                }
                if force && priority == Priority::Front {
                    state.move_to_front(page);
                    EnqueueOutcome::MovedToFront
                } else {
                    EnqueueOutcome::AlreadyQueued
                }
            } else if !force && self.store.is_translated(page) {
                EnqueueOutcome::AlreadyTranslated
            } else {
                state.push(page, priority, extra_instruction);
                EnqueueOutcome::Queued
            };
            self.pump(&mut state);
            outcome
        };

        debug!("Page {}: enqueue ({:?}, force={}) → {:?}", page, priority, force, outcome);
        match outcome {
            EnqueueOutcome::Queued | EnqueueOutcome::MovedToFront => {
                self.progress.on_page_status(page, "Queued")
            }
            EnqueueOutcome::Replaced => self.progress.on_page_status(page, "Restarting"),
            _ => {}
        }
        outcome
    }

    /// Admit pages until the cap, the policy or the pending list stops us.
    fn pump(self: &Arc<Self>, state: &mut QueueState) {
        while let Some(admission) =
            state.admit_next(self.config.concurrency, self.policy.as_ref(), self.store.as_ref())
        {
            debug!(
                "Page {}: admitted (active {}/{})",
                admission.page,
                state.active(),
                self.config.concurrency
            );
            tokio::spawn(Arc::clone(self).run(admission));
        }
    }

    async fn run(self: Arc<Self>, admission: Admission) {
        let Admission {
            page,
            ticket,
            token,
            extra_instruction,
        } = admission;
        self.progress.on_page_start(page);

        let work = AssertUnwindSafe(self.processor.process_page(page, token.clone(), extra_instruction))
            .catch_unwind();
        let settlement = tokio::select! {
            _ = token.cancelled() => Settlement::Cancelled,
            outcome = tokio::time::timeout(self.config.page_timeout, work) => match outcome {
                Err(_) => {
                    token.cancel();
                    Settlement::TimedOut
                }
                Ok(Err(_)) => Settlement::Failed(PageError::TranslationFailed {
                    page,
                    detail: "page processor panicked".into(),
                }),
                Ok(Ok(Ok(()))) => Settlement::Completed,
                Ok(Ok(Err(e))) if e.is_cancelled() => Settlement::Cancelled,
                Ok(Ok(Err(e))) => Settlement::Failed(e),
            },
        };

        match settlement {
            Settlement::Completed => debug!("Page {}: settled", page),
            Settlement::Failed(e) => {
                warn!("{}", e);
                self.progress.on_page_error(page, &e.to_string());
            }
            Settlement::TimedOut => {
                let e = PageError::Timeout {
                    page,
                    secs: self.config.page_timeout.as_secs(),
                };
                warn!("{}", e);
                self.progress.on_page_error(page, &e.to_string());
            }
            Settlement::Cancelled => {
                info!("Page {}: cancelled", page);
                self.progress.on_page_status(page, "Cancelled");
            }
        }

        let mut state = self.state.lock();
        if !state.release(page, ticket) {
            debug!("Page {}: stale settlement ignored", page);
        }
        self.pump(&mut state);
        self.notify_if_idle(&state);
    }

    fn notify_if_idle(&self, state: &QueueState) {
        if state.is_idle() {
            self.idle.notify_waiters();
        }
    }
}
