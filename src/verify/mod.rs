//! Quality verifier: the second half of the retry loop.
//!
//! After a page is translated the verifier
//!
//! 1. runs a local language check ([`heuristic::check_language`]); text
//!    that is not in the target language goes straight back to the queue
//!    with a corrective instruction,
//! 2. otherwise asks a [`VerificationBackend`] for a [`VerificationReport`],
//!    sending the page image and strips of the neighbouring pages,
//! 3. on a `severe` verdict with retry budget left, synthesises an
//!    instruction ([`build_retry_instruction`]) and re-enqueues the page at
//!    the front, forced.
//!
//! Every attempt takes a new per-page run id. State changes are applied only
//! while the run id is still the page's latest, so a superseded run can
//! never overwrite fresher state. Starting a run cancels the page's previous
//! one.

pub mod heuristic;
pub mod instruction;
pub mod report;

pub use heuristic::{check_language, LanguageCheck};
pub use instruction::build_retry_instruction;
pub use report::{Annotation, Severity, VerificationReport, VerificationState};

use crate::config::VerifierConfig;
use crate::error::ProviderError;
use crate::pipeline::render::{ImageSection, PageImages};
use crate::progress::ProgressCallback;
use crate::prompts::wrong_language_instruction;
use crate::queue::{EnqueueOutcome, EnqueueRequest, Requeue};
use crate::store::{PageVerification, TranslationStore};
use async_trait::async_trait;
use edgequake_llm::ImageData;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Everything a verifier model needs to judge one page.
#[derive(Debug, Clone)]
pub struct VerificationRequest {
    pub page: usize,
    pub model: String,
    pub translated_text: String,
    pub target_language: String,
    pub source_language: Option<String>,
    pub page_image: Option<ImageData>,
    /// Bottom strip of the previous page.
    pub previous_context: Option<ImageData>,
    /// Top strip of the next page.
    pub next_context: Option<ImageData>,
}

/// Provider-specific verification pass.
#[async_trait]
pub trait VerificationBackend: Send + Sync {
    /// Whether credentials for the full pass are configured.
    fn is_configured(&self) -> bool {
        true
    }

    async fn verify(
        &self,
        request: VerificationRequest,
        cancel: CancellationToken,
    ) -> Result<VerificationReport, ProviderError>;
}

/// How one [`QualityVerifier::verify`] call ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// Verification disabled, or no credentials for the full pass.
    Skipped,
    /// Failed the language check; re-enqueued without the full pass.
    HeuristicRetry,
    /// Severe verdict; re-enqueued with a synthesised instruction.
    QueuedForRetry,
    /// Report persisted as final.
    Final(Severity),
    /// Aborted; state reset to idle.
    Cancelled,
    /// Superseded by a newer run; nothing persisted.
    Stale,
    /// Backend error or deadline; persisted as failed.
    Failed(String),
}

#[derive(Debug, Default)]
struct PageRuns {
    run_id: u64,
    auto_retries: u32,
    cancel: Option<CancellationToken>,
    /// Instruction derived from the page's latest severe report.
    severe_instruction: Option<String>,
}

/// Counts running verifications so callers can wait for quiescence.
#[derive(Default)]
struct Activity {
    running: AtomicUsize,
    idle: Notify,
}

struct ActivityGuard(Arc<Activity>);

impl Activity {
    fn enter(self: &Arc<Self>) -> ActivityGuard {
        self.running.fetch_add(1, Ordering::SeqCst);
        ActivityGuard(Arc::clone(self))
    }
}

impl Drop for ActivityGuard {
    fn drop(&mut self) {
        if self.0.running.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

pub struct QualityVerifier {
    config: VerifierConfig,
    backend: Arc<dyn VerificationBackend>,
    images: Arc<dyn PageImages>,
    store: Arc<dyn TranslationStore>,
    requeue: Arc<dyn Requeue>,
    progress: ProgressCallback,
    pages: Mutex<HashMap<usize, PageRuns>>,
    activity: Arc<Activity>,
}

impl std::fmt::Debug for QualityVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QualityVerifier")
            .field("config", &self.config)
            .field("running", &self.activity.running.load(Ordering::SeqCst))
            .finish()
    }
}

impl QualityVerifier {
    pub fn new(
        config: VerifierConfig,
        backend: Arc<dyn VerificationBackend>,
        images: Arc<dyn PageImages>,
        store: Arc<dyn TranslationStore>,
        requeue: Arc<dyn Requeue>,
        progress: ProgressCallback,
    ) -> Self {
        Self {
            config,
            backend,
            images,
            store,
            requeue,
            progress,
            pages: Mutex::new(HashMap::new()),
            activity: Arc::new(Activity::default()),
        }
    }

    pub fn config(&self) -> &VerifierConfig {
        &self.config
    }

    /// Automatic retries consumed for `page`.
    pub fn auto_retries(&self, page: usize) -> u32 {
        self.pages.lock().get(&page).map_or(0, |p| p.auto_retries)
    }

    /// Reset the automatic retry budget (manual "reanalyze").
    pub fn reset_retries(&self, page: usize) {
        self.pages.lock().entry(page).or_default().auto_retries = 0;
    }

    /// Instruction synthesised from the page's latest severe report.
    pub fn last_severe_instruction(&self, page: usize) -> Option<String> {
        self.pages
            .lock()
            .get(&page)
            .and_then(|p| p.severe_instruction.clone())
    }

    /// Cancel the page's running verification, if any.
    pub fn cancel(&self, page: usize) {
        if let Some(token) = self.pages.lock().get_mut(&page).and_then(|p| p.cancel.take()) {
            token.cancel();
        }
    }

    /// Cancel every running verification.
    ///
    /// Run ids keep counting so runs still settling are recognised as stale.
    /// Retry budgets survive; only a manual reanalyze restores them.
    pub fn abort_all(&self) {
        let mut pages = self.pages.lock();
        for runs in pages.values_mut() {
            if let Some(token) = runs.cancel.take() {
                token.cancel();
            }
            runs.run_id += 1;
            runs.severe_instruction = None;
        }
    }

    /// Run [`verify`](Self::verify) on its own task, linked to `parent`.
    ///
    /// The verification counts as running from this call on, so
    /// [`wait_idle`](Self::wait_idle) cannot miss it.
    pub fn spawn_verify(
        self: &Arc<Self>,
        page: usize,
        translated_text: String,
        force: bool,
        parent: &CancellationToken,
    ) -> JoinHandle<VerifyOutcome> {
        let guard = self.activity.enter();
        let verifier = Arc::clone(self);
        let parent = parent.clone();
        tokio::spawn(async move {
            let outcome = verifier.verify(page, &translated_text, force, &parent).await;
            drop(guard);
            outcome
        })
    }

    /// Resolves when no verification is running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.activity.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.activity.running.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    pub fn is_idle(&self) -> bool {
        self.activity.running.load(Ordering::SeqCst) == 0
    }

    /// Verify one page translation. `signal` cancels the run from outside.
    pub async fn verify(
        &self,
        page: usize,
        translated_text: &str,
        force: bool,
        signal: &CancellationToken,
    ) -> VerifyOutcome {
        if !self.config.enabled && !force {
            debug!("Page {}: verification disabled", page);
            return VerifyOutcome::Skipped;
        }
        let _guard = self.activity.enter();
        let token = signal.child_token();
        let run_id = self.begin_run(page, &token);

        let check = check_language(
            translated_text,
            &self.config.target_language,
            self.config.source_language.as_deref(),
        );
        if !check.passed {
            info!(
                "Page {}: language check failed (target ratio {:.2}, source ratio {:?})",
                page, check.target_ratio, check.source_ratio
            );
            if let Some(outcome) = self.retry_wrong_language(page, run_id) {
                return outcome;
            }
        }

        if !self.backend.is_configured() {
            debug!("Page {}: no verifier credentials, skipping full pass", page);
            self.reset_idle(page, run_id);
            return VerifyOutcome::Skipped;
        }

        self.progress.on_page_status(page, "Verifying");
        let attempt = tokio::time::timeout(self.config.timeout, async {
            let request = self.build_request(page, translated_text).await;
            self.backend.verify(request, token.clone()).await
        });
        let result = tokio::select! {
            _ = token.cancelled() => return self.cancelled(page, run_id),
            result = attempt => result,
        };

        match result {
            Err(_) => {
                token.cancel();
                let message = format!(
                    "verification timed out after {}s",
                    self.config.timeout.as_secs()
                );
                self.fail(page, run_id, message)
            }
            Ok(Err(e)) if e.is_cancelled() => self.cancelled(page, run_id),
            Ok(Err(e)) => self.fail(page, run_id, e.to_string()),
            Ok(Ok(report)) => self.apply_report(page, run_id, report),
        }
    }

    /// New run id; cancels the page's previous run and marks it verifying.
    fn begin_run(&self, page: usize, token: &CancellationToken) -> u64 {
        let mut pages = self.pages.lock();
        let runs = pages.entry(page).or_default();
        if let Some(previous) = runs.cancel.replace(token.clone()) {
            previous.cancel();
        }
        runs.run_id += 1;
        let run_id = runs.run_id;
        let previous = self.store.verification(page).unwrap_or_default();
        self.store.save_verification(
            page,
            PageVerification {
                state: VerificationState::Verifying,
                run_id,
                report: previous.report,
                error: None,
                auto_retries: runs.auto_retries,
                queued_for_retry: false,
            },
        );
        debug!("Page {}: verification run {}", page, run_id);
        run_id
    }

    /// Apply `f` only if `run_id` is still the page's latest run.
    fn with_latest<T>(&self, page: usize, run_id: u64, f: impl FnOnce(&mut PageRuns) -> T) -> Option<T> {
        let mut pages = self.pages.lock();
        match pages.get_mut(&page) {
            Some(runs) if runs.run_id == run_id => Some(f(runs)),
            _ => {
                debug!("Page {}: stale verification run {} dropped", page, run_id);
                None
            }
        }
    }

    /// Like [`with_latest`](Self::with_latest), and ends the run.
    fn commit<T>(&self, page: usize, run_id: u64, f: impl FnOnce(&mut PageRuns) -> T) -> Option<T> {
        self.with_latest(page, run_id, |runs| {
            runs.cancel = None;
            f(runs)
        })
    }

    fn retry_wrong_language(&self, page: usize, run_id: u64) -> Option<VerifyOutcome> {
        let max = self.config.max_auto_retries;
        let target = self.config.target_language.clone();
        let instruction = wrong_language_instruction(&target, self.config.source_language.as_deref());
        let report = VerificationReport {
            severity: Severity::Severe,
            summary: format!("Queued for retry: text is not in {target}"),
            ..VerificationReport::default()
        };

        let committed = self.with_latest(page, run_id, |runs| {
            if runs.auto_retries >= max {
                return false;
            }
            runs.cancel = None;
            runs.auto_retries += 1;
            self.store.save_verification(
                page,
                PageVerification {
                    state: VerificationState::Verified,
                    run_id,
                    report: Some(report.clone()),
                    error: None,
                    auto_retries: runs.auto_retries,
                    queued_for_retry: true,
                },
            );
            true
        });
        match committed {
            None => Some(VerifyOutcome::Stale),
            // Budget spent; the full pass judges the page.
            Some(false) => None,
            Some(true) => {
                self.progress.on_verification(page, &report, true);
                self.requeue_page(page, instruction);
                Some(VerifyOutcome::HeuristicRetry)
            }
        }
    }

    async fn build_request(&self, page: usize, translated_text: &str) -> VerificationRequest {
        let previous = async {
            if page > 1 {
                self.images.context_image(page - 1, ImageSection::Bottom).await
            } else {
                None
            }
        };
        let next = async {
            if page < self.images.page_count() {
                self.images.context_image(page + 1, ImageSection::Top).await
            } else {
                None
            }
        };
        let (page_image, previous_context, next_context) = tokio::join!(
            self.images.context_image(page, ImageSection::Full),
            previous,
            next
        );
        VerificationRequest {
            page,
            model: self.config.verifier_model.clone(),
            translated_text: translated_text.to_string(),
            target_language: self.config.target_language.clone(),
            source_language: self.config.source_language.clone(),
            page_image,
            previous_context,
            next_context,
        }
    }

    fn apply_report(&self, page: usize, run_id: u64, report: VerificationReport) -> VerifyOutcome {
        let max = self.config.max_auto_retries;
        let instruction = report
            .is_severe()
            .then(|| build_retry_instruction(&report, &self.config.target_language));

        let committed = self.commit(page, run_id, |runs| {
            runs.severe_instruction = instruction.clone();
            let retry = report.is_severe() && runs.auto_retries < max;
            if retry {
                runs.auto_retries += 1;
            }
            let persisted = if retry {
                VerificationReport {
                    summary: format!("Queued for retry: {}", report.summary),
                    ..report.clone()
                }
            } else {
                report.clone()
            };
            self.store.save_verification(
                page,
                PageVerification {
                    state: VerificationState::Verified,
                    run_id,
                    report: Some(persisted.clone()),
                    error: None,
                    auto_retries: runs.auto_retries,
                    queued_for_retry: retry,
                },
            );
            (retry, persisted)
        });

        let Some((retry, persisted)) = committed else {
            return VerifyOutcome::Stale;
        };
        self.progress.on_verification(page, &persisted, retry);
        match (retry, instruction) {
            (true, Some(instruction)) => {
                info!("Page {}: severe verdict, queued for retry", page);
                self.requeue_page(page, instruction);
                VerifyOutcome::QueuedForRetry
            }
            _ => {
                info!("Page {}: verified ({})", page, report.severity);
                VerifyOutcome::Final(report.severity)
            }
        }
    }

    fn fail(&self, page: usize, run_id: u64, message: String) -> VerifyOutcome {
        let committed = self.commit(page, run_id, |runs| {
            let previous = self.store.verification(page).unwrap_or_default();
            self.store.save_verification(
                page,
                PageVerification {
                    state: VerificationState::Failed,
                    run_id,
                    report: previous.report,
                    error: Some(message.clone()),
                    auto_retries: runs.auto_retries,
                    queued_for_retry: false,
                },
            );
        });
        if committed.is_none() {
            return VerifyOutcome::Stale;
        }
        warn!("Page {}: verification failed: {}", page, message);
        self.progress
            .on_page_status(page, &format!("Verification failed: {message}"));
        VerifyOutcome::Failed(message)
    }

    fn cancelled(&self, page: usize, run_id: u64) -> VerifyOutcome {
        debug!("Page {}: verification run {} cancelled", page, run_id);
        self.reset_idle(page, run_id);
        VerifyOutcome::Cancelled
    }

    fn reset_idle(&self, page: usize, run_id: u64) {
        self.commit(page, run_id, |runs| {
            let previous = self.store.verification(page).unwrap_or_default();
            self.store.save_verification(
                page,
                PageVerification {
                    state: VerificationState::Idle,
                    run_id,
                    report: previous.report,
                    error: None,
                    auto_retries: runs.auto_retries,
                    queued_for_retry: false,
                },
            );
        });
    }

    fn requeue_page(&self, page: usize, instruction: String) -> EnqueueOutcome {
        let outcome = self.requeue.requeue(
            page,
            EnqueueRequest::front().forced().with_instruction(instruction),
        );
        debug!("Page {}: requeue → {:?}", page, outcome);
        outcome
    }

    /// Operator re-run of a page whose latest report is severe.
    ///
    /// Uses the synthesised instruction and leaves the automatic retry
    /// budget untouched. Returns None when there is nothing to fix.
    pub fn fix_translation(&self, page: usize) -> Option<EnqueueOutcome> {
        let latest_severe = self
            .store
            .verification(page)
            .and_then(|v| v.report)
            .is_some_and(|r| r.is_severe());
        if !latest_severe {
            return None;
        }
        let instruction = self.last_severe_instruction(page)?;
        info!("Page {}: fix requested", page);
        Some(self.requeue_page(page, instruction))
    }
}
