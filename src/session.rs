//! The translation session: one open document and everything working on it.
//!
//! [`TranslationSession`] is the composition root. It owns the model
//! registry, the store, the scheduler and the verifier, wires them together
//! and exposes the operations a caller (the CLI, a UI) needs.
//!
//! ```text
//!                 ┌──────────── requeue (weak) ────────────┐
//!                 ▼                                        │
//! request ──▶ TranslationQueue ──▶ TranslatingProcessor ──▶ QualityVerifier
//!                 │                     │                  │
//!                 └──────── TranslationStore ◀─────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use pdftrans::{TranslationConfig, TranslationSession};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = TranslationConfig::builder()
//!         .target_language("English")
//!         .source_language("German")
//!         .build()?;
//!     let session = TranslationSession::open("scan.pdf", config).await?;
//!     session.ensure_ready().await?;
//!     session.request_selected();
//!     session.wait_until_settled().await;
//!     for page in session.translations() {
//!         println!("{}", page.text);
//!     }
//!     Ok(())
//! }
//! ```

use crate::config::{api_key_env_var, ProviderSettings, TranslationConfig};
use crate::error::TranslateError;
use crate::models::{ConnectivityProbe, ModelRegistry, Readiness};
use crate::pipeline::llm::LlmBackend;
use crate::pipeline::processor::{PageTranslator, TranslatingProcessor};
use crate::pipeline::render::{PageImages, PdfPageSource};
use crate::progress::{NoopProgressCallback, ProgressCallback};
use crate::queue::{
    AdmissionPolicy, EnqueueOutcome, EnqueueRequest, PageProcessor, QueueSnapshot, QueueStats,
    SequentialDependency, TranslationQueue, Unordered,
};
use crate::store::{MemoryStore, PageTranslation, PageVerification, TranslationStore};
use crate::verify::{QualityVerifier, VerificationBackend, VerifyOutcome};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Collaborators a session is assembled from.
///
/// [`TranslationSession::open`] builds these for a PDF file and an
/// `edgequake-llm` provider; tests and embedders pass their own.
pub struct SessionParts {
    pub images: Arc<dyn PageImages>,
    pub translator: Arc<dyn PageTranslator>,
    pub verification: Arc<dyn VerificationBackend>,
    pub probe: Arc<dyn ConnectivityProbe>,
    pub store: Arc<dyn TranslationStore>,
    pub registry: Arc<ModelRegistry>,
}

pub struct TranslationSession {
    images: Arc<dyn PageImages>,
    store: Arc<dyn TranslationStore>,
    registry: Arc<ModelRegistry>,
    probe: Arc<dyn ConnectivityProbe>,
    queue: TranslationQueue,
    verifier: Arc<QualityVerifier>,
    settings: ProviderSettings,
    verifier_model: Option<String>,
    selected: Vec<usize>,
}

impl std::fmt::Debug for TranslationSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranslationSession")
            .field("page_count", &self.images.page_count())
            .field("selected", &self.selected.len())
            .field("settings", &self.settings)
            .field("queue", &self.queue)
            .field("verifier", &self.verifier)
            .finish()
    }
}

impl TranslationSession {
    /// Open a PDF and build a session around an `edgequake-llm` provider.
    ///
    /// Fails fast, without any network call, when the active provider needs
    /// an API key and none is set.
    pub async fn open(path: impl AsRef<Path>, config: TranslationConfig) -> Result<Self, TranslateError> {
        let settings = config.provider_settings();
        if !settings.has_api_key() {
            let env_var = api_key_env_var(&settings.active_provider).unwrap_or("the provider's API key variable");
            return Err(TranslateError::MissingApiKey {
                provider: settings.active_provider,
                env_var: env_var.to_string(),
            });
        }

        let images = PdfPageSource::open(
            path,
            config.password.clone(),
            config.dpi,
            config.max_rendered_pixels,
        )
        .await?;
        let registry = Arc::new(ModelRegistry::new(config.registry_config()));
        let backend = Arc::new(LlmBackend::new(&config, Arc::clone(&registry)));
        backend.preflight()?;

        let parts = SessionParts {
            images,
            translator: backend.clone(),
            verification: backend.clone(),
            probe: backend,
            store: Arc::new(MemoryStore::new()),
            registry,
        };
        Self::with_parts(config, parts)
    }

    /// Assemble a session from explicit collaborators.
    pub fn with_parts(config: TranslationConfig, parts: SessionParts) -> Result<Self, TranslateError> {
        let SessionParts {
            images,
            translator,
            verification,
            probe,
            store,
            registry,
        } = parts;

        let page_count = images.page_count();
        let selected = config.pages.to_pages(page_count);
        if selected.is_empty() {
            return Err(TranslateError::PageOutOfRange {
                page: 0,
                total: page_count,
            });
        }

        let progress: ProgressCallback = config
            .progress_callback
            .clone()
            .unwrap_or_else(|| Arc::new(NoopProgressCallback));
        let policy: Arc<dyn AdmissionPolicy> = if config.maintain_context {
            Arc::new(SequentialDependency)
        } else {
            Arc::new(Unordered)
        };
        let verifier_config = config.verifier_config();
        let verifier_model = (config.quality_check && verifier_config.verifier_model != config.model)
            .then(|| verifier_config.verifier_model.clone());

        let mut built = None;
        let queue = TranslationQueue::new_cyclic(
            config.queue_config(),
            policy,
            Arc::clone(&store),
            Arc::clone(&progress),
            |handle| {
                let verifier = Arc::new(QualityVerifier::new(
                    verifier_config,
                    verification,
                    Arc::clone(&images),
                    Arc::clone(&store),
                    Arc::new(handle),
                    Arc::clone(&progress),
                ));
                built = Some(Arc::clone(&verifier));
                let processor: Arc<dyn PageProcessor> = Arc::new(TranslatingProcessor::new(
                    Arc::clone(&images),
                    translator,
                    Arc::clone(&store),
                    verifier,
                    Arc::clone(&progress),
                    config.maintain_context,
                ));
                processor
            },
        );
        let verifier = built.ok_or_else(|| TranslateError::Internal("queue built without a processor".into()))?;

        info!(
            "session ready: {} page(s), {} selected, concurrency {}",
            page_count,
            selected.len(),
            config.concurrency
        );
        Ok(Self {
            images,
            store,
            registry,
            probe,
            queue,
            verifier,
            settings: config.provider_settings(),
            verifier_model,
            selected,
        })
    }

    pub fn page_count(&self) -> usize {
        self.images.page_count()
    }

    /// Pages chosen by the configured [`crate::config::PageSelection`].
    pub fn selected_pages(&self) -> &[usize] {
        &self.selected
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn TranslationStore> {
        &self.store
    }

    // ── Readiness ────────────────────────────────────────────────────────

    /// Check the translation model (and a distinct verifier model) before
    /// starting work.
    pub async fn ensure_ready(&self) -> Result<Readiness, TranslateError> {
        let provider = self.settings.active_provider.as_str();
        if !self.settings.has_api_key() {
            return Err(TranslateError::MissingApiKey {
                provider: provider.to_string(),
                env_var: api_key_env_var(provider).unwrap_or("API key").to_string(),
            });
        }

        let readiness = self
            .registry
            .ensure_ready(provider, &self.settings, None, self.probe.as_ref())
            .await;
        if !readiness.ok {
            return Err(TranslateError::ProviderUnavailable {
                provider: provider.to_string(),
                model: self.settings.model.clone(),
            });
        }

        if let Some(ref model) = self.verifier_model {
            let verifier = self
                .registry
                .ensure_ready(provider, &self.settings, Some(model), self.probe.as_ref())
                .await;
            if !verifier.ok {
                return Err(TranslateError::ProviderUnavailable {
                    provider: provider.to_string(),
                    model: model.clone(),
                });
            }
        }
        Ok(readiness)
    }

    // ── Scheduling ───────────────────────────────────────────────────────

    pub fn enqueue(&self, page: usize, request: EnqueueRequest) -> Result<EnqueueOutcome, TranslateError> {
        let total = self.page_count();
        if page == 0 || page > total {
            return Err(TranslateError::PageOutOfRange { page, total });
        }
        Ok(self.queue.enqueue(page, request))
    }

    /// Request a page at the back of the queue. Translated pages are skipped.
    pub fn request_page(&self, page: usize) -> Result<EnqueueOutcome, TranslateError> {
        self.enqueue(page, EnqueueRequest::back())
    }

    /// Request several pages in order; returns how many were scheduled.
    pub fn request_pages(&self, pages: &[usize]) -> Result<usize, TranslateError> {
        let mut scheduled = 0;
        for &page in pages {
            if self.request_page(page)?.scheduled() {
                scheduled += 1;
            }
        }
        Ok(scheduled)
    }

    /// Request every selected page.
    pub fn request_selected(&self) -> usize {
        self.selected
            .iter()
            .filter(|&&page| self.queue.enqueue(page, EnqueueRequest::back()).scheduled())
            .count()
    }

    /// Translate a page again, ahead of everything else.
    pub fn retranslate(&self, page: usize, instruction: Option<String>) -> Result<EnqueueOutcome, TranslateError> {
        let request = EnqueueRequest::front().forced();
        let request = match instruction {
            Some(text) => request.with_instruction(text),
            None => request,
        };
        self.enqueue(page, request)
    }

    /// Stop a page's translation and its verification.
    pub fn stop(&self, page: usize) -> bool {
        self.verifier.cancel(page);
        self.queue.stop(page)
    }

    /// Cancel all work and reset the scheduler's counters and the retry budgets.
    pub fn abort_all(&self) {
        self.queue.abort_all();
        self.verifier.abort_all();
    }

    pub fn pause(&self) {
        self.queue.pause();
    }

    pub fn resume(&self) {
        self.queue.resume();
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.queue.queue_stats()
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        self.queue.snapshot()
    }

    // ── Quality ──────────────────────────────────────────────────────────

    /// Re-run a page with the instruction from its latest severe report.
    pub fn fix_translation(&self, page: usize) -> Option<EnqueueOutcome> {
        self.verifier.fix_translation(page)
    }

    /// Reset the page's automatic retry budget and verify its stored
    /// translation again, even if verification is disabled.
    ///
    /// Returns None when the page has no translation yet.
    pub async fn reanalyze(&self, page: usize) -> Option<VerifyOutcome> {
        let translation = self.store.translation(page)?;
        self.verifier.reset_retries(page);
        debug!("Page {}: reanalyze", page);
        let handle = self
            .verifier
            .spawn_verify(page, translation.text, true, &CancellationToken::new());
        handle.await.ok()
    }

    // ── Results ──────────────────────────────────────────────────────────

    /// Resolves once no page is pending, running, awaiting resubmission or
    /// being verified.
    ///
    /// Never resolves while the queue is paused with pages pending.
    pub async fn wait_until_settled(&self) {
        loop {
            self.queue.wait_idle().await;
            self.verifier.wait_idle().await;
            // A verification may have re-queued its page while we waited.
            if self.queue.queue_stats() == QueueStats::default() && self.verifier.is_idle() {
                return;
            }
        }
    }

    pub fn translation(&self, page: usize) -> Option<PageTranslation> {
        self.store.translation(page)
    }

    pub fn verification(&self, page: usize) -> Option<PageVerification> {
        self.store.verification(page)
    }

    /// Stored translations of the selected pages, in page order.
    pub fn translations(&self) -> Vec<PageTranslation> {
        self.selected
            .iter()
            .filter_map(|&page| self.store.translation(page))
            .collect()
    }

    /// Selected pages with no stored translation.
    pub fn missing_pages(&self) -> Vec<usize> {
        self.selected
            .iter()
            .copied()
            .filter(|&page| !self.store.is_translated(page))
            .collect()
    }
}
