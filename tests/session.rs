//! The full translate → verify → retry loop, assembled from mock parts.

use async_trait::async_trait;
use image::{DynamicImage, Rgba, RgbaImage};
use parking_lot::Mutex;
use pdftrans::{
    ConnectivityProbe, EnqueueOutcome, MemoryStore, ModelRegistry, PageError, PageImages,
    PageSelection, PageTranslator, ProviderError, QueueStats, SessionParts, Severity,
    TranslateError, TranslatedDocument, Translation, TranslationConfig,
    TranslationProgressCallback, TranslationRequest, TranslationSession, VerificationBackend,
    VerificationReport, VerificationRequest, VerificationState, VerifyOutcome,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

// ── Mocks ────────────────────────────────────────────────────────────────────

struct Pages(usize);

#[async_trait]
impl PageImages for Pages {
    fn page_count(&self) -> usize {
        self.0
    }

    async fn render_page(&self, _page: usize) -> Result<DynamicImage, PageError> {
        Ok(DynamicImage::ImageRgba8(RgbaImage::from_pixel(
            8,
            8,
            Rgba([255, 255, 255, 255]),
        )))
    }
}

#[derive(Debug, Clone)]
struct Seen {
    page: usize,
    previous_page: Option<String>,
    extra_instruction: Option<String>,
}

#[derive(Default)]
struct Translator {
    seen: Mutex<Vec<Seen>>,
    /// Block until cancelled instead of answering.
    hold: bool,
}

impl Translator {
    fn seen_for(&self, page: usize) -> Vec<Seen> {
        self.seen.lock().iter().filter(|s| s.page == page).cloned().collect()
    }
}

#[async_trait]
impl PageTranslator for Translator {
    async fn translate(
        &self,
        request: TranslationRequest,
        cancel: CancellationToken,
    ) -> Result<Translation, ProviderError> {
        let attempt = {
            let mut seen = self.seen.lock();
            seen.push(Seen {
                page: request.page,
                previous_page: request.previous_page.clone(),
                extra_instruction: request.extra_instruction.clone(),
            });
            seen.iter().filter(|s| s.page == request.page).count()
        };
        if self.hold {
            cancel.cancelled().await;
            return Err(ProviderError::Cancelled);
        }
        Ok(Translation {
            text: format!("Translated page {}, attempt {}", request.page, attempt),
            annotations: vec![],
            model: "vision-1".into(),
            input_tokens: 1000,
            output_tokens: 200,
        })
    }
}

/// Pops scripted reports per page; an empty script answers `ok`.
#[derive(Default)]
struct Verifier {
    scripts: Mutex<HashMap<usize, VecDeque<VerificationReport>>>,
    always: Mutex<HashMap<usize, VerificationReport>>,
    calls: AtomicUsize,
}

impl Verifier {
    fn script(&self, page: usize, reports: Vec<VerificationReport>) {
        self.scripts.lock().insert(page, reports.into());
    }
}

#[async_trait]
impl VerificationBackend for Verifier {
    async fn verify(
        &self,
        request: VerificationRequest,
        _cancel: CancellationToken,
    ) -> Result<VerificationReport, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        assert_eq!(request.model, "checker");
        assert!(request.page_image.is_some());
        if let Some(report) = self.always.lock().get(&request.page) {
            return Ok(report.clone());
        }
        let scripted = self
            .scripts
            .lock()
            .get_mut(&request.page)
            .and_then(|q| q.pop_front());
        Ok(scripted.unwrap_or_else(|| VerificationReport::ok("faithful")))
    }
}

#[derive(Default)]
struct Probe {
    calls: AtomicUsize,
    broken_model: Option<String>,
}

#[async_trait]
impl ConnectivityProbe for Probe {
    async fn probe(&self, _provider: &str, model: &str) -> Result<bool, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.broken_model.as_deref() != Some(model))
    }
}

#[derive(Default)]
struct Verdicts {
    events: Mutex<Vec<(usize, Severity, String, bool)>>,
}

impl TranslationProgressCallback for Verdicts {
    fn on_verification(&self, page_num: usize, report: &VerificationReport, queued_for_retry: bool) {
        self.events
            .lock()
            .push((page_num, report.severity, report.summary.clone(), queued_for_retry));
    }
}

fn severe(summary: &str) -> VerificationReport {
    VerificationReport {
        severity: Severity::Severe,
        summary: summary.into(),
        evidence: vec!["the second table is missing".into()],
        ..VerificationReport::default()
    }
}

struct Harness {
    session: TranslationSession,
    translator: Arc<Translator>,
    verifier: Arc<Verifier>,
    probe: Arc<Probe>,
    verdicts: Arc<Verdicts>,
}

/// `RUST_LOG=pdftrans=debug cargo test --test session -- --nocapture` shows
/// the scheduler and verifier logs.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn harness_with(
    pages: usize,
    configure: impl FnOnce(pdftrans::TranslationConfigBuilder) -> pdftrans::TranslationConfigBuilder,
    translator: Translator,
    verifier: Verifier,
    probe: Probe,
) -> Harness {
    init_tracing();
    let verdicts = Arc::new(Verdicts::default());
    let builder = TranslationConfig::builder()
        .target_language("en")
        .provider_name("ollama")
        .model("vision-1")
        .verifier_model("checker")
        .concurrency(2)
        .max_auto_retries(1)
        .progress_callback(verdicts.clone());
    let config = configure(builder).build().unwrap();

    let translator = Arc::new(translator);
    let verifier = Arc::new(verifier);
    let probe = Arc::new(probe);
    let registry = Arc::new(ModelRegistry::new(config.registry_config()));
    let session = TranslationSession::with_parts(
        config,
        SessionParts {
            images: Arc::new(Pages(pages)),
            translator: translator.clone(),
            verification: verifier.clone(),
            probe: probe.clone(),
            store: Arc::new(MemoryStore::new()),
            registry,
        },
    )
    .unwrap();
    Harness {
        session,
        translator,
        verifier,
        probe,
        verdicts,
    }
}

fn harness(pages: usize, verifier: Verifier) -> Harness {
    harness_with(pages, |b| b, Translator::default(), verifier, Probe::default())
}

// ── Readiness ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn readiness_probes_both_models_once() {
    let h = harness(1, Verifier::default());
    let first = h.session.ensure_ready().await.unwrap();
    assert!(first.ok);
    assert!(!first.from_cache);
    assert_eq!(h.probe.calls.load(Ordering::SeqCst), 2);

    let second = h.session.ensure_ready().await.unwrap();
    assert!(second.from_cache);
    assert_eq!(h.probe.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn unreachable_verifier_model_is_reported() {
    let probe = Probe {
        broken_model: Some("checker".into()),
        ..Probe::default()
    };
    let h = harness_with(1, |b| b, Translator::default(), Verifier::default(), probe);
    match h.session.ensure_ready().await {
        Err(TranslateError::ProviderUnavailable { model, .. }) => assert_eq!(model, "checker"),
        other => panic!("expected ProviderUnavailable, got {other:?}"),
    }
}

// ── Translation ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn translates_every_page_with_previous_page_context() {
    let h = harness(3, Verifier::default());
    assert_eq!(h.session.request_selected(), 3);
    h.session.wait_until_settled().await;

    assert!(h.session.missing_pages().is_empty());
    let texts: Vec<_> = h.session.translations().into_iter().map(|t| t.text).collect();
    assert_eq!(
        texts,
        vec![
            "Translated page 1, attempt 1\n",
            "Translated page 2, attempt 1\n",
            "Translated page 3, attempt 1\n",
        ]
    );
    assert_eq!(h.translator.seen_for(1)[0].previous_page, None);
    assert_eq!(
        h.translator.seen_for(2)[0].previous_page.as_deref(),
        Some("Translated page 1, attempt 1\n")
    );

    for page in 1..=3 {
        let v = h.session.verification(page).unwrap();
        assert_eq!(v.state, VerificationState::Verified);
        assert_eq!(v.report.unwrap().severity, Severity::Ok);
    }
    assert_eq!(h.verifier.calls.load(Ordering::SeqCst), 3);
    assert_eq!(h.session.queue_stats(), QueueStats::default());
}

#[tokio::test]
async fn only_selected_pages_are_requested() {
    let h = harness_with(
        6,
        |b| b.pages(PageSelection::Set(vec![2, 5])).maintain_context(false),
        Translator::default(),
        Verifier::default(),
        Probe::default(),
    );
    assert_eq!(h.session.selected_pages(), &[2, 5]);
    assert_eq!(h.session.request_selected(), 2);
    h.session.wait_until_settled().await;

    assert_eq!(h.session.missing_pages(), Vec::<usize>::new());
    assert!(h.session.translation(1).is_none());
    // Without context no previous page is sent.
    assert_eq!(h.translator.seen_for(5)[0].previous_page, None);

    let doc = TranslatedDocument::from_session(&h.session, "scan.pdf");
    assert_eq!(doc.stats.translated_pages, 2);
    assert_eq!(doc.stats.total_input_tokens, 2000);
    assert!(doc.to_markdown().starts_with("<!-- page 2 -->\n\nTranslated page 2"));
}

#[tokio::test]
async fn out_of_range_pages_are_rejected() {
    let h = harness(3, Verifier::default());
    assert!(matches!(
        h.session.request_page(0),
        Err(TranslateError::PageOutOfRange { page: 0, total: 3 })
    ));
    assert!(matches!(
        h.session.request_pages(&[1, 4]),
        Err(TranslateError::PageOutOfRange { page: 4, total: 3 })
    ));
    h.session.abort_all();
}

#[tokio::test]
async fn retranslate_carries_the_operator_instruction() {
    let h = harness(2, Verifier::default());
    h.session.request_page(1).unwrap();
    h.session.wait_until_settled().await;
    assert_eq!(h.session.request_page(1).unwrap(), EnqueueOutcome::AlreadyTranslated);

    let outcome = h
        .session
        .retranslate(1, Some("Keep the letterhead in the original language.".into()))
        .unwrap();
    assert_eq!(outcome, EnqueueOutcome::Queued);
    h.session.wait_until_settled().await;

    let seen = h.translator.seen_for(1);
    assert_eq!(seen.len(), 2);
    assert_eq!(
        seen[1].extra_instruction.as_deref(),
        Some("Keep the letterhead in the original language.")
    );
    let stored = h.session.translation(1).unwrap();
    assert_eq!(stored.attempt, 2);
    assert_eq!(stored.text, "Translated page 1, attempt 2\n");
}

// ── Quality loop ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn severe_verdict_requeues_once_with_an_instruction() {
    let verifier = Verifier::default();
    verifier.script(2, vec![severe("table dropped")]);
    let h = harness(3, verifier);
    h.session.request_selected();
    h.session.wait_until_settled().await;

    let seen = h.translator.seen_for(2);
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].extra_instruction, None);
    let instruction = seen[1].extra_instruction.clone().unwrap();
    assert!(instruction.contains("table dropped"), "got: {instruction}");
    assert!(instruction.contains("the second table is missing"), "got: {instruction}");

    let events: Vec<_> = h
        .verdicts
        .events
        .lock()
        .iter()
        .filter(|e| e.0 == 2)
        .cloned()
        .collect();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].1, Severity::Severe);
    assert!(events[0].2.starts_with("Queued for retry"), "got: {}", events[0].2);
    assert!(events[0].3);
    assert_eq!(events[1].1, Severity::Ok);
    assert!(!events[1].3);

    let v = h.session.verification(2).unwrap();
    assert_eq!(v.state, VerificationState::Verified);
    assert_eq!(v.auto_retries, 1);
    assert!(!v.queued_for_retry);
    assert_eq!(h.session.translation(2).unwrap().attempt, 2);
    // Other pages were not retried.
    assert_eq!(h.translator.seen_for(1).len(), 1);
    assert_eq!(h.translator.seen_for(3).len(), 1);
}

#[tokio::test]
async fn automatic_retries_are_bounded_and_fix_reruns_on_demand() {
    let verifier = Verifier::default();
    verifier.always.lock().insert(1, severe("half the page is missing"));
    let h = harness(1, verifier);
    h.session.request_selected();
    h.session.wait_until_settled().await;

    // One automatic retry, then the severe report is final.
    assert_eq!(h.translator.seen_for(1).len(), 2);
    let v = h.session.verification(1).unwrap();
    assert_eq!(v.report.as_ref().unwrap().severity, Severity::Severe);
    assert_eq!(v.report.unwrap().summary, "half the page is missing");
    assert!(!v.queued_for_retry);
    assert_eq!(v.auto_retries, 1);

    let outcome = h.session.fix_translation(1).unwrap();
    assert_eq!(outcome, EnqueueOutcome::Queued);
    h.session.wait_until_settled().await;

    let seen = h.translator.seen_for(1);
    assert_eq!(seen.len(), 3);
    assert!(seen[2].extra_instruction.as_deref().unwrap().contains("half the page is missing"));
    // The manual fix does not spend the automatic budget.
    assert_eq!(h.session.verification(1).unwrap().auto_retries, 1);
}

#[tokio::test]
async fn fix_translation_needs_a_severe_report() {
    let h = harness(1, Verifier::default());
    h.session.request_selected();
    h.session.wait_until_settled().await;
    assert_eq!(h.session.fix_translation(1), None);
}

#[tokio::test]
async fn reanalyze_runs_even_with_quality_check_off() {
    let h = harness_with(
        2,
        |b| b.quality_check(false),
        Translator::default(),
        Verifier::default(),
        Probe::default(),
    );
    h.session.request_page(1).unwrap();
    h.session.wait_until_settled().await;
    assert!(h.session.verification(1).is_none());
    assert_eq!(h.verifier.calls.load(Ordering::SeqCst), 0);

    let outcome = h.session.reanalyze(1).await;
    assert_eq!(outcome, Some(VerifyOutcome::Final(Severity::Ok)));
    assert_eq!(
        h.session.verification(1).unwrap().state,
        VerificationState::Verified
    );
    assert_eq!(h.session.reanalyze(2).await, None);
}

// ── Cancellation ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn abort_all_cancels_running_pages() {
    let translator = Translator {
        hold: true,
        ..Translator::default()
    };
    let h = harness_with(
        4,
        |b| b.maintain_context(false),
        translator,
        Verifier::default(),
        Probe::default(),
    );
    h.session.request_selected();
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
    assert_eq!(h.session.queue_stats(), QueueStats { queued: 2, active: 2 });

    h.session.abort_all();
    assert_eq!(h.session.queue_stats(), QueueStats::default());
    h.session.wait_until_settled().await;
    assert_eq!(h.session.missing_pages(), vec![1, 2, 3, 4]);
}

#[tokio::test]
async fn stopped_page_is_not_stored() {
    let translator = Translator {
        hold: true,
        ..Translator::default()
    };
    let h = harness_with(2, |b| b, translator, Verifier::default(), Probe::default());
    h.session.request_page(1).unwrap();
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
    assert!(h.session.stop(1));
    h.session.wait_until_settled().await;
    assert!(h.session.translation(1).is_none());
    assert_eq!(h.session.queue_stats(), QueueStats::default());
}
