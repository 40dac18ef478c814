//! Page-scoped status channel.
//!
//! Every user-visible outcome (queued, started, translated, failed, cancelled,
//! verification verdicts, retries) is reported through a
//! [`TranslationProgressCallback`] rather than thrown across into
//! presentation code. Inject one via
//! [`crate::config::TranslationConfigBuilder::progress_callback`].
//!
//! [`StatusBoard`] is a ready-made implementation that keeps the latest
//! human-readable status line per page.
//!
//! # Example
//!
//! ```rust
//! use pdftrans::{StatusBoard, TranslationProgressCallback};
//!
//! let board = StatusBoard::new();
//! board.on_page_status(3, "Queued");
//! board.on_page_error(4, "Page 4: timed out after 180s");
//! assert_eq!(board.status(3).as_deref(), Some("Queued"));
//! assert!(board.status(4).unwrap().contains("timed out"));
//! ```

use crate::verify::VerificationReport;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Called by the scheduler, processor and verifier as pages move through
/// the pipeline.
///
/// Implementations must be `Send + Sync`: pages run concurrently on tokio
/// tasks and callbacks arrive from whichever task settles. All methods have
/// default no-op implementations so callers only override what they care about.
pub trait TranslationProgressCallback: Send + Sync {
    /// Free-form progress line for a page ("Queued", "Verifying", …).
    fn on_page_status(&self, page_num: usize, status: &str) {
        let _ = (page_num, status);
    }

    /// The page was admitted and its processor started.
    fn on_page_start(&self, page_num: usize) {
        let _ = page_num;
    }

    /// The page was translated and stored.
    ///
    /// * `text_len`: byte length of the stored translation
    fn on_page_complete(&self, page_num: usize, text_len: usize) {
        let _ = (page_num, text_len);
    }

    /// The page failed (error, timeout). Cancellation is reported as a status.
    fn on_page_error(&self, page_num: usize, error: &str) {
        let _ = (page_num, error);
    }

    /// A verification run produced a persisted report.
    ///
    /// * `queued_for_retry`: the page was sent back to the queue
    fn on_verification(&self, page_num: usize, report: &VerificationReport, queued_for_retry: bool) {
        let _ = (page_num, report, queued_for_retry);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl TranslationProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::TranslationConfig`].
pub type ProgressCallback = Arc<dyn TranslationProgressCallback>;

/// Latest status line per page.
#[derive(Default)]
pub struct StatusBoard {
    lines: Mutex<BTreeMap<usize, String>>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self, page_num: usize) -> Option<String> {
        self.lines.lock().get(&page_num).cloned()
    }

    /// All pages with a status, in page order.
    pub fn snapshot(&self) -> Vec<(usize, String)> {
        self.lines
            .lock()
            .iter()
            .map(|(p, s)| (*p, s.clone()))
            .collect()
    }

    fn set(&self, page_num: usize, line: String) {
        self.lines.lock().insert(page_num, line);
    }
}

impl TranslationProgressCallback for StatusBoard {
    fn on_page_status(&self, page_num: usize, status: &str) {
        self.set(page_num, status.to_string());
    }

    fn on_page_start(&self, page_num: usize) {
        self.set(page_num, "Translating".to_string());
    }

    fn on_page_complete(&self, page_num: usize, text_len: usize) {
        self.set(page_num, format!("Translated ({text_len} bytes)"));
    }

    fn on_page_error(&self, page_num: usize, error: &str) {
        self.set(page_num, error.to_string());
    }

    fn on_verification(&self, page_num: usize, report: &VerificationReport, queued_for_retry: bool) {
        let line = if queued_for_retry {
            format!("Quality {}: queued for retry", report.severity)
        } else {
            format!("Quality {}: {}", report.severity, report.summary)
        };
        self.set(page_num, line);
    }
}

/// Fans events out to several callbacks.
pub struct FanoutProgress {
    targets: Vec<ProgressCallback>,
}

impl FanoutProgress {
    pub fn new(targets: Vec<ProgressCallback>) -> Self {
        Self { targets }
    }
}

impl TranslationProgressCallback for FanoutProgress {
    fn on_page_status(&self, page_num: usize, status: &str) {
        self.targets.iter().for_each(|t| t.on_page_status(page_num, status));
    }

    fn on_page_start(&self, page_num: usize) {
        self.targets.iter().for_each(|t| t.on_page_start(page_num));
    }

    fn on_page_complete(&self, page_num: usize, text_len: usize) {
        self.targets
            .iter()
            .for_each(|t| t.on_page_complete(page_num, text_len));
    }

    fn on_page_error(&self, page_num: usize, error: &str) {
        self.targets.iter().for_each(|t| t.on_page_error(page_num, error));
    }

    fn on_verification(&self, page_num: usize, report: &VerificationReport, queued_for_retry: bool) {
        self.targets
            .iter()
            .for_each(|t| t.on_verification(page_num, report, queued_for_retry));
    }
}
