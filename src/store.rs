//! Translation store: the source of truth for "is page N translated?".
//!
//! The scheduler consults [`TranslationStore::is_translated`] for the
//! sequential-dependency rule and for skipping already-translated pages;
//! the processor writes [`PageTranslation`]s; the verifier reads them back
//! and writes [`PageVerification`] snapshots.

use crate::verify::{Annotation, VerificationReport, VerificationState};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Stored result of one successful page translation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageTranslation {
    /// 1-indexed page number.
    pub page: usize,
    pub text: String,
    /// Uncertain or illegible spans the translator flagged.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub annotations: Vec<Annotation>,
    /// Model that actually produced the text (after fallback routing).
    pub model: String,
    pub input_tokens: usize,
    pub output_tokens: usize,
    pub duration_ms: u64,
    /// 1 for the first translation, +1 for every re-translation.
    pub attempt: u32,
}

/// Persisted verification snapshot for a page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageVerification {
    pub state: VerificationState,
    pub run_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report: Option<VerificationReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Automatic quality retries consumed so far.
    pub auto_retries: u32,
    /// The page was sent back to the queue because of this report.
    pub queued_for_retry: bool,
}

/// Page-keyed persistence consumed by the scheduler, processor and verifier.
pub trait TranslationStore: Send + Sync {
    fn is_translated(&self, page: usize) -> bool {
        self.translation(page).is_some()
    }

    fn translation(&self, page: usize) -> Option<PageTranslation>;

    fn save_translation(&self, translation: PageTranslation);

    fn verification(&self, page: usize) -> Option<PageVerification>;

    fn save_verification(&self, page: usize, verification: PageVerification);

    /// Drop everything (document switch).
    fn clear(&self);
}

/// In-process store used by the session and the CLI.
#[derive(Debug, Default)]
pub struct MemoryStore {
    translations: RwLock<BTreeMap<usize, PageTranslation>>,
    verifications: RwLock<BTreeMap<usize, PageVerification>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All stored translations in page order.
    pub fn translations(&self) -> Vec<PageTranslation> {
        self.translations.read().values().cloned().collect()
    }

    /// All stored verification snapshots in page order.
    pub fn verifications(&self) -> Vec<(usize, PageVerification)> {
        self.verifications
            .read()
            .iter()
            .map(|(p, v)| (*p, v.clone()))
            .collect()
    }
}

impl TranslationStore for MemoryStore {
    fn is_translated(&self, page: usize) -> bool {
        self.translations.read().contains_key(&page)
    }

    fn translation(&self, page: usize) -> Option<PageTranslation> {
        self.translations.read().get(&page).cloned()
    }

    fn save_translation(&self, translation: PageTranslation) {
        self.translations.write().insert(translation.page, translation);
    }

    fn verification(&self, page: usize) -> Option<PageVerification> {
        self.verifications.read().get(&page).cloned()
    }

    fn save_verification(&self, page: usize, verification: PageVerification) {
        self.verifications.write().insert(page, verification);
    }

    fn clear(&self) {
        self.translations.write().clear();
        self.verifications.write().clear();
    }
}
