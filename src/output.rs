//! Assembled results of a session and their on-disk forms.

use crate::error::TranslateError;
use crate::session::TranslationSession;
use crate::store::{PageTranslation, PageVerification};
use crate::verify::{Annotation, Severity};
use serde::Serialize;
use std::path::Path;

/// One selected page in the final document.
#[derive(Debug, Clone, Serialize)]
pub struct PageOutput {
    pub page: usize,
    /// None when the page never produced a translation.
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub attempt: u32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub annotations: Vec<Annotation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification: Option<PageVerification>,
}

impl PageOutput {
    fn new(page: usize, translation: Option<PageTranslation>, verification: Option<PageVerification>) -> Self {
        match translation {
            Some(t) => Self {
                page,
                text: Some(t.text),
                model: Some(t.model),
                attempt: t.attempt,
                annotations: t.annotations,
                verification,
            },
            None => Self {
                page,
                text: None,
                model: None,
                attempt: 0,
                annotations: Vec::new(),
                verification,
            },
        }
    }

    fn severity(&self) -> Option<Severity> {
        self.verification
            .as_ref()
            .and_then(|v| v.report.as_ref())
            .map(|r| r.severity)
    }
}

/// Aggregate numbers for a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TranslationStats {
    pub selected_pages: usize,
    pub translated_pages: usize,
    pub missing_pages: Vec<usize>,
    /// Pages whose latest verification verdict is severe.
    pub severe_pages: Vec<usize>,
    pub total_input_tokens: usize,
    pub total_output_tokens: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct TranslatedDocument {
    pub source: String,
    pub pages: Vec<PageOutput>,
    pub stats: TranslationStats,
}

impl TranslatedDocument {
    /// Collect the selected pages of a session, in page order.
    pub fn from_session(session: &TranslationSession, source: impl Into<String>) -> Self {
        let entries = session
            .selected_pages()
            .iter()
            .map(|&page| (page, session.translation(page), session.verification(page)))
            .collect();
        Self::from_entries(source, entries)
    }

    fn from_entries(
        source: impl Into<String>,
        entries: Vec<(usize, Option<PageTranslation>, Option<PageVerification>)>,
    ) -> Self {
        let mut stats = TranslationStats {
            selected_pages: entries.len(),
            ..TranslationStats::default()
        };
        let pages: Vec<PageOutput> = entries
            .into_iter()
            .map(|(page, translation, verification)| {
                if let Some(ref t) = translation {
                    stats.translated_pages += 1;
                    stats.total_input_tokens += t.input_tokens;
                    stats.total_output_tokens += t.output_tokens;
                } else {
                    stats.missing_pages.push(page);
                }
                PageOutput::new(page, translation, verification)
            })
            .collect();
        stats.severe_pages = pages
            .iter()
            .filter(|p| p.severity() == Some(Severity::Severe))
            .map(|p| p.page)
            .collect();

        Self {
            source: source.into(),
            pages,
            stats,
        }
    }

    /// Markdown with an HTML comment marking the start of every page.
    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        for page in &self.pages {
            if !out.is_empty() {
                out.push('\n');
            }
            match page.text {
                Some(ref text) => {
                    out.push_str(&format!("<!-- page {} -->\n\n", page.page));
                    out.push_str(text);
                    if !text.ends_with('\n') {
                        out.push('\n');
                    }
                }
                None => out.push_str(&format!("<!-- page {}: not translated -->\n", page.page)),
            }
        }
        out
    }

    pub fn to_json(&self) -> Result<String, TranslateError> {
        serde_json::to_string_pretty(self)
            .map_err(|e| TranslateError::Internal(format!("Failed to serialise output: {e}")))
    }
}

/// Write `contents` to `path` via a temp file and a rename, so readers
/// never see a partial file.
pub async fn write_atomic(path: impl AsRef<Path>, contents: &str) -> Result<(), TranslateError> {
    let path = path.as_ref();
    let failed = |source: std::io::Error| TranslateError::OutputWriteFailed {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(failed)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    tokio::fs::write(&tmp, contents).await.map_err(failed)?;
    tokio::fs::rename(&tmp, path).await.map_err(failed)?;
    Ok(())
}
