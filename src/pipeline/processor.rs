//! The page processor: everything that happens to one admitted page.
//!
//! ```text
//! render ──▶ encode ──▶ translate ──▶ clean ──▶ store ──▶ spawn verify
//! ```
//!
//! The previous page's stored translation is passed along as context when
//! `maintain_context` is on, which is why the default admission policy
//! waits for page `p - 1`.

use super::encode::encode_page;
use super::postprocess::clean_translation;
use super::render::PageImages;
use crate::error::{PageError, ProviderError};
use crate::progress::ProgressCallback;
use crate::queue::PageProcessor;
use crate::store::{PageTranslation, TranslationStore};
use crate::verify::{Annotation, QualityVerifier};
use async_trait::async_trait;
use edgequake_llm::ImageData;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// One page translation call.
#[derive(Debug, Clone)]
pub struct TranslationRequest {
    pub page: usize,
    pub image: ImageData,
    /// Stored translation of the previous page.
    pub previous_page: Option<String>,
    /// Corrective instruction from the verifier or the operator.
    pub extra_instruction: Option<String>,
}

/// Raw translator output, before cleanup.
#[derive(Debug, Clone, PartialEq)]
pub struct Translation {
    pub text: String,
    pub annotations: Vec<Annotation>,
    pub model: String,
    pub input_tokens: usize,
    pub output_tokens: usize,
}

#[async_trait]
pub trait PageTranslator: Send + Sync {
    async fn translate(
        &self,
        request: TranslationRequest,
        cancel: CancellationToken,
    ) -> Result<Translation, ProviderError>;
}

pub struct TranslatingProcessor {
    images: Arc<dyn PageImages>,
    translator: Arc<dyn PageTranslator>,
    store: Arc<dyn TranslationStore>,
    verifier: Arc<QualityVerifier>,
    progress: ProgressCallback,
    maintain_context: bool,
}

impl std::fmt::Debug for TranslatingProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranslatingProcessor")
            .field("page_count", &self.images.page_count())
            .field("maintain_context", &self.maintain_context)
            .finish()
    }
}

impl TranslatingProcessor {
    pub fn new(
        images: Arc<dyn PageImages>,
        translator: Arc<dyn PageTranslator>,
        store: Arc<dyn TranslationStore>,
        verifier: Arc<QualityVerifier>,
        progress: ProgressCallback,
        maintain_context: bool,
    ) -> Self {
        Self {
            images,
            translator,
            store,
            verifier,
            progress,
            maintain_context,
        }
    }

    fn previous_page(&self, page: usize) -> Option<String> {
        if !self.maintain_context || page <= 1 {
            return None;
        }
        self.store.translation(page - 1).map(|t| t.text)
    }
}

#[async_trait]
impl PageProcessor for TranslatingProcessor {
    async fn process_page(
        &self,
        page: usize,
        cancel: CancellationToken,
        extra_instruction: Option<String>,
    ) -> Result<(), PageError> {
        let start = Instant::now();

        let rendered = self.images.render_page(page).await?;
        let image = encode_page(&rendered).map_err(|e| PageError::RenderFailed {
            page,
            detail: format!("PNG encoding failed: {}", e),
        })?;
        drop(rendered);

        if extra_instruction.is_some() {
            debug!("Page {}: translating with extra instruction", page);
        }
        let request = TranslationRequest {
            page,
            image,
            previous_page: self.previous_page(page),
            extra_instruction,
        };
        let translation = self
            .translator
            .translate(request, cancel.clone())
            .await
            .map_err(|e| PageError::from_provider(page, e))?;

        let text = clean_translation(&translation.text);
        if text.is_empty() {
            return Err(PageError::EmptyResponse { page });
        }
        if cancel.is_cancelled() {
            return Err(PageError::Cancelled { page });
        }

        let attempt = self.store.translation(page).map_or(0, |t| t.attempt) + 1;
        let duration_ms = start.elapsed().as_millis() as u64;
        info!(
            "Page {}: translated by {} in {}ms (attempt {})",
            page, translation.model, duration_ms, attempt
        );
        self.store.save_translation(PageTranslation {
            page,
            text: text.clone(),
            annotations: translation.annotations,
            model: translation.model,
            input_tokens: translation.input_tokens,
            output_tokens: translation.output_tokens,
            duration_ms,
            attempt,
        });
        self.progress.on_page_complete(page, text.len());

        // Verification outlives this call; the queue slot is freed now.
        self.verifier.spawn_verify(page, text, false, &cancel);
        Ok(())
    }
}
