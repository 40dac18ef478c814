//! # pdftrans
//!
//! Translate scanned PDF pages with Vision Language Models (VLMs), one page
//! at a time, with an automatic quality check that sends bad pages back for
//! another attempt.
//!
//! ## Why this crate?
//!
//! OCR followed by text translation loses layout and stumbles on stamps,
//! handwriting and tables. Instead each page is rasterised and a VLM reads
//! and translates it in one pass. Consecutive pages are loosely ordered so
//! page `p` can use page `p - 1`'s translation as context, and a verifier
//! pass catches omissions, wrong-language output and mangled structure.
//!
//! ## Architecture
//!
//! ```text
//! request ─▶ queue ─▶ processor ─▶ store ─▶ verifier ─┐
//!              ▲      (render, encode,               │ severe verdict:
//!              │       translate, clean)             │ front + forced
//!              └─────────────────────────────────────┘ + instruction
//! ```
//!
//! * [`queue`]: scheduler with a concurrency cap, a sequential-dependency
//!   admission rule, cancellation and forced re-queueing
//! * [`verify`]: language heuristic plus AI verification with a bounded
//!   automatic retry loop
//! * [`models`]: provider readiness cache and model cooldown/fallback
//! * [`backoff`]: exponential-backoff retry helper
//! * [`pipeline`]: the page stages and the `edgequake-llm` backend
//! * [`session`]: the composition root
//! * [`output`]: assembled Markdown/JSON results
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pdftrans::{TranslationConfig, TranslationSession};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // API key read from OPENAI_API_KEY / ANTHROPIC_API_KEY / GEMINI_API_KEY …
//!     let config = TranslationConfig::builder()
//!         .target_language("English")
//!         .concurrency(2)
//!         .build()?;
//!     let session = TranslationSession::open("letters.pdf", config).await?;
//!     session.ensure_ready().await?;
//!     session.request_selected();
//!     session.wait_until_settled().await;
//!     eprintln!("{} page(s) missing", session.missing_pages().len());
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `pdftrans` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! pdftrans = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod backoff;
pub mod config;
pub mod error;
pub mod models;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod queue;
pub mod session;
pub mod store;
pub mod verify;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use backoff::{retry_with_backoff, BackoffPolicy};
pub use config::{PageSelection, TranslationConfig, TranslationConfigBuilder};
pub use error::{PageError, ProviderError, TranslateError};
pub use models::{ConnectivityProbe, ModelRegistry, Readiness};
pub use output::{write_atomic, PageOutput, TranslatedDocument, TranslationStats};
pub use pipeline::processor::{PageTranslator, Translation, TranslationRequest};
pub use pipeline::render::{ImageSection, PageImages};
pub use progress::{
    FanoutProgress, NoopProgressCallback, ProgressCallback, StatusBoard, TranslationProgressCallback,
};
pub use queue::{
    EnqueueOutcome, EnqueueRequest, PageProcessor, Priority, QueueSnapshot, QueueStats,
    TranslationQueue,
};
pub use session::{SessionParts, TranslationSession};
pub use store::{MemoryStore, PageTranslation, PageVerification, TranslationStore};
pub use verify::{
    QualityVerifier, Severity, VerificationBackend, VerificationReport, VerificationRequest,
    VerificationState, VerifyOutcome,
};
