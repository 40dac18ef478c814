//! Error types for the pdftrans library.
//!
//! Three error types reflect three distinct failure scopes:
//!
//! * [`TranslateError`]: **fatal**, the session cannot proceed at all
//!   (provider not configured, missing API key, unreadable PDF). Returned as
//!   `Err(TranslateError)` from session construction and the CLI entry points.
//!
//! * [`ProviderError`]: **one provider call** failed. Classified so the
//!   retry helper knows what to retry and the model registry knows when to
//!   put a model in cooldown.
//!
//! * [`PageError`]: **non-fatal**, a single page failed (render glitch,
//!   provider gave up, deadline hit) but all other pages are fine. Reported
//!   through the page-scoped progress channel, never thrown across it.

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the pdftrans library.
#[derive(Debug, Error)]
pub enum TranslateError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("PDF file not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// PDF header/trailer/xref is corrupt and cannot be parsed.
    #[error("PDF '{path}' is corrupt: {detail}")]
    CorruptPdf { path: PathBuf, detail: String },

    /// PDF requires a password but none was provided.
    #[error("PDF '{path}' is encrypted and requires a password.\nProvide it with --password <PASSWORD>.")]
    PasswordRequired { path: PathBuf },

    /// A password was provided but it is wrong.
    #[error("Wrong password for PDF '{path}'")]
    WrongPassword { path: PathBuf },

    /// Selected page numbers exceed the actual page count.
    #[error("Page {page} is out of range (document has {total} pages)")]
    PageOutOfRange { page: usize, total: usize },

    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\
Set PDFIUM_LIB_PATH or install libpdfium next to the binary."
    )]
    PdfiumBindingFailed(String),

    // ── Provider errors ───────────────────────────────────────────────────
    /// The configured provider could not be constructed.
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    /// No API key is available for the active provider.
    #[error("No API key found for provider '{provider}'.\nSet {env_var} and try again.")]
    MissingApiKey { provider: String, env_var: String },

    /// The readiness probe reported the provider/model as unusable.
    #[error("Model '{model}' on provider '{provider}' is not reachable.\nCheck the model name and your API key.")]
    ProviderUnavailable { provider: String, model: String },

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or write the output file.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Failure of a single provider call (translate, verify or probe).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// HTTP 429 or an explicit quota-exhaustion message.
    #[error("Rate limit or quota exhausted for model '{model}': {detail}")]
    RateLimited { model: String, detail: String },

    /// The call exceeded its deadline.
    #[error("Call to model '{model}' timed out after {secs}s")]
    Timeout { model: String, secs: u64 },

    /// 5xx, connection reset, DNS failure and friends.
    #[error("Transient provider error: {detail}")]
    Transient { detail: String },

    /// 401/403; retrying with the same credentials will not help.
    #[error("Authentication error: {detail}")]
    Auth { detail: String },

    /// No API key configured; no network call was made.
    #[error("No API key configured for provider '{provider}'")]
    MissingApiKey { provider: String },

    /// The provider answered with nothing usable.
    #[error("Empty response from model '{model}'")]
    EmptyResponse { model: String },

    /// The response could not be parsed into the expected shape.
    #[error("Malformed response from model '{model}': {detail}")]
    Malformed { model: String, detail: String },

    /// Explicit abort or a deadline-triggered abort.
    #[error("Cancelled")]
    Cancelled,

    /// Any other non-retryable API error.
    #[error("Provider API error: {detail}")]
    Api { detail: String },
}

impl ProviderError {
    /// Classify a provider error message.
    ///
    /// Providers surface failures as free-form strings that embed the HTTP
    /// status or the upstream error code, so classification is keyword based.
    pub fn classify(model: &str, message: impl Into<String>) -> Self {
        let detail = message.into();
        let lower = detail.to_lowercase();

        if lower.contains("429")
            || lower.contains("rate limit")
            || lower.contains("rate_limit")
            || lower.contains("quota")
            || lower.contains("resource_exhausted")
            || lower.contains("resource exhausted")
        {
            return ProviderError::RateLimited {
                model: model.to_string(),
                detail,
            };
        }
        if lower.contains("timed out") || lower.contains("timeout") || lower.contains("deadline") {
            return ProviderError::Timeout {
                model: model.to_string(),
                secs: 0,
            };
        }
        if lower.contains("401")
            || lower.contains("403")
            || lower.contains("unauthorized")
            || lower.contains("invalid api key")
            || lower.contains("permission denied")
        {
            return ProviderError::Auth { detail };
        }
        if lower.contains("500")
            || lower.contains("502")
            || lower.contains("503")
            || lower.contains("504")
            || lower.contains("overloaded")
            || lower.contains("unavailable")
            || lower.contains("connection")
            || lower.contains("network")
            || lower.contains("reset by peer")
        {
            return ProviderError::Transient { detail };
        }
        ProviderError::Api { detail }
    }

    /// Whether the backoff helper should try again.
    ///
    /// Cancellation is never retried; neither are auth or configuration
    /// failures. Rate limits are handled by cooldown + fallback instead.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProviderError::Transient { .. })
    }

    /// Whether the failing model should be put in cooldown.
    pub fn triggers_cooldown(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimited { .. } | ProviderError::Timeout { .. }
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ProviderError::Cancelled)
    }
}

/// A non-fatal error for a single page.
#[derive(Debug, Clone, Error, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum PageError {
    /// Page rasterisation failed.
    #[error("Page {page}: rasterisation failed: {detail}")]
    RenderFailed { page: usize, detail: String },

    /// The provider call failed after retries and fallbacks.
    #[error("Page {page}: translation failed: {detail}")]
    TranslationFailed { page: usize, detail: String },

    /// The provider returned an empty translation.
    #[error("Page {page}: provider returned an empty translation")]
    EmptyResponse { page: usize },

    /// The page-processing deadline elapsed.
    #[error("Page {page}: timed out after {secs}s")]
    Timeout { page: usize, secs: u64 },

    /// The page was stopped or replaced before it finished.
    #[error("Page {page}: cancelled")]
    Cancelled { page: usize },
}

impl PageError {
    /// Lift a provider failure to page scope.
    pub fn from_provider(page: usize, err: ProviderError) -> Self {
        match err {
            ProviderError::Cancelled => PageError::Cancelled { page },
            ProviderError::EmptyResponse { .. } => PageError::EmptyResponse { page },
            other => PageError::TranslationFailed {
                page,
                detail: other.to_string(),
            },
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, PageError::Cancelled { .. })
    }
}
