//! Configuration types for a translation session.
//!
//! All session behaviour is controlled through [`TranslationConfig`], built
//! via its [`TranslationConfigBuilder`]. Components receive the slice of
//! configuration they need ([`QueueConfig`], [`VerifierConfig`],
//! [`RegistryConfig`], [`ProviderSettings`]) instead of the whole struct.

use crate::error::TranslateError;
use crate::progress::ProgressCallback;
use edgequake_llm::LLMProvider;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Hard bounds on the settings surface.
pub const MIN_CONCURRENCY: usize = 1;
pub const MAX_CONCURRENCY: usize = 4;
pub const MAX_AUTO_RETRIES: u32 = 2;

/// Default model chain (primary → secondary fallback → fastest fallback).
pub const DEFAULT_MODEL: &str = "gpt-4.1";
pub const DEFAULT_SECONDARY_MODEL: &str = "gpt-4.1-mini";
pub const DEFAULT_FAST_MODEL: &str = "gpt-4.1-nano";

/// Configuration for a translation session.
///
/// # Example
/// ```rust
/// use pdftrans::TranslationConfig;
///
/// let config = TranslationConfig::builder()
///     .target_language("fr")
///     .concurrency(2)
///     .max_auto_retries(1)
///     .build()
///     .unwrap();
/// assert_eq!(config.concurrency, 2);
/// ```
#[derive(Clone)]
pub struct TranslationConfig {
    /// Pages translated at the same time. Clamped to 1–4. Default: 2.
    ///
    /// The sequential-dependency rule already keeps adjacent pages apart, so
    /// a small cap is enough to overlap independent page runs.
    pub concurrency: usize,

    /// Run the quality verifier after each page. Default: true.
    pub quality_check: bool,

    /// Model used for the verification pass. If None, the primary model.
    pub verifier_model: Option<String>,

    /// Automatic quality-driven retries per page. Clamped to 0–2. Default: 1.
    pub max_auto_retries: u32,

    /// Language the pages are translated into (ISO code or English name). Default: "en".
    pub target_language: String,

    /// Declared source language, enables the contrastive language check.
    pub source_language: Option<String>,

    /// Provider name (e.g. "openai", "anthropic", "gemini", "ollama").
    /// If None, "openai" when `OPENAI_API_KEY` is set, else auto-detected.
    pub provider_name: Option<String>,

    /// Pre-constructed provider. Takes precedence over `provider_name`.
    /// Model fallback is disabled when set, since the provider is bound to one model.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Primary model. Default: [`DEFAULT_MODEL`].
    pub model: String,

    /// Secondary fallback used while the primary is cooling down.
    pub secondary_model: Option<String>,

    /// Fastest/cheapest fallback, last in the chain.
    pub fast_model: Option<String>,

    /// Sampling temperature. Default: 0.1.
    pub temperature: f32,

    /// Maximum output tokens per page. Default: 8192.
    pub max_tokens: usize,

    /// Retries per provider call on transient failures. Default: 3.
    pub max_retries: u32,

    /// Initial backoff delay in milliseconds (doubles each retry). Default: 500.
    pub retry_backoff_ms: u64,

    /// Deadline for one page-processing attempt, in seconds. Default: 180.
    pub page_timeout_secs: u64,

    /// Deadline for one verification attempt, in seconds. Default: 90.
    pub verify_timeout_secs: u64,

    /// How long a readiness probe result stays valid, in seconds. Default: 300.
    pub readiness_ttl_secs: u64,

    /// How long a model stays in cooldown after a quota/timeout error, in seconds. Default: 1200.
    pub cooldown_secs: u64,

    /// Pass the previous page's translation as context and enforce the
    /// sequential dependency between adjacent pages. Default: true.
    pub maintain_context: bool,

    /// Custom translation system prompt. If None, the built-in prompt.
    pub system_prompt: Option<String>,

    /// Rendering DPI. Range: 72–400. Default: 150.
    pub dpi: u32,

    /// Longest rendered edge in pixels. Default: 2000.
    pub max_rendered_pixels: u32,

    /// PDF user password for encrypted documents.
    pub password: Option<String>,

    /// Pages to translate. Default: all.
    pub pages: PageSelection,

    /// Receives page-scoped status events.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for TranslationConfig {
    fn default() -> Self {
        Self {
            concurrency: 2,
            quality_check: true,
            verifier_model: None,
            max_auto_retries: 1,
            target_language: "en".to_string(),
            source_language: None,
            provider_name: None,
            provider: None,
            model: DEFAULT_MODEL.to_string(),
            secondary_model: Some(DEFAULT_SECONDARY_MODEL.to_string()),
            fast_model: Some(DEFAULT_FAST_MODEL.to_string()),
            temperature: 0.1,
            max_tokens: 8192,
            max_retries: 3,
            retry_backoff_ms: 500,
            page_timeout_secs: 180,
            verify_timeout_secs: 90,
            readiness_ttl_secs: 300,
            cooldown_secs: 20 * 60,
            maintain_context: true,
            system_prompt: None,
            dpi: 150,
            max_rendered_pixels: 2000,
            password: None,
            pages: PageSelection::default(),
            progress_callback: None,
        }
    }
}

impl fmt::Debug for TranslationConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TranslationConfig")
            .field("concurrency", &self.concurrency)
            .field("quality_check", &self.quality_check)
            .field("verifier_model", &self.verifier_model)
            .field("max_auto_retries", &self.max_auto_retries)
            .field("target_language", &self.target_language)
            .field("source_language", &self.source_language)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("model", &self.model)
            .field("secondary_model", &self.secondary_model)
            .field("fast_model", &self.fast_model)
            .field("max_retries", &self.max_retries)
            .field("page_timeout_secs", &self.page_timeout_secs)
            .field("verify_timeout_secs", &self.verify_timeout_secs)
            .field("maintain_context", &self.maintain_context)
            .field("pages", &self.pages)
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<dyn TranslationProgressCallback>"),
            )
            .finish()
    }
}

impl TranslationConfig {
    /// Create a new builder for `TranslationConfig`.
    pub fn builder() -> TranslationConfigBuilder {
        TranslationConfigBuilder {
            config: Self::default(),
        }
    }

    /// Provider name the session will use.
    pub fn resolved_provider_name(&self) -> String {
        if let Some(ref name) = self.provider_name {
            return name.clone();
        }
        match std::env::var("EDGEQUAKE_LLM_PROVIDER") {
            Ok(p) if !p.is_empty() => p,
            _ => "openai".to_string(),
        }
    }

    /// The ordered model chain: primary, then configured fallbacks.
    pub fn model_chain(&self) -> ModelChain {
        if self.provider.is_some() {
            return ModelChain::single(&self.model);
        }
        ModelChain {
            primary: self.model.clone(),
            secondary: self.secondary_model.clone().filter(|m| *m != self.model),
            fastest: self.fast_model.clone().filter(|m| *m != self.model),
        }
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            concurrency: self.concurrency,
            page_timeout: Duration::from_secs(self.page_timeout_secs),
        }
    }

    pub fn verifier_config(&self) -> VerifierConfig {
        VerifierConfig {
            enabled: self.quality_check,
            max_auto_retries: self.max_auto_retries,
            verifier_model: self
                .verifier_model
                .clone()
                .unwrap_or_else(|| self.model.clone()),
            target_language: self.target_language.clone(),
            source_language: self.source_language.clone(),
            timeout: Duration::from_secs(self.verify_timeout_secs),
        }
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            readiness_ttl: Duration::from_secs(self.readiness_ttl_secs),
            cooldown: Duration::from_secs(self.cooldown_secs),
            chain: self.model_chain(),
        }
    }

    /// Provider settings as seen by the readiness registry.
    ///
    /// A pre-built provider carries its own credentials, so it counts as keyed.
    pub fn provider_settings(&self) -> ProviderSettings {
        let provider = self.resolved_provider_name();
        let api_key = if self.provider.is_some() {
            Some("<pre-built provider>".to_string())
        } else {
            api_key_from_env(&provider)
        };
        ProviderSettings {
            active_provider: provider,
            model: self.model.clone(),
            api_key,
        }
    }
}

/// Builder for [`TranslationConfig`].
pub struct TranslationConfigBuilder {
    config: TranslationConfig,
}

impl fmt::Debug for TranslationConfigBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TranslationConfigBuilder")
            .field("config", &self.config)
            .finish()
    }
}

impl TranslationConfigBuilder {
    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n.clamp(MIN_CONCURRENCY, MAX_CONCURRENCY);
        self
    }

    pub fn quality_check(mut self, enabled: bool) -> Self {
        self.config.quality_check = enabled;
        self
    }

    pub fn verifier_model(mut self, model: impl Into<String>) -> Self {
        self.config.verifier_model = Some(model.into());
        self
    }

    pub fn max_auto_retries(mut self, n: u32) -> Self {
        self.config.max_auto_retries = n.min(MAX_AUTO_RETRIES);
        self
    }

    pub fn target_language(mut self, lang: impl Into<String>) -> Self {
        self.config.target_language = lang.into();
        self
    }

    pub fn source_language(mut self, lang: impl Into<String>) -> Self {
        self.config.source_language = Some(lang.into());
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = model.into();
        self
    }

    pub fn secondary_model(mut self, model: Option<String>) -> Self {
        self.config.secondary_model = model;
        self
    }

    pub fn fast_model(mut self, model: Option<String>) -> Self {
        self.config.fast_model = model;
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn page_timeout_secs(mut self, secs: u64) -> Self {
        self.config.page_timeout_secs = secs;
        self
    }

    pub fn verify_timeout_secs(mut self, secs: u64) -> Self {
        self.config.verify_timeout_secs = secs;
        self
    }

    pub fn readiness_ttl_secs(mut self, secs: u64) -> Self {
        self.config.readiness_ttl_secs = secs;
        self
    }

    pub fn cooldown_secs(mut self, secs: u64) -> Self {
        self.config.cooldown_secs = secs;
        self
    }

    pub fn maintain_context(mut self, v: bool) -> Self {
        self.config.maintain_context = v;
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = Some(prompt.into());
        self
    }

    pub fn dpi(mut self, dpi: u32) -> Self {
        self.config.dpi = dpi.clamp(72, 400);
        self
    }

    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.config.max_rendered_pixels = px.max(100);
        self
    }

    pub fn password(mut self, pwd: impl Into<String>) -> Self {
        self.config.password = Some(pwd.into());
        self
    }

    pub fn pages(mut self, selection: PageSelection) -> Self {
        self.config.pages = selection;
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<TranslationConfig, TranslateError> {
        let c = &self.config;
        if c.target_language.trim().is_empty() {
            return Err(TranslateError::InvalidConfig(
                "Target language must not be empty".into(),
            ));
        }
        if c.model.trim().is_empty() {
            return Err(TranslateError::InvalidConfig(
                "Model must not be empty".into(),
            ));
        }
        if c.page_timeout_secs == 0 || c.verify_timeout_secs == 0 {
            return Err(TranslateError::InvalidConfig(
                "Timeouts must be ≥ 1 second".into(),
            ));
        }
        Ok(self.config)
    }
}

// ── Component slices ─────────────────────────────────────────────────────

/// Scheduler settings.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub concurrency: usize,
    pub page_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        TranslationConfig::default().queue_config()
    }
}

/// Quality verifier settings.
#[derive(Debug, Clone)]
pub struct VerifierConfig {
    pub enabled: bool,
    pub max_auto_retries: u32,
    pub verifier_model: String,
    pub target_language: String,
    pub source_language: Option<String>,
    pub timeout: Duration,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        TranslationConfig::default().verifier_config()
    }
}

/// Model registry settings.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub readiness_ttl: Duration,
    pub cooldown: Duration,
    pub chain: ModelChain,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        TranslationConfig::default().registry_config()
    }
}

/// Primary model plus its fallbacks, in routing order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelChain {
    pub primary: String,
    pub secondary: Option<String>,
    pub fastest: Option<String>,
}

impl ModelChain {
    /// A chain with no fallbacks.
    pub fn single(model: &str) -> Self {
        Self {
            primary: model.to_string(),
            secondary: None,
            fastest: None,
        }
    }

    /// The model a failing `model` falls back to, if any.
    ///
    /// Models outside the chain fall back to the chain's first fallback.
    pub fn fallback_for(&self, model: &str) -> Option<&str> {
        if model == self.primary {
            self.secondary.as_deref().or(self.fastest.as_deref())
        } else if Some(model) == self.secondary.as_deref() {
            self.fastest.as_deref()
        } else if Some(model) == self.fastest.as_deref() {
            None
        } else {
            self.secondary.as_deref().or(self.fastest.as_deref())
        }
    }
}

/// Provider settings consulted by the readiness check.
#[derive(Clone)]
pub struct ProviderSettings {
    pub active_provider: String,
    pub model: String,
    pub api_key: Option<String>,
}

impl ProviderSettings {
    pub fn has_api_key(&self) -> bool {
        self.api_key.as_deref().is_some_and(|k| !k.trim().is_empty())
    }
}

impl fmt::Debug for ProviderSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderSettings")
            .field("active_provider", &self.active_provider)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Conventional environment variable holding a provider's API key.
///
/// Returns None for local providers that need no key.
pub fn api_key_env_var(provider: &str) -> Option<&'static str> {
    match provider.to_lowercase().as_str() {
        "openai" => Some("OPENAI_API_KEY"),
        "anthropic" => Some("ANTHROPIC_API_KEY"),
        "gemini" | "google" => Some("GEMINI_API_KEY"),
        "mistral" => Some("MISTRAL_API_KEY"),
        "azure" => Some("AZURE_OPENAI_API_KEY"),
        "openrouter" => Some("OPENROUTER_API_KEY"),
        "xai" => Some("XAI_API_KEY"),
        _ => None,
    }
}

fn api_key_from_env(provider: &str) -> Option<String> {
    match api_key_env_var(provider) {
        Some(var) => std::env::var(var).ok().filter(|k| !k.is_empty()),
        // Local providers (ollama, lmstudio) run without a key.
        None => Some("<local>".to_string()),
    }
}

// ── Page selection ───────────────────────────────────────────────────────

/// Specifies which pages of the PDF to translate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PageSelection {
    /// Translate all pages (default).
    #[default]
    All,
    /// A single page (1-indexed).
    Single(usize),
    /// A contiguous range of pages (1-indexed, inclusive).
    Range(usize, usize),
    /// Specific pages (1-indexed, deduplicated).
    Set(Vec<usize>),
}

impl PageSelection {
    /// Expand the selection into a sorted, deduplicated list of 1-indexed page numbers.
    pub fn to_pages(&self, total_pages: usize) -> Vec<usize> {
        let mut pages: Vec<usize> = match self {
            PageSelection::All => (1..=total_pages).collect(),
            PageSelection::Single(p) => {
                if *p >= 1 && *p <= total_pages {
                    vec![*p]
                } else {
                    vec![]
                }
            }
            PageSelection::Range(start, end) => {
                let s = (*start).max(1);
                let e = (*end).min(total_pages);
                (s..=e).collect()
            }
            PageSelection::Set(set) => set
                .iter()
                .copied()
                .filter(|&p| p >= 1 && p <= total_pages)
                .collect(),
        };
        pages.sort_unstable();
        pages.dedup();
        pages
    }
}
