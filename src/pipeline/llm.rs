//! Provider interaction: build vision messages and call the model.
//!
//! [`LlmBackend`] is the one place that talks to `edgequake-llm`. It serves
//! three roles:
//!
//! * [`PageTranslator`] for the page processor,
//! * [`VerificationBackend`] for the quality verifier,
//! * [`ConnectivityProbe`] for the readiness check.
//!
//! Prompt text lives in [`crate::prompts`]; this module only arranges
//! messages and handles failures.
//!
//! ## Failure handling
//!
//! Every call goes through two layers:
//!
//! 1. [`ModelRegistry::call_with_fallback`] routes the call away from a
//!    model in cooldown and, on a quota or timeout error, puts the model in
//!    cooldown and retries once on its fallback.
//! 2. [`retry_with_backoff`] retries transient errors (5xx, connection
//!    resets) on the routed model: 500 ms → 1 s → 2 s with the defaults.
//!
//! Cancellation interrupts both the provider call and the backoff sleep.

use super::postprocess::split_annotations;
use super::processor::{PageTranslator, Translation, TranslationRequest};
use crate::backoff::{retry_with_backoff, BackoffPolicy};
use crate::config::TranslationConfig;
use crate::error::{ProviderError, TranslateError};
use crate::models::{ConnectivityProbe, ModelRegistry};
use crate::prompts::{
    extra_instruction_message, previous_page_context, translation_prompt, verifier_prompt,
    verifier_user_message, TRANSLATION_SYSTEM_PROMPT,
};
use crate::verify::{VerificationBackend, VerificationReport, VerificationRequest};
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider, ProviderFactory};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Output budget for a verification reply.
const VERIFY_MAX_TOKENS: usize = 2048;

/// One successful chat call.
#[derive(Debug)]
struct ChatOutput {
    model: String,
    content: String,
    prompt_tokens: usize,
    completion_tokens: usize,
}

/// `edgequake-llm` backed translator, verifier and probe.
pub struct LlmBackend {
    provider_name: String,
    /// Pre-built provider; bypasses the factory and the per-model cache.
    fixed: Option<Arc<dyn LLMProvider>>,
    providers: Mutex<HashMap<String, Arc<dyn LLMProvider>>>,
    registry: Arc<ModelRegistry>,
    backoff: BackoffPolicy,
    model: String,
    temperature: f32,
    max_tokens: usize,
    system_prompt: String,
    has_api_key: bool,
}

impl std::fmt::Debug for LlmBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmBackend")
            .field("provider_name", &self.provider_name)
            .field("fixed", &self.fixed.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("model", &self.model)
            .field("backoff", &self.backoff)
            .field("has_api_key", &self.has_api_key)
            .finish()
    }
}

impl LlmBackend {
    pub fn new(config: &TranslationConfig, registry: Arc<ModelRegistry>) -> Self {
        let template = config
            .system_prompt
            .as_deref()
            .unwrap_or(TRANSLATION_SYSTEM_PROMPT);
        Self {
            provider_name: config.resolved_provider_name(),
            fixed: config.provider.clone(),
            providers: Mutex::new(HashMap::new()),
            registry,
            backoff: BackoffPolicy::new(config.max_retries, config.retry_backoff_ms),
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            system_prompt: translation_prompt(
                template,
                &config.target_language,
                config.source_language.as_deref(),
            ),
            has_api_key: config.provider_settings().has_api_key(),
        }
    }

    /// Build the primary model's provider now, so a misconfigured provider
    /// fails the session instead of every page.
    pub fn preflight(&self) -> Result<(), TranslateError> {
        if self.fixed.is_some() {
            return Ok(());
        }
        let provider = ProviderFactory::create_llm_provider(&self.provider_name, &self.model).map_err(|e| {
            TranslateError::ProviderNotConfigured {
                provider: self.provider_name.clone(),
                hint: format!("{e}"),
            }
        })?;
        self.providers.lock().insert(self.model.clone(), provider);
        Ok(())
    }

    /// Provider bound to `model`, created on first use.
    fn provider_for(&self, model: &str) -> Result<Arc<dyn LLMProvider>, ProviderError> {
        if let Some(ref fixed) = self.fixed {
            return Ok(Arc::clone(fixed));
        }
        if let Some(provider) = self.providers.lock().get(model) {
            return Ok(Arc::clone(provider));
        }
        let provider = ProviderFactory::create_llm_provider(&self.provider_name, model).map_err(|e| {
            if self.has_api_key {
                ProviderError::Api {
                    detail: format!("cannot create provider '{}': {}", self.provider_name, e),
                }
            } else {
                ProviderError::MissingApiKey {
                    provider: self.provider_name.clone(),
                }
            }
        })?;
        debug!("created provider '{}' for model '{}'", self.provider_name, model);
        self.providers
            .lock()
            .insert(model.to_string(), Arc::clone(&provider));
        Ok(provider)
    }

    /// Chat with `model`, through cooldown routing and backoff retries.
    async fn chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: &CompletionOptions,
        cancel: &CancellationToken,
    ) -> Result<ChatOutput, ProviderError> {
        self.registry
            .call_with_fallback(model, |routed| async move {
                let provider = self.provider_for(&routed)?;
                let provider = &provider;
                let routed_ref = routed.as_str();
                let response = retry_with_backoff(&self.backoff, cancel, ProviderError::is_retryable, |_| async move {
                    tokio::select! {
                        _ = cancel.cancelled() => Err(ProviderError::Cancelled),
                        result = provider.chat(messages, Some(options)) => {
                            result.map_err(|e| ProviderError::classify(routed_ref, e.to_string()))
                        }
                    }
                })
                .await?;

                if response.content.trim().is_empty() {
                    return Err(ProviderError::EmptyResponse { model: routed });
                }
                Ok(ChatOutput {
                    content: response.content,
                    prompt_tokens: response.prompt_tokens as usize,
                    completion_tokens: response.completion_tokens as usize,
                    model: routed,
                })
            })
            .await
    }

    fn translation_options(&self) -> CompletionOptions {
        CompletionOptions {
            temperature: Some(self.temperature),
            max_tokens: Some(self.max_tokens),
            ..Default::default()
        }
    }

    fn verification_options(&self) -> CompletionOptions {
        CompletionOptions {
            temperature: Some(0.0),
            max_tokens: Some(VERIFY_MAX_TOKENS),
            ..Default::default()
        }
    }

    /// Message layout for a translation request:
    /// 1. system prompt with the languages filled in
    /// 2. previous page's translation *(when available)*
    /// 3. extra instruction *(quality retry or operator fix)*
    /// 4. user message carrying the page image
    fn translation_messages(&self, request: &TranslationRequest) -> Vec<ChatMessage> {
        let mut messages = vec![ChatMessage::system(self.system_prompt.as_str())];
        if let Some(prior) = request.previous_page.as_deref().filter(|p| !p.trim().is_empty()) {
            messages.push(ChatMessage::system(previous_page_context(prior)));
        }
        if let Some(extra) = request.extra_instruction.as_deref().filter(|e| !e.trim().is_empty()) {
            messages.push(ChatMessage::system(extra_instruction_message(extra)));
        }
        messages.push(ChatMessage::user_with_images("", vec![request.image.clone()]));
        messages
    }

    /// Message layout for a verification request: system prompt, then one
    /// user message with the page image followed by the context strips.
    fn verification_messages(&self, request: &VerificationRequest) -> Vec<ChatMessage> {
        let mut text = verifier_user_message(request.page, &request.translated_text);
        let mut images = Vec::new();
        if let Some(ref img) = request.page_image {
            images.push(img.clone());
            text.push_str("\n\nImage 1 is the page itself.");
        }
        if let Some(ref img) = request.previous_context {
            images.push(img.clone());
            text.push_str(&format!(
                "\nImage {} is the bottom of the previous page.",
                images.len()
            ));
        }
        if let Some(ref img) = request.next_context {
            images.push(img.clone());
            text.push_str(&format!("\nImage {} is the top of the next page.", images.len()));
        }
        vec![
            ChatMessage::system(verifier_prompt(&request.target_language)),
            ChatMessage::user_with_images(text, images),
        ]
    }
}

#[async_trait]
impl PageTranslator for LlmBackend {
    async fn translate(
        &self,
        request: TranslationRequest,
        cancel: CancellationToken,
    ) -> Result<Translation, ProviderError> {
        let messages = self.translation_messages(&request);
        let output = self
            .chat(&self.model, &messages, &self.translation_options(), &cancel)
            .await?;
        debug!(
            "Page {}: {} input tokens, {} output tokens ({})",
            request.page, output.prompt_tokens, output.completion_tokens, output.model
        );

        let (text, annotations) = split_annotations(&output.content);
        Ok(Translation {
            text,
            annotations,
            model: output.model,
            input_tokens: output.prompt_tokens,
            output_tokens: output.completion_tokens,
        })
    }
}

#[async_trait]
impl VerificationBackend for LlmBackend {
    fn is_configured(&self) -> bool {
        self.has_api_key
    }

    async fn verify(
        &self,
        request: VerificationRequest,
        cancel: CancellationToken,
    ) -> Result<VerificationReport, ProviderError> {
        let messages = self.verification_messages(&request);
        let output = self
            .chat(&request.model, &messages, &self.verification_options(), &cancel)
            .await?;
        VerificationReport::from_model_output(&output.content).map_err(|detail| ProviderError::Malformed {
            model: output.model,
            detail,
        })
    }
}

#[async_trait]
impl ConnectivityProbe for LlmBackend {
    async fn probe(&self, provider: &str, model: &str) -> Result<bool, ProviderError> {
        if provider != self.provider_name {
            return Ok(true);
        }
        let client = self.provider_for(model)?;
        let options = CompletionOptions {
            temperature: Some(0.0),
            max_tokens: Some(8),
            ..Default::default()
        };
        let messages = [ChatMessage::user_with_images("Reply with OK.", Vec::new())];
        let response = client
            .chat(&messages, Some(&options))
            .await
            .map_err(|e| ProviderError::classify(model, e.to_string()))?;
        let ok = !response.content.trim().is_empty();
        info!("probe {}:{} → {}", provider, model, if ok { "ok" } else { "empty reply" });
        Ok(ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TranslationConfig;
    use crate::models::ModelRegistry;
    use edgequake_llm::ImageData;

    fn backend(config: &TranslationConfig) -> LlmBackend {
        LlmBackend::new(config, Arc::new(ModelRegistry::new(config.registry_config())))
    }

    fn image() -> ImageData {
        ImageData::new("aGVsbG8=", "image/png")
    }

    #[test]
    fn translation_options_follow_config() {
        let config = TranslationConfig::builder()
            .temperature(0.3)
            .max_tokens(1000)
            .build()
            .unwrap();
        let opts = backend(&config).translation_options();
        assert_eq!(opts.temperature, Some(0.3));
        assert_eq!(opts.max_tokens, Some(1000));
    }

    #[test]
    fn system_prompt_names_the_target_language() {
        let config = TranslationConfig::builder()
            .target_language("Italian")
            .build()
            .unwrap();
        assert!(backend(&config).system_prompt.contains("into Italian"));
    }

    #[test]
    fn translation_message_layout() {
        let config = TranslationConfig::default();
        let b = backend(&config);
        let bare = TranslationRequest {
            page: 1,
            image: image(),
            previous_page: None,
            extra_instruction: None,
        };
        assert_eq!(b.translation_messages(&bare).len(), 2);

        let full = TranslationRequest {
            page: 2,
            image: image(),
            previous_page: Some("page one".into()),
            extra_instruction: Some("fix the table".into()),
        };
        assert_eq!(b.translation_messages(&full).len(), 4);

        let blank_context = TranslationRequest {
            previous_page: Some("   ".into()),
            ..full
        };
        assert_eq!(b.translation_messages(&blank_context).len(), 3);
    }

    #[test]
    fn local_provider_counts_as_configured() {
        let config = TranslationConfig::builder()
            .provider_name("ollama")
            .build()
            .unwrap();
        // Local providers need no key.
        assert!(backend(&config).is_configured());
    }
}
