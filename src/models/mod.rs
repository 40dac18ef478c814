//! Model readiness and cooldown registry.
//!
//! One [`ModelRegistry`] is created by the session (the composition root)
//! and shared by every component that talks to a provider. It answers two
//! questions:
//!
//! 1. **Is this provider+model usable?** [`ModelRegistry::ensure_ready`]
//!    runs a cheap connectivity probe and caches the verdict for a TTL
//!    (5 minutes by default) under the key `provider:model`.
//! 2. **Which model should this call actually use?** A model that hit a
//!    quota or timeout error is put in cooldown (20 minutes by default) and
//!    calls routed to it go to the next model in the [`ModelChain`]
//!    instead. [`ModelRegistry::call_with_fallback`] retries the failing
//!    call once against that fallback.
//!
//! Time comes from an injected [`Clock`] so expiry can be tested without
//! sleeping.

pub mod clock;
pub mod cooldown;
pub mod readiness;

pub use clock::{Clock, ManualClock, SystemClock};
pub use cooldown::CooldownRegistry;
pub use readiness::ReadinessCache;

use crate::config::{ModelChain, ProviderSettings, RegistryConfig};
use crate::error::ProviderError;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Live connectivity check for a provider/model pair.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    /// `Ok(true)` when the model answered, `Ok(false)` when it answered but
    /// is unusable, `Err` when the probe itself failed.
    async fn probe(&self, provider: &str, model: &str) -> Result<bool, ProviderError>;
}

/// Result of [`ModelRegistry::ensure_ready`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub ok: bool,
    pub from_cache: bool,
}

pub struct ModelRegistry {
    clock: Arc<dyn Clock>,
    chain: ModelChain,
    readiness: ReadinessCache,
    cooldowns: CooldownRegistry,
}

impl std::fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRegistry")
            .field("chain", &self.chain)
            .field("readiness", &self.readiness)
            .field("cooldowns", &self.cooldowns)
            .finish()
    }
}

impl ModelRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: RegistryConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            chain: config.chain,
            readiness: ReadinessCache::new(config.readiness_ttl),
            cooldowns: CooldownRegistry::new(config.cooldown),
        }
    }

    pub fn chain(&self) -> &ModelChain {
        &self.chain
    }

    /// Check that `provider` can serve requests.
    ///
    /// * not the active provider → `ok`, nothing else happens
    /// * no API key → not `ok`, no network call
    /// * cached verdict younger than the TTL → returned with `from_cache`
    /// * otherwise probe, cache and return the verdict; a probe error counts as invalid
    pub async fn ensure_ready(
        &self,
        provider: &str,
        settings: &ProviderSettings,
        model_override: Option<&str>,
        probe: &dyn ConnectivityProbe,
    ) -> Readiness {
        if provider != settings.active_provider {
            return Readiness {
                ok: true,
                from_cache: false,
            };
        }
        if !settings.has_api_key() {
            warn!("provider '{}' has no API key; skipping probe", provider);
            return Readiness {
                ok: false,
                from_cache: false,
            };
        }

        let model = model_override.unwrap_or(&settings.model);
        let key = ReadinessCache::key(provider, model);
        if let Some(valid) = self.readiness.lookup(&key, self.clock.now()) {
            debug!("readiness cache hit for {}: {}", key, valid);
            return Readiness {
                ok: valid,
                from_cache: true,
            };
        }

        let valid = match probe.probe(provider, model).await {
            Ok(valid) => valid,
            Err(e) => {
                warn!("readiness probe for {} failed: {}", key, e);
                false
            }
        };
        self.readiness.record(&key, valid, self.clock.now());
        info!("readiness probe for {}: {}", key, if valid { "ok" } else { "unusable" });

        Readiness {
            ok: valid,
            from_cache: false,
        }
    }

    /// Forget a cached verdict, e.g. after the user changed their API key.
    pub fn invalidate_readiness(&self, provider: &str, model: &str) {
        self.readiness.invalidate(&ReadinessCache::key(provider, model));
    }

    pub fn start_cooldown(&self, model: &str) {
        let now = self.clock.now();
        let expiry = self.cooldowns.start(model, now);
        warn!(
            "model '{}' in cooldown for {}s",
            model,
            expiry.saturating_duration_since(now).as_secs()
        );
    }

    pub fn is_cooling_down(&self, model: &str) -> bool {
        self.cooldowns.is_active(model, self.clock.now())
    }

    /// The model a call for `model` should actually use right now.
    pub fn route(&self, model: &str) -> String {
        let mut current = model.to_string();
        // The chain has at most three models; bound the walk anyway.
        for _ in 0..4 {
            if !self.is_cooling_down(&current) {
                break;
            }
            match self.chain.fallback_for(&current) {
                Some(next) => {
                    debug!("model '{}' cooling down, routing to '{}'", current, next);
                    current = next.to_string();
                }
                None => break,
            }
        }
        current
    }

    /// Run `op` against the routed model; on a quota/timeout error put that
    /// model in cooldown and run `op` once more against its fallback.
    pub async fn call_with_fallback<T, F, Fut>(&self, model: &str, op: F) -> Result<T, ProviderError>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let routed = self.route(model);
        match op(routed.clone()).await {
            Ok(value) => Ok(value),
            Err(err) if err.triggers_cooldown() => {
                let Some(fallback) = self.chain.fallback_for(&routed) else {
                    return Err(err);
                };
                let fallback = fallback.to_string();
                self.start_cooldown(&routed);
                let next = self.route(&fallback);
                warn!("model '{}' failed ({}), retrying once on '{}'", routed, err, next);
                op(next).await
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn chain() -> ModelChain {
        ModelChain {
            primary: "pro-x".into(),
            secondary: Some("mid-x".into()),
            fastest: Some("fast-x".into()),
        }
    }

    fn registry(clock: Arc<ManualClock>) -> ModelRegistry {
        ModelRegistry::with_clock(
            RegistryConfig {
                readiness_ttl: Duration::from_secs(300),
                cooldown: Duration::from_secs(20 * 60),
                chain: chain(),
            },
            clock,
        )
    }

    fn settings(key: Option<&str>) -> ProviderSettings {
        ProviderSettings {
            active_provider: "openai".into(),
            model: "pro-x".into(),
            api_key: key.map(str::to_string),
        }
    }

    struct CountingProbe {
        calls: AtomicUsize,
        answer: Result<bool, ProviderError>,
    }

    #[async_trait]
    impl ConnectivityProbe for CountingProbe {
        async fn probe(&self, _provider: &str, _model: &str) -> Result<bool, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.answer.clone()
        }
    }

    fn probe(answer: Result<bool, ProviderError>) -> CountingProbe {
        CountingProbe {
            calls: AtomicUsize::new(0),
            answer,
        }
    }

    #[tokio::test]
    async fn inactive_provider_is_ready_without_probe() {
        let reg = registry(Arc::new(ManualClock::new()));
        let p = probe(Ok(false));
        let r = reg.ensure_ready("anthropic", &settings(None), None, &p).await;
        assert_eq!(r, Readiness { ok: true, from_cache: false });
        assert_eq!(p.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_key_fails_fast() {
        let reg = registry(Arc::new(ManualClock::new()));
        let p = probe(Ok(true));
        let r = reg.ensure_ready("openai", &settings(None), None, &p).await;
        assert!(!r.ok);
        assert_eq!(p.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn probe_result_is_cached_for_ttl() {
        let clock = Arc::new(ManualClock::new());
        let reg = registry(clock.clone());
        let p = probe(Ok(true));
        let s = settings(Some("sk-1"));

        let first = reg.ensure_ready("openai", &s, None, &p).await;
        assert_eq!(first, Readiness { ok: true, from_cache: false });

        clock.advance(Duration::from_secs(120));
        let second = reg.ensure_ready("openai", &s, None, &p).await;
        assert_eq!(second, Readiness { ok: true, from_cache: true });
        assert_eq!(p.calls.load(Ordering::SeqCst), 1);

        clock.advance(Duration::from_secs(181));
        let third = reg.ensure_ready("openai", &s, None, &p).await;
        assert!(!third.from_cache);
        assert_eq!(p.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn model_override_uses_its_own_cache_key() {
        let reg = registry(Arc::new(ManualClock::new()));
        let p = probe(Ok(true));
        let s = settings(Some("sk-1"));
        reg.ensure_ready("openai", &s, None, &p).await;
        let r = reg.ensure_ready("openai", &s, Some("checker"), &p).await;
        assert!(!r.from_cache);
        assert_eq!(p.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn thrown_probe_is_cached_as_invalid() {
        let reg = registry(Arc::new(ManualClock::new()));
        let p = probe(Err(ProviderError::Transient {
            detail: "connection refused".into(),
        }));
        let s = settings(Some("sk-1"));
        let r = reg.ensure_ready("openai", &s, None, &p).await;
        assert!(!r.ok);
        let r = reg.ensure_ready("openai", &s, None, &p).await;
        assert_eq!(r, Readiness { ok: false, from_cache: true });
    }

    #[tokio::test]
    async fn quota_error_routes_to_fallback_until_cooldown_expires() {
        let clock = Arc::new(ManualClock::new());
        let reg = registry(clock.clone());
        let seen = Arc::new(Mutex::new(Vec::<String>::new()));

        // First call: pro-x hits its quota, the call is retried on mid-x.
        let s = seen.clone();
        let out = reg
            .call_with_fallback("pro-x", |model| {
                let s = s.clone();
                async move {
                    s.lock().push(model.clone());
                    if model == "pro-x" {
                        Err(ProviderError::RateLimited {
                            model,
                            detail: "quota".into(),
                        })
                    } else {
                        Ok(model)
                    }
                }
            })
            .await;
        assert_eq!(out, Ok("mid-x".to_string()));
        assert_eq!(*seen.lock(), vec!["pro-x", "mid-x"]);

        // Within 20 minutes pro-x is not tried again.
        clock.advance(Duration::from_secs(19 * 60));
        assert!(reg.is_cooling_down("pro-x"));
        assert_eq!(reg.route("pro-x"), "mid-x");
        seen.lock().clear();
        let s = seen.clone();
        let out = reg
            .call_with_fallback("pro-x", |model| {
                let s = s.clone();
                async move {
                    s.lock().push(model.clone());
                    Ok::<_, ProviderError>(model)
                }
            })
            .await;
        assert_eq!(out, Ok("mid-x".to_string()));
        assert_eq!(*seen.lock(), vec!["mid-x"]);

        // After 20 minutes the lookup evicts the entry and routing reverts.
        clock.advance(Duration::from_secs(61));
        assert_eq!(reg.route("pro-x"), "pro-x");
        assert!(!reg.is_cooling_down("pro-x"));
    }

    #[tokio::test]
    async fn fallback_is_tried_only_once() {
        let reg = registry(Arc::new(ManualClock::new()));
        let calls = AtomicUsize::new(0);
        let out: Result<(), ProviderError> = reg
            .call_with_fallback("pro-x", |model| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { Err(ProviderError::Timeout { model, secs: 90 }) }
            })
            .await;
        assert!(matches!(out, Err(ProviderError::Timeout { ref model, .. }) if model == "mid-x"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(reg.is_cooling_down("pro-x"));
        // The fallback's own failure does not start a second cooldown.
        assert!(!reg.is_cooling_down("mid-x"));
    }

    #[tokio::test]
    async fn other_errors_do_not_trigger_fallback() {
        let reg = registry(Arc::new(ManualClock::new()));
        let calls = AtomicUsize::new(0);
        let out: Result<(), ProviderError> = reg
            .call_with_fallback("pro-x", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ProviderError::Auth { detail: "401".into() }) }
            })
            .await;
        assert!(out.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!reg.is_cooling_down("pro-x"));
    }

    #[test]
    fn route_walks_the_chain() {
        let reg = registry(Arc::new(ManualClock::new()));
        reg.start_cooldown("pro-x");
        reg.start_cooldown("mid-x");
        assert_eq!(reg.route("pro-x"), "fast-x");
        assert_eq!(reg.route("fast-x"), "fast-x");
    }
}
