//! LLM Client
//!
//! Public entry point. Owns the immutable registry, the dispatcher and the
//! fallback engine; cheap to clone and safe to share across tasks.

use crate::dispatcher::{CompletionOptions, RequestDispatcher};
use crate::error::{CompletionError, LimitOrigin};
use crate::fallback::{AttemptExecutor, FallbackEngine, FallbackPolicy};
use crate::key_pool::KeyPoolStats;
use crate::models::{CompletionParams, CompletionRequest, CompletionResponse, Message};
use crate::provider_config::{builtin_defaults, ConfigError, ProvidersConfig};
use crate::registry::{ProviderInfo, ProviderRegistry};
use crate::router::ModelRouter;
use crate::transport::{HttpTransport, Transport};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;
use uuid::Uuid;

/// Cooldown applied on a provider 429 without a usable `Retry-After`
pub const DEFAULT_UPSTREAM_COOLDOWN: Duration = Duration::from_secs(60);

/// What a provider-signalled 429 does to the key that received it
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Upstream429Policy {
    /// Report the failure only; the local window is untouched
    Ignore,
    /// Put the key in cooldown for `Retry-After` (or 60s) so rotation skips it
    #[default]
    CoolDownKey,
}

type EnvLookup = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Builder for [`LlmClient`]
#[derive(Default)]
pub struct LlmClientBuilder {
    config: Option<ProvidersConfig>,
    defaults: Option<ProvidersConfig>,
    env: Option<EnvLookup>,
    transport: Option<Arc<dyn Transport>>,
    upstream_429: Upstream429Policy,
    fallback: FallbackPolicy,
}

impl LlmClientBuilder {
    /// User configuration merged over the defaults
    pub fn config(mut self, config: ProvidersConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Replace the built-in provider table
    pub fn defaults(mut self, defaults: ProvidersConfig) -> Self {
        self.defaults = Some(defaults);
        self
    }

    /// Resolve env references through `lookup` instead of the process env
    pub fn env_lookup<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.env = Some(Box::new(lookup));
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn upstream_429_policy(mut self, policy: Upstream429Policy) -> Self {
        self.upstream_429 = policy;
        self
    }

    pub fn fallback_policy(mut self, policy: FallbackPolicy) -> Self {
        self.fallback = policy;
        self
    }

    pub fn build(self) -> Result<LlmClient, ConfigError> {
        let config = self.config.unwrap_or_default();
        let defaults = match &self.defaults {
            Some(defaults) => defaults,
            None => builtin_defaults()?,
        };

        let registry = match &self.env {
            Some(lookup) => ProviderRegistry::build(defaults, &config, |name| lookup(name))?,
            None => ProviderRegistry::build(defaults, &config, |name| std::env::var(name).ok())?,
        };

        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(HttpTransport::from_env()));

        tracing::info!(
            providers = registry.names().len(),
            models = registry.configured_models().len(),
            "LLM client initialized"
        );

        Ok(LlmClient {
            registry: Arc::new(registry),
            dispatcher: RequestDispatcher::new(transport),
            fallback: FallbackEngine::new(self.fallback),
            upstream_429: self.upstream_429,
        })
    }
}

#[derive(Debug, Clone)]
pub struct LlmClient {
    registry: Arc<ProviderRegistry>,
    dispatcher: RequestDispatcher,
    fallback: FallbackEngine,
    upstream_429: Upstream429Policy,
}

impl LlmClient {
    pub fn builder() -> LlmClientBuilder {
        LlmClientBuilder::default()
    }

    /// Built-in defaults merged with `config`, keys from the process env.
    pub fn new(config: ProvidersConfig) -> Result<Self, ConfigError> {
        Self::builder().config(config).build()
    }

    /// Discover a config file (see [`ProvidersConfig::discover`]) and build.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::new(ProvidersConfig::discover()?)
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Single completion. With `model = None` the only configured model is used.
    pub async fn completion(
        &self,
        messages: Vec<Message>,
        model: Option<&str>,
        params: CompletionParams,
    ) -> Result<CompletionResponse, CompletionError> {
        let request = CompletionRequest::new(messages).with_params(params);
        self.completion_with_options(&request, model, &CompletionOptions::default())
            .await
    }

    pub async fn completion_with_options(
        &self,
        request: &CompletionRequest,
        model: Option<&str>,
        options: &CompletionOptions,
    ) -> Result<CompletionResponse, CompletionError> {
        self.execute(model, request, options).await
    }

    /// Try each reference in order until one succeeds.
    pub async fn completion_with_fallback<S>(
        &self,
        models: &[S],
        request: &CompletionRequest,
        options: &CompletionOptions,
    ) -> Result<CompletionResponse, CompletionError>
    where
        S: AsRef<str> + Sync,
    {
        self.fallback.run(self, models, request, options).await
    }

    /// Provider names, sorted
    pub fn providers(&self) -> Vec<String> {
        self.registry.names().into_iter().map(String::from).collect()
    }

    /// Declared `provider/model` references, sorted
    pub fn configured_models(&self) -> Vec<String> {
        self.registry
            .configured_models()
            .iter()
            .map(|m| m.to_string())
            .collect()
    }

    pub fn provider_info(&self, name: &str) -> Result<ProviderInfo, CompletionError> {
        self.registry
            .info(name)
            .ok_or_else(|| CompletionError::NotFound(format!("provider '{name}'")))
    }

    pub fn pool_stats(&self, name: &str) -> Result<KeyPoolStats, CompletionError> {
        self.registry
            .pool_stats(name)
            .ok_or_else(|| CompletionError::NotFound(format!("provider '{name}'")))
    }

    async fn execute(
        &self,
        reference: Option<&str>,
        request: &CompletionRequest,
        options: &CompletionOptions,
    ) -> Result<CompletionResponse, CompletionError> {
        let span = tracing::info_span!(
            "completion",
            request_id = %Uuid::new_v4(),
            model = reference.unwrap_or("<implicit>"),
        );
        self.execute_once(reference, request, options)
            .instrument(span)
            .await
    }

    async fn execute_once(
        &self,
        reference: Option<&str>,
        request: &CompletionRequest,
        options: &CompletionOptions,
    ) -> Result<CompletionResponse, CompletionError> {
        let model = ModelRouter::new(&self.registry).resolve(reference)?;
        let provider = self.registry.get(&model.provider)?;

        let key = provider.pool().claim().map_err(|err| match err {
            CompletionError::RateLimitExceeded {
                provider,
                model: None,
                origin,
                retry_after,
            } => CompletionError::RateLimitExceeded {
                provider,
                model: Some(model.model.clone()),
                origin,
                retry_after,
            },
            other => other,
        })?;

        let result = self
            .dispatcher
            .dispatch(provider.definition(), &key, &model, request, options)
            .await;

        if let Err(CompletionError::RateLimitExceeded {
            origin: LimitOrigin::Upstream,
            retry_after,
            ..
        }) = &result
        {
            if self.upstream_429 == Upstream429Policy::CoolDownKey {
                provider.pool().cool_down(
                    key.handle(),
                    retry_after.unwrap_or(DEFAULT_UPSTREAM_COOLDOWN),
                );
            }
        }

        result
    }
}

#[async_trait]
impl AttemptExecutor for LlmClient {
    async fn attempt(
        &self,
        reference: &str,
        request: &CompletionRequest,
        options: &CompletionOptions,
    ) -> Result<CompletionResponse, CompletionError> {
        self.execute(Some(reference), request, options).await
    }
}
