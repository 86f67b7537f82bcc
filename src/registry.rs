//! Provider Registry
//!
//! Built once from the built-in defaults deep-merged with the user config:
//! - `base_url`, `api_key_env` and other scalars: user value replaces default
//! - `headers`, `param_mappings`: merged key by key, user entries win
//! - `rate_limit`: replaced wholly when the user sets it, else inherited
//! - providers only present in the user config are added as-is
//!
//! Keys are resolved from literals and env vars at construction and handed to
//! one [`KeyPool`] per provider. The registry is immutable afterwards; only the
//! pools carry (internally synchronized) mutable state.

use crate::error::CompletionError;
use crate::key_pool::{KeyPool, KeyPoolStats};
use crate::provider_config::{
    AuthScheme, ConfigError, ProviderOverride, ProviderQuirks, ProvidersConfig, RateLimitConfig,
    RotationStrategy,
};
use crate::rate_limiter::RateLimiter;
use crate::router::ModelReference;
use crate::util::expand_env_vars;
use http::{HeaderName, HeaderValue};
use serde::Serialize;
use std::collections::BTreeMap;

/// Fully merged, validated provider definition
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderDefinition {
    pub name: String,
    pub base_url: String,
    /// Env var names consulted for keys, in resolution order
    pub api_key_env: Vec<String>,
    pub models: Vec<String>,
    /// Logical parameter name → provider field name
    pub param_mappings: BTreeMap<String, String>,
    /// Static headers, env references already expanded
    pub headers: BTreeMap<String, String>,
    pub rate_limit: Option<RateLimitConfig>,
    pub auth: AuthScheme,
    pub quirks: ProviderQuirks,
    pub rotation_strategy: RotationStrategy,
}

impl ProviderDefinition {
    pub fn requests_per_minute(&self) -> Option<u32> {
        self.rate_limit.and_then(|r| r.requests_per_minute)
    }
}

/// A registered provider: its definition plus its key pool
#[derive(Debug)]
pub struct Provider {
    definition: ProviderDefinition,
    pool: KeyPool,
}

impl Provider {
    pub fn definition(&self) -> &ProviderDefinition {
        &self.definition
    }

    pub fn pool(&self) -> &KeyPool {
        &self.pool
    }
}

/// Provider information for introspection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderInfo {
    pub name: String,
    pub base_url: String,
    pub models: Vec<String>,
    pub has_keys: bool,
    pub key_count: usize,
    pub rotation_strategy: RotationStrategy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requests_per_minute: Option<u32>,
}

#[derive(Debug)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, Provider>,
}

impl ProviderRegistry {
    /// Merge `overrides` onto `defaults`, resolving env references through `env`.
    pub fn build<F>(
        defaults: &ProvidersConfig,
        overrides: &ProvidersConfig,
        env: F,
    ) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = defaults.normalize()?;
        let mut overrides = overrides.normalize()?;

        let mut merged: BTreeMap<String, ProviderOverride> = BTreeMap::new();
        for (name, default) in defaults {
            let layered = match overrides.remove(&name) {
                Some(user) => layer(default, user),
                None => default,
            };
            merged.insert(name, layered);
        }
        // What is left exists only in the user config
        merged.extend(overrides);

        let mut providers = BTreeMap::new();
        for (name, entry) in merged {
            let (definition, keys) = finalize(&name, entry, &env)?;
            let limiter = RateLimiter::new(definition.requests_per_minute());

            let pool = if keys.is_empty() && definition.auth == AuthScheme::None {
                KeyPool::anonymous(name.clone(), limiter)
            } else {
                KeyPool::new(name.clone(), keys, definition.rotation_strategy, limiter)
            };

            tracing::debug!(
                provider = %name,
                base_url = %definition.base_url,
                keys = pool.len(),
                "Registered provider"
            );
            providers.insert(name, Provider { definition, pool });
        }

        Ok(Self { providers })
    }

    /// Look up a provider by name.
    pub fn get(&self, name: &str) -> Result<&Provider, CompletionError> {
        self.providers
            .get(name)
            .ok_or_else(|| CompletionError::NotFound(format!("provider '{name}'")))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.providers.contains_key(name)
    }

    /// Provider names, sorted
    pub fn names(&self) -> Vec<&str> {
        self.providers.keys().map(|s| s.as_str()).collect()
    }

    /// Every `provider/model` declared across all providers, sorted.
    pub fn configured_models(&self) -> Vec<ModelReference> {
        let mut models: Vec<ModelReference> = self
            .providers
            .values()
            .flat_map(|p| {
                p.definition.models.iter().map(|model| ModelReference {
                    provider: p.definition.name.clone(),
                    model: model.clone(),
                })
            })
            .collect();
        models.sort_by(|a, b| (&a.provider, &a.model).cmp(&(&b.provider, &b.model)));
        models
    }

    pub fn info(&self, name: &str) -> Option<ProviderInfo> {
        self.providers.get(name).map(|p| {
            let key_count = p.pool.len();
            ProviderInfo {
                name: p.definition.name.clone(),
                base_url: p.definition.base_url.clone(),
                models: p.definition.models.clone(),
                has_keys: key_count > 0,
                key_count,
                rotation_strategy: p.definition.rotation_strategy,
                requests_per_minute: p.definition.requests_per_minute(),
            }
        })
    }

    pub fn pool_stats(&self, name: &str) -> Option<KeyPoolStats> {
        self.providers.get(name).map(|p| p.pool.stats())
    }
}

/// Overlay a user entry on a default entry.
fn layer(default: ProviderOverride, user: ProviderOverride) -> ProviderOverride {
    let mut headers = default.headers;
    headers.extend(user.headers);
    let mut param_mappings = default.param_mappings;
    param_mappings.extend(user.param_mappings);

    ProviderOverride {
        base_url: user.base_url.or(default.base_url),
        base_url_env: user.base_url_env.or(default.base_url_env),
        api_key_env: user.api_key_env.or(default.api_key_env),
        keys: user.keys.or(default.keys),
        keys_env: user.keys_env.or(default.keys_env),
        rotation_strategy: user.rotation_strategy.or(default.rotation_strategy),
        models: user.models.or(default.models),
        param_mappings,
        headers,
        rate_limit: user.rate_limit.or(default.rate_limit),
        auth: user.auth.or(default.auth),
        quirks: user.quirks.or(default.quirks),
    }
}

/// Validate a merged entry and resolve its keys.
fn finalize<F>(
    name: &str,
    entry: ProviderOverride,
    env: &F,
) -> Result<(ProviderDefinition, Vec<String>), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let invalid = |reason: String| ConfigError::Invalid {
        provider: name.to_string(),
        reason,
    };

    let env_base_url = entry
        .base_url_env
        .as_deref()
        .and_then(env)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());
    let base_url = env_base_url
        .or(entry.base_url)
        .ok_or_else(|| invalid("missing base_url".to_string()))?;

    if let Some(RateLimitConfig {
        requests_per_minute: Some(0),
    }) = entry.rate_limit
    {
        return Err(invalid("requests_per_minute must be greater than 0".to_string()));
    }

    let mut headers = BTreeMap::new();
    for (header, raw) in entry.headers {
        let value = expand_env_vars(&raw, env);
        HeaderName::try_from(header.as_str())
            .map_err(|e| invalid(format!("invalid header name '{header}': {e}")))?;
        HeaderValue::from_str(&value)
            .map_err(|e| invalid(format!("invalid value for header '{header}': {e}")))?;
        headers.insert(header, value);
    }

    let api_key_env = entry
        .api_key_env
        .map(|names| names.names())
        .unwrap_or_default();
    let keys_env = entry.keys_env.unwrap_or_default();

    let mut keys = entry.keys.unwrap_or_default();
    for var in api_key_env.iter().chain(keys_env.iter()) {
        match env(var) {
            Some(key) => keys.push(key),
            None => tracing::debug!(provider = %name, env = %var, "Key env var not set"),
        }
    }

    let mut key_env_names = api_key_env;
    for var in keys_env {
        if !key_env_names.contains(&var) {
            key_env_names.push(var);
        }
    }

    let definition = ProviderDefinition {
        name: name.to_string(),
        base_url,
        api_key_env: key_env_names,
        models: entry.models.unwrap_or_default(),
        param_mappings: entry.param_mappings,
        headers,
        rate_limit: entry.rate_limit,
        auth: entry.auth.unwrap_or_default(),
        quirks: entry.quirks.unwrap_or_default(),
        rotation_strategy: entry.rotation_strategy.unwrap_or_default(),
    };
    Ok((definition, keys))
}
