//! Provider Configuration
//!
//! Input schema consumed by the registry at construction time:
//! - Wrapped form: `{ "providers": {...}, "key_pools": {...} }`
//! - Bare map keyed by provider name
//! - Flat entries keyed by `provider/model`, which add that model to the
//!   provider and merge the rest of the entry into it
//!
//! Files may be JSON or YAML. Built-in defaults are compiled in from
//! `providers.json` and parsed once.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Env var naming an explicit config file
pub const CONFIG_PATH_ENV: &str = "LLMROTOR_CONFIG";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Invalid config for provider '{provider}': {reason}")]
    Invalid { provider: String, reason: String },

    #[error("Invalid flat model key '{0}': expected 'provider/model'")]
    InvalidModelKey(String),

    #[error("Built-in provider table is malformed: {0}")]
    Builtin(String),
}

/// Strategy for rotating API keys
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RotationStrategy {
    #[default]
    RoundRobin,
    Random,
    #[serde(alias = "lru")]
    LeastRecentlyUsed,
}

/// How the claimed key is attached to the outbound request
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthScheme {
    /// `Authorization: Bearer <key>`
    #[default]
    Bearer,
    /// Raw key in a named header (e.g. `x-api-key`)
    Header { name: String },
    /// No credential (local servers)
    None,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateLimitConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests_per_minute: Option<u32>,
}

/// Provider-specific request quirks
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderQuirks {
    /// Join multi-part message content into a single string
    #[serde(default)]
    pub convert_content_list_to_string: bool,

    /// Give assistant tool-call turns a non-empty `content`
    #[serde(default)]
    pub add_text_to_tool_calls: bool,
}

/// One env var name or a list of them
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum EnvNames {
    One(String),
    Many(Vec<String>),
}

impl EnvNames {
    pub fn names(&self) -> Vec<String> {
        match self {
            EnvNames::One(name) => vec![name.clone()],
            EnvNames::Many(names) => names.clone(),
        }
    }
}

/// A partial provider definition. Every field is optional so the same shape
/// serves both the built-in defaults and user overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProviderOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    /// Env var that, when set, replaces `base_url`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url_env: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<EnvNames>,

    /// Literal key values
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keys: Option<Vec<String>>,

    /// Additional env var names holding keys
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keys_env: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation_strategy: Option<RotationStrategy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub models: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub param_mappings: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthScheme>,

    #[serde(
        default,
        alias = "special_handling",
        skip_serializing_if = "Option::is_none"
    )]
    pub quirks: Option<ProviderQuirks>,
}

impl ProviderOverride {
    /// Fold another entry from the same config source into this one.
    /// Scalars from `other` win, maps merge key by key and lists accumulate.
    fn absorb(&mut self, other: ProviderOverride) {
        if other.base_url.is_some() {
            self.base_url = other.base_url;
        }
        if other.base_url_env.is_some() {
            self.base_url_env = other.base_url_env;
        }
        if other.api_key_env.is_some() {
            self.api_key_env = other.api_key_env;
        }
        if other.rotation_strategy.is_some() {
            self.rotation_strategy = other.rotation_strategy;
        }
        if other.rate_limit.is_some() {
            self.rate_limit = other.rate_limit;
        }
        if other.auth.is_some() {
            self.auth = other.auth;
        }
        if other.quirks.is_some() {
            self.quirks = other.quirks;
        }
        append_unique(&mut self.keys, other.keys);
        append_unique(&mut self.keys_env, other.keys_env);
        append_unique(&mut self.models, other.models);
        self.param_mappings.extend(other.param_mappings);
        self.headers.extend(other.headers);
    }

    fn add_model(&mut self, model: String) {
        append_unique(&mut self.models, Some(vec![model]));
    }
}

fn append_unique(target: &mut Option<Vec<String>>, extra: Option<Vec<String>>) {
    let Some(extra) = extra else {
        return;
    };
    let list = target.get_or_insert_with(Vec::new);
    for item in extra {
        if !list.contains(&item) {
            list.push(item);
        }
    }
}

/// Key pool configuration for multi-key support
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct KeyPoolConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keys_env: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keys: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation_strategy: Option<RotationStrategy>,
}

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProvidersConfig {
    /// Entries keyed by provider name or by `provider/model`
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderOverride>,

    #[serde(default)]
    pub key_pools: BTreeMap<String, KeyPoolConfig>,
}

impl ProvidersConfig {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Parse from a JSON value, accepting the wrapped form or a bare map.
    pub fn from_value(value: serde_json::Value) -> Result<Self, ConfigError> {
        let wrapped = value
            .as_object()
            .map(|obj| obj.contains_key("providers") || obj.contains_key("key_pools"))
            .unwrap_or(false);

        if wrapped {
            serde_json::from_value(value).map_err(|e| ConfigError::Parse(e.to_string()))
        } else if value.is_null() {
            Ok(Self::empty())
        } else {
            let providers: BTreeMap<String, ProviderOverride> =
                serde_json::from_value(value).map_err(|e| ConfigError::Parse(e.to_string()))?;
            Ok(Self {
                providers,
                key_pools: BTreeMap::new(),
            })
        }
    }

    pub fn from_json_str(content: &str) -> Result<Self, ConfigError> {
        let value: serde_json::Value =
            serde_json::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Self::from_value(value)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        let yaml: serde_yaml::Value =
            serde_yaml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        let value = serde_json::to_value(yaml).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Self::from_value(value)
    }

    /// Load config from file; `.yaml`/`.yml` are parsed as YAML, anything else as JSON.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;

        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );
        let config = if is_yaml {
            Self::from_yaml_str(&content)?
        } else {
            Self::from_json_str(&content)?
        };

        tracing::info!(
            path = %path.display(),
            entries = config.providers.len(),
            "Loaded provider config"
        );
        Ok(config)
    }

    /// Load the first config found in the default locations, or an empty
    /// config when none exists. An explicit `LLMROTOR_CONFIG` must exist.
    pub fn discover() -> Result<Self, ConfigError> {
        if let Ok(explicit) = std::env::var(CONFIG_PATH_ENV) {
            let explicit = explicit.trim();
            if !explicit.is_empty() {
                return Self::load_from_file(explicit);
            }
        }

        for candidate in Self::default_paths() {
            if candidate.is_file() {
                return Self::load_from_file(&candidate);
            }
        }

        tracing::debug!("No provider config file found, using built-in defaults only");
        Ok(Self::empty())
    }

    fn default_paths() -> Vec<PathBuf> {
        vec![
            PathBuf::from("llmrotor.json"),
            PathBuf::from("llmrotor.yaml"),
            PathBuf::from("providers.json"),
        ]
    }

    /// Collapse flat `provider/model` keys and `key_pools` into one override
    /// per provider name.
    pub fn normalize(&self) -> Result<BTreeMap<String, ProviderOverride>, ConfigError> {
        let mut normalized: BTreeMap<String, ProviderOverride> = BTreeMap::new();

        for (key, entry) in &self.providers {
            match key.split_once('/') {
                Some((provider, model)) => {
                    if provider.is_empty() || model.is_empty() {
                        return Err(ConfigError::InvalidModelKey(key.clone()));
                    }
                    let slot = normalized.entry(provider.to_string()).or_default();
                    slot.absorb(entry.clone());
                    slot.add_model(model.to_string());
                }
                None => {
                    normalized
                        .entry(key.clone())
                        .or_default()
                        .absorb(entry.clone());
                }
            }
        }

        for (name, pool) in &self.key_pools {
            let slot = normalized.entry(name.clone()).or_default();
            slot.absorb(ProviderOverride {
                keys: (!pool.keys.is_empty()).then(|| pool.keys.clone()),
                keys_env: (!pool.keys_env.is_empty()).then(|| pool.keys_env.clone()),
                rotation_strategy: pool.rotation_strategy,
                ..Default::default()
            });
        }

        Ok(normalized)
    }
}

static BUILTIN: Lazy<Result<ProvidersConfig, String>> = Lazy::new(|| {
    ProvidersConfig::from_json_str(include_str!("../providers.json")).map_err(|e| e.to_string())
});

/// The built-in provider table.
pub fn builtin_defaults() -> Result<&'static ProvidersConfig, ConfigError> {
    BUILTIN
        .as_ref()
        .map_err(|msg| ConfigError::Builtin(msg.clone()))
}
