//! Model Routing
//!
//! Parses `provider/model` references and resolves the implicit single-model
//! selection when the caller names no model.

use crate::error::CompletionError;
use crate::registry::ProviderRegistry;
use std::fmt;

/// Parsed model identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelReference {
    /// Provider name (e.g. "openai", "groq")
    pub provider: String,

    /// Provider-local model name; may itself contain `/`
    /// (e.g. "meta-llama/Llama-3.3-70B-Instruct-Turbo")
    pub model: String,
}

impl ModelReference {
    /// Split on the first `/`. Both sides must be non-empty.
    pub fn parse(reference: &str) -> Result<Self, CompletionError> {
        let reference = reference.trim();
        let invalid = |reason: &str| CompletionError::InvalidModel {
            reference: reference.to_string(),
            reason: reason.to_string(),
        };

        let (provider, model) = reference
            .split_once('/')
            .ok_or_else(|| invalid("expected 'provider/model'"))?;

        if provider.is_empty() {
            return Err(invalid("provider part is empty"));
        }
        if model.is_empty() {
            return Err(invalid("model part is empty"));
        }

        Ok(Self {
            provider: provider.to_string(),
            model: model.to_string(),
        })
    }
}

impl fmt::Display for ModelReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider, self.model)
    }
}

/// Resolves references against a registry.
#[derive(Debug, Clone, Copy)]
pub struct ModelRouter<'a> {
    registry: &'a ProviderRegistry,
}

impl<'a> ModelRouter<'a> {
    pub fn new(registry: &'a ProviderRegistry) -> Self {
        Self { registry }
    }

    /// Resolve an explicit reference, or pick the only configured model when
    /// none is given.
    pub fn resolve(&self, reference: Option<&str>) -> Result<ModelReference, CompletionError> {
        let resolved = match reference {
            Some(reference) => ModelReference::parse(reference)?,
            None => self.implicit()?,
        };

        // Existence check only; the model list is informational
        self.registry.get(&resolved.provider)?;
        Ok(resolved)
    }

    fn implicit(&self) -> Result<ModelReference, CompletionError> {
        let mut configured = self.registry.configured_models();
        match configured.len() {
            0 => Err(CompletionError::NotFound(
                "no models configured; pass a 'provider/model' reference".to_string(),
            )),
            1 => {
                let only = configured.remove(0);
                tracing::debug!(model = %only, "Implicitly selected the only configured model");
                Ok(only)
            }
            _ => Err(CompletionError::AmbiguousModel {
                candidates: configured.iter().map(|m| m.to_string()).collect(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider_config::ProvidersConfig;
    use serde_json::json;

    fn registry(overrides: serde_json::Value) -> ProviderRegistry {
        let defaults = ProvidersConfig::from_value(json!({
            "openai": {"base_url": "https://api.openai.com/v1", "keys": ["sk-a"]},
            "groq": {"base_url": "https://api.groq.com/openai/v1", "keys": ["gsk-a"]}
        }))
        .unwrap();
        let overrides = ProvidersConfig::from_value(overrides).unwrap();
        ProviderRegistry::build(&defaults, &overrides, |_| None).unwrap()
    }

    #[test]
    fn test_parse_simple() {
        let route = ModelReference::parse("openai/gpt-4").unwrap();
        assert_eq!(route.provider, "openai");
        assert_eq!(route.model, "gpt-4");
        assert_eq!(route.to_string(), "openai/gpt-4");
    }

    #[test]
    fn test_parse_keeps_rest_of_path_in_model() {
        let route = ModelReference::parse("together/meta-llama/Llama-3.3-70B").unwrap();
        assert_eq!(route.provider, "together");
        assert_eq!(route.model, "meta-llama/Llama-3.3-70B");
    }

    #[test]
    fn test_parse_invalid() {
        for bad in ["malformed-no-slash", "/gpt-4", "openai/", "/", ""] {
            assert!(
                matches!(
                    ModelReference::parse(bad),
                    Err(CompletionError::InvalidModel { .. })
                ),
                "{bad} should be invalid"
            );
        }
    }

    #[test]
    fn test_resolve_unknown_provider_is_not_found() {
        let registry = registry(json!({}));
        let router = ModelRouter::new(&registry);
        assert!(matches!(
            router.resolve(Some("bogus/model")),
            Err(CompletionError::NotFound(_))
        ));
        assert!(matches!(
            router.resolve(Some("malformed-no-slash")),
            Err(CompletionError::InvalidModel { .. })
        ));
    }

    #[test]
    fn test_resolve_known_provider_any_model() {
        let registry = registry(json!({}));
        let router = ModelRouter::new(&registry);
        let resolved = router.resolve(Some("groq/llama-3.1-8b-instant")).unwrap();
        assert_eq!(resolved.provider, "groq");
    }

    #[test]
    fn test_implicit_selection() {
        let none = registry(json!({}));
        assert!(matches!(
            ModelRouter::new(&none).resolve(None),
            Err(CompletionError::NotFound(_))
        ));

        let one = registry(json!({"groq": {"models": ["llama-3.1-8b-instant"]}}));
        let resolved = ModelRouter::new(&one).resolve(None).unwrap();
        assert_eq!(resolved.to_string(), "groq/llama-3.1-8b-instant");

        let two = registry(json!({
            "groq": {"models": ["llama-3.1-8b-instant"]},
            "openai/gpt-4o-mini": {}
        }));
        match ModelRouter::new(&two).resolve(None) {
            Err(CompletionError::AmbiguousModel { candidates }) => {
                assert_eq!(
                    candidates,
                    vec!["groq/llama-3.1-8b-instant", "openai/gpt-4o-mini"]
                );
            }
            other => panic!("expected ambiguity, got {other:?}"),
        }
    }
}
