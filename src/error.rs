//! Error taxonomy for the completion path.
//!
//! Every failure a completion call can produce is a [`CompletionError`]. The
//! fallback loop never matches on individual variants; it asks for the
//! [`ErrorClass`] and branches on that.

use std::fmt;
use std::time::Duration;

/// Coarse classification used to drive skip / record / abort decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Caller or configuration mistake. Never retried.
    Configuration,
    /// A key or provider is out of quota.
    Quota,
    /// The provider answered with an error or could not be reached.
    Remote,
    /// The provider answered 2xx with a body that does not match the contract.
    Parse,
}

/// Where a rate limit was detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitOrigin {
    /// Every key in the local pool is over its rolling window or cooling down.
    Local,
    /// The provider returned HTTP 429.
    Upstream,
}

impl fmt::Display for LimitOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimitOrigin::Local => f.write_str("local key pool exhausted"),
            LimitOrigin::Upstream => f.write_str("provider returned 429"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CompletionError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid model reference '{reference}': {reason}")]
    InvalidModel { reference: String, reason: String },

    #[error("Ambiguous model selection, pass one of: {}", .candidates.join(", "))]
    AmbiguousModel { candidates: Vec<String> },

    #[error("No API keys resolved for provider '{provider}'")]
    MissingKeys { provider: String },

    #[error("Authentication rejected by '{provider}' for model '{model}': {message}")]
    Auth {
        provider: String,
        model: String,
        status: Option<u16>,
        message: String,
    },

    #[error("Rate limit exceeded for '{provider}' ({origin}){}", retry_hint(.retry_after))]
    RateLimitExceeded {
        provider: String,
        model: Option<String>,
        origin: LimitOrigin,
        retry_after: Option<Duration>,
    },

    #[error("Transient failure from '{provider}' for model '{model}': {message}")]
    Transient {
        provider: String,
        model: String,
        status: Option<u16>,
        message: String,
    },

    #[error("Request to '{provider}' for model '{model}' failed with status {status}: {body}")]
    Request {
        provider: String,
        model: String,
        status: u16,
        body: String,
    },

    #[error("Failed to parse response from '{provider}' for model '{model}': {message}")]
    ResponseParse {
        provider: String,
        model: String,
        message: String,
    },

    #[error("No usable provider: every candidate model was skipped")]
    NoUsableProvider,
}

fn retry_hint(retry_after: &Option<Duration>) -> String {
    match retry_after {
        Some(wait) => format!(", next slot in {:.1}s", wait.as_secs_f64()),
        None => String::new(),
    }
}

impl CompletionError {
    pub fn class(&self) -> ErrorClass {
        match self {
            CompletionError::NotFound(_)
            | CompletionError::InvalidModel { .. }
            | CompletionError::AmbiguousModel { .. }
            | CompletionError::MissingKeys { .. }
            | CompletionError::NoUsableProvider => ErrorClass::Configuration,
            CompletionError::RateLimitExceeded { .. } => ErrorClass::Quota,
            CompletionError::Auth { .. }
            | CompletionError::Transient { .. }
            | CompletionError::Request { .. } => ErrorClass::Remote,
            CompletionError::ResponseParse { .. } => ErrorClass::Parse,
        }
    }

    /// True when the failure is tied to the claimed key, so another key of the
    /// same provider may still succeed.
    pub fn is_key_scoped(&self) -> bool {
        matches!(
            self,
            CompletionError::Auth { .. }
                | CompletionError::Transient { .. }
                | CompletionError::RateLimitExceeded {
                    origin: LimitOrigin::Upstream,
                    ..
                }
        )
    }

    /// HTTP status reported by the provider, if the failure came from a response.
    pub fn status(&self) -> Option<u16> {
        match self {
            CompletionError::Auth { status, .. } | CompletionError::Transient { status, .. } => {
                *status
            }
            CompletionError::Request { status, .. } => Some(*status),
            CompletionError::RateLimitExceeded {
                origin: LimitOrigin::Upstream,
                ..
            } => Some(429),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert_eq!(
            CompletionError::NotFound("provider 'x'".into()).class(),
            ErrorClass::Configuration
        );
        assert_eq!(
            CompletionError::AmbiguousModel {
                candidates: vec!["a/b".into(), "c/d".into()]
            }
            .class(),
            ErrorClass::Configuration
        );
        assert_eq!(
            CompletionError::RateLimitExceeded {
                provider: "groq".into(),
                model: None,
                origin: LimitOrigin::Local,
                retry_after: None,
            }
            .class(),
            ErrorClass::Quota
        );
        assert_eq!(
            CompletionError::ResponseParse {
                provider: "groq".into(),
                model: "m".into(),
                message: "eof".into(),
            }
            .class(),
            ErrorClass::Parse
        );
    }

    #[test]
    fn test_key_scoped() {
        let local = CompletionError::RateLimitExceeded {
            provider: "groq".into(),
            model: None,
            origin: LimitOrigin::Local,
            retry_after: Some(Duration::from_secs(3)),
        };
        let upstream = CompletionError::RateLimitExceeded {
            provider: "groq".into(),
            model: Some("m".into()),
            origin: LimitOrigin::Upstream,
            retry_after: None,
        };
        let bad_request = CompletionError::Request {
            provider: "groq".into(),
            model: "m".into(),
            status: 400,
            body: "bad".into(),
        };

        assert!(!local.is_key_scoped());
        assert!(upstream.is_key_scoped());
        assert!(!bad_request.is_key_scoped());
        assert_eq!(upstream.status(), Some(429));
        assert_eq!(bad_request.status(), Some(400));
    }

    #[test]
    fn test_display_mentions_candidates_and_wait() {
        let ambiguous = CompletionError::AmbiguousModel {
            candidates: vec!["groq/a".into(), "openai/b".into()],
        };
        assert!(ambiguous.to_string().contains("groq/a, openai/b"));

        let limited = CompletionError::RateLimitExceeded {
            provider: "groq".into(),
            model: None,
            origin: LimitOrigin::Local,
            retry_after: Some(Duration::from_millis(2500)),
        };
        let msg = limited.to_string();
        assert!(msg.contains("local key pool exhausted"), "{msg}");
        assert!(msg.contains("2.5s"), "{msg}");
    }
}
