#![forbid(unsafe_code)]
#![doc = r#"
llmrotor

Issue one logical chat completion against `provider/model` and let the client
resolve the endpoint, rotate API keys, enforce per-key rate limits, adapt the
request to provider quirks, and fall back across models.

Crate highlights
- Client: `LlmClient::completion(messages, Some("groq/llama-3.1-8b-instant"), params)`.
- Fallback: `LlmClient::completion_with_fallback(&["groq/a", "openai/b"], ...)`.
- Config: built-in provider table merged with a JSON/YAML file (`LLMROTOR_CONFIG`).

Modules
- `provider_config`: Config schema, file loading, built-in defaults.
- `registry`: Merged, immutable provider definitions with one key pool each.
- `key_pool` / `rate_limiter`: Key rotation and rolling 60s windows.
- `router`: `provider/model` parsing and implicit selection.
- `dispatcher`: Request adaptation, transport call, status classification.
- `fallback`: Ordered model chains.
- `transport`: HTTP boundary (reqwest by default).
- `util`: Shared helpers (tracing, env, HTTP client).
"#]

pub mod client;
pub mod dispatcher;
pub mod error;
pub mod fallback;
pub mod key_pool;
pub mod models;
pub mod provider_config;
pub mod rate_limiter;
pub mod registry;
pub mod router;
pub mod transport;
pub mod util;

pub use crate::client::{LlmClient, LlmClientBuilder, Upstream429Policy};
pub use crate::dispatcher::{CompletionOptions, RequestDispatcher};
pub use crate::error::{CompletionError, ErrorClass, LimitOrigin};
pub use crate::fallback::{AttemptExecutor, FallbackEngine, FallbackPolicy};
pub use crate::key_pool::{ClaimedKey, KeyPool, KeyPoolStats, KeyStats};
pub use crate::models::{
    Choice, CompletionParams, CompletionRequest, CompletionResponse, Message, MessageContent,
    Usage,
};
pub use crate::provider_config::{
    AuthScheme, ConfigError, ProviderOverride, ProvidersConfig, RotationStrategy,
};
pub use crate::rate_limiter::RateLimiter;
pub use crate::registry::{ProviderDefinition, ProviderInfo, ProviderRegistry};
pub use crate::router::{ModelReference, ModelRouter};
pub use crate::transport::{
    HttpTransport, OutboundRequest, Transport, TransportError, TransportResponse,
};
