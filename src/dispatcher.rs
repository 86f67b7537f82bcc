//! Request Dispatcher
//!
//! One attempt against one provider with one claimed key: adapt the request
//! to the provider (param renames, quirks, headers, auth), send it through the
//! [`Transport`], and classify what comes back. Never retries; that policy
//! belongs to the fallback layer.

use crate::error::{CompletionError, LimitOrigin};
use crate::key_pool::ClaimedKey;
use crate::models::{CompletionRequest, CompletionResponse, Message, MessageContent};
use crate::provider_config::{AuthScheme, ProviderQuirks};
use crate::registry::ProviderDefinition;
use crate::router::ModelReference;
use crate::transport::{OutboundRequest, Transport, TransportError, TransportResponse};
use crate::util::{completions_url, retry_after_from_headers};
use http::header::AUTHORIZATION;
use http::{HeaderMap, HeaderName, HeaderValue};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Longest provider error body carried into an error message
const MAX_ERROR_BODY: usize = 2048;

/// Per-call options that are not part of the logical request
#[derive(Debug, Clone, Default)]
pub struct CompletionOptions {
    /// Deadline for each network attempt
    pub timeout: Option<Duration>,

    /// Extra headers; provider headers and auth take precedence
    pub headers: HeaderMap,
}

impl CompletionOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }
}

#[derive(Clone)]
pub struct RequestDispatcher {
    transport: Arc<dyn Transport>,
}

impl std::fmt::Debug for RequestDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestDispatcher").finish_non_exhaustive()
    }
}

impl RequestDispatcher {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    /// Send one attempt and classify the outcome.
    pub async fn dispatch(
        &self,
        provider: &ProviderDefinition,
        key: &ClaimedKey,
        model: &ModelReference,
        request: &CompletionRequest,
        options: &CompletionOptions,
    ) -> Result<CompletionResponse, CompletionError> {
        let outbound = OutboundRequest {
            url: completions_url(&provider.base_url),
            headers: build_headers(provider, key, model, &options.headers)?,
            body: build_payload(provider, model, request),
        };

        tracing::debug!(
            provider = %provider.name,
            model = %model.model,
            key = %key.fingerprint(),
            url = %outbound.url,
            "Dispatching completion request"
        );

        let started = Instant::now();
        let sent = self.transport.post(outbound);
        let result = match options.timeout {
            Some(deadline) => match tokio::time::timeout(deadline, sent).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout(format!(
                    "deadline of {}ms elapsed",
                    deadline.as_millis()
                ))),
            },
            None => sent.await,
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(
                    provider = %provider.name,
                    model = %model.model,
                    elapsed_ms,
                    error = %e,
                    "Transport failure"
                );
                return Err(CompletionError::Transient {
                    provider: provider.name.clone(),
                    model: model.model.clone(),
                    status: None,
                    message: e.to_string(),
                });
            }
        };

        let outcome = classify(provider, model, response);
        match &outcome {
            Ok(_) => tracing::info!(
                provider = %provider.name,
                model = %model.model,
                key = %key.fingerprint(),
                elapsed_ms,
                "Completion succeeded"
            ),
            Err(e) => tracing::warn!(
                provider = %provider.name,
                model = %model.model,
                key = %key.fingerprint(),
                status = e.status(),
                elapsed_ms,
                error = %e,
                "Completion failed"
            ),
        }
        outcome
    }
}

/// Provider-adapted JSON body: logical params renamed through
/// `param_mappings`, plus `messages` and the bare `model` name.
pub fn build_payload(
    provider: &ProviderDefinition,
    model: &ModelReference,
    request: &CompletionRequest,
) -> Value {
    let params = match serde_json::to_value(&request.params) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    };

    let mut payload = Map::new();
    let mut renamed = Vec::new();
    for (name, value) in params {
        match provider.param_mappings.get(&name) {
            Some(target) if *target != name => {
                tracing::debug!(
                    provider = %provider.name,
                    from = %name,
                    to = %target,
                    "Renamed request parameter"
                );
                renamed.push((target.clone(), value));
            }
            _ => {
                payload.insert(name, value);
            }
        }
    }
    // A renamed value wins over a literal field of the same name
    payload.extend(renamed);

    let messages: Vec<Value> = request
        .messages
        .iter()
        .map(|m| adapt_message(m, provider.quirks))
        .collect();

    payload.insert("messages".to_string(), Value::Array(messages));
    payload.insert("model".to_string(), Value::String(model.model.clone()));
    Value::Object(payload)
}

fn adapt_message(message: &Message, quirks: ProviderQuirks) -> Value {
    let mut content = match &message.content {
        MessageContent::Text(text) => Value::String(text.clone()),
        MessageContent::Parts(_) if quirks.convert_content_list_to_string => {
            Value::String(message.content.to_text())
        }
        MessageContent::Parts(parts) => Value::Array(parts.clone()),
    };
    let blank = match &content {
        Value::String(s) => s.is_empty(),
        Value::Array(parts) => parts.is_empty(),
        _ => false,
    };
    if blank
        && quirks.add_text_to_tool_calls
        && message.role == "assistant"
        && message.tool_calls.is_some()
    {
        content = Value::String(" ".to_string());
    }

    let mut out = Map::new();
    out.insert("role".to_string(), Value::String(message.role.clone()));
    out.insert("content".to_string(), content);
    if let Some(name) = &message.name {
        out.insert("name".to_string(), Value::String(name.clone()));
    }
    if let Some(calls) = &message.tool_calls {
        out.insert("tool_calls".to_string(), Value::Array(calls.clone()));
    }
    if let Some(id) = &message.tool_call_id {
        out.insert("tool_call_id".to_string(), Value::String(id.clone()));
    }
    Value::Object(out)
}

/// Caller headers, then provider static headers, then auth.
pub fn build_headers(
    provider: &ProviderDefinition,
    key: &ClaimedKey,
    model: &ModelReference,
    caller: &HeaderMap,
) -> Result<HeaderMap, CompletionError> {
    let mut headers = caller.clone();

    for (name, value) in &provider.headers {
        match (
            HeaderName::try_from(name.as_str()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => tracing::warn!(
                provider = %provider.name,
                header = %name,
                "Skipping invalid header"
            ),
        }
    }

    let auth_error = |message: &str| CompletionError::Auth {
        provider: provider.name.clone(),
        model: model.model.clone(),
        status: None,
        message: message.to_string(),
    };

    if key.value().is_empty() {
        return Ok(headers);
    }
    match &provider.auth {
        AuthScheme::Bearer => {
            let mut value = HeaderValue::from_str(&format!("Bearer {}", key.value()))
                .map_err(|_| auth_error("API key is not a valid header value"))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }
        AuthScheme::Header { name } => {
            let name = HeaderName::try_from(name.as_str())
                .map_err(|_| auth_error("auth header name is invalid"))?;
            let mut value = HeaderValue::from_str(key.value())
                .map_err(|_| auth_error("API key is not a valid header value"))?;
            value.set_sensitive(true);
            headers.insert(name, value);
        }
        AuthScheme::None => {}
    }
    Ok(headers)
}

fn classify(
    provider: &ProviderDefinition,
    model: &ModelReference,
    response: TransportResponse,
) -> Result<CompletionResponse, CompletionError> {
    let status = response.status;
    let provider_name = provider.name.clone();
    let model_name = model.model.clone();

    match status {
        200..=299 => serde_json::from_str::<CompletionResponse>(&response.body).map_err(|e| {
            CompletionError::ResponseParse {
                provider: provider_name,
                model: model_name,
                message: e.to_string(),
            }
        }),
        401 | 403 => Err(CompletionError::Auth {
            provider: provider_name,
            model: model_name,
            status: Some(status),
            message: error_message(&response.body),
        }),
        429 => Err(CompletionError::RateLimitExceeded {
            provider: provider_name,
            model: Some(model_name),
            origin: LimitOrigin::Upstream,
            retry_after: retry_after_from_headers(&response.headers),
        }),
        500..=599 => Err(CompletionError::Transient {
            provider: provider_name,
            model: model_name,
            status: Some(status),
            message: error_message(&response.body),
        }),
        _ => Err(CompletionError::Request {
            provider: provider_name,
            model: model_name,
            status,
            body: truncate(&response.body),
        }),
    }
}

/// OpenAI-style `error.message` when present, else the (truncated) raw body.
fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.pointer("/error/message")
                .or_else(|| v.get("message"))
                .and_then(|m| m.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| truncate(body))
}

fn truncate(body: &str) -> String {
    if body.len() <= MAX_ERROR_BODY {
        return body.to_string();
    }
    let mut end = MAX_ERROR_BODY;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &body[..end])
}
