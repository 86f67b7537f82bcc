use axum::{
    extract::State,
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

pub static ENV_LOCK: Mutex<()> = Mutex::new(());

#[derive(Clone, Debug)]
pub struct MockReply {
    pub status: u16,
    pub body: String,
    pub retry_after: Option<u64>,
}

impl MockReply {
    pub fn ok(content: &str) -> Self {
        Self {
            status: 200,
            body: json!({
                "id": "chatcmpl-test",
                "object": "chat.completion",
                "model": "mock",
                "choices": [{
                    "index": 0,
                    "message": {"role": "assistant", "content": content},
                    "finish_reason": "stop"
                }],
                "usage": {"prompt_tokens": 5, "completion_tokens": 2, "total_tokens": 7}
            })
            .to_string(),
            retry_after: None,
        }
    }

    pub fn status(status: u16, message: &str) -> Self {
        Self {
            status,
            body: json!({"error": {"message": message}}).to_string(),
            retry_after: None,
        }
    }

    pub fn raw(status: u16, body: &str) -> Self {
        Self {
            status,
            body: body.to_string(),
            retry_after: None,
        }
    }

    pub fn with_retry_after(mut self, secs: u64) -> Self {
        self.retry_after = Some(secs);
        self
    }
}

#[derive(Clone, Debug)]
pub struct RecordedRequest {
    pub headers: HeaderMap,
    pub body: Value,
}

#[derive(Clone)]
struct UpstreamState {
    requests: Arc<AsyncMutex<Vec<RecordedRequest>>>,
    reply: Arc<AsyncMutex<MockReply>>,
}

async fn handle_chat(
    State(state): State<UpstreamState>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Response {
    state.requests.lock().await.push(RecordedRequest {
        headers,
        body: payload,
    });
    let reply = state.reply.lock().await.clone();

    let status = StatusCode::from_u16(reply.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = (status, reply.body).into_response();
    if let Some(secs) = reply.retry_after {
        response
            .headers_mut()
            .insert("retry-after", HeaderValue::from(secs));
    }
    response
}

/// OpenAI-compatible upstream on an ephemeral port
pub struct MockUpstream {
    pub base_url: String,
    requests: Arc<AsyncMutex<Vec<RecordedRequest>>>,
    reply: Arc<AsyncMutex<MockReply>>,
    join: JoinHandle<()>,
}

impl MockUpstream {
    pub async fn start(reply: MockReply) -> Self {
        let requests = Arc::new(AsyncMutex::new(Vec::new()));
        let reply = Arc::new(AsyncMutex::new(reply));
        let state = UpstreamState {
            requests: requests.clone(),
            reply: reply.clone(),
        };

        let app = Router::new()
            .route("/v1/chat/completions", post(handle_chat))
            .with_state(state);

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind upstream");
        let addr = listener.local_addr().expect("local addr");
        let base_url = format!("http://{}/v1", addr);

        let join = tokio::spawn(async move {
            axum::serve(listener, app)
                .await
                .expect("upstream server error");
        });

        Self {
            base_url,
            requests,
            reply,
            join,
        }
    }

    pub async fn set_reply(&self, reply: MockReply) {
        *self.reply.lock().await = reply;
    }

    pub async fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().await.clone()
    }

    pub async fn hits(&self) -> usize {
        self.requests.lock().await.len()
    }

    pub async fn last_request(&self) -> RecordedRequest {
        self.requests
            .lock()
            .await
            .last()
            .cloned()
            .expect("no request recorded")
    }
}

impl Drop for MockUpstream {
    fn drop(&mut self) {
        self.join.abort();
    }
}

pub struct EnvRestore {
    saved: Vec<(&'static str, Option<String>)>,
}

impl EnvRestore {
    pub fn capture(keys: &[&'static str]) -> Self {
        let saved = keys.iter().map(|&k| (k, std::env::var(k).ok())).collect();
        Self { saved }
    }
}

impl Drop for EnvRestore {
    fn drop(&mut self) {
        for (key, value) in self.saved.drain(..) {
            if let Some(val) = value {
                std::env::set_var(key, val);
            } else {
                std::env::remove_var(key);
            }
        }
    }
}
