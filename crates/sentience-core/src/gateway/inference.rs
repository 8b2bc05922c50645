//! Inference service contract and its clients.
//!
//! `ChatCompletionsClient` speaks the OpenAI-compatible `/chat/completions` API (OpenRouter,
//! Ollama's `/v1`, vLLM). `MockInference` answers locally for `llm_mode = "mock"` and tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_BASE_URL: &str = "http://localhost:11434/v1";
pub const DEFAULT_MODEL: &str = "llama3.2";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum InferenceError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Service returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Empty response from inference service")]
    EmptyResponse,

    #[error("Inference service unavailable: {0}")]
    Unavailable(String),
}

impl From<reqwest::Error> for InferenceError {
    fn from(err: reqwest::Error) -> Self {
        InferenceError::Http(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceOptions {
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for InferenceOptions {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 512,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceRequest {
    pub prompt: String,
    pub system: Option<String>,
    pub options: InferenceOptions,
    /// Caller-imposed deadline; clients should give up no later than this.
    pub deadline: Duration,
}

impl InferenceRequest {
    pub fn new(prompt: impl Into<String>, deadline: Duration) -> Self {
        Self {
            prompt: prompt.into(),
            system: None,
            options: InferenceOptions::default(),
            deadline,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_options(mut self, options: InferenceOptions) -> Self {
        self.options = options;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceResponse {
    pub text: String,
}

/// External text generation. Implementations must be cancel-safe: the gateway drops the
/// future when the deadline passes.
#[async_trait::async_trait]
pub trait InferenceService: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(&self, request: InferenceRequest) -> Result<InferenceResponse, InferenceError>;
}

// ---------------------------------------------------------------------------
// OpenAI-compatible HTTP client
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessageResponse,
}

#[derive(Deserialize)]
struct ChatMessageResponse {
    content: Option<String>,
}

pub struct ChatCompletionsClient {
    base_url: String,
    model: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl ChatCompletionsClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: DEFAULT_MODEL.to_string(),
            api_key: None,
            client: reqwest::Client::new(),
        }
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.model = model.to_string();
        self
    }

    /// Sends `Authorization: Bearer <key>`. Blank keys are ignored.
    pub fn with_api_key(mut self, key: Option<String>) -> Self {
        self.api_key = key.map(|k| k.trim().to_string()).filter(|k| !k.is_empty());
        self
    }
}

#[async_trait::async_trait]
impl InferenceService for ChatCompletionsClient {
    fn name(&self) -> &str {
        "chat-completions"
    }

    async fn generate(&self, request: InferenceRequest) -> Result<InferenceResponse, InferenceError> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = request.system.as_deref() {
            messages.push(ChatMessage {
                role: "system",
                content: system,
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: &request.prompt,
        });
        let body = ChatRequest {
            model: &self.model,
            messages,
            temperature: request.options.temperature,
            max_tokens: request.options.max_tokens,
        };

        let mut builder = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .timeout(request.deadline)
            .json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(InferenceError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ChatResponse = response.json().await?;
        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .ok_or(InferenceError::EmptyResponse)?;
        Ok(InferenceResponse { text })
    }
}

// ---------------------------------------------------------------------------
// Local mock
// ---------------------------------------------------------------------------

/// Scripted behavior for [`MockInference`].
#[derive(Debug, Clone, PartialEq)]
pub enum MockBehavior {
    /// Reply with a short acknowledgement of the prompt.
    Echo,
    /// Always reply with this text.
    Fixed(String),
    /// Fail with `Unavailable`.
    Fail,
    /// Sleep this long before echoing.
    Delay(Duration),
    /// Never answer.
    Hang,
}

pub struct MockInference {
    behavior: Mutex<MockBehavior>,
    calls: AtomicUsize,
}

impl MockInference {
    pub fn new(behavior: MockBehavior) -> Self {
        Self {
            behavior: Mutex::new(behavior),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn echo() -> Self {
        Self::new(MockBehavior::Echo)
    }

    pub fn set_behavior(&self, behavior: MockBehavior) {
        *self.behavior.lock().unwrap_or_else(PoisonError::into_inner) = behavior;
    }

    /// Number of times `generate` was entered.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn echo_text(prompt: &str) -> String {
        let line = prompt.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("").trim();
        let preview: String = line.chars().take(80).collect();
        format!("I hear you: {}", preview)
    }
}

impl Default for MockInference {
    fn default() -> Self {
        Self::echo()
    }
}

#[async_trait::async_trait]
impl InferenceService for MockInference {
    fn name(&self) -> &str {
        "mock"
    }

    async fn generate(&self, request: InferenceRequest) -> Result<InferenceResponse, InferenceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let behavior = self.behavior.lock().unwrap_or_else(PoisonError::into_inner).clone();
        match behavior {
            MockBehavior::Echo => Ok(InferenceResponse {
                text: Self::echo_text(&request.prompt),
            }),
            MockBehavior::Fixed(text) => Ok(InferenceResponse { text }),
            MockBehavior::Fail => Err(InferenceError::Unavailable("mock configured to fail".to_string())),
            MockBehavior::Delay(d) => {
                tokio::time::sleep(d).await;
                Ok(InferenceResponse {
                    text: Self::echo_text(&request.prompt),
                })
            }
            MockBehavior::Hang => {
                std::future::pending::<()>().await;
                Err(InferenceError::EmptyResponse)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echo_repeats_last_prompt_line() {
        let mock = MockInference::echo();
        let reply = mock
            .generate(InferenceRequest::new("context\nUser: hello there\n", Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(reply.text, "I hear you: User: hello there");
        assert_eq!(mock.calls(), 1);
    }

    #[tokio::test]
    async fn behavior_can_be_switched() {
        let mock = MockInference::new(MockBehavior::Fail);
        let req = InferenceRequest::new("x", Duration::from_secs(1));
        assert!(mock.generate(req.clone()).await.is_err());
        mock.set_behavior(MockBehavior::Fixed("ok".into()));
        assert_eq!(mock.generate(req).await.unwrap().text, "ok");
    }

    #[test]
    fn chat_request_serializes_openai_shape() {
        let body = ChatRequest {
            model: "m",
            messages: vec![ChatMessage {
                role: "user",
                content: "hi",
            }],
            temperature: 0.5,
            max_tokens: 16,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["messages"][0]["role"], "user");
        assert_eq!(json["max_tokens"], 16);
    }

    #[test]
    fn blank_api_key_is_dropped() {
        let client = ChatCompletionsClient::new("http://localhost:1/v1/").with_api_key(Some("  ".into()));
        assert!(client.api_key.is_none());
        assert_eq!(client.base_url, "http://localhost:1/v1");
    }
}
