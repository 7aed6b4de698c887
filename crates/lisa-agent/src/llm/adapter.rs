//! Backend adapters.
//!
//! An adapter's only job is translating the common [`CompletionRequest`] into
//! one provider's wire shape and parsing the reply back into a
//! [`BackendReply`].  Retry, timeout and health bookkeeping live in the
//! gateway, never here.
//!
//! Two HTTP adapters ship:
//!
//! - [`OpenAiCompatibleBackend`] -- the Chat Completions API, which also covers
//!   OpenAI-compatible endpoints (Ollama, Groq, DeepSeek, Gemini's OpenAI
//!   surface, vLLM).
//! - [`AnthropicBackend`] -- the Anthropic Messages API.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde_json::{Value, json};

use crate::error::{AgentError, Result};
use crate::llm::types::{
    BackendConfig, BackendId, BackendReply, CompletionRequest, Message, Role, Usage,
};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const OLLAMA_BASE_URL: &str = "http://localhost:11434/v1";
const GROQ_BASE_URL: &str = "https://api.groq.com/openai/v1";
const DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com/v1";
const GOOGLE_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/openai";

/// Anthropic API version header value.
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Default `max_tokens` when the request leaves it unset (Anthropic requires
/// the field).
const DEFAULT_MAX_TOKENS: u32 = 4096;

// ---------------------------------------------------------------------------
// Adapter trait
// ---------------------------------------------------------------------------

/// A completion backend the gateway can route requests to.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Static configuration (identity, priority, endpoint).
    fn config(&self) -> &BackendConfig;

    /// Send one request and return the parsed reply.
    async fn complete(&self, request: &CompletionRequest) -> Result<BackendReply>;

    /// Minimal liveness probe used by the health-check loop.
    async fn probe(&self) -> Result<()> {
        self.complete(&CompletionRequest::probe()).await.map(|_| ())
    }

    /// The backend's identity.
    fn id(&self) -> BackendId {
        self.config().id()
    }
}

/// Build the HTTP adapter matching `config.provider`.
///
/// `anthropic` gets the Messages adapter; every other provider is treated as
/// OpenAI-compatible.  Providers other than `ollama` require an API key.
pub fn build_backend(
    config: BackendConfig,
    http: reqwest::Client,
) -> Result<Arc<dyn CompletionBackend>> {
    let api_key = config.resolve_api_key();
    let provider = config.provider.to_ascii_lowercase();

    if api_key.is_none() && provider != "ollama" {
        return Err(AgentError::MissingApiKey {
            provider: config.provider.clone(),
        });
    }

    let backend: Arc<dyn CompletionBackend> = match provider.as_str() {
        "anthropic" => Arc::new(AnthropicBackend {
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| ANTHROPIC_BASE_URL.to_owned()),
            api_key: api_key.unwrap_or_default(),
            config,
            http,
        }),
        other => {
            let default_url = match other {
                "ollama" => OLLAMA_BASE_URL,
                "groq" => GROQ_BASE_URL,
                "deepseek" => DEEPSEEK_BASE_URL,
                "google" | "gemini" => GOOGLE_BASE_URL,
                _ => OPENAI_BASE_URL,
            };
            Arc::new(OpenAiCompatibleBackend {
                base_url: config
                    .base_url
                    .clone()
                    .unwrap_or_else(|| default_url.to_owned()),
                api_key: api_key.unwrap_or_else(|| "ollama".to_owned()),
                config,
                http,
            })
        }
    };

    tracing::debug!(backend = %backend.id(), "completion backend built");
    Ok(backend)
}

/// The shared HTTP client used by all adapters.
///
/// Per-call deadlines are enforced by the gateway; the client only bounds
/// connection setup.
pub fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
        .map_err(|e| AgentError::Config {
            reason: format!("failed to build HTTP client: {e}"),
        })
}

// ---------------------------------------------------------------------------
// OpenAI-compatible adapter
// ---------------------------------------------------------------------------

/// Adapter for the OpenAI Chat Completions API and compatible endpoints.
pub struct OpenAiCompatibleBackend {
    config: BackendConfig,
    base_url: String,
    api_key: String,
    http: reqwest::Client,
}

#[async_trait]
impl CompletionBackend for OpenAiCompatibleBackend {
    fn config(&self) -> &BackendConfig {
        &self.config
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<BackendReply> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let body = openai_request_body(&self.config.model, request);

        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", self.api_key)).map_err(|e| {
                AgentError::Config {
                    reason: format!("invalid authorization header: {e}"),
                }
            })?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        tracing::debug!(url = %url, model = %self.config.model, provider = %self.config.provider, "sending completion request");

        let v = send_json(&self.http, &url, headers, &body, &self.id()).await?;
        parse_openai_response(&v)
    }
}

/// Build the JSON body for the Chat Completions API.
pub fn openai_request_body(model: &str, request: &CompletionRequest) -> Value {
    let messages: Vec<Value> = request
        .messages
        .iter()
        .map(|m| json!({ "role": m.role.to_string(), "content": m.content }))
        .collect();

    let mut body = json!({
        "model": model,
        "messages": messages,
    });
    if let Some(max_tokens) = request.max_tokens {
        body["max_tokens"] = json!(max_tokens);
    }
    if let Some(temp) = request.temperature {
        body["temperature"] = json!(temp);
    }
    body
}

/// Parse a non-streaming Chat Completions response.
pub fn parse_openai_response(v: &Value) -> Result<BackendReply> {
    let message = &v["choices"][0]["message"];
    if message.is_null() {
        return Err(AgentError::ResponseParse {
            reason: "missing `choices[0].message` in response".into(),
        });
    }

    let content = message["content"].as_str().unwrap_or_default().to_owned();
    let usage = v.get("usage").filter(|u| u.is_object()).map(|u| Usage {
        prompt_tokens: token_count(&u["prompt_tokens"]),
        completion_tokens: token_count(&u["completion_tokens"]),
        total_tokens: token_count(&u["total_tokens"]),
    });

    Ok(BackendReply { content, usage })
}

// ---------------------------------------------------------------------------
// Anthropic adapter
// ---------------------------------------------------------------------------

/// Adapter for the Anthropic Messages API.
pub struct AnthropicBackend {
    config: BackendConfig,
    base_url: String,
    api_key: String,
    http: reqwest::Client,
}

#[async_trait]
impl CompletionBackend for AnthropicBackend {
    fn config(&self) -> &BackendConfig {
        &self.config
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<BackendReply> {
        let url = format!("{}/v1/messages", self.base_url.trim_end_matches('/'));
        let body = anthropic_request_body(&self.config.model, request);

        let mut headers = HeaderMap::new();
        headers.insert(
            "x-api-key",
            HeaderValue::from_str(&self.api_key).map_err(|e| AgentError::Config {
                reason: format!("invalid API key header: {e}"),
            })?,
        );
        headers.insert(
            "anthropic-version",
            HeaderValue::from_static(ANTHROPIC_VERSION),
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        tracing::debug!(url = %url, model = %self.config.model, provider = "anthropic", "sending completion request");

        let v = send_json(&self.http, &url, headers, &body, &self.id()).await?;
        parse_anthropic_response(&v)
    }
}

/// Build the JSON body for the Messages API.
///
/// System messages are lifted into the top-level `system` field; Anthropic
/// does not accept them in the `messages` array.
pub fn anthropic_request_body(model: &str, request: &CompletionRequest) -> Value {
    let (system, messages) = messages_to_anthropic(&request.messages);

    let mut body = json!({
        "model": model,
        "max_tokens": request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        "messages": messages,
    });
    if let Some(system) = system {
        body["system"] = json!(system);
    }
    if let Some(temp) = request.temperature {
        body["temperature"] = json!(temp);
    }
    body
}

fn messages_to_anthropic(messages: &[Message]) -> (Option<String>, Vec<Value>) {
    let mut system: Option<String> = None;
    let mut wire = Vec::with_capacity(messages.len());

    for msg in messages {
        match msg.role {
            Role::System => match &mut system {
                Some(existing) => {
                    existing.push('\n');
                    existing.push_str(&msg.content);
                }
                None => system = Some(msg.content.clone()),
            },
            Role::User | Role::Assistant => {
                wire.push(json!({ "role": msg.role.to_string(), "content": msg.content }));
            }
        }
    }

    (system, wire)
}

/// Parse a non-streaming Messages API response, concatenating text blocks.
pub fn parse_anthropic_response(v: &Value) -> Result<BackendReply> {
    let blocks = v["content"]
        .as_array()
        .ok_or_else(|| AgentError::ResponseParse {
            reason: "missing `content` array in response".into(),
        })?;

    let content: String = blocks
        .iter()
        .filter(|b| b["type"] == "text")
        .filter_map(|b| b["text"].as_str())
        .collect();

    let usage = v.get("usage").filter(|u| u.is_object()).map(|u| {
        let prompt_tokens = token_count(&u["input_tokens"]);
        let completion_tokens = token_count(&u["output_tokens"]);
        Usage {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    });

    Ok(BackendReply { content, usage })
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

async fn send_json(
    http: &reqwest::Client,
    url: &str,
    headers: HeaderMap,
    body: &Value,
    backend_id: &BackendId,
) -> Result<Value> {
    let resp = http
        .post(url)
        .headers(headers)
        .json(body)
        .send()
        .await
        .map_err(|e| AgentError::BackendFailure {
            backend_id: backend_id.to_string(),
            reason: e.to_string(),
        })?;

    let status = resp.status();
    let text = resp.text().await.map_err(|e| AgentError::BackendFailure {
        backend_id: backend_id.to_string(),
        reason: format!("failed to read response body: {e}"),
    })?;

    if !status.is_success() {
        return Err(AgentError::BackendFailure {
            backend_id: backend_id.to_string(),
            reason: format!("API returned {status}: {text}"),
        });
    }

    serde_json::from_str(&text).map_err(|e| AgentError::ResponseParse {
        reason: format!("invalid JSON response: {e}"),
    })
}

fn token_count(v: &Value) -> u32 {
    v.as_u64().map_or(0, |n| u32::try_from(n).unwrap_or(u32::MAX))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
