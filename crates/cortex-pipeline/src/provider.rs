//! LLM provider interface for the three pipeline layers.
//!
//! One trait, one HTTP implementation (Ollama-compatible `/api/chat`).
//! Every call carries a deadline; expiry surfaces as a provider error that
//! the orchestrator maps to `done_reason=error`.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use cortex_core::types::{ChatMessage, MessageRole};

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("deadline exceeded after {ms}ms")]
    Deadline { ms: u64 },

    #[error("provider unavailable: {0}")]
    Unavailable(String),
}

/// Request to a chat model.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub model: String,
    pub system: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct ModelResponse {
    pub content: String,
    pub model: String,
}

/// Common interface for chat model backends. The orchestrator only ever
/// talks to this trait; tests substitute scripted providers.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, req: &ModelRequest) -> Result<ModelResponse, ProviderError>;

    /// Stream content deltas through a channel. Default falls back to a
    /// single non-streaming send.
    async fn send_stream(
        &self,
        req: &ModelRequest,
        tx: mpsc::Sender<String>,
    ) -> Result<ModelResponse, ProviderError> {
        let resp = self.send(req).await?;
        let _ = tx.send(resp.content.clone()).await;
        Ok(resp)
    }
}

/// Ollama-compatible chat backend.
pub struct OllamaProvider {
    client: reqwest::Client,
    base_url: String,
    deadline: Duration,
}

impl OllamaProvider {
    pub fn new(base_url: impl Into<String>, deadline_s: u64) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            deadline: Duration::from_secs(deadline_s),
        }
    }

    fn build_body(&self, req: &ModelRequest, stream: bool) -> serde_json::Value {
        let mut messages = vec![serde_json::json!({
            "role": "system",
            "content": req.system,
        })];
        for m in &req.messages {
            messages.push(serde_json::json!({
                "role": role_str(m.role),
                "content": m.content,
            }));
        }
        let mut body = serde_json::json!({
            "model": req.model,
            "messages": messages,
            "stream": stream,
        });
        let mut options = serde_json::Map::new();
        if let Some(t) = req.temperature {
            options.insert("temperature".to_string(), serde_json::json!(t));
        }
        if let Some(n) = req.max_tokens {
            options.insert("num_predict".to_string(), serde_json::json!(n));
        }
        if !options.is_empty() {
            body["options"] = serde_json::Value::Object(options);
        }
        body
    }
}

fn role_str(role: MessageRole) -> &'static str {
    match role {
        MessageRole::User => "user",
        MessageRole::Assistant => "assistant",
        MessageRole::System => "system",
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    model: String,
    #[serde(default)]
    message: ApiMessage,
}

#[derive(Debug, Deserialize, Default)]
struct ApiMessage {
    #[serde(default)]
    content: String,
}

#[async_trait]
impl ChatProvider for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn send(&self, req: &ModelRequest) -> Result<ModelResponse, ProviderError> {
        let url = format!("{}/api/chat", self.base_url);
        debug!(model = %req.model, "model request");

        let resp = self
            .client
            .post(&url)
            .timeout(self.deadline)
            .json(&self.build_body(req, false))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Deadline {
                        ms: self.deadline.as_millis() as u64,
                    }
                } else if e.is_connect() {
                    ProviderError::Unavailable(e.to_string())
                } else {
                    ProviderError::Http(e)
                }
            })?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "model api error");
            return Err(ProviderError::Api {
                status,
                message: text,
            });
        }

        let api: ApiResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;
        Ok(ModelResponse {
            content: api.message.content,
            model: if api.model.is_empty() {
                req.model.clone()
            } else {
                api.model
            },
        })
    }

    async fn send_stream(
        &self,
        req: &ModelRequest,
        tx: mpsc::Sender<String>,
    ) -> Result<ModelResponse, ProviderError> {
        let url = format!("{}/api/chat", self.base_url);
        let resp = self
            .client
            .post(&url)
            .timeout(self.deadline)
            .json(&self.build_body(req, true))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Deadline {
                        ms: self.deadline.as_millis() as u64,
                    }
                } else {
                    ProviderError::Unavailable(e.to_string())
                }
            })?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Api {
                status,
                message: text,
            });
        }

        // NDJSON stream: one JSON object per line, `done:true` terminates.
        let mut content = String::new();
        let mut model = req.model.clone();
        let mut buffer = Vec::new();
        let mut stream = resp;
        while let Some(chunk) = stream.chunk().await? {
            buffer.extend_from_slice(&chunk);
            while let Some(newline) = buffer.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=newline).collect();
                let Ok(value) = serde_json::from_slice::<serde_json::Value>(&line) else {
                    continue;
                };
                if let Some(m) = value.get("model").and_then(|v| v.as_str()) {
                    model = m.to_string();
                }
                if let Some(delta) = value
                    .get("message")
                    .and_then(|m| m.get("content"))
                    .and_then(|c| c.as_str())
                {
                    if !delta.is_empty() {
                        content.push_str(delta);
                        // Consumer gone → cooperative stop.
                        if tx.send(delta.to_string()).await.is_err() {
                            return Ok(ModelResponse { content, model });
                        }
                    }
                }
                if value.get("done").and_then(|d| d.as_bool()).unwrap_or(false) {
                    return Ok(ModelResponse { content, model });
                }
            }
        }
        Ok(ModelResponse { content, model })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_includes_system_and_options() {
        let provider = OllamaProvider::new("http://localhost:11434", 60);
        let req = ModelRequest {
            model: "qwen2.5:1.5b".into(),
            system: "you verify plans".into(),
            messages: vec![ChatMessage {
                role: MessageRole::User,
                content: "check this".into(),
            }],
            temperature: Some(0.2),
            max_tokens: Some(512),
        };
        let body = provider.build_body(&req, false);
        assert_eq!(body["model"], "qwen2.5:1.5b");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["role"], "user");
        assert_eq!(body["options"]["temperature"], 0.2);
        assert_eq!(body["options"]["num_predict"], 512);
        assert_eq!(body["stream"], false);
    }

    #[test]
    fn body_omits_options_when_unset() {
        let provider = OllamaProvider::new("http://localhost:11434", 60);
        let req = ModelRequest {
            model: "m".into(),
            system: String::new(),
            messages: Vec::new(),
            temperature: None,
            max_tokens: None,
        };
        let body = provider.build_body(&req, true);
        assert!(body.get("options").is_none());
        assert_eq!(body["stream"], true);
    }
}
