//! MCP tool hub client.
//!
//! The hub is a single JSON-RPC 2.0 endpoint speaking `initialize`,
//! `tools/list` and `tools/call`. We keep a `tool name → server` map from
//! the last `tools/list` so callers can validate suggested tool names before
//! dispatch — hallucinated names are dropped, never sent.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use cortex_core::{CortexError, Result};

/// One tool definition as advertised by `tools/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDef {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON-Schema of the arguments; `required` is consulted for auto-fill.
    #[serde(default, rename = "inputSchema")]
    pub input_schema: Value,
    /// Which upstream server owns the tool (hub-side routing tag).
    #[serde(default)]
    pub server: String,
}

impl ToolDef {
    /// Names listed as required by the tool's input schema.
    pub fn required_args(&self) -> Vec<String> {
        self.input_schema
            .get("required")
            .and_then(|r| r.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default()
    }
}

pub struct McpHub {
    client: reqwest::Client,
    base_url: String,
    tool_timeout: Duration,
    tools: RwLock<HashMap<String, ToolDef>>,
    request_id: AtomicU64,
    initialized: std::sync::atomic::AtomicBool,
}

impl McpHub {
    pub fn new(base_url: impl Into<String>, tool_timeout_s: u64) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            tool_timeout: Duration::from_secs(tool_timeout_s),
            tools: RwLock::new(HashMap::new()),
            request_id: AtomicU64::new(1),
            initialized: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Handshake + tool discovery. Idempotent: repeated calls refresh the
    /// tool map but only the first performs the `initialize` exchange.
    pub async fn initialize(&self) -> Result<()> {
        if !self.initialized.swap(true, Ordering::SeqCst) {
            let _ = self
                .rpc(
                    "initialize",
                    json!({
                        "protocolVersion": "2025-06-18",
                        "capabilities": {},
                        "clientInfo": {
                            "name": "cortex",
                            "version": env!("CARGO_PKG_VERSION"),
                        }
                    }),
                )
                .await?;
        }
        self.refresh_tools().await
    }

    /// Re-fetch the tool list and rebuild the routing map.
    pub async fn refresh_tools(&self) -> Result<()> {
        let result = self.rpc("tools/list", json!({})).await?;
        let defs: Vec<ToolDef> = result
            .get("tools")
            .and_then(|t| serde_json::from_value(t.clone()).ok())
            .unwrap_or_default();
        let count = defs.len();
        let mut map = self.tools.write().expect("tool map poisoned");
        map.clear();
        for def in defs {
            map.insert(def.name.clone(), def);
        }
        info!(tools = count, "mcp tool map refreshed");
        Ok(())
    }

    /// True if a tool with this name is registered.
    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.read().expect("tool map poisoned").contains_key(name)
    }

    /// The tool definition, if registered.
    pub fn tool_def(&self, name: &str) -> Option<ToolDef> {
        self.tools.read().expect("tool map poisoned").get(name).cloned()
    }

    /// All registered tool names, sorted.
    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .tools
            .read()
            .expect("tool map poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort_unstable();
        names
    }

    /// Call a tool by name. Returns the structured result payload.
    ///
    /// Result unwrapping prefers `structuredContent`, then the first text
    /// content block (parsed as JSON when possible), then the raw result.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value> {
        debug!(tool = name, "mcp tools/call");
        let result = self
            .rpc("tools/call", json!({ "name": name, "arguments": arguments }))
            .await
            .map_err(|e| CortexError::ToolCall {
                tool: name.to_string(),
                reason: e.to_string(),
            })?;

        if result
            .get("isError")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
        {
            let reason = extract_text_content(&result).unwrap_or_else(|| "tool error".to_string());
            return Err(CortexError::ToolCall {
                tool: name.to_string(),
                reason,
            });
        }

        if let Some(structured) = result.get("structuredContent") {
            return Ok(structured.clone());
        }
        if let Some(text) = extract_text_content(&result) {
            if let Ok(parsed) = serde_json::from_str::<Value>(&text) {
                return Ok(parsed);
            }
            return Ok(Value::String(text));
        }
        Ok(result)
    }

    async fn rpc(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.request_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let response = self
            .client
            .post(&self.base_url)
            .timeout(self.tool_timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CortexError::Timeout {
                        ms: self.tool_timeout.as_millis() as u64,
                    }
                } else {
                    CortexError::Hub(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), body = %text, "hub http error");
            return Err(CortexError::Hub(format!("http {status}: {text}")));
        }

        let envelope: Value = response
            .json()
            .await
            .map_err(|e| CortexError::Hub(format!("bad hub response: {e}")))?;

        if let Some(error) = envelope.get("error") {
            return Err(CortexError::Hub(
                error
                    .get("message")
                    .and_then(|m| m.as_str())
                    .unwrap_or("rpc error")
                    .to_string(),
            ));
        }
        Ok(envelope.get("result").cloned().unwrap_or(Value::Null))
    }
}

/// First `{"type":"text"}` block of an MCP content array, if any.
fn extract_text_content(result: &Value) -> Option<String> {
    result
        .get("content")
        .and_then(|c| c.as_array())
        .and_then(|blocks| {
            blocks.iter().find_map(|b| {
                (b.get("type").and_then(|t| t.as_str()) == Some("text"))
                    .then(|| b.get("text").and_then(|t| t.as_str()).map(String::from))
                    .flatten()
            })
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_args_reads_input_schema() {
        let def = ToolDef {
            name: "memory_search".into(),
            description: String::new(),
            input_schema: json!({
                "type": "object",
                "properties": {"query": {"type": "string"}},
                "required": ["query"],
            }),
            server: "sql-memory".into(),
        };
        assert_eq!(def.required_args(), vec!["query".to_string()]);
    }

    #[test]
    fn required_args_empty_without_schema() {
        let def = ToolDef {
            name: "x".into(),
            description: String::new(),
            input_schema: Value::Null,
            server: String::new(),
        };
        assert!(def.required_args().is_empty());
    }

    #[test]
    fn extract_text_content_finds_first_text_block() {
        let result = json!({
            "content": [
                {"type": "image", "data": "…"},
                {"type": "text", "text": "{\"ok\":true}"},
            ]
        });
        assert_eq!(
            extract_text_content(&result).as_deref(),
            Some("{\"ok\":true}")
        );
        assert!(extract_text_content(&json!({})).is_none());
    }

    #[test]
    fn unknown_tool_is_not_registered() {
        let hub = McpHub::new("http://localhost:0", 1);
        assert!(!hub.has_tool("made_up_tool"));
        assert!(hub.tool_def("made_up_tool").is_none());
    }
}
