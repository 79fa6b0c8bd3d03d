//! Context retrieval for the output layer.
//!
//! Two jobs: `get_context` assembles memory + tool hints for a plan, and
//! `build_small_model_context` renders the compact NOW/RULES/NEXT view from
//! workspace events.
//!
//! Temporal guard: a `time_reference=today` plan must NOT hit the generic
//! memory graph (it returns stale "today" topics); it reads the daily
//! protocol file instead. Tool dispatch enforces the same block again.
//!
//! Fail-closed: the compact builder never returns the empty string on
//! internal errors — the output layer must always see that context
//! retrieval failed rather than silently proceeding without it.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{info, warn};

use cortex_core::config::SmallModelConfig;
use cortex_core::types::{Event, EventType};
use cortex_core::Result;
use cortex_events::{build_compact_context, format_compact_context, SectionCaps};
use cortex_mcp::McpHub;

use crate::plan::Plan;

/// Canonical fail-closed block. A NOW section plus a clarification bullet,
/// so a small model downstream asks instead of hallucinating.
pub const CONTEXT_ERROR_BLOCK: &str = "[CONTEXT ERROR]\nNOW:\n  - Kontextabruf fehlgeschlagen\nNEXT:\n  - Rückfrage stellen: letzte Angaben bitte bestätigen\n";

/// Memory access used by the context manager. The MCP hub is the production
/// backend; tests substitute scripted ones.
#[async_trait]
pub trait MemoryBackend: Send + Sync {
    /// Rendered memory text for a query (graph search).
    async fn graph_search(&self, query: &str) -> Result<String>;

    /// Raw workspace entries payload for a conversation.
    async fn workspace_entries(&self, conversation_id: &str) -> Result<Value>;
}

#[async_trait]
impl MemoryBackend for McpHub {
    async fn graph_search(&self, query: &str) -> Result<String> {
        let result = self
            .call_tool("memory_graph_search", json!({ "query": query, "limit": 5 }))
            .await?;
        Ok(render_memory_result(&result))
    }

    async fn workspace_entries(&self, conversation_id: &str) -> Result<Value> {
        self.call_tool(
            "memory_search_layered",
            json!({ "conversation_id": conversation_id, "layer": "workspace", "limit": 50 }),
        )
        .await
    }
}

fn render_memory_result(result: &Value) -> String {
    let entries = result
        .get("results")
        .and_then(|r| r.as_array())
        .cloned()
        .unwrap_or_default();
    let mut out = String::new();
    for entry in entries {
        if let Some(content) = entry.get("content").and_then(|c| c.as_str()) {
            out.push_str("- ");
            out.push_str(content);
            out.push('\n');
        }
    }
    out
}

#[derive(Debug, Clone, Default)]
pub struct ContextResult {
    pub memory_data: String,
    pub memory_used: bool,
    pub system_tools: String,
    pub sources: Vec<String>,
}

pub struct ContextManager {
    backend: Arc<dyn MemoryBackend>,
    small_model: SmallModelConfig,
    protocol_dir: PathBuf,
}

impl ContextManager {
    pub fn new(
        backend: Arc<dyn MemoryBackend>,
        small_model: SmallModelConfig,
        protocol_dir: impl AsRef<std::path::Path>,
    ) -> Self {
        Self {
            backend,
            small_model,
            protocol_dir: protocol_dir.as_ref().to_path_buf(),
        }
    }

    /// Retrieve context for a plan.
    pub async fn get_context(
        &self,
        query: &str,
        plan: &Plan,
        _conversation_id: &str,
    ) -> ContextResult {
        let mut result = ContextResult::default();

        // Temporal guard: "today" queries bypass the memory graph entirely.
        if plan.time_reference.as_deref() == Some("today") {
            let protocol = self.read_daily_protocol();
            result.memory_data = protocol;
            result.memory_used = true;
            result.sources.push("daily_protocol".to_string());
            info!("temporal guard: graph search blocked, daily protocol used");
            return self.finish(result, plan);
        }

        if plan.needs_memory || !plan.memory_keys.is_empty() {
            let mut fetched = String::new();
            let mut queries: Vec<String> = vec![query.to_string()];
            queries.extend(plan.memory_keys.iter().cloned());
            let mut seen = HashSet::new();
            for q in queries {
                if !seen.insert(q.clone()) {
                    continue;
                }
                match self.backend.graph_search(&q).await {
                    Ok(text) if !text.is_empty() => {
                        fetched.push_str(&text);
                        result.sources.push(format!("memory:{q}"));
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, query = %q, "memory search failed");
                    }
                }
            }
            if !fetched.is_empty() {
                result.memory_data = fetched;
                result.memory_used = true;
            }
        }

        self.finish(result, plan)
    }

    fn finish(&self, mut result: ContextResult, plan: &Plan) -> ContextResult {
        if !plan.suggested_tools.is_empty() {
            let mut tools = String::from("## Verfügbare Tools\n");
            for name in &plan.suggested_tools {
                tools.push_str("- ");
                tools.push_str(name);
                tools.push('\n');
            }
            result.system_tools = tools;
            result.sources.push("system_tools".to_string());
        }
        result
    }

    /// Today's protocol markdown. Present-and-non-empty even when no file
    /// was written yet — the temporal path must never be silent.
    fn read_daily_protocol(&self) -> String {
        let today = chrono::Utc::now().format("%Y-%m-%d").to_string();
        let path = self.protocol_dir.join(format!("{today}.md"));
        match std::fs::read_to_string(&path) {
            Ok(contents) if !contents.trim().is_empty() => contents,
            _ => format!("# Protokoll {today}\n(keine Einträge für heute)\n"),
        }
    }

    /// Compact NOW/RULES/NEXT view for small-context models. Fail-closed:
    /// any backend or parse failure yields the canonical error block.
    pub async fn build_small_model_context(&self, conversation_id: &str) -> String {
        let payload = match self.backend.workspace_entries(conversation_id).await {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, conv = conversation_id, "workspace fetch failed");
                return CONTEXT_ERROR_BLOCK.to_string();
            }
        };

        let entries = extract_workspace_events(&payload);
        let events: Vec<Event> = entries.iter().filter_map(event_from_entry).collect();
        let caps = SectionCaps {
            now_max: self.small_model.now_max,
            rules_max: self.small_model.rules_max,
            next_max: self.small_model.next_max,
        };
        let ctx = build_compact_context(&events, caps);
        format_compact_context(&ctx)
    }
}

/// Pull the entry list out of whatever shape the hub handed back:
/// a ToolResult-like object (`content` list or JSON string), a
/// `structuredContent` wrapper (`entries` or legacy `events`), or a plain
/// list. Anything else reads as empty.
pub fn extract_workspace_events(payload: &Value) -> Vec<Value> {
    if let Some(list) = payload.as_array() {
        return list.clone();
    }
    if let Some(content) = payload.get("content") {
        if let Some(list) = content.as_array() {
            return list.clone();
        }
        if let Some(text) = content.as_str() {
            if let Ok(Value::Array(list)) = serde_json::from_str(text) {
                return list;
            }
        }
    }
    if let Some(structured) = payload.get("structuredContent") {
        for key in ["entries", "events"] {
            if let Some(list) = structured.get(key).and_then(|v| v.as_array()) {
                return list.clone();
            }
        }
    }
    Vec::new()
}

/// `event_data` may be an object or (in pre-migration rows) a JSON-encoded
/// string. Invalid payloads read as empty.
pub fn get_event_data(entry: &Value) -> serde_json::Map<String, Value> {
    match entry.get("event_data") {
        Some(Value::Object(map)) => map.clone(),
        Some(Value::String(raw)) => match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        },
        _ => serde_json::Map::new(),
    }
}

fn event_from_entry(entry: &Value) -> Option<Event> {
    let event_type = entry
        .get("event_type")
        .or_else(|| entry.get("entry_type"))
        .and_then(|v| v.as_str())?;
    Some(Event {
        id: entry
            .get("id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        conversation_id: entry
            .get("conversation_id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        event_type: EventType::from(event_type),
        created_at: entry
            .get("created_at")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        event_data: get_event_data(entry),
    })
}
