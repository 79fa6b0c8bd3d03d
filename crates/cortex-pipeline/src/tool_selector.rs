//! Layer 0: tool candidate finder.
//!
//! Semantic search only — no model call. The Control layer makes the final
//! tool decision; these names are hints handed to Thinking.

use std::sync::Arc;

use serde_json::json;
use tracing::{info, warn};

use cortex_mcp::McpHub;

pub struct ToolSelector {
    hub: Arc<McpHub>,
}

impl ToolSelector {
    pub fn new(hub: Arc<McpHub>) -> Self {
        Self { hub }
    }

    /// Tool candidates for the user text, or `None` when the search is
    /// unavailable or returns nothing useful.
    pub async fn select_tools(&self, user_text: &str) -> Option<Vec<String>> {
        let result = match self
            .hub
            .call_tool(
                "memory_semantic_search",
                json!({ "query": user_text, "limit": 15, "min_similarity": 0.3 }),
            )
            .await
        {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "tool selector search failed");
                return None;
            }
        };

        let rows = result.get("results")?.as_array()?;
        let mut seen = std::collections::HashSet::new();
        let mut candidates = Vec::new();
        for row in rows {
            let key = row
                .get("metadata")
                .and_then(|m| m.get("key"))
                .and_then(|k| k.as_str())
                .unwrap_or("");
            // Tool entries are stored under keys like "tool_list_skills".
            if let Some(name) = key.strip_prefix("tool_") {
                if !name.is_empty() && seen.insert(name.to_string()) {
                    candidates.push(name.to_string());
                }
            }
        }

        if candidates.is_empty() {
            return None;
        }
        info!(count = candidates.len(), "tool candidates selected");
        Some(candidates)
    }
}
