//! Queue-independent archive embedding pass.
//!
//! Archive rows whose graph mirror failed at write time carry an empty
//! `archive_graph_node_id`; this pass re-pushes them to the memory graph.
//! It is the unit of work behind the post-task job queue AND the direct
//! fallback when the queue is unavailable — it never touches the queue.
//!
//! The pushed metadata carries the same archive key as the store row, so
//! the graph side stays joinable and repeated pushes land on the same node.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info};

use cortex_digest::store::DigestRow;
use cortex_digest::weekly::GraphMirror;
use cortex_digest::DigestStore;

use crate::queue::EmbeddingProcessor;

pub struct ArchiveEmbedder {
    graph: Arc<dyn GraphMirror>,
    store_path: String,
}

impl ArchiveEmbedder {
    pub fn new(graph: Arc<dyn GraphMirror>, store_path: impl Into<String>) -> Self {
        Self {
            graph,
            store_path: store_path.into(),
        }
    }

    /// Push up to `batch_size` unmirrored archive rows to the graph.
    ///
    /// Returns the number pushed. `Err` only when at least one push failed
    /// and nothing succeeded — the transient signal the queue retries on.
    pub async fn process_pending(&self, batch_size: usize) -> Result<usize, String> {
        let store = DigestStore::new(&self.store_path);
        let rows = store.list_by_action("archive_digest");
        let pending: Vec<&DigestRow> = rows
            .iter()
            .filter(|row| needs_embedding(row))
            .take(batch_size)
            .collect();
        if pending.is_empty() {
            debug!("no archive rows pending embedding");
            return Ok(0);
        }

        let mut processed = 0usize;
        let mut last_error: Option<String> = None;
        for row in pending {
            let conversation_id = row
                .get("conversation_id")
                .map(String::as_str)
                .unwrap_or_default();
            let Some(params) = row
                .get("parameters")
                .and_then(|p| serde_json::from_str::<serde_json::Value>(p).ok())
            else {
                continue;
            };
            let Some(archive_key) = params.get("digest_key").and_then(|k| k.as_str()) else {
                continue;
            };
            let weekly_key = params
                .get("weekly_digest_key")
                .and_then(|k| k.as_str())
                .unwrap_or_default();
            let archive_date = params
                .get("archive_date")
                .and_then(|d| d.as_str())
                .unwrap_or_default();

            let content = format!(
                "[archive_digest] conv={conversation_id} weekly_key={weekly_key} date={archive_date}"
            );
            match self
                .graph
                .save_archive_node(
                    conversation_id,
                    &content,
                    json!({
                        "type": "archive_digest",
                        "weekly_digest_key": weekly_key,
                        "archived_at": archive_date,
                        "archive_key": archive_key,
                    }),
                )
                .await
            {
                Some(node_id) => {
                    debug!(key = archive_key, node = %node_id, "archive embedded");
                    processed += 1;
                }
                None => {
                    last_error = Some(format!("graph push failed for key={archive_key}"));
                }
            }
        }

        if processed == 0 {
            if let Some(reason) = last_error {
                return Err(reason);
            }
        }
        info!(processed, "archive embedding pass complete");
        Ok(processed)
    }
}

/// A row needs embedding when its recorded graph node id is empty — the
/// write-time mirror failed or was disabled.
fn needs_embedding(row: &DigestRow) -> bool {
    row.get("fact_attributes")
        .and_then(|fa| serde_json::from_str::<serde_json::Value>(fa).ok())
        .map(|fa| {
            fa.get("archive_graph_node_id")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .is_empty()
        })
        .unwrap_or(false)
}

#[async_trait]
impl EmbeddingProcessor for ArchiveEmbedder {
    async fn process_pending(&self, batch_size: usize) -> Result<usize, String> {
        ArchiveEmbedder::process_pending(self, batch_size).await
    }
}
