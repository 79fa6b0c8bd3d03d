//! Semantic routers for blueprints and skills.
//!
//! Both share the same gate structure: a trust filter first (only
//! `trust_level=verified` candidates with parseable metadata and an id in
//! the active set survive), then score thresholds:
//!
//!   score <  0.68          → no match (hard gate, no freestyle fallback)
//!   0.68 ≤ score < 0.85    → suggest (top-2 candidates, user confirms)
//!   score ≥ 0.85           → use (auto-route)
//!
//! Broken metadata is treated as untrusted. When the router itself is
//! unavailable the caller must block the tool class, not fall through.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::json;
use tracing::{info, warn};

use cortex_mcp::McpHub;

pub const SUGGEST_THRESHOLD: f64 = 0.68;
pub const STRICT_THRESHOLD: f64 = 0.85;

/// One raw semantic search hit. `metadata` stays a string: malformed JSON
/// is a trust signal, not a parse error to paper over.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub similarity: f64,
    pub metadata: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Use,
    Suggest,
    NoMatch,
}

#[derive(Debug, Clone)]
pub struct Candidate {
    pub id: String,
    pub score: f64,
}

#[derive(Debug, Clone)]
pub struct RouteDecision {
    pub outcome: RouteOutcome,
    /// Set for `Use`; the top suggestion for `Suggest`; `None` otherwise.
    pub target_id: Option<String>,
    pub score: f64,
    /// Top-2 surviving candidates (Suggest zone shows these to the user).
    pub candidates: Vec<Candidate>,
}

impl RouteDecision {
    fn no_match() -> Self {
        Self {
            outcome: RouteOutcome::NoMatch,
            target_id: None,
            score: 0.0,
            candidates: Vec::new(),
        }
    }

    /// Wire label used in decisions and logs, e.g. `no_blueprint`.
    pub fn label(&self, kind: &str) -> String {
        match self.outcome {
            RouteOutcome::Use => format!("use_{kind}"),
            RouteOutcome::Suggest => format!("suggest_{kind}"),
            RouteOutcome::NoMatch => format!("no_{kind}"),
        }
    }
}

/// Pure routing core, shared by both routers.
///
/// `id_field` names the metadata key carrying the candidate id
/// (`blueprint_id` / `skill_name`). `active_ids` is the soft-delete filter:
/// a candidate present in the graph but absent from the active set is
/// dropped regardless of score.
pub fn route_hits(
    hits: &[SearchHit],
    id_field: &str,
    active_ids: &HashSet<String>,
) -> RouteDecision {
    let mut survivors: Vec<Candidate> = hits
        .iter()
        .filter_map(|hit| {
            let metadata: serde_json::Value = match serde_json::from_str(&hit.metadata) {
                Ok(v) => v,
                Err(_) => {
                    warn!("candidate metadata unparseable — treated as untrusted");
                    return None;
                }
            };
            if metadata.get("trust_level").and_then(|v| v.as_str()) != Some("verified") {
                return None;
            }
            let id = metadata.get(id_field).and_then(|v| v.as_str())?.to_string();
            if !active_ids.contains(&id) {
                return None;
            }
            Some(Candidate {
                id,
                score: hit.similarity,
            })
        })
        .collect();

    survivors.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    survivors.truncate(2);

    let Some(best) = survivors.first().cloned() else {
        return RouteDecision::no_match();
    };

    if best.score >= STRICT_THRESHOLD {
        RouteDecision {
            outcome: RouteOutcome::Use,
            target_id: Some(best.id.clone()),
            score: best.score,
            candidates: survivors,
        }
    } else if best.score >= SUGGEST_THRESHOLD {
        RouteDecision {
            outcome: RouteOutcome::Suggest,
            target_id: Some(best.id.clone()),
            score: best.score,
            candidates: survivors,
        }
    } else {
        RouteDecision::no_match()
    }
}

fn hits_from_search_result(result: &serde_json::Value) -> Vec<SearchHit> {
    result
        .get("results")
        .and_then(|r| r.as_array())
        .map(|items| {
            items
                .iter()
                .map(|item| SearchHit {
                    similarity: item
                        .get("similarity")
                        .and_then(|s| s.as_f64())
                        .unwrap_or(0.0),
                    metadata: match item.get("metadata") {
                        Some(serde_json::Value::String(s)) => s.clone(),
                        Some(other) => other.to_string(),
                        None => String::new(),
                    },
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Blueprint router: gates `request_container` on a verified blueprint.
pub struct BlueprintSemanticRouter {
    hub: Arc<McpHub>,
}

impl BlueprintSemanticRouter {
    pub fn new(hub: Arc<McpHub>) -> Self {
        Self { hub }
    }

    pub async fn route(&self, user_intent: &str, active_ids: &HashSet<String>) -> RouteDecision {
        let result = match self
            .hub
            .call_tool(
                "blueprint_semantic_search",
                json!({ "query": user_intent, "limit": 5 }),
            )
            .await
        {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "blueprint search failed — no_blueprint");
                return RouteDecision::no_match();
            }
        };
        let hits = hits_from_search_result(&result);
        let decision = route_hits(&hits, "blueprint_id", active_ids);
        info!(
            decision = %decision.label("blueprint"),
            score = decision.score,
            "blueprint route"
        );
        decision
    }
}

/// Skill router: gates skill tools the same way. The id field follows the
/// configured key mode (`name` → `skill_name`, `legacy` → `skill_id`).
pub struct SkillSemanticRouter {
    hub: Arc<McpHub>,
    id_field: &'static str,
}

impl SkillSemanticRouter {
    pub fn new(hub: Arc<McpHub>, key_mode: &str) -> Self {
        Self {
            hub,
            id_field: if key_mode == "legacy" {
                "skill_id"
            } else {
                "skill_name"
            },
        }
    }

    pub async fn route(&self, user_intent: &str, active_ids: &HashSet<String>) -> RouteDecision {
        let result = match self
            .hub
            .call_tool(
                "memory_semantic_search",
                json!({ "query": user_intent, "limit": 5, "min_similarity": 0.3 }),
            )
            .await
        {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "skill search failed — no_skill");
                return RouteDecision::no_match();
            }
        };
        let hits = hits_from_search_result(&result);
        let decision = route_hits(&hits, self.id_field, active_ids);
        info!(decision = %decision.label("skill"), score = decision.score, "skill route");
        decision
    }
}
