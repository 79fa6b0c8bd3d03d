//! Plan and Verification — the structured outputs of the Thinking and
//! Control layers.
//!
//! Both are parsed from model JSON with tolerant field extraction (models
//! omit fields, emit strings for numbers, wrap output in code fences) but
//! held as typed structs from there on. Downstream code never touches raw
//! JSON again.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Risk {
    Low,
    #[default]
    Medium,
    High,
}

impl Risk {
    pub fn parse(s: &str) -> Self {
        match s {
            "low" => Self::Low,
            "high" => Self::High,
            _ => Self::Medium,
        }
    }
}

impl fmt::Display for Risk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
        }
    }
}

/// How the user wants the answer shaped this turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseMode {
    #[default]
    Interactive,
    Deep,
}

impl ResponseMode {
    /// `/deep` prefix forces deep mode; everything else is interactive.
    pub fn from_user_text(text: &str) -> Self {
        if text.trim_start().starts_with("/deep") {
            Self::Deep
        } else {
            Self::Interactive
        }
    }
}

/// Output of the Thinking layer. Drives every downstream decision.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Plan {
    pub intent: String,
    pub needs_memory: bool,
    pub memory_keys: BTreeSet<String>,
    pub hallucination_risk: Risk,
    pub needs_sequential_thinking: bool,
    /// 0..=10, clamped on parse.
    pub sequential_complexity: u8,
    pub suggested_tools: Vec<String>,
    pub is_new_fact: bool,
    pub new_fact_key: Option<String>,
    pub new_fact_value: Option<String>,
    /// Temporal reference extracted from the query ("today", …). Gates the
    /// context manager's memory search.
    pub time_reference: Option<String>,

    // Volatile pipeline flags. Never serialised to callers and stripped
    // before a plan is copied into an intent.
    #[serde(skip)]
    pub sequential_deferred: bool,
    #[serde(skip)]
    pub skill_gate_blocked: bool,
    #[serde(skip)]
    pub blueprint_gate_blocked: bool,
}

impl Plan {
    /// Parse a plan from model output. Accepts raw JSON or JSON inside a
    /// fenced block; missing fields take defaults.
    pub fn from_model_output(raw: &str) -> Self {
        let Some(value) = extract_json_object(raw) else {
            return Plan {
                intent: "unknown".to_string(),
                ..Plan::default()
            };
        };

        let mut plan = Plan {
            intent: str_field(&value, "intent").unwrap_or_else(|| "unknown".to_string()),
            needs_memory: bool_field(&value, "needs_memory"),
            hallucination_risk: str_field(&value, "hallucination_risk")
                .map(|s| Risk::parse(&s))
                .unwrap_or_default(),
            needs_sequential_thinking: bool_field(&value, "needs_sequential_thinking")
                || bool_field(&value, "sequential_thinking_required"),
            sequential_complexity: u64_field(&value, "sequential_complexity").min(10) as u8,
            is_new_fact: bool_field(&value, "is_new_fact"),
            new_fact_key: str_field(&value, "new_fact_key"),
            new_fact_value: str_field(&value, "new_fact_value"),
            time_reference: str_field(&value, "time_reference"),
            ..Plan::default()
        };
        plan.memory_keys = string_list(&value, "memory_keys").into_iter().collect();
        plan.suggested_tools = string_list(&value, "suggested_tools");
        plan
    }

    /// Serialisable copy without volatile pipeline flags, for storage in an
    /// intent or the plan cache.
    pub fn stable_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Output of the Control layer.
#[derive(Debug, Clone, Default)]
pub struct Verification {
    pub approved: bool,
    /// Partial plan overrides; applied by `apply_corrections`.
    pub corrections: Corrections,
    pub warnings: Vec<String>,
    pub needs_skill_confirmation: bool,
    pub skill_name: Option<String>,
    /// Message shown when the request is not approved.
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Corrections {
    pub memory_keys: Vec<String>,
    pub suggested_tools: Option<Vec<String>>,
    pub hallucination_risk: Option<Risk>,
}

impl Corrections {
    pub fn is_empty(&self) -> bool {
        self.memory_keys.is_empty()
            && self.suggested_tools.is_none()
            && self.hallucination_risk.is_none()
    }
}

impl Verification {
    /// A verification that approves the plan unchanged (skip path).
    pub fn approved() -> Self {
        Self {
            approved: true,
            ..Self::default()
        }
    }

    /// Parse from model output. Unparseable output approves by default —
    /// Control failing must not block the pipeline.
    pub fn from_model_output(raw: &str) -> Self {
        let Some(value) = extract_json_object(raw) else {
            return Self::approved();
        };

        let corrections_value = value.get("corrections").cloned().unwrap_or_default();
        let corrections = Corrections {
            memory_keys: string_list(&corrections_value, "memory_keys"),
            suggested_tools: corrections_value
                .get("suggested_tools")
                .and_then(|v| v.as_array())
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|v| v.as_str().map(String::from))
                        .collect()
                }),
            hallucination_risk: str_field(&corrections_value, "hallucination_risk")
                .map(|s| Risk::parse(&s)),
        };

        Self {
            approved: value
                .get("approved")
                .and_then(|v| v.as_bool())
                .unwrap_or(true),
            corrections,
            warnings: string_list(&value, "warnings"),
            needs_skill_confirmation: bool_field(&value, "_needs_skill_confirmation")
                || bool_field(&value, "needs_skill_confirmation"),
            skill_name: str_field(&value, "_skill_name").or_else(|| str_field(&value, "skill_name")),
            message: str_field(&value, "message"),
        }
    }

    /// Apply corrections to a plan, returning the verified plan.
    pub fn apply_to(&self, plan: &Plan) -> Plan {
        let mut verified = plan.clone();
        for key in &self.corrections.memory_keys {
            verified.memory_keys.insert(key.clone());
        }
        if let Some(tools) = &self.corrections.suggested_tools {
            verified.suggested_tools = tools.clone();
        }
        if let Some(risk) = self.corrections.hallucination_risk {
            verified.hallucination_risk = risk;
        }
        verified
    }
}

// ── tolerant JSON field helpers ─────────────────────────────────────────────

/// Find the outermost JSON object in model output (handles code fences and
/// surrounding prose).
pub fn extract_json_object(raw: &str) -> Option<serde_json::Value> {
    let trimmed = raw.trim();
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if value.is_object() {
            return Some(value);
        }
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&trimmed[start..=end])
        .ok()
        .filter(serde_json::Value::is_object)
}

fn str_field(value: &serde_json::Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
}

fn bool_field(value: &serde_json::Value, key: &str) -> bool {
    match value.get(key) {
        Some(serde_json::Value::Bool(b)) => *b,
        Some(serde_json::Value::String(s)) => s.eq_ignore_ascii_case("true"),
        _ => false,
    }
}

fn u64_field(value: &serde_json::Value, key: &str) -> u64 {
    match value.get(key) {
        Some(serde_json::Value::Number(n)) => n.as_u64().unwrap_or(0),
        Some(serde_json::Value::String(s)) => s.parse().unwrap_or(0),
        _ => 0,
    }
}

fn string_list(value: &serde_json::Value, key: &str) -> Vec<String> {
    value
        .get(key)
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_parses_full_json() {
        let raw = r#"{
            "intent": "run python code",
            "needs_memory": true,
            "memory_keys": ["project_x", "deploy_target"],
            "hallucination_risk": "high",
            "needs_sequential_thinking": true,
            "sequential_complexity": 8,
            "suggested_tools": ["request_container", "exec_in_container"]
        }"#;
        let plan = Plan::from_model_output(raw);
        assert_eq!(plan.intent, "run python code");
        assert!(plan.needs_memory);
        assert_eq!(plan.memory_keys.len(), 2);
        assert_eq!(plan.hallucination_risk, Risk::High);
        assert_eq!(plan.sequential_complexity, 8);
        assert_eq!(plan.suggested_tools.len(), 2);
    }

    #[test]
    fn plan_parses_fenced_json_with_prose() {
        let raw = "Here is my analysis:\n```json\n{\"intent\": \"greet\", \"hallucination_risk\": \"low\"}\n```\nDone.";
        let plan = Plan::from_model_output(raw);
        assert_eq!(plan.intent, "greet");
        assert_eq!(plan.hallucination_risk, Risk::Low);
    }

    #[test]
    fn unparseable_plan_defaults_to_unknown() {
        let plan = Plan::from_model_output("I have no idea");
        assert_eq!(plan.intent, "unknown");
        assert_eq!(plan.hallucination_risk, Risk::Medium);
        assert!(!plan.needs_memory);
    }

    #[test]
    fn sequential_complexity_is_clamped() {
        let plan = Plan::from_model_output(r#"{"intent":"x","sequential_complexity": 99}"#);
        assert_eq!(plan.sequential_complexity, 10);
    }

    #[test]
    fn response_mode_deep_prefix() {
        assert_eq!(ResponseMode::from_user_text("/deep explain"), ResponseMode::Deep);
        assert_eq!(
            ResponseMode::from_user_text("  /deep explain"),
            ResponseMode::Deep
        );
        assert_eq!(
            ResponseMode::from_user_text("explain /deep"),
            ResponseMode::Interactive
        );
    }

    #[test]
    fn verification_applies_corrections() {
        let plan = Plan::from_model_output(r#"{"intent":"x","memory_keys":["a"]}"#);
        let verification = Verification::from_model_output(
            r#"{
                "approved": true,
                "corrections": {
                    "memory_keys": ["b"],
                    "suggested_tools": ["memory_graph_search"],
                    "hallucination_risk": "high"
                },
                "warnings": ["memory key missing"]
            }"#,
        );
        let verified = verification.apply_to(&plan);
        assert!(verified.memory_keys.contains("a"));
        assert!(verified.memory_keys.contains("b"));
        assert_eq!(verified.suggested_tools, vec!["memory_graph_search"]);
        assert_eq!(verified.hallucination_risk, Risk::High);
        assert_eq!(verification.warnings.len(), 1);
    }

    #[test]
    fn verification_skill_confirmation_fields() {
        let v = Verification::from_model_output(
            r#"{"approved": true, "_needs_skill_confirmation": true, "_skill_name": "demo-skill"}"#,
        );
        assert!(v.needs_skill_confirmation);
        assert_eq!(v.skill_name.as_deref(), Some("demo-skill"));
    }

    #[test]
    fn broken_verification_approves_by_default() {
        let v = Verification::from_model_output("control model crashed");
        assert!(v.approved);
        assert!(v.corrections.is_empty());
    }

    #[test]
    fn stable_json_omits_volatile_flags() {
        let mut plan = Plan::from_model_output(r#"{"intent":"x"}"#);
        plan.sequential_deferred = true;
        plan.skill_gate_blocked = true;
        let value = plan.stable_json();
        assert!(value.get("sequential_deferred").is_none());
        assert!(value.get("skill_gate_blocked").is_none());
        assert_eq!(value["intent"], "x");
    }
}
