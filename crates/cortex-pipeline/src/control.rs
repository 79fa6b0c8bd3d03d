//! Control layer — verification and correction of thinking plans.
//!
//! A small model double-checks the plan against the retrieved context and
//! may correct memory keys, tool suggestions or the risk level. Skill
//! creation never passes through silently: whether flagged by the model or
//! detected from the user text, it becomes a confirmation request.

use std::sync::Arc;

use serde_json::json;
use tracing::{info, warn};

use cortex_core::types::{ChatMessage, MessageRole};
use cortex_mcp::McpHub;

use crate::plan::{Plan, Verification};
use crate::provider::{ChatProvider, ModelRequest};

const CONTROL_SYSTEM_PROMPT: &str = "\
You are the verification stage of an assistant pipeline. Given the user \
message, the plan and the retrieved context, answer ONLY with JSON:\n\
{\"approved\": bool,\n \"corrections\": {\"memory_keys\": [...], \
\"suggested_tools\": [...], \"hallucination_risk\": \"low|medium|high\"},\n \
\"warnings\": [\"...\"],\n \"_needs_skill_confirmation\": bool,\n \
\"_skill_name\": \"...\"}\n\
Approve unless the plan would answer from missing memory. No prose.";

/// Keywords marking a skill-creation request. Used both for the
/// control-skip guard and the confirmation fallback.
pub const SKILL_CREATION_KEYWORDS: [&str; 4] = ["skill", "erstelle", "create", "programmier"];

pub struct ControlLayer {
    provider: Arc<dyn ChatProvider>,
    model: String,
    hub: Option<Arc<McpHub>>,
}

impl ControlLayer {
    pub fn new(
        provider: Arc<dyn ChatProvider>,
        model: impl Into<String>,
        hub: Option<Arc<McpHub>>,
    ) -> Self {
        Self {
            provider,
            model: model.into(),
            hub,
        }
    }

    /// Verify a plan against the retrieved context.
    pub async fn verify(&self, user_text: &str, plan: &Plan, context: &str) -> Verification {
        let payload = json!({
            "user_message": user_text,
            "plan": plan.stable_json(),
            "context_excerpt": context.chars().take(2000).collect::<String>(),
        });
        let request = ModelRequest {
            model: self.model.clone(),
            system: CONTROL_SYSTEM_PROMPT.to_string(),
            messages: vec![ChatMessage {
                role: MessageRole::User,
                content: payload.to_string(),
            }],
            temperature: Some(0.0),
            max_tokens: Some(512),
        };

        let mut verification = match self.provider.send(&request).await {
            Ok(resp) => Verification::from_model_output(&resp.content),
            Err(e) => {
                warn!(error = %e, "control model failed — approving unchanged");
                Verification::approved()
            }
        };

        // Deterministic fallback: a skill-creation request must always end
        // in a confirmation, even when the model forgot to flag it.
        if !verification.needs_skill_confirmation && is_skill_creation_request(user_text) {
            verification.needs_skill_confirmation = true;
            if verification.skill_name.is_none() {
                verification.skill_name = extract_skill_name(user_text);
            }
        }

        info!(
            approved = verification.approved,
            warnings = verification.warnings.len(),
            skill_confirmation = verification.needs_skill_confirmation,
            "control complete"
        );
        verification
    }

    /// Run the sequential-thinking tool for complex plans. Fail-open: any
    /// hub error returns `None` and the pipeline continues without steps.
    pub async fn run_sequential(&self, user_text: &str, plan: &Plan) -> Option<serde_json::Value> {
        let hub = self.hub.as_ref()?;
        if !hub.has_tool("think") {
            return None;
        }
        match hub
            .call_tool(
                "think",
                json!({
                    "problem": user_text,
                    "complexity": plan.sequential_complexity,
                }),
            )
            .await
        {
            Ok(result) => Some(result),
            Err(e) => {
                warn!(error = %e, "sequential thinking failed");
                None
            }
        }
    }
}

/// True when the user text asks for a new skill to be created (as opposed
/// to merely mentioning skills).
pub fn is_skill_creation_request(user_text: &str) -> bool {
    let lower = user_text.to_lowercase();
    lower.contains("skill")
        && ["erstell", "create", "bau", "mach", "programmier"]
            .iter()
            .any(|kw| lower.contains(kw))
}

/// Best-effort skill name extraction: the first token after the word
/// "skill" that looks like an identifier.
pub fn extract_skill_name(user_text: &str) -> Option<String> {
    let lower = user_text.to_lowercase();
    let words: Vec<&str> = lower.split_whitespace().collect();
    let position = words.iter().position(|w| w.trim_matches('"') == "skill")?;
    words
        .get(position + 1)
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric() && c != '-' && c != '_'))
        .filter(|w| !w.is_empty())
        .map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ModelResponse, ProviderError};
    use async_trait::async_trait;

    struct ScriptedProvider(String);

    #[async_trait]
    impl ChatProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }
        async fn send(&self, _req: &ModelRequest) -> Result<ModelResponse, ProviderError> {
            Ok(ModelResponse {
                content: self.0.clone(),
                model: "scripted".into(),
            })
        }
    }

    #[tokio::test]
    async fn verify_parses_corrections() {
        let layer = ControlLayer::new(
            Arc::new(ScriptedProvider(
                r#"{"approved": true, "corrections": {"memory_keys": ["birthday"]}}"#.into(),
            )),
            "m",
            None,
        );
        let plan = Plan::default();
        let v = layer.verify("wann hat er geburtstag?", &plan, "").await;
        assert!(v.approved);
        assert_eq!(v.corrections.memory_keys, vec!["birthday"]);
    }

    #[tokio::test]
    async fn skill_creation_forces_confirmation_even_without_model_flag() {
        let layer = ControlLayer::new(
            Arc::new(ScriptedProvider(r#"{"approved": true}"#.into())),
            "m",
            None,
        );
        let plan = Plan::default();
        let v = layer
            .verify("Bitte erstelle einen Skill demo-skill", &plan, "")
            .await;
        assert!(v.needs_skill_confirmation);
        assert_eq!(v.skill_name.as_deref(), Some("demo-skill"));
    }

    #[test]
    fn skill_creation_detection() {
        assert!(is_skill_creation_request("erstelle einen skill für mich"));
        assert!(is_skill_creation_request("create a skill that sorts files"));
        assert!(!is_skill_creation_request("welche skills hast du?"));
        assert!(!is_skill_creation_request("erstelle eine zusammenfassung"));
    }

    #[test]
    fn skill_name_extraction() {
        assert_eq!(
            extract_skill_name("Bitte erstelle einen Skill demo-skill").as_deref(),
            Some("demo-skill")
        );
        assert_eq!(
            extract_skill_name("create skill weather_report now").as_deref(),
            Some("weather_report")
        );
        assert_eq!(extract_skill_name("erstelle etwas anderes"), None);
    }
}
