//! Thinking layer — intent analysis and planning on a small fast model.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use cortex_core::types::{ChatMessage, MessageRole};

use crate::cache::SqlitePlanCache;
use crate::plan::Plan;
use crate::provider::{ChatProvider, ModelRequest};

const THINKING_SYSTEM_PROMPT: &str = "\
You are the planning stage of an assistant pipeline. Analyse the user's \
message and answer ONLY with a JSON object:\n\
{\"intent\": \"short description\",\n \"needs_memory\": bool,\n \
\"memory_keys\": [\"key\", ...],\n \"hallucination_risk\": \"low|medium|high\",\n \
\"needs_sequential_thinking\": bool,\n \"sequential_complexity\": 0-10,\n \
\"suggested_tools\": [\"tool_name\", ...],\n \"is_new_fact\": bool,\n \
\"new_fact_key\": \"...\",\n \"new_fact_value\": \"...\",\n \
\"time_reference\": \"today|yesterday|null\"}\n\
Suggest only tools from the available list. No prose, no code fences.";

pub struct ThinkingLayer {
    provider: Arc<dyn ChatProvider>,
    model: String,
    cache: Option<Arc<SqlitePlanCache>>,
}

impl ThinkingLayer {
    pub fn new(
        provider: Arc<dyn ChatProvider>,
        model: impl Into<String>,
        cache: Option<Arc<SqlitePlanCache>>,
    ) -> Self {
        Self {
            provider,
            model: model.into(),
            cache,
        }
    }

    fn build_request(&self, user_text: &str, available_tools: Option<&[String]>) -> ModelRequest {
        let mut system = THINKING_SYSTEM_PROMPT.to_string();
        if let Some(tools) = available_tools {
            if !tools.is_empty() {
                system.push_str("\nAvailable tools: ");
                system.push_str(&tools.join(", "));
            }
        }
        ModelRequest {
            model: self.model.clone(),
            system,
            messages: vec![ChatMessage {
                role: MessageRole::User,
                content: user_text.to_string(),
            }],
            temperature: Some(0.1),
            max_tokens: Some(512),
        }
    }

    /// Produce a plan for the user text. Identical inputs within the cache
    /// TTL skip the model call entirely (shared across processes via the
    /// cache file).
    pub async fn analyze(&self, user_text: &str, available_tools: Option<&[String]>) -> Plan {
        if let Some(cache) = &self.cache {
            if let Some(cached) = cache.get(user_text) {
                debug!("thinking plan served from cache");
                return Plan::from_model_output(&cached.to_string());
            }
        }

        let request = self.build_request(user_text, available_tools);
        let plan = match self.provider.send(&request).await {
            Ok(resp) => Plan::from_model_output(&resp.content),
            Err(e) => {
                warn!(error = %e, "thinking model failed — neutral plan");
                Plan {
                    intent: "unknown".to_string(),
                    ..Plan::default()
                }
            }
        };
        info!(
            intent = %plan.intent,
            needs_memory = plan.needs_memory,
            risk = %plan.hallucination_risk,
            sequential = plan.needs_sequential_thinking,
            "thinking complete"
        );

        if let Some(cache) = &self.cache {
            cache.set(user_text, &plan.stable_json());
        }
        plan
    }

    /// Streaming variant: raw model deltas are forwarded through `tx` while
    /// the full text accumulates; the parsed plan is returned at the end.
    pub async fn analyze_stream(
        &self,
        user_text: &str,
        available_tools: Option<&[String]>,
        tx: mpsc::Sender<String>,
    ) -> Plan {
        if let Some(cache) = &self.cache {
            if let Some(cached) = cache.get(user_text) {
                return Plan::from_model_output(&cached.to_string());
            }
        }

        let request = self.build_request(user_text, available_tools);
        let plan = match self.provider.send_stream(&request, tx).await {
            Ok(resp) => Plan::from_model_output(&resp.content),
            Err(e) => {
                warn!(error = %e, "thinking stream failed — neutral plan");
                Plan {
                    intent: "unknown".to_string(),
                    ..Plan::default()
                }
            }
        };
        if let Some(cache) = &self.cache {
            cache.set(user_text, &plan.stable_json());
        }
        plan
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ModelResponse, ProviderError};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedProvider {
        reply: String,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ChatProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }
        async fn send(&self, _req: &ModelRequest) -> Result<ModelResponse, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ModelResponse {
                content: self.reply.clone(),
                model: "scripted".into(),
            })
        }
    }

    #[tokio::test]
    async fn analyze_parses_model_json() {
        let provider = Arc::new(ScriptedProvider {
            reply: r#"{"intent": "list skills", "suggested_tools": ["list_skills"]}"#.into(),
            calls: AtomicUsize::new(0),
        });
        let layer = ThinkingLayer::new(provider, "m", None);
        let plan = layer.analyze("zeig mir deine skills", None).await;
        assert_eq!(plan.intent, "list skills");
        assert_eq!(plan.suggested_tools, vec!["list_skills"]);
    }

    #[tokio::test]
    async fn cache_skips_second_model_call() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(
            SqlitePlanCache::open(dir.path().join("cache.sqlite"), 120, "thinking").unwrap(),
        );
        let provider = Arc::new(ScriptedProvider {
            reply: r#"{"intent": "greet"}"#.into(),
            calls: AtomicUsize::new(0),
        });
        let layer = ThinkingLayer::new(Arc::clone(&provider) as Arc<dyn ChatProvider>, "m", Some(cache));

        let first = layer.analyze("hallo", None).await;
        let second = layer.analyze("hallo", None).await;
        assert_eq!(first.intent, "greet");
        assert_eq!(second.intent, "greet");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn provider_failure_yields_neutral_plan() {
        struct FailingProvider;
        #[async_trait]
        impl ChatProvider for FailingProvider {
            fn name(&self) -> &str {
                "failing"
            }
            async fn send(&self, _req: &ModelRequest) -> Result<ModelResponse, ProviderError> {
                Err(ProviderError::Unavailable("down".into()))
            }
        }
        let layer = ThinkingLayer::new(Arc::new(FailingProvider), "m", None);
        let plan = layer.analyze("anything", None).await;
        assert_eq!(plan.intent, "unknown");
        assert!(plan.suggested_tools.is_empty());
    }
}
