//! Output layer — final response generation on the user-facing model.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::info;

use cortex_core::types::{ChatMessage, MessageRole};

use crate::plan::Plan;
use crate::provider::{ChatProvider, ModelRequest, ModelResponse, ProviderError};

const PERSONA_PROMPT: &str = "\
You are a helpful, precise assistant. Answer in the language of the user's \
message. Use the provided context when it is relevant; never invent facts \
that the context contradicts.";

const MEMORY_MISSING_INSTRUCTION: &str = "\
The requested information was not found in memory. Say so plainly and ask \
a clarifying question instead of guessing.";

pub struct OutputLayer {
    provider: Arc<dyn ChatProvider>,
    default_model: String,
}

impl OutputLayer {
    pub fn new(provider: Arc<dyn ChatProvider>, default_model: impl Into<String>) -> Self {
        Self {
            provider,
            default_model: default_model.into(),
        }
    }

    fn resolve_model<'a>(&'a self, requested: &'a str) -> &'a str {
        if requested.is_empty() {
            &self.default_model
        } else {
            requested
        }
    }

    /// Assemble the provider messages: persona + context as system, recent
    /// history, then the current user turn.
    fn build_messages(
        &self,
        user_text: &str,
        plan: &Plan,
        memory_data: &str,
        chat_history: &[ChatMessage],
        memory_required_but_missing: bool,
    ) -> (String, Vec<ChatMessage>) {
        let mut system = String::from(PERSONA_PROMPT);
        if !plan.intent.is_empty() && plan.intent != "unknown" {
            system.push_str("\n\nUser intent: ");
            system.push_str(&plan.intent);
        }
        if !memory_data.is_empty() {
            system.push_str("\n\n## Kontext\n");
            system.push_str(memory_data);
        }
        if memory_required_but_missing {
            system.push('\n');
            system.push_str(MEMORY_MISSING_INSTRUCTION);
        }

        let mut messages: Vec<ChatMessage> = chat_history
            .iter()
            .filter(|m| m.role != MessageRole::System)
            .cloned()
            .collect();
        // The final turn is always the current user text; drop a trailing
        // duplicate from the history.
        if messages
            .last()
            .map(|m| m.role == MessageRole::User && m.content == user_text)
            .unwrap_or(false)
        {
            messages.pop();
        }
        messages.push(ChatMessage {
            role: MessageRole::User,
            content: user_text.to_string(),
        });

        let payload_chars: usize =
            system.len() + messages.iter().map(|m| m.content.len()).sum::<usize>();
        info!(
            payload_chars,
            history = messages.len() - 1,
            "output payload assembled"
        );

        (system, messages)
    }

    pub async fn generate(
        &self,
        user_text: &str,
        plan: &Plan,
        memory_data: &str,
        model: &str,
        chat_history: &[ChatMessage],
        memory_required_but_missing: bool,
    ) -> Result<String, ProviderError> {
        let (system, messages) = self.build_messages(
            user_text,
            plan,
            memory_data,
            chat_history,
            memory_required_but_missing,
        );
        let request = ModelRequest {
            model: self.resolve_model(model).to_string(),
            system,
            messages,
            temperature: None,
            max_tokens: None,
        };
        let response = self.provider.send(&request).await?;
        info!(chars = response.content.len(), "output generated");
        Ok(response.content)
    }

    /// Streaming variant: deltas flow through `tx`; the accumulated
    /// response is returned for memory save.
    #[allow(clippy::too_many_arguments)]
    pub async fn generate_stream(
        &self,
        user_text: &str,
        plan: &Plan,
        memory_data: &str,
        model: &str,
        chat_history: &[ChatMessage],
        memory_required_but_missing: bool,
        tx: mpsc::Sender<String>,
    ) -> Result<ModelResponse, ProviderError> {
        let (system, messages) = self.build_messages(
            user_text,
            plan,
            memory_data,
            chat_history,
            memory_required_but_missing,
        );
        let request = ModelRequest {
            model: self.resolve_model(model).to_string(),
            system,
            messages,
            temperature: None,
            max_tokens: None,
        };
        self.provider.send_stream(&request, tx).await
    }
}
