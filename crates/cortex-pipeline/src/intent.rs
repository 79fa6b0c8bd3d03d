//! First-class intent objects for deferred, user-confirmable actions
//! (primarily skill creation).
//!
//! An intent is a small state machine: PENDING_CONFIRMATION is the only
//! state that accepts a confirm/reject transition, so an intent is
//! confirmable exactly once.

use std::fmt;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::info;

use cortex_core::types::now_rfc3339;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentState {
    PendingConfirmation,
    Confirmed,
    Rejected,
    Executed,
    Failed,
}

impl fmt::Display for IntentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::PendingConfirmation => "pending_confirmation",
            Self::Confirmed => "confirmed",
            Self::Rejected => "rejected",
            Self::Executed => "executed",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Who triggered the intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntentOrigin {
    User,
    Ai,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillCreationIntent {
    /// 8-char token; long enough to be unambiguous in one conversation.
    pub id: String,
    pub skill_name: String,
    pub origin: IntentOrigin,
    pub reason: String,
    pub state: IntentState,
    pub conversation_id: String,
    pub user_text: String,
    /// Stable snapshot of the thinking plan (volatile flags stripped).
    pub thinking_plan: Option<serde_json::Value>,
    pub complexity: u8,
    pub created_at: String,
}

impl SkillCreationIntent {
    pub fn new(
        skill_name: impl Into<String>,
        origin: IntentOrigin,
        reason: impl Into<String>,
        conversation_id: impl Into<String>,
        user_text: impl Into<String>,
    ) -> Self {
        let id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        Self {
            id,
            skill_name: skill_name.into(),
            origin,
            reason: reason.into(),
            state: IntentState::PendingConfirmation,
            conversation_id: conversation_id.into(),
            user_text: user_text.into(),
            thinking_plan: None,
            complexity: 5,
            created_at: now_rfc3339(),
        }
    }
}

/// In-memory intent store. One pending intent per conversation is the
/// normal case; lookups return the most recently created match.
#[derive(Default)]
pub struct IntentStore {
    intents: DashMap<String, SkillCreationIntent>,
}

impl IntentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, intent: SkillCreationIntent) {
        info!(intent = %intent.id, skill = %intent.skill_name, "intent stored");
        self.intents.insert(intent.id.clone(), intent);
    }

    pub fn get(&self, intent_id: &str) -> Option<SkillCreationIntent> {
        self.intents.get(intent_id).map(|entry| entry.clone())
    }

    /// Latest pending intent for a conversation, if any.
    pub fn pending_for_conversation(&self, conversation_id: &str) -> Option<SkillCreationIntent> {
        self.intents
            .iter()
            .filter(|entry| {
                entry.conversation_id == conversation_id
                    && entry.state == IntentState::PendingConfirmation
            })
            .max_by(|a, b| a.created_at.cmp(&b.created_at))
            .map(|entry| entry.clone())
    }

    /// Transition an intent. Confirm/reject are only legal from
    /// PENDING_CONFIRMATION; EXECUTED/FAILED only from CONFIRMED. Illegal
    /// transitions return false and leave the intent unchanged.
    pub fn transition(&self, intent_id: &str, new_state: IntentState) -> bool {
        let Some(mut entry) = self.intents.get_mut(intent_id) else {
            return false;
        };
        let legal = matches!(
            (entry.state, new_state),
            (
                IntentState::PendingConfirmation,
                IntentState::Confirmed | IntentState::Rejected
            ) | (
                IntentState::Confirmed,
                IntentState::Executed | IntentState::Failed
            )
        );
        if legal {
            info!(intent = intent_id, from = %entry.state, to = %new_state, "intent transition");
            entry.state = new_state;
        }
        legal
    }

    pub fn remove(&self, intent_id: &str) {
        self.intents.remove(intent_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(conv: &str) -> SkillCreationIntent {
        SkillCreationIntent::new(
            "demo-skill",
            IntentOrigin::User,
            "control_layer",
            conv,
            "Bitte erstelle einen Skill demo-skill",
        )
    }

    #[test]
    fn id_is_eight_chars() {
        let intent = pending("conv-A");
        assert_eq!(intent.id.len(), 8);
        assert_eq!(intent.state, IntentState::PendingConfirmation);
    }

    #[test]
    fn pending_lookup_finds_latest_for_conversation() {
        let store = IntentStore::new();
        store.add(pending("conv-A"));
        let second = pending("conv-A");
        let second_id = second.id.clone();
        store.add(second);
        store.add(pending("conv-B"));

        let found = store.pending_for_conversation("conv-A").unwrap();
        // Same created_at second is possible; either of the two conv-A
        // intents is acceptable, but never conv-B's.
        assert_eq!(found.conversation_id, "conv-A");
        assert!(store.get(&second_id).is_some());
        assert!(store.pending_for_conversation("conv-C").is_none());
    }

    #[test]
    fn confirm_is_exactly_once() {
        let store = IntentStore::new();
        let intent = pending("conv-A");
        let id = intent.id.clone();
        store.add(intent);

        assert!(store.transition(&id, IntentState::Confirmed));
        // Second confirm attempt is illegal.
        assert!(!store.transition(&id, IntentState::Confirmed));
        // And the intent no longer shows up as pending.
        assert!(store.pending_for_conversation("conv-A").is_none());
    }

    #[test]
    fn reject_blocks_later_confirm() {
        let store = IntentStore::new();
        let intent = pending("conv-A");
        let id = intent.id.clone();
        store.add(intent);

        assert!(store.transition(&id, IntentState::Rejected));
        assert!(!store.transition(&id, IntentState::Confirmed));
        assert_eq!(store.get(&id).unwrap().state, IntentState::Rejected);
    }

    #[test]
    fn executed_requires_confirmed_first() {
        let store = IntentStore::new();
        let intent = pending("conv-A");
        let id = intent.id.clone();
        store.add(intent);

        assert!(!store.transition(&id, IntentState::Executed));
        assert!(store.transition(&id, IntentState::Confirmed));
        assert!(store.transition(&id, IntentState::Executed));
        assert_eq!(store.get(&id).unwrap().state, IntentState::Executed);
    }

    #[test]
    fn unknown_intent_transition_fails() {
        let store = IntentStore::new();
        assert!(!store.transition("nope", IntentState::Confirmed));
    }
}
