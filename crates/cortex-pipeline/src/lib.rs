//! The per-request pipeline: Thinking → Context → Control → Tools → Output →
//! Memory, plus the semantic routers, intent state machine, plan cache and
//! durable post-task queue the orchestrator coordinates.

pub mod cache;
pub mod context_manager;
pub mod control;
pub mod embedder;
pub mod intent;
pub mod orchestrator;
pub mod output;
pub mod plan;
pub mod provider;
pub mod queue;
pub mod routers;
pub mod thinking;
pub mod tool_selector;

pub use context_manager::{ContextManager, ContextResult};
pub use intent::{IntentOrigin, IntentState, IntentStore, SkillCreationIntent};
pub use orchestrator::PipelineOrchestrator;
pub use plan::{Plan, ResponseMode, Risk, Verification};
