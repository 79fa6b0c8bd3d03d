//! The per-request pipeline state machine.
//!
//! One code path serves both entry points: `process` runs it without an
//! event sink, `process_stream` runs it with an mpsc sink and returns the
//! receiving end. Both therefore produce the same context source set for
//! equivalent inputs; streaming only adds intermediate events.
//!
//! Order within a request is fixed: intent gate → tool selection → thinking
//! → response-mode policy → context retrieval → control → tool dispatch →
//! output → memory save. Tool failures never abort the pipeline — they
//! become failure markers in the output context.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};

use cortex_core::config::CortexConfig;
use cortex_core::types::{
    now_rfc3339, CoreChatRequest, CoreChatResponse, DoneReason, StreamChunk,
};
use cortex_digest::weekly::GraphMirror;
use cortex_digest::RuntimeStateFile;
use cortex_events::{
    build_compact_context, format_compact_context, maybe_load_csv_events, JitTelemetry,
    JitTrigger, LoadGates, SectionCaps,
};
use cortex_mcp::McpHub;

use crate::context_manager::{ContextManager, MemoryBackend};
use crate::control::{ControlLayer, SKILL_CREATION_KEYWORDS};
use crate::embedder::ArchiveEmbedder;
use crate::intent::{IntentOrigin, IntentState, IntentStore, SkillCreationIntent};
use crate::output::OutputLayer;
use crate::plan::{Plan, ResponseMode, Risk, Verification};
use crate::provider::ChatProvider;
use crate::queue::{ArchiveEmbeddingJobQueue, EMBEDDING_BATCH_SIZE};
use crate::routers::{BlueprintSemanticRouter, RouteOutcome, SkillSemanticRouter};
use crate::thinking::ThinkingLayer;
use crate::tool_selector::ToolSelector;

/// Closed token lists for the intent-confirmation gate.
const AFFIRMATIONS: [&str; 8] = ["ja", "yes", "ok", "bestaetigen", "mach", "los", "ja bitte", "klar"];
const NEGATIONS: [&str; 6] = ["nein", "no", "abbrechen", "cancel", "stop", "nee"];

/// Tools that always force a Control pass, regardless of risk.
const SENSITIVE_TOOLS: [&str; 2] = ["create_skill", "autonomous_skill_task"];

/// Tools gated by the blueprint router.
const CONTAINER_TOOLS: [&str; 2] = ["request_container", "exec_in_container"];
/// Tools gated by the skill router.
const SKILL_TOOLS: [&str; 3] = ["run_skill", "create_skill", "autonomous_skill_task"];

/// Failure markers. They must survive any clipping so the output layer can
/// explain what went wrong.
pub const TOOL_ERROR_MARKER: &str = "TOOL-FEHLER";
pub const TOOL_SKIP_MARKER: &str = "TOOL-SKIP";

const FAILURE_COMPACT_HEADER: &str = "[COMPACT-CONTEXT-ON-FAILURE]";

/// Accounting for one request's context assembly. `append_context_block` is
/// the only mutation point, so sources and char counts cannot drift apart.
#[derive(Debug, Clone, Default)]
pub struct ContextTrace {
    pub context_sources: Vec<String>,
    pub context_blocks: usize,
    pub context_chars: usize,
    pub context_chars_final: usize,
    pub retrieval_count: usize,
    pub mode: String,
    pub flags: Vec<String>,
}

struct ToolOutcome {
    context: String,
    had_failure: bool,
    executed: Vec<String>,
}

/// Optional per-request event sink. `None` = non-streaming.
type EventSink = mpsc::Sender<StreamChunk>;

pub struct PipelineOrchestrator {
    config: CortexConfig,
    hub: Arc<McpHub>,
    thinking: ThinkingLayer,
    control: ControlLayer,
    output: OutputLayer,
    context: ContextManager,
    tool_selector: ToolSelector,
    intents: Arc<IntentStore>,
    blueprint_router: Option<Arc<BlueprintSemanticRouter>>,
    skill_router: Option<Arc<SkillSemanticRouter>>,
    embedding_queue: Option<Arc<ArchiveEmbeddingJobQueue>>,
    embedder: ArchiveEmbedder,
    runtime_state: Option<Arc<RuntimeStateFile>>,
}

impl PipelineOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: CortexConfig,
        hub: Arc<McpHub>,
        provider: Arc<dyn ChatProvider>,
        backend: Arc<dyn MemoryBackend>,
        intents: Arc<IntentStore>,
        blueprint_router: Option<Arc<BlueprintSemanticRouter>>,
        skill_router: Option<Arc<SkillSemanticRouter>>,
        embedding_queue: Option<Arc<ArchiveEmbeddingJobQueue>>,
        runtime_state: Option<Arc<RuntimeStateFile>>,
    ) -> Self {
        let cache = crate::cache::SqlitePlanCache::open(
            &config.pipeline.plan_cache_path,
            config.pipeline.plan_cache_ttl_s,
            "thinking",
        )
        .map(Arc::new)
        .map_err(|e| warn!(error = %e, "plan cache unavailable"))
        .ok();

        let thinking = ThinkingLayer::new(Arc::clone(&provider), &config.models.thinking, cache);
        let control = ControlLayer::new(
            Arc::clone(&provider),
            &config.models.control,
            Some(Arc::clone(&hub)),
        );
        let output = OutputLayer::new(Arc::clone(&provider), &config.models.output);
        let context = ContextManager::new(
            backend,
            config.small_model.clone(),
            &config.pipeline.protocol_dir,
        );
        let tool_selector = ToolSelector::new(Arc::clone(&hub));
        // The embedding pass is built independently of the queue so it can
        // run inline when the queue is down.
        let embedder = ArchiveEmbedder::new(
            Arc::clone(&hub) as Arc<dyn GraphMirror>,
            config.digest.store_path.clone(),
        );

        Self {
            config,
            hub,
            thinking,
            control,
            output,
            context,
            tool_selector,
            intents,
            blueprint_router,
            skill_router,
            embedding_queue,
            embedder,
            runtime_state,
        }
    }

    // ── public contract ─────────────────────────────────────────────────────

    /// Non-streaming pipeline execution.
    pub async fn process(&self, request: CoreChatRequest) -> CoreChatResponse {
        self.run_pipeline(&request, None).await
    }

    /// Streaming pipeline execution: a lazy NDJSON-ready event sequence
    /// terminated by exactly one `done` chunk. Dropping the receiver stops
    /// the producer at its next yield point.
    pub fn process_stream(self: &Arc<Self>, request: CoreChatRequest) -> ReceiverStream<StreamChunk> {
        let (tx, rx) = mpsc::channel::<StreamChunk>(32);
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            let response = orchestrator.run_pipeline(&request, Some(tx.clone())).await;
            let done = StreamChunk::new("done")
                .with("done_reason", json!(response.done_reason.to_string()))
                .with("memory_used", json!(response.memory_used))
                .with("model", json!(response.model))
                .terminal();
            let _ = tx.send(done).await;
        });
        ReceiverStream::new(rx)
    }

    // ── the pipeline ────────────────────────────────────────────────────────

    async fn run_pipeline(&self, request: &CoreChatRequest, sink: Option<EventSink>) -> CoreChatResponse {
        let user_text = request.last_user_message().to_string();
        let conversation_id = request.conversation_id.clone();
        info!(adapter = %request.source_adapter, conv = %conversation_id, "pipeline start");

        // STEP 1: intent-confirmation gate. A pending intent consumes the
        // turn entirely — the rest of the pipeline never runs.
        if let Some(response) = self
            .check_pending_confirmation(&user_text, &conversation_id)
            .await
        {
            self.emit_content(&sink, &response.content).await;
            return response;
        }

        // STEP 1.5: chunking for oversized inputs (optional, fail-open).
        let thinking_input = match self.maybe_chunk(&user_text, &sink).await {
            Some(summary) => summary,
            None => user_text.clone(),
        };

        // STEP 2: tool-selection pre-fetch. Hints only, no commitment.
        let selected_tools = self.tool_selector.select_tools(&user_text).await;
        if let Some(tools) = &selected_tools {
            self.emit(&sink, StreamChunk::new("tool_selection").with("tools", json!(tools)))
                .await;
        }

        // STEP 3: thinking.
        let mut plan = match &sink {
            Some(tx) => {
                let (delta_tx, mut delta_rx) = mpsc::channel::<String>(16);
                let forward = tx.clone();
                let forwarder = tokio::spawn(async move {
                    while let Some(chunk) = delta_rx.recv().await {
                        let event =
                            StreamChunk::new("thinking_stream").with("thinking_chunk", json!(chunk));
                        if forward.send(event).await.is_err() {
                            break;
                        }
                    }
                });
                let plan = self
                    .thinking
                    .analyze_stream(&thinking_input, selected_tools.as_deref(), delta_tx)
                    .await;
                let _ = forwarder.await;
                plan
            }
            None => {
                self.thinking
                    .analyze(&thinking_input, selected_tools.as_deref())
                    .await
            }
        };
        self.emit(
            &sink,
            StreamChunk::new("thinking_done").with(
                "thinking",
                json!({
                    "intent": plan.intent,
                    "needs_memory": plan.needs_memory,
                    "memory_keys": plan.memory_keys,
                    "hallucination_risk": plan.hallucination_risk.to_string(),
                    "needs_sequential_thinking": plan.needs_sequential_thinking,
                }),
            ),
        )
        .await;

        // Workspace: noteworthy thinking observations.
        if let Some(observation) = workspace_observation(&plan) {
            self.save_workspace_entry(&conversation_id, &observation, "observation", "thinking", &sink)
                .await;
        }

        // STEP 4: response-mode policy.
        let mode = ResponseMode::from_user_text(&user_text);
        let threshold = self.config.pipeline.sequential_defer_threshold;
        if mode == ResponseMode::Interactive
            && plan.needs_sequential_thinking
            && plan.sequential_complexity >= threshold
        {
            plan.sequential_deferred = true;
            let wants_think = user_text.to_lowercase().contains("think");
            if !wants_think {
                plan.suggested_tools.retain(|t| t != "think");
            }
            info!(
                complexity = plan.sequential_complexity,
                "sequential thinking deferred (interactive mode)"
            );
        }

        // Fail-closed router gates: an unavailable router blocks its tool
        // class outright instead of falling through.
        if self.skill_router.is_none() {
            plan.skill_gate_blocked = true;
        }
        if self.blueprint_router.is_none() {
            plan.blueprint_gate_blocked = true;
        }

        // STEP 5: context retrieval.
        let small_model_mode = self.config.small_model.mode;
        let (mut full_context, mut trace) = self
            .build_effective_context(&user_text, &conversation_id, &plan, small_model_mode)
            .await;
        let mut memory_used = trace.context_sources.iter().any(|s| s.starts_with("memory:"))
            || trace.context_sources.iter().any(|s| s == "daily_protocol");

        // Sequential thinking runs before Control so the verifier sees the
        // step results.
        if plan.needs_sequential_thinking && !plan.sequential_deferred {
            if let Some(result) = self.control.run_sequential(&user_text, &plan).await {
                self.emit(
                    &sink,
                    StreamChunk::new("sequential_done").with("result", result.clone()),
                )
                .await;
                full_context = self.append_context_block(
                    full_context,
                    format!("\n## Zwischenschritte\n{result}\n"),
                    "sequential",
                    &mut trace,
                    false,
                );
            }
        }

        // STEP 6: control.
        let (verification, verified_plan, control_skipped) = self
            .execute_control(&user_text, &plan, &full_context)
            .await;
        self.emit(
            &sink,
            StreamChunk::new("control")
                .with("approved", json!(verification.approved))
                .with("skipped", json!(control_skipped)),
        )
        .await;

        if !verification.corrections.is_empty() || !verification.warnings.is_empty() {
            let mut parts = Vec::new();
            if !verification.warnings.is_empty() {
                parts.push(format!("**Warnings:** {}", verification.warnings.join(", ")));
            }
            if !verification.corrections.memory_keys.is_empty() {
                parts.push(format!(
                    "**Corrections:** memory_keys={:?}",
                    verification.corrections.memory_keys
                ));
            }
            if !parts.is_empty() {
                self.save_workspace_entry(&conversation_id, &parts.join("\n"), "observation", "control", &sink)
                    .await;
            }
        }

        // Skill confirmation: defer execution behind a pending intent.
        if verification.needs_skill_confirmation {
            let skill_name = verification
                .skill_name
                .clone()
                .unwrap_or_else(|| "unbenannt".to_string());
            let mut intent = SkillCreationIntent::new(
                &skill_name,
                IntentOrigin::User,
                "control_layer",
                &conversation_id,
                &user_text,
            );
            intent.thinking_plan = Some(plan.stable_json());
            intent.complexity = if plan.sequential_complexity == 0 {
                5
            } else {
                plan.sequential_complexity
            };
            let intent_id = intent.id.clone();
            self.intents.add(intent);

            let prompt = format!("Möchtest du den Skill **{skill_name}** erstellen? (Ja/Nein)");
            self.emit_content(&sink, &prompt).await;
            self.emit(
                &sink,
                StreamChunk::new("confirmation_pending").with("intent_id", json!(intent_id)),
            )
            .await;
            return CoreChatResponse {
                model: request.model.clone(),
                content: prompt,
                conversation_id,
                done: true,
                done_reason: DoneReason::ConfirmationPending,
                memory_used,
                validation_passed: None,
            };
        }

        // Blocked: high-risk answer with no memory backing. The gate reads
        // the PRE-correction plan risk — a Control pass that corrects risk
        // downward must not lift the block.
        if !verification.approved && plan.hallucination_risk == Risk::High && !memory_used {
            warn!("blocked: high hallucination risk without memory");
            return CoreChatResponse {
                model: request.model.clone(),
                content: "Das kann ich nicht zuverlässig beantworten — dazu ist nichts gespeichert."
                    .to_string(),
                conversation_id,
                done: true,
                done_reason: DoneReason::Blocked,
                memory_used: false,
                validation_passed: Some(false),
            };
        }

        // Extra lookups for Control-added memory keys.
        for key in &verification.corrections.memory_keys {
            if plan.memory_keys.contains(key) {
                continue;
            }
            let extra_plan = Plan {
                needs_memory: true,
                memory_keys: [key.clone()].into_iter().collect(),
                ..Plan::default()
            };
            let extra = self.context.get_context(key, &extra_plan, &conversation_id).await;
            if extra.memory_used {
                full_context = self.append_context_block(
                    full_context,
                    format!("\n{}", extra.memory_data),
                    "jit_memory",
                    &mut trace,
                    false,
                );
                trace.retrieval_count += 1;
                memory_used = true;
            }
        }

        // STEP 7: tool dispatch.
        let mut suggested_tools = verified_plan.suggested_tools.clone();
        if !suggested_tools.is_empty() {
            let valid: Vec<String> = suggested_tools
                .iter()
                .filter(|t| self.hub.has_tool(t))
                .cloned()
                .collect();
            if valid.len() != suggested_tools.len() {
                let dropped: Vec<&String> =
                    suggested_tools.iter().filter(|t| !self.hub.has_tool(t)).collect();
                info!(?dropped, "hallucinated tool names filtered");
            }
            suggested_tools = valid;
        }
        if suggested_tools.is_empty() {
            suggested_tools = detect_tools_by_keyword(&user_text)
                .into_iter()
                .filter(|t| self.hub.has_tool(t))
                .collect();
            if !suggested_tools.is_empty() {
                info!(tools = ?suggested_tools, "keyword fallback tool detection");
            }
        }

        let mut tool_failure = false;
        if !suggested_tools.is_empty() {
            self.emit(
                &sink,
                StreamChunk::new("tool_start").with("tools", json!(suggested_tools)),
            )
            .await;
            let outcome = self
                .dispatch_tools(&suggested_tools, &user_text, &verified_plan, &conversation_id, &sink)
                .await;
            tool_failure = outcome.had_failure;

            if !outcome.context.is_empty() {
                let mut tool_context =
                    self.clip_tool_context(&outcome.context, small_model_mode);

                if tool_failure {
                    // Recovery context is PREPENDED to the tool block, then
                    // the combined block is appended ONCE as tool_ctx with
                    // failure_ctx registered separately — chars are never
                    // counted twice.
                    let failure_block = self
                        .build_failure_compact_block(&conversation_id, small_model_mode)
                        .await;
                    if !failure_block.is_empty() {
                        tool_context = format!("{failure_block}{tool_context}");
                        trace.context_sources.push("failure_ctx".to_string());
                    }
                }

                full_context =
                    self.append_context_block(full_context, tool_context, "tool_ctx", &mut trace, false);

                if !outcome.executed.is_empty() {
                    let summary = format!(
                        "**Tools executed:** {}\n\n{}",
                        outcome.executed.join(", "),
                        outcome.context.chars().take(500).collect::<String>()
                    );
                    self.save_workspace_entry(&conversation_id, &summary, "note", "control", &sink)
                        .await;
                }
            }
        }

        // Final cap, applied after ALL appends.
        let final_cap = if self.config.small_model.final_cap > 0 {
            self.config.small_model.final_cap
        } else {
            self.config.small_model.char_cap
        };
        if small_model_mode && final_cap > 0 && full_context.chars().count() > final_cap {
            full_context = full_context.chars().take(final_cap).collect();
            trace.context_chars_final = final_cap;
            trace.flags.push("final_cap".to_string());
        }
        info!(
            sources = ?trace.context_sources,
            chars_final = trace.context_chars_final,
            retrievals = trace.retrieval_count,
            "context assembled"
        );

        // STEP 8: output.
        let needs_memory = verified_plan.needs_memory;
        let memory_required_but_missing =
            needs_memory && verified_plan.hallucination_risk == Risk::High && !memory_used;

        let answer = match &sink {
            Some(tx) => {
                let (delta_tx, mut delta_rx) = mpsc::channel::<String>(16);
                let forward = tx.clone();
                let forwarder = tokio::spawn(async move {
                    while let Some(chunk) = delta_rx.recv().await {
                        let event = StreamChunk::new("content").with("content", json!(chunk));
                        if forward.send(event).await.is_err() {
                            break;
                        }
                    }
                });
                let result = self
                    .output
                    .generate_stream(
                        &user_text,
                        &verified_plan,
                        &full_context,
                        &request.model,
                        &request.messages,
                        memory_required_but_missing,
                        delta_tx,
                    )
                    .await;
                let _ = forwarder.await;
                match result {
                    Ok(resp) => resp.content,
                    Err(e) => {
                        warn!(error = %e, "output stream failed");
                        return error_response(request, &conversation_id, memory_used);
                    }
                }
            }
            None => match self
                .output
                .generate(
                    &user_text,
                    &verified_plan,
                    &full_context,
                    &request.model,
                    &request.messages,
                    memory_required_but_missing,
                )
                .await
            {
                Ok(answer) => answer,
                Err(e) => {
                    warn!(error = %e, "output failed");
                    return error_response(request, &conversation_id, memory_used);
                }
            },
        };

        // STEP 9: memory save + durable post-task work.
        self.save_memory(&conversation_id, &verified_plan, &answer, tool_failure)
            .await;
        self.post_task_processing().await;

        CoreChatResponse {
            model: request.model.clone(),
            content: answer,
            conversation_id,
            done: true,
            done_reason: DoneReason::Stop,
            memory_used,
            validation_passed: Some(true),
        }
    }

    // ── intent confirmation ─────────────────────────────────────────────────

    async fn check_pending_confirmation(
        &self,
        user_text: &str,
        conversation_id: &str,
    ) -> Option<CoreChatResponse> {
        let intent = self.intents.pending_for_conversation(conversation_id)?;
        let text = user_text.trim().to_lowercase();

        if AFFIRMATIONS.contains(&text.as_str()) {
            if !self.intents.transition(&intent.id, IntentState::Confirmed) {
                return None;
            }
            info!(intent = %intent.id, skill = %intent.skill_name, "intent confirmed — executing");

            let mut task_args = json!({
                "user_text": intent.user_text,
                "intent": if intent.reason.is_empty() { intent.skill_name.clone() } else { intent.reason.clone() },
                "complexity": intent.complexity,
                "allow_auto_create": true,
                "execute_after_create": true,
            });
            if let Some(plan) = &intent.thinking_plan {
                task_args["thinking_plan"] = plan.clone();
            }

            let response = match self.hub.call_tool("autonomous_skill_task", task_args).await {
                Ok(result) => {
                    let success = result
                        .get("success")
                        .and_then(|v| v.as_bool())
                        .unwrap_or(true);
                    if success {
                        self.intents.transition(&intent.id, IntentState::Executed);
                        let skill_name = result
                            .get("skill_name")
                            .and_then(|v| v.as_str())
                            .unwrap_or(intent.skill_name.as_str());
                        let mut content =
                            format!("✅ Skill **{skill_name}** wurde erstellt und ausgeführt.");
                        if let Some(score) = result.get("validation_score").and_then(|v| v.as_f64())
                        {
                            content.push_str(&format!("\nValidation: {:.0}%", score * 100.0));
                        }
                        CoreChatResponse::terminal(
                            "system",
                            content,
                            conversation_id,
                            DoneReason::ConfirmationExecuted,
                        )
                    } else {
                        self.intents.transition(&intent.id, IntentState::Failed);
                        let error = result
                            .get("error")
                            .and_then(|v| v.as_str())
                            .unwrap_or("unbekannter Fehler");
                        CoreChatResponse::terminal(
                            "system",
                            format!("❌ Skill-Erstellung fehlgeschlagen: {error}"),
                            conversation_id,
                            DoneReason::ConfirmationExecuted,
                        )
                    }
                }
                Err(e) => {
                    self.intents.transition(&intent.id, IntentState::Failed);
                    CoreChatResponse::terminal(
                        "system",
                        format!("❌ Fehler beim Erstellen: {e}"),
                        conversation_id,
                        DoneReason::ConfirmationExecuted,
                    )
                }
            };
            return Some(response);
        }

        if NEGATIONS.contains(&text.as_str()) {
            self.intents.transition(&intent.id, IntentState::Rejected);
            info!(intent = %intent.id, "intent rejected");
            return Some(CoreChatResponse::terminal(
                "system",
                "❌ Skill-Erstellung abgebrochen.",
                conversation_id,
                DoneReason::Stop,
            ));
        }

        None
    }

    // ── context assembly ────────────────────────────────────────────────────

    /// Canonical context builder shared by both pipeline paths.
    pub async fn build_effective_context(
        &self,
        user_text: &str,
        conversation_id: &str,
        plan: &Plan,
        small_model_mode: bool,
    ) -> (String, ContextTrace) {
        let mut trace = ContextTrace {
            mode: if small_model_mode { "small" } else { "full" }.to_string(),
            ..ContextTrace::default()
        };
        let mut ctx = String::new();

        let result = self.context.get_context(user_text, plan, conversation_id).await;
        trace.retrieval_count += 1;
        // Upstream sources (memory:<key>, daily_protocol, system_tools)
        // keep their own labels.
        trace.context_sources.extend(result.sources.clone());

        if !result.system_tools.is_empty() {
            ctx = self.raw_append(ctx, &result.system_tools, &mut trace);
        }
        if !result.memory_data.is_empty() {
            ctx = self.raw_append(ctx, &result.memory_data, &mut trace);
        }

        if small_model_mode {
            let compact = self.context.build_small_model_context(conversation_id).await;
            trace.retrieval_count += 1;
            if !compact.is_empty() {
                ctx = self.append_context_block(ctx, compact, "compact", &mut trace, false);
            }
        }

        // Typed-state CSV supplement, gated by the JIT trigger derived from
        // the plan. Without a trigger (and jit_only set) this performs no
        // file I/O at all.
        let trigger = derive_jit_trigger(user_text, plan);
        let telemetry = self
            .runtime_state
            .as_deref()
            .map(|state| state as &dyn JitTelemetry);
        let csv_events = maybe_load_csv_events(
            &self.config,
            LoadGates { small_model_mode },
            trigger,
            Some(conversation_id),
            None,
            telemetry,
        );
        if !csv_events.is_empty() {
            let caps = SectionCaps {
                now_max: self.config.small_model.now_max,
                rules_max: self.config.small_model.rules_max,
                next_max: self.config.small_model.next_max,
            };
            let rendered = format_compact_context(&build_compact_context(&csv_events, caps));
            if !rendered.is_empty() {
                ctx = self.append_context_block(ctx, rendered, "typedstate_csv", &mut trace, false);
            }
        }

        trace.context_chars = ctx.chars().count();
        trace.context_chars_final = trace.context_chars;
        (ctx, trace)
    }

    /// Append without registering a new source (the source label was already
    /// recorded by the retrieval step).
    fn raw_append(&self, ctx: String, block: &str, trace: &mut ContextTrace) -> String {
        trace.context_blocks += 1;
        let mut out = ctx;
        out.push_str(block);
        out
    }

    /// Single mutation point for post-build context growth: registers the
    /// source, accumulates final chars, optionally prepends.
    pub fn append_context_block(
        &self,
        ctx: String,
        block: String,
        source: &str,
        trace: &mut ContextTrace,
        prepend: bool,
    ) -> String {
        if block.is_empty() {
            return ctx;
        }
        trace.context_sources.push(source.to_string());
        trace.context_blocks += 1;
        trace.context_chars_final += block.chars().count();
        if prepend {
            format!("{block}{ctx}")
        } else {
            format!("{ctx}{block}")
        }
    }

    /// Per-tool-result clipping. The truncation marker always fits within
    /// the cap, JSON payloads stay parseable, and failure markers survive.
    pub fn clip_tool_context(&self, text: &str, small_model_mode: bool) -> String {
        let cap = self.config.small_model.tool_ctx_cap;
        if !small_model_mode || cap == 0 {
            return text.to_string();
        }
        clip_with_cap(text, cap)
    }

    /// `[COMPACT-CONTEXT-ON-FAILURE]` recovery block for the output layer.
    /// Empty when compact context is unavailable or small mode is off.
    async fn build_failure_compact_block(
        &self,
        conversation_id: &str,
        small_model_mode: bool,
    ) -> String {
        if !small_model_mode {
            return String::new();
        }
        let mut compact = self.context.build_small_model_context(conversation_id).await;
        // On tool failure a second retrieval covers the global container
        // event store — except when we're already looking at it.
        if conversation_id != "_container_events" {
            let container_ctx = self.context.build_small_model_context("_container_events").await;
            if !container_ctx.is_empty() && !container_ctx.starts_with("[CONTEXT ERROR]") {
                compact.push_str(&container_ctx);
            }
        }
        if compact.is_empty() {
            return String::new();
        }
        format!("{FAILURE_COMPACT_HEADER}\n{compact}\n\n")
    }

    // ── control ─────────────────────────────────────────────────────────────

    async fn execute_control(
        &self,
        user_text: &str,
        plan: &Plan,
        context: &str,
    ) -> (Verification, Plan, bool) {
        let mut skip = !self.config.pipeline.enable_control_layer;

        let suggests_sensitive = plan
            .suggested_tools
            .iter()
            .any(|t| SENSITIVE_TOOLS.contains(&t.as_str()));
        let lower = user_text.to_lowercase();
        let has_skill_keyword = SKILL_CREATION_KEYWORDS.iter().any(|kw| lower.contains(kw));

        if !skip
            && self.config.pipeline.skip_control_on_low_risk
            && plan.hallucination_risk == Risk::Low
            && !suggests_sensitive
            && !has_skill_keyword
        {
            skip = true;
            info!("control skipped (low risk)");
        }
        // Sensitive tools force control even when it would be skipped.
        if suggests_sensitive {
            skip = false;
        }

        if skip {
            return (Verification::approved(), plan.clone(), true);
        }

        let verification = self.control.verify(user_text, plan, context).await;
        let verified_plan = verification.apply_to(plan);
        (verification, verified_plan, false)
    }

    // ── tool dispatch ───────────────────────────────────────────────────────

    async fn dispatch_tools(
        &self,
        tools: &[String],
        user_text: &str,
        plan: &Plan,
        conversation_id: &str,
        sink: &Option<EventSink>,
    ) -> ToolOutcome {
        let mut outcome = ToolOutcome {
            context: String::new(),
            had_failure: false,
            executed: Vec::new(),
        };
        let mut last_container_id: Option<String> = None;

        for tool_name in tools {
            // Gate blocks first: a blocked class yields a skip marker, not a
            // silent drop, so the output layer can explain itself.
            if CONTAINER_TOOLS.contains(&tool_name.as_str()) && plan.blueprint_gate_blocked {
                outcome.context.push_str(&format!(
                    "\n### {TOOL_SKIP_MARKER} ({tool_name}): blueprint_gate_blocked\n"
                ));
                outcome.had_failure = true;
                self.emit_tool_result(sink, tool_name, false, Some("blueprint_gate_blocked"))
                    .await;
                continue;
            }
            if SKILL_TOOLS.contains(&tool_name.as_str()) && plan.skill_gate_blocked {
                outcome.context.push_str(&format!(
                    "\n### {TOOL_SKIP_MARKER} ({tool_name}): skill_gate_blocked\n"
                ));
                outcome.had_failure = true;
                self.emit_tool_result(sink, tool_name, false, Some("skill_gate_blocked"))
                    .await;
                continue;
            }
            // Temporal guard, enforced again at dispatch: a "today" query
            // never hits the generic memory graph.
            if tool_name == "memory_graph_search" && plan.time_reference.as_deref() == Some("today")
            {
                info!("memory_graph_search blocked by temporal guard");
                continue;
            }
            // Blueprint router consult before container deployment.
            if tool_name == "request_container" {
                if let Some(router) = &self.blueprint_router {
                    let active = self.active_blueprint_ids().await;
                    let decision = router.route(user_text, &active).await;
                    if decision.outcome == RouteOutcome::NoMatch {
                        outcome.context.push_str(&format!(
                            "\n### {TOOL_SKIP_MARKER} ({tool_name}): no_blueprint\n"
                        ));
                        outcome.had_failure = true;
                        self.emit_tool_result(sink, tool_name, false, Some("no_blueprint")).await;
                        continue;
                    }
                }
            }

            let mut tool_args = self.build_tool_args(tool_name, user_text);

            // Chained calls: inject the container id from the previous
            // request_container into PENDING placeholders.
            if tool_args.get("container_id").and_then(|v| v.as_str()) == Some("PENDING") {
                match &last_container_id {
                    Some(cid) => {
                        tool_args["container_id"] = json!(cid);
                    }
                    None => {
                        info!(tool = %tool_name, "skipped — no container_id yet");
                        outcome.context.push_str(&format!(
                            "\n### {TOOL_SKIP_MARKER} ({tool_name}): missing_required=[\"container_id\"]\n"
                        ));
                        outcome.had_failure = true;
                        continue;
                    }
                }
            }

            // Verify step before exec on a non-fresh container (fail-only:
            // no repair attempted).
            if tool_name == "exec_in_container" {
                if let Some(cid) = tool_args.get("container_id").and_then(|v| v.as_str()) {
                    let fresh = last_container_id.as_deref() == Some(cid);
                    if !fresh && !self.verify_container_running(cid).await {
                        let stop_event = json!({
                            "container_id": cid,
                            "stopped_at": now_rfc3339(),
                            "reason": "verify_failed",
                        })
                        .to_string();
                        self.save_workspace_entry(
                            "_container_events",
                            &stop_event,
                            "container_stopped",
                            "orchestrator",
                            sink,
                        )
                        .await;
                        outcome.context.push_str(&format!(
                            "\n### {TOOL_SKIP_MARKER} ({tool_name}): Container {} ist nicht mehr aktiv.\n",
                            short_id(cid)
                        ));
                        outcome.had_failure = true;
                        self.emit_tool_result(sink, tool_name, false, Some("container_not_running"))
                            .await;
                        continue;
                    }
                }
            }

            info!(tool = %tool_name, "calling tool");
            match self.hub.call_tool(tool_name, tool_args.clone()).await {
                Ok(result) => {
                    if tool_name == "request_container" {
                        last_container_id = result
                            .get("container_id")
                            .and_then(|v| v.as_str())
                            .or_else(|| {
                                result
                                    .get("container")
                                    .and_then(|c| c.get("container_id"))
                                    .and_then(|v| v.as_str())
                            })
                            .map(String::from)
                            .filter(|s| !s.is_empty());
                    }

                    let mut rendered = result.to_string();
                    if rendered.chars().count() > 3000 {
                        rendered = clip_with_cap(&rendered, 3000);
                    }
                    outcome
                        .context
                        .push_str(&format!("\n### TOOL-ERGEBNIS ({tool_name}):\n{rendered}\n"));
                    outcome.executed.push(tool_name.clone());
                    self.emit_tool_result(sink, tool_name, true, None).await;

                    if let Some((entry_type, content)) =
                        container_event(tool_name, &result, user_text, &tool_args)
                    {
                        self.save_workspace_entry(
                            "_container_events",
                            &content,
                            &entry_type,
                            "orchestrator",
                            sink,
                        )
                        .await;
                    }
                }
                Err(e) => {
                    warn!(tool = %tool_name, error = %e, "tool failed");
                    outcome
                        .context
                        .push_str(&format!("\n### {TOOL_ERROR_MARKER} ({tool_name}): {e}\n"));
                    outcome.had_failure = true;
                    self.emit_tool_result(sink, tool_name, false, Some(&e.to_string())).await;
                }
            }
        }

        outcome
    }

    async fn active_blueprint_ids(&self) -> HashSet<String> {
        match self.hub.call_tool("blueprint_list", json!({})).await {
            Ok(result) => result
                .get("blueprints")
                .and_then(|b| b.as_array())
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|bp| {
                            bp.get("blueprint_id")
                                .or_else(|| bp.get("id"))
                                .and_then(|v| v.as_str())
                                .map(String::from)
                        })
                        .collect()
                })
                .unwrap_or_default(),
            Err(e) => {
                warn!(error = %e, "blueprint_list failed — empty active set");
                HashSet::new()
            }
        }
    }

    async fn verify_container_running(&self, container_id: &str) -> bool {
        match self
            .hub
            .call_tool("container_stats", json!({ "container_id": container_id }))
            .await
        {
            Ok(result) => {
                let has_error = result.get("error").map(|e| !e.is_null()).unwrap_or(false);
                if has_error {
                    warn!(container = short_id(container_id), "container not running");
                }
                !has_error
            }
            Err(e) => {
                warn!(container = short_id(container_id), error = %e, "verify probe failed");
                false
            }
        }
    }

    /// Deterministic per-tool argument extraction from the user text, plus
    /// auto-fill of schema-required `query`/`message` arguments.
    pub fn build_tool_args(&self, tool_name: &str, user_text: &str) -> Value {
        let lower = user_text.to_lowercase();
        let mut args = match tool_name {
            "run_skill" => json!({ "skill_name": user_text.trim(), "arguments": {} }),
            "get_skill_info" => json!({ "skill_name": user_text.trim() }),
            "create_skill" => json!({ "description": user_text.trim() }),
            "autonomous_skill_task" => json!({ "task_description": user_text.trim() }),
            "memory_search" | "memory_graph_search" | "memory_semantic_search" => {
                json!({ "query": user_text.trim() })
            }
            "memory_save" | "memory_fact_save" => json!({
                "conversation_id": "auto",
                "role": "user",
                "content": user_text.trim(),
            }),
            "blueprint_list" => {
                let tag = ["python", "node", "database", "latex", "web"]
                    .iter()
                    .find(|t| lower.contains(*t));
                match tag {
                    Some(t) => json!({ "tag": t }),
                    None => json!({}),
                }
            }
            "request_container" => json!({ "blueprint_id": detect_blueprint(&lower) }),
            "exec_in_container" => json!({
                "container_id": "PENDING",
                "command": synthesize_command(user_text, &lower),
            }),
            "stop_container" | "container_stats" => json!({ "container_id": "PENDING" }),
            "container_logs" => json!({ "container_id": "PENDING", "tail": 50 }),
            "home_write" => {
                let path = extract_quoted_path(user_text).unwrap_or_else(|| {
                    format!(
                        "notes/note_{}.md",
                        chrono::Utc::now().format("%Y-%m-%d_%H-%M-%S")
                    )
                });
                json!({ "path": path, "content": user_text.trim() })
            }
            "home_read" => json!({ "path": detect_home_path(&lower, user_text) }),
            "home_list" => json!({ "path": detect_home_dir(&lower) }),
            _ => json!({}),
        };

        // Auto-fill: the LLM sometimes suggests a tool without the argument
        // its schema marks required.
        if let Some(def) = self.hub.tool_def(tool_name) {
            for required in def.required_args() {
                if (required == "query" || required == "message")
                    && args.get(required.as_str()).is_none()
                {
                    args[required.as_str()] = json!(user_text.trim());
                }
            }
        }
        args
    }

    // ── memory save & post-task ─────────────────────────────────────────────

    async fn save_memory(
        &self,
        conversation_id: &str,
        plan: &Plan,
        answer: &str,
        tool_failure: bool,
    ) {
        if plan.is_new_fact {
            if let (Some(key), Some(value)) = (&plan.new_fact_key, &plan.new_fact_value) {
                info!(key = %key, "saving new fact");
                if let Err(e) = self
                    .hub
                    .call_tool(
                        "memory_fact_save",
                        json!({
                            "conversation_id": conversation_id,
                            "key": key,
                            "value": value,
                            "layer": "ltm",
                        }),
                    )
                    .await
                {
                    warn!(error = %e, "fact save failed");
                }
            }
        }

        // Autosave is suppressed when a pending intent exists or any
        // failure/skip marker reached the context — half-finished turns
        // must not become short-term memory.
        let pending = self
            .intents
            .pending_for_conversation(conversation_id)
            .is_some();
        if pending || tool_failure {
            info!(pending, tool_failure, "autosave suppressed");
            return;
        }
        if answer.is_empty() {
            return;
        }
        if let Err(e) = self
            .hub
            .call_tool(
                "memory_save",
                json!({
                    "conversation_id": conversation_id,
                    "role": "assistant",
                    "content": answer,
                    "layer": "stm",
                }),
            )
            .await
        {
            warn!(error = %e, "autosave failed");
        }
    }

    /// Durable post-task work: record an archive-embedding job and drain it
    /// eagerly. Every queue failure mode — no queue, enqueue error, claim
    /// failure — falls back to running the pass inline; the pass itself
    /// never depends on the queue being healthy.
    async fn post_task_processing(&self) {
        match &self.embedding_queue {
            Some(queue) => match queue.enqueue() {
                Ok(_) => {
                    // A job we just enqueued must be claimable; when it is
                    // not, the queue itself is broken.
                    if !queue.run_once(&self.embedder).await {
                        warn!("queue claim failed after enqueue — processing inline");
                        self.run_embeddings_inline().await;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "embedding enqueue failed — processing inline");
                    self.run_embeddings_inline().await;
                }
            },
            None => {
                warn!("embedding queue unavailable — processing inline");
                self.run_embeddings_inline().await;
            }
        }
    }

    /// The queue-independent embedding pass.
    async fn run_embeddings_inline(&self) {
        if let Err(e) = self.embedder.process_pending(EMBEDDING_BATCH_SIZE).await {
            warn!(error = %e, "inline embedding pass failed");
        }
    }

    // ── workspace + event emission ──────────────────────────────────────────

    async fn save_workspace_entry(
        &self,
        conversation_id: &str,
        content: &str,
        entry_type: &str,
        source_layer: &str,
        sink: &Option<EventSink>,
    ) {
        let result = self
            .hub
            .call_tool(
                "workspace_save",
                json!({
                    "conversation_id": conversation_id,
                    "content": content,
                    "entry_type": entry_type,
                    "source_layer": source_layer,
                }),
            )
            .await;

        match result {
            Ok(value) => {
                let entry_id = value.get("id").and_then(|v| v.as_str()).unwrap_or("");
                if !entry_id.is_empty() {
                    self.emit(
                        sink,
                        StreamChunk::new("workspace_update")
                            .with("entry_id", json!(entry_id))
                            .with("content", json!(content))
                            .with("entry_type", json!(entry_type))
                            .with("source_layer", json!(source_layer))
                            .with("conversation_id", json!(conversation_id))
                            .with("timestamp", json!(now_rfc3339())),
                    )
                    .await;
                }
            }
            Err(e) => warn!(error = %e, "workspace save failed"),
        }
    }

    async fn emit(&self, sink: &Option<EventSink>, chunk: StreamChunk) {
        if let Some(tx) = sink {
            let _ = tx.send(chunk).await;
        }
    }

    async fn emit_content(&self, sink: &Option<EventSink>, content: &str) {
        self.emit(sink, StreamChunk::new("content").with("content", json!(content)))
            .await;
    }

    async fn emit_tool_result(
        &self,
        sink: &Option<EventSink>,
        tool: &str,
        success: bool,
        error: Option<&str>,
    ) {
        let mut chunk = StreamChunk::new("tool_result")
            .with("tool", json!(tool))
            .with("success", json!(success));
        if let Some(e) = error {
            chunk = chunk.with("error", json!(e));
        }
        self.emit(sink, chunk).await;
    }

    // ── chunking ────────────────────────────────────────────────────────────

    /// Structure-analysis path for oversized inputs. Returns a compact
    /// summary to feed Thinking instead of the raw text, or `None` when
    /// chunking is disabled, unnecessary, or unavailable (fail-open).
    async fn maybe_chunk(&self, user_text: &str, sink: &Option<EventSink>) -> Option<String> {
        if !self.config.pipeline.enable_chunking {
            return None;
        }
        let approx_tokens = user_text.chars().count() / 4;
        if approx_tokens <= self.config.pipeline.chunking_threshold {
            return None;
        }

        self.emit(
            sink,
            StreamChunk::new("document_analysis_start")
                .with("message", json!("Preprocessing document…")),
        )
        .await;

        let processed = match self
            .hub
            .call_tool(
                "preprocess",
                json!({ "text": user_text, "normalize_whitespace": true }),
            )
            .await
        {
            Ok(result) => result
                .get("text")
                .and_then(|t| t.as_str())
                .unwrap_or(user_text)
                .to_string(),
            Err(e) => {
                warn!(error = %e, "preprocess failed — raw text");
                user_text.to_string()
            }
        };

        let structure = match self
            .hub
            .call_tool("analyze_structure", json!({ "text": processed }))
            .await
        {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "structure analysis failed — chunking skipped");
                return None;
            }
        };

        let heading_count = structure
            .get("heading_count")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        let complexity = structure.get("complexity").and_then(|v| v.as_u64()).unwrap_or(5);
        self.emit(
            sink,
            StreamChunk::new("document_analysis_done")
                .with("heading_count", json!(heading_count))
                .with("complexity", json!(complexity)),
        )
        .await;

        let mut summary = String::from("# Document Overview\n");
        summary.push_str(&format!(
            "- Size: {} chars, complexity {complexity}/10\n",
            processed.chars().count()
        ));
        if let Some(headings) = structure.get("headings").and_then(|h| h.as_array()) {
            summary.push_str(&format!("\n## Structure ({heading_count} headings):\n"));
            for heading in headings.iter().take(5) {
                if let Some(text) = heading.get("text").and_then(|t| t.as_str()) {
                    summary.push_str(&format!("- {text}\n"));
                }
            }
        }
        if let Some(keywords) = structure.get("keywords").and_then(|k| k.as_array()) {
            let words: Vec<&str> = keywords.iter().filter_map(|w| w.as_str()).take(10).collect();
            if !words.is_empty() {
                summary.push_str(&format!("\n## Keywords: {}\n", words.join(", ")));
            }
        }
        summary.push_str(&format!("\n## Intro:\n{}\n", head_chars(&processed, 300)));

        self.emit(
            sink,
            StreamChunk::new("chunking_done").with("aggregated_summary", json!(summary)),
        )
        .await;
        Some(summary)
    }
}

// ── free helpers ────────────────────────────────────────────────────────────

fn error_response(
    request: &CoreChatRequest,
    conversation_id: &str,
    memory_used: bool,
) -> CoreChatResponse {
    CoreChatResponse {
        model: request.model.clone(),
        content: "Bei der Antwort ist ein Fehler aufgetreten.".to_string(),
        conversation_id: conversation_id.to_string(),
        done: true,
        done_reason: DoneReason::Error,
        memory_used,
        validation_passed: Some(false),
    }
}

fn short_id(id: &str) -> &str {
    &id[..id.len().min(12)]
}

/// Map a plan (plus the raw text) to a JIT trigger category. Temporal
/// references win, explicit remember-requests next, then fact recall.
fn derive_jit_trigger(user_text: &str, plan: &Plan) -> Option<JitTrigger> {
    if plan.time_reference.is_some() {
        return Some(JitTrigger::TimeReference);
    }
    let lower = user_text.to_lowercase();
    if ["merk dir", "remember", "speicher"]
        .iter()
        .any(|kw| lower.contains(kw))
        || plan.is_new_fact
    {
        return Some(JitTrigger::Remember);
    }
    if plan.needs_memory && !plan.memory_keys.is_empty() {
        return Some(JitTrigger::FactRecall);
    }
    None
}

fn head_chars(s: &str, n: usize) -> String {
    s.chars().take(n).collect()
}

/// Noteworthy thinking-plan observations for the workspace.
fn workspace_observation(plan: &Plan) -> Option<String> {
    let mut parts = Vec::new();
    if !plan.intent.is_empty() && plan.intent != "unknown" {
        parts.push(format!("**Intent:** {}", plan.intent));
    }
    if !plan.memory_keys.is_empty() {
        let keys: Vec<&str> = plan.memory_keys.iter().map(String::as_str).collect();
        parts.push(format!("**Memory keys:** {}", keys.join(", ")));
    }
    if plan.hallucination_risk == Risk::High {
        parts.push("**Risk:** high hallucination risk".to_string());
    }
    if plan.needs_sequential_thinking {
        parts.push("**Sequential thinking** required".to_string());
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n"))
    }
}

/// Keyword fallback when the plan suggests no valid tools.
pub fn detect_tools_by_keyword(user_text: &str) -> Vec<String> {
    let lower = user_text.to_lowercase();
    let contains_any = |kws: &[&str]| kws.iter().any(|kw| lower.contains(kw));

    if contains_any(&["skill", "skills", "fähigkeit"]) {
        if contains_any(&["zeig", "list", "welche", "hast du", "installiert", "verfügbar"]) {
            return vec!["list_skills".to_string()];
        }
        if contains_any(&["erstell", "create", "bau", "mach"]) {
            return vec!["autonomous_skill_task".to_string()];
        }
    }
    if contains_any(&["erinnerst du", "weißt du noch", "was weißt du über"]) {
        return vec!["memory_graph_search".to_string()];
    }
    if contains_any(&["merk dir", "speicher", "remember"]) {
        return vec!["memory_fact_save".to_string()];
    }
    if contains_any(&["blueprint", "blueprints", "container-typ", "container typen"])
        || contains_any(&["welche container", "verfügbare container", "container liste"])
    {
        return vec!["blueprint_list".to_string()];
    }
    if contains_any(&[
        "starte container",
        "start container",
        "deploy container",
        "container starten",
        "brauche sandbox",
        "brauche container",
        "python sandbox",
        "node sandbox",
    ]) {
        return vec!["request_container".to_string()];
    }
    if contains_any(&["stoppe container", "stop container", "container stoppen", "beende container"]) {
        return vec!["stop_container".to_string()];
    }
    if contains_any(&["container stats", "container status", "container auslastung"]) {
        return vec!["container_stats".to_string()];
    }
    if contains_any(&["container log", "container logs", "container ausgabe"]) {
        return vec!["container_logs".to_string()];
    }
    if contains_any(&["snapshot", "snapshots", "volume backup"]) {
        return vec!["snapshot_list".to_string()];
    }
    if contains_any(&[
        "berechne",
        "berechnung",
        "rechne",
        "ausführen",
        "execute",
        "führe aus",
        "run code",
        "fibonacci",
        "fakultät",
    ]) {
        return vec![
            "request_container".to_string(),
            "exec_in_container".to_string(),
        ];
    }
    Vec::new()
}

fn detect_blueprint(lower: &str) -> &'static str {
    if ["python", "pandas", "numpy", "berechn", "fibonacci", "fakult"]
        .iter()
        .any(|kw| lower.contains(kw))
    {
        "python-sandbox"
    } else if ["node", "javascript", "npm"].iter().any(|kw| lower.contains(kw)) {
        "node-sandbox"
    } else if ["datenbank", "database", "sql", "postgres"]
        .iter()
        .any(|kw| lower.contains(kw))
    {
        "db-sandbox"
    } else if ["latex", "pdf", "dokument"].iter().any(|kw| lower.contains(kw)) {
        "latex-builder"
    } else if ["scrape", "crawl"].iter().any(|kw| lower.contains(kw)) {
        "web-scraper"
    } else {
        "python-sandbox"
    }
}

/// Synthesise a shell command from the user's compute request.
fn synthesize_command(user_text: &str, lower: &str) -> String {
    let first_number = || {
        user_text
            .split_whitespace()
            .find_map(|w| w.trim_matches(|c: char| !c.is_ascii_digit()).parse::<u64>().ok())
    };
    if lower.contains("fibonacci") {
        let n = first_number().unwrap_or(20);
        format!("python3 -c 'a,b=0,1\nfor _ in range({n}):\n print(a)\n a,b=b,a+b'")
    } else if lower.contains("fakult") || lower.contains("factorial") {
        let n = first_number().unwrap_or(100);
        format!("python3 -c 'import math; print(math.factorial({n}))'")
    } else if lower.contains("primzahl") || lower.contains("prime") {
        "python3 -c 'primes=[i for i in range(2,100) if all(i%j for j in range(2,i))]; print(primes)'"
            .to_string()
    } else {
        "python3 -c 'print(42)'".to_string()
    }
}

fn extract_quoted_path(user_text: &str) -> Option<String> {
    let idx = user_text.find("path=")?;
    let rest = &user_text[idx + 5..];
    let trimmed = rest.trim_start_matches(['\'', '"']);
    let end = trimmed
        .find(['\'', '"', ' '])
        .unwrap_or(trimmed.len());
    let path = &trimmed[..end];
    (!path.is_empty()).then(|| path.to_string())
}

fn detect_home_path(lower: &str, user_text: &str) -> String {
    if lower.contains("notes") {
        user_text
            .split_whitespace()
            .find(|w| w.contains("notes/"))
            .map(|w| w.trim_matches(|c: char| ".,;\"'".contains(c)).to_string())
            .unwrap_or_else(|| "notes".to_string())
    } else if lower.contains("project") {
        "projects".to_string()
    } else if lower.contains("script") {
        "scripts".to_string()
    } else if lower.contains("config") {
        ".config".to_string()
    } else {
        "notes".to_string()
    }
}

fn detect_home_dir(lower: &str) -> &'static str {
    if lower.contains("notes") {
        "notes"
    } else if lower.contains("projects") {
        "projects"
    } else if lower.contains("scripts") {
        "scripts"
    } else if lower.contains("config") {
        ".config"
    } else {
        "."
    }
}

/// Clip to at most `cap` characters while keeping the truncation marker
/// inside the cap and preserving failure-marker lines. JSON inputs stay
/// parseable via a structured preview object.
pub fn clip_with_cap(text: &str, cap: usize) -> String {
    let total = text.chars().count();
    if total <= cap {
        return text.to_string();
    }
    let omitted = total - cap;
    let marker = format!("[...truncated:{omitted}]");

    // JSON payloads are replaced by a parseable preview object.
    if serde_json::from_str::<Value>(text).is_ok() {
        let mut preview_budget = cap.saturating_sub(marker.len() + 32);
        loop {
            let preview = format!("{}{marker}", head_chars(text, preview_budget));
            let clipped = json!({ "truncated": omitted, "preview": preview }).to_string();
            if clipped.chars().count() <= cap || preview_budget == 0 {
                if clipped.chars().count() <= cap {
                    return clipped;
                }
                // Even the minimal object exceeds the cap: degrade to the
                // plain-text path below.
                break;
            }
            preview_budget = preview_budget.saturating_sub(16);
        }
    }

    // Failure-marker lines are mandatory survivors.
    let marker_lines: Vec<&str> = text
        .lines()
        .filter(|line| line.contains(TOOL_ERROR_MARKER) || line.contains(TOOL_SKIP_MARKER))
        .collect();
    let mut mandatory = marker.clone();
    if !marker_lines.is_empty() {
        let block = marker_lines.join("\n");
        let budget = cap.saturating_sub(marker.chars().count() + 1);
        mandatory = format!("{marker}\n{}", head_chars(&block, budget));
    }
    let mandatory_len = mandatory.chars().count();
    if mandatory_len >= cap {
        return head_chars(&mandatory, cap);
    }
    let head_budget = cap - mandatory_len;
    format!("{}{mandatory}", head_chars(text, head_budget))
}

/// Workspace event payload for container lifecycle transitions.
fn container_event(
    tool_name: &str,
    result: &Value,
    user_text: &str,
    tool_args: &Value,
) -> Option<(String, String)> {
    match tool_name {
        "request_container" => {
            let cid = result.get("container_id").and_then(|v| v.as_str())?;
            if result.get("status").and_then(|v| v.as_str()) != Some("running") || cid.is_empty() {
                return None;
            }
            let content = json!({
                "container_id": cid,
                "blueprint": tool_args.get("blueprint_id").cloned().unwrap_or(json!("unknown")),
                "name": result.get("name").cloned().unwrap_or(json!("")),
                "purpose": head_chars(user_text, 200),
                "ttl_seconds": result.get("ttl_seconds").cloned().unwrap_or(Value::Null),
                "started_at": now_rfc3339(),
            })
            .to_string();
            Some(("container_started".to_string(), content))
        }
        "stop_container" => {
            let cid = result.get("container_id").and_then(|v| v.as_str())?;
            if !result.get("stopped").and_then(|v| v.as_bool()).unwrap_or(false) || cid.is_empty() {
                return None;
            }
            let content = json!({
                "container_id": cid,
                "stopped_at": now_rfc3339(),
                "reason": "user_stopped",
            })
            .to_string();
            Some(("container_stopped".to_string(), content))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── clipping ────────────────────────────────────────────────────────────

    #[test]
    fn clip_respects_cap_and_adds_marker() {
        let big = "T".repeat(5000);
        let clipped = clip_with_cap(&big, 200);
        assert!(clipped.chars().count() <= 200);
        assert!(clipped.contains("[...truncated:"));
    }

    #[test]
    fn clip_is_noop_under_cap() {
        assert_eq!(clip_with_cap("short", 200), "short");
    }

    #[test]
    fn clip_preserves_failure_markers() {
        let mut text = String::from("### TOOL-FEHLER (exec_in_container): timeout\n");
        text.push_str(&"x".repeat(5000));
        let clipped = clip_with_cap(&text, 200);
        assert!(clipped.chars().count() <= 200);
        assert!(clipped.contains(TOOL_ERROR_MARKER));
        assert!(clipped.contains("[...truncated:"));
    }

    #[test]
    fn clip_keeps_json_parseable() {
        let payload = json!({ "stdout": "y".repeat(5000), "exit_code": 0 }).to_string();
        let clipped = clip_with_cap(&payload, 300);
        assert!(clipped.chars().count() <= 300);
        let parsed: Value = serde_json::from_str(&clipped).expect("clipped JSON must parse");
        assert!(parsed.get("truncated").is_some());
    }

    // ── keyword detection & tool args ───────────────────────────────────────

    #[test]
    fn keyword_detection_covers_tool_classes() {
        assert_eq!(detect_tools_by_keyword("zeig mir deine skills"), vec!["list_skills"]);
        assert_eq!(
            detect_tools_by_keyword("erstelle einen skill für wetter"),
            vec!["autonomous_skill_task"]
        );
        assert_eq!(
            detect_tools_by_keyword("was weißt du über berlin?"),
            vec!["memory_graph_search"]
        );
        assert_eq!(
            detect_tools_by_keyword("merk dir meine lieblingsfarbe"),
            vec!["memory_fact_save"]
        );
        assert_eq!(
            detect_tools_by_keyword("welche blueprints gibt es?"),
            vec!["blueprint_list"]
        );
        assert_eq!(
            detect_tools_by_keyword("berechne fibonacci 30"),
            vec!["request_container", "exec_in_container"]
        );
        assert!(detect_tools_by_keyword("wie ist das wetter?").is_empty());
    }

    #[test]
    fn blueprint_detection_prefers_specific_stack() {
        assert_eq!(detect_blueprint("run some python pandas"), "python-sandbox");
        assert_eq!(detect_blueprint("ein node script bitte"), "node-sandbox");
        assert_eq!(detect_blueprint("sql datenbank anlegen"), "db-sandbox");
        assert_eq!(detect_blueprint("latex pdf bauen"), "latex-builder");
        assert_eq!(detect_blueprint("irgendwas"), "python-sandbox");
    }

    #[test]
    fn command_synthesis_extracts_numbers() {
        let cmd = synthesize_command("berechne fibonacci 30", "berechne fibonacci 30");
        assert!(cmd.contains("range(30)"));
        let cmd = synthesize_command("fakultät von 12", "fakultät von 12");
        assert!(cmd.contains("factorial(12)"));
        let cmd = synthesize_command("führe code aus", "führe code aus");
        assert!(cmd.contains("print(42)"));
    }

    #[test]
    fn quoted_path_extraction() {
        assert_eq!(
            extract_quoted_path("schreibe path='notes/todo.md' bitte").as_deref(),
            Some("notes/todo.md")
        );
        assert_eq!(
            extract_quoted_path("path=\"a/b.md\"").as_deref(),
            Some("a/b.md")
        );
        assert!(extract_quoted_path("kein pfad hier").is_none());
    }

    // ── context trace ───────────────────────────────────────────────────────

    fn trace() -> ContextTrace {
        ContextTrace::default()
    }

    /// `append_context_block` needs no live orchestrator state; reproduce
    /// its accounting contract standalone.
    fn append(
        ctx: String,
        block: &str,
        source: &str,
        trace: &mut ContextTrace,
        prepend: bool,
    ) -> String {
        if block.is_empty() {
            return ctx;
        }
        trace.context_sources.push(source.to_string());
        trace.context_blocks += 1;
        trace.context_chars_final += block.chars().count();
        if prepend {
            format!("{block}{ctx}")
        } else {
            format!("{ctx}{block}")
        }
    }

    #[test]
    fn append_registers_source_and_chars() {
        let mut t = trace();
        let out = append("base".into(), "EXTRA", "jit_memory", &mut t, false);
        assert_eq!(out, "baseEXTRA");
        assert_eq!(t.context_sources, vec!["jit_memory"]);
        assert_eq!(t.context_chars_final, 5);
    }

    #[test]
    fn append_prepend_flag() {
        let mut t = trace();
        let out = append("existing".into(), "PREFIX_", "failure_ctx", &mut t, true);
        assert_eq!(out, "PREFIX_existing");
    }

    #[test]
    fn append_empty_block_is_noop() {
        let mut t = trace();
        let out = append("unchanged".into(), "", "noop", &mut t, false);
        assert_eq!(out, "unchanged");
        assert!(t.context_sources.is_empty());
        assert_eq!(t.context_chars_final, 0);
    }

    #[test]
    fn failure_compact_is_counted_once() {
        // Stream-path contract: the failure block is prepended to the tool
        // context, failure_ctx registered WITHOUT chars, then the combined
        // block is appended once as tool_ctx.
        let mut t = trace();
        t.context_chars_final = 50;

        let fail_block = "[COMPACT-CONTEXT-ON-FAILURE]\nNOW: container c-1 running\n\n";
        let tool_output = "\nTool result: exit_code=0\n";
        let tool_context = format!("{fail_block}{tool_output}");

        t.context_sources.push("failure_ctx".to_string());
        let _ = append("BASE".into(), &tool_context, "tool_ctx", &mut t, false);

        assert_eq!(
            t.context_sources
                .iter()
                .filter(|s| s.as_str() == "failure_ctx")
                .count(),
            1
        );
        assert_eq!(
            t.context_sources
                .iter()
                .filter(|s| s.as_str() == "tool_ctx")
                .count(),
            1
        );
        assert_eq!(
            t.context_chars_final,
            50 + tool_context.chars().count(),
            "failure block chars must be counted exactly once (via tool_ctx)"
        );
    }

    #[test]
    fn final_cap_truncates_after_appends() {
        let mut t = trace();
        let mut ctx = append(String::new(), "MEM", "memory:x", &mut t, false);
        ctx = append(ctx, &"T".repeat(2000), "tool_ctx", &mut t, false);

        let cap = 100;
        if ctx.chars().count() > cap {
            ctx = ctx.chars().take(cap).collect();
            t.context_chars_final = cap;
        }
        assert_eq!(ctx.chars().count(), 100);
        assert_eq!(t.context_chars_final, 100);
    }

    // ── blocked gate ────────────────────────────────────────────────────────

    use crate::provider::{ModelRequest, ModelResponse, ProviderError};
    use async_trait::async_trait;
    use cortex_core::types::{ChatMessage, MessageRole};

    /// Scripted provider answering per pipeline layer (keyed by model id).
    struct LayeredProvider {
        thinking_model: String,
        control_model: String,
        thinking_reply: String,
        control_reply: String,
    }

    #[async_trait]
    impl ChatProvider for LayeredProvider {
        fn name(&self) -> &str {
            "layered"
        }
        async fn send(&self, req: &ModelRequest) -> Result<ModelResponse, ProviderError> {
            let content = if req.model == self.thinking_model {
                self.thinking_reply.clone()
            } else if req.model == self.control_model {
                self.control_reply.clone()
            } else {
                "output layer must not run".to_string()
            };
            Ok(ModelResponse {
                content,
                model: req.model.clone(),
            })
        }
    }

    struct EmptyBackend;

    #[async_trait]
    impl MemoryBackend for EmptyBackend {
        async fn graph_search(&self, _query: &str) -> cortex_core::Result<String> {
            Ok(String::new())
        }
        async fn workspace_entries(
            &self,
            _conversation_id: &str,
        ) -> cortex_core::Result<Value> {
            Ok(json!([]))
        }
    }

    fn gate_test_orchestrator(dir: &tempfile::TempDir, control_reply: &str) -> PipelineOrchestrator {
        let mut config = CortexConfig::default();
        config.pipeline.plan_cache_path = dir
            .path()
            .join("plan_cache.sqlite")
            .to_string_lossy()
            .into_owned();
        config.pipeline.protocol_dir = dir.path().to_string_lossy().into_owned();
        config.digest.store_path = dir
            .path()
            .join("digest_store.csv")
            .to_string_lossy()
            .into_owned();

        let provider = Arc::new(LayeredProvider {
            thinking_model: config.models.thinking.clone(),
            control_model: config.models.control.clone(),
            thinking_reply:
                r#"{"intent": "fact query", "needs_memory": true, "hallucination_risk": "high"}"#
                    .into(),
            control_reply: control_reply.to_string(),
        });

        // The hub points at a closed port: every tool call fails fast, which
        // the pipeline tolerates everywhere it touches the hub.
        PipelineOrchestrator::new(
            config,
            Arc::new(McpHub::new("http://127.0.0.1:1", 1)),
            provider,
            Arc::new(EmptyBackend),
            Arc::new(IntentStore::new()),
            None,
            None,
            None,
            None,
        )
    }

    fn gate_test_request() -> CoreChatRequest {
        CoreChatRequest {
            model: "ministral-3:8b".into(),
            messages: vec![ChatMessage {
                role: MessageRole::User,
                content: "Wann hat er Geburtstag?".into(),
            }],
            conversation_id: "conv-blocked".into(),
            temperature: None,
            top_p: None,
            max_tokens: None,
            stream: false,
            source_adapter: "test".into(),
        }
    }

    #[tokio::test]
    async fn high_risk_without_memory_is_blocked() {
        let dir = tempfile::tempdir().unwrap();
        let orch = gate_test_orchestrator(&dir, r#"{"approved": false}"#);

        let response = orch.process(gate_test_request()).await;
        assert_eq!(response.done_reason, DoneReason::Blocked);
        assert!(!response.memory_used);
        assert_eq!(response.validation_passed, Some(false));
        assert!(!response.content.is_empty());
    }

    #[tokio::test]
    async fn risk_correction_does_not_lift_the_block() {
        // Control rejects AND corrects the risk down to low; the gate reads
        // the pre-correction plan risk, so the request stays blocked.
        let dir = tempfile::tempdir().unwrap();
        let orch = gate_test_orchestrator(
            &dir,
            r#"{"approved": false, "corrections": {"hallucination_risk": "low"}}"#,
        );

        let response = orch.process(gate_test_request()).await;
        assert_eq!(response.done_reason, DoneReason::Blocked);
    }

    // ── intent gate tokens ──────────────────────────────────────────────────

    #[test]
    fn affirmation_and_negation_token_sets() {
        for token in AFFIRMATIONS {
            assert!(!NEGATIONS.contains(&token));
        }
        assert!(AFFIRMATIONS.contains(&"ja"));
        assert!(AFFIRMATIONS.contains(&"yes"));
        assert!(NEGATIONS.contains(&"nein"));
        assert!(NEGATIONS.contains(&"cancel"));
    }

    #[test]
    fn jit_trigger_derivation() {
        let temporal = Plan {
            time_reference: Some("today".into()),
            ..Plan::default()
        };
        assert_eq!(
            derive_jit_trigger("was war heute?", &temporal),
            Some(JitTrigger::TimeReference)
        );

        assert_eq!(
            derive_jit_trigger("merk dir: ich mag grün", &Plan::default()),
            Some(JitTrigger::Remember)
        );

        let mut recall = Plan {
            needs_memory: true,
            ..Plan::default()
        };
        recall.memory_keys.insert("birthday".into());
        assert_eq!(
            derive_jit_trigger("wann war das nochmal?", &recall),
            Some(JitTrigger::FactRecall)
        );

        assert_eq!(derive_jit_trigger("hallo", &Plan::default()), None);
    }

    #[test]
    fn workspace_observation_includes_risk_and_keys() {
        let mut plan = Plan {
            intent: "deploy".into(),
            hallucination_risk: Risk::High,
            ..Plan::default()
        };
        plan.memory_keys.insert("proj".into());
        let obs = workspace_observation(&plan).unwrap();
        assert!(obs.contains("**Intent:** deploy"));
        assert!(obs.contains("proj"));
        assert!(obs.contains("high hallucination risk"));
        assert!(workspace_observation(&Plan::default()).is_none());
    }

    #[test]
    fn container_event_shapes() {
        let result = json!({ "container_id": "c-123", "status": "running", "ttl_seconds": 600 });
        let args = json!({ "blueprint_id": "python-sandbox" });
        let (entry_type, content) =
            container_event("request_container", &result, "berechne 2+2", &args).unwrap();
        assert_eq!(entry_type, "container_started");
        let parsed: Value = serde_json::from_str(&content).unwrap();
        assert_eq!(parsed["blueprint"], "python-sandbox");
        assert_eq!(parsed["ttl_seconds"], 600);

        // Not running → no event.
        let pending = json!({ "container_id": "c-123", "status": "pending" });
        assert!(container_event("request_container", &pending, "", &args).is_none());

        let stopped = json!({ "container_id": "c-123", "stopped": true });
        let (entry_type, content) =
            container_event("stop_container", &stopped, "", &json!({})).unwrap();
        assert_eq!(entry_type, "container_stopped");
        assert!(content.contains("user_stopped"));
    }
}
