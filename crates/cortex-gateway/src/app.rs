//! Shared application state for the HTTP host.

use std::sync::Arc;

use tracing::warn;

use cortex_core::config::CortexConfig;
use cortex_digest::{LockService, RuntimeStateFile};
use cortex_mcp::{EndpointMode, McpHub, ToolExecutorClient};
use cortex_pipeline::context_manager::MemoryBackend;
use cortex_pipeline::queue::ArchiveEmbeddingJobQueue;
use cortex_pipeline::routers::{BlueprintSemanticRouter, SkillSemanticRouter};
use cortex_pipeline::{IntentStore, PipelineOrchestrator};

pub struct AppState {
    pub config: CortexConfig,
    pub orchestrator: Arc<PipelineOrchestrator>,
    pub hub: Arc<McpHub>,
    pub executor: ToolExecutorClient,
    pub runtime_state: Arc<RuntimeStateFile>,
    pub lock_service: LockService,
}

impl AppState {
    /// Wire up the full dependency graph. One root object per process —
    /// the lock and state files are the only cross-process singletons.
    pub fn build(config: CortexConfig) -> Arc<Self> {
        let hub = Arc::new(McpHub::new(
            config.mcp.base_url.clone(),
            config.mcp.tool_timeout_s,
        ));
        let provider = Arc::new(cortex_pipeline::provider::OllamaProvider::new(
            config.models.provider_base_url.clone(),
            config.models.deadline_s,
        ));
        let backend: Arc<dyn MemoryBackend> = Arc::clone(&hub) as Arc<dyn MemoryBackend>;
        let intents = Arc::new(IntentStore::new());

        let blueprint_router = Some(Arc::new(BlueprintSemanticRouter::new(Arc::clone(&hub))));
        let skill_router = Some(Arc::new(SkillSemanticRouter::new(
            Arc::clone(&hub),
            &config.pipeline.skill_key_mode,
        )));

        let embedding_queue = match ArchiveEmbeddingJobQueue::open(&config.pipeline.job_queue_path)
        {
            Ok(queue) => Some(Arc::new(queue)),
            Err(e) => {
                warn!(error = %e, "embedding job queue unavailable");
                None
            }
        };

        let runtime_state = Arc::new(RuntimeStateFile::new(&config.digest.state_path));

        let orchestrator = Arc::new(PipelineOrchestrator::new(
            config.clone(),
            Arc::clone(&hub),
            provider,
            backend,
            intents,
            blueprint_router,
            skill_router,
            embedding_queue,
            Some(Arc::clone(&runtime_state)),
        ));

        let executor = ToolExecutorClient::new(
            config.mcp.executor_base_url.clone(),
            EndpointMode::parse(&config.mcp.executor_endpoint_mode),
        );
        let lock_service = LockService::new(&config.digest.lock_path, config.digest.lock_timeout_s);

        Arc::new(Self {
            config,
            orchestrator,
            hub,
            executor,
            runtime_state,
            lock_service,
        })
    }
}
