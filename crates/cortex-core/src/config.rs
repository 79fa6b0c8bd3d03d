//! Runtime configuration (cortex.toml + environment overrides).
//!
//! The TOML file is loaded through figment; on top of that an explicit
//! override pass applies the recognised environment variables. They are an
//! external contract (`DIGEST_ENABLE`, `TYPEDSTATE_CSV_ENABLE`,
//! `SMALL_MODEL_MODE`, …) and do not share a prefix, so a single
//! `Env::prefixed` provider cannot express them.

use figment::{
    providers::{Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Top-level config (cortex.toml + env overrides).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CortexConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub mcp: McpConfig,
    #[serde(default)]
    pub models: ModelsConfig,
    #[serde(default)]
    pub digest: DigestConfig,
    #[serde(default)]
    pub typedstate: TypedStateConfig,
    #[serde(default)]
    pub small_model: SmallModelConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Bearer token for the chat endpoint. `None` disables auth.
    pub token: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: default_bind(),
            token: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpConfig {
    /// Base URL of the MCP tool hub (single JSON-RPC endpoint).
    #[serde(default = "default_mcp_base_url")]
    pub base_url: String,
    /// Upper-bound timeout per tool call, in seconds.
    #[serde(default = "default_tool_timeout_s")]
    pub tool_timeout_s: u64,
    /// Tool executor base URL (skill/package HTTP contract).
    #[serde(default = "default_executor_base_url")]
    pub executor_base_url: String,
    /// Executor endpoint mode: auto | modern | compat.
    #[serde(default = "default_endpoint_mode")]
    pub executor_endpoint_mode: String,
}

impl Default for McpConfig {
    fn default() -> Self {
        Self {
            base_url: default_mcp_base_url(),
            tool_timeout_s: default_tool_timeout_s(),
            executor_base_url: default_executor_base_url(),
            executor_endpoint_mode: default_endpoint_mode(),
        }
    }
}

/// Which model serves each pipeline layer. The output model can be
/// overridden per request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    #[serde(default = "default_provider_base_url")]
    pub provider_base_url: String,
    #[serde(default = "default_thinking_model")]
    pub thinking: String,
    #[serde(default = "default_control_model")]
    pub control: String,
    #[serde(default = "default_output_model")]
    pub output: String,
    /// Per-call deadline for model requests, in seconds.
    #[serde(default = "default_model_deadline_s")]
    pub deadline_s: u64,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            provider_base_url: default_provider_base_url(),
            thinking: default_thinking_model(),
            control: default_control_model(),
            output: default_output_model(),
            deadline_s: default_model_deadline_s(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DigestConfig {
    /// Master switch for the digest subsystem.
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub daily_enable: bool,
    #[serde(default)]
    pub weekly_enable: bool,
    #[serde(default)]
    pub archive_enable: bool,
    /// off | sidecar | inline
    #[serde(default = "default_run_mode")]
    pub run_mode: String,
    #[serde(default = "default_tz")]
    pub tz: String,
    #[serde(default = "default_catchup_max_days")]
    pub catchup_max_days: i64,
    /// Input quality gates. 0 disables the gate.
    #[serde(default)]
    pub min_events_daily: usize,
    #[serde(default)]
    pub min_daily_per_week: usize,
    #[serde(default = "default_lock_path")]
    pub lock_path: String,
    #[serde(default = "default_lock_timeout_s")]
    pub lock_timeout_s: i64,
    #[serde(default = "default_state_path")]
    pub state_path: String,
    #[serde(default = "default_store_path")]
    pub store_path: String,
    /// Digest key schema: v1 (default) | v2 (explicit window bounds).
    #[serde(default = "default_key_version")]
    pub key_version: String,
    /// Enables trigger-derived time-window filters on CSV loads.
    #[serde(default)]
    pub filters_enable: bool,
    /// v2 runtime API response shape.
    #[serde(default = "bool_true")]
    pub runtime_api_v2: bool,
}

impl Default for DigestConfig {
    fn default() -> Self {
        Self {
            enable: false,
            daily_enable: false,
            weekly_enable: false,
            archive_enable: false,
            run_mode: default_run_mode(),
            tz: default_tz(),
            catchup_max_days: default_catchup_max_days(),
            min_events_daily: 0,
            min_daily_per_week: 0,
            lock_path: default_lock_path(),
            lock_timeout_s: default_lock_timeout_s(),
            state_path: default_state_path(),
            store_path: default_store_path(),
            key_version: default_key_version(),
            filters_enable: false,
            runtime_api_v2: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypedStateConfig {
    #[serde(default)]
    pub csv_enable: bool,
    #[serde(default = "default_csv_path")]
    pub csv_path: String,
    /// off | on — master mode for typed-state ingestion.
    #[serde(default = "default_typedstate_mode")]
    pub mode: String,
    /// When true, CSV loads require a valid JIT trigger (no trigger → no I/O).
    #[serde(default = "bool_true")]
    pub csv_jit_only: bool,
    /// When true, the CSV is only consulted in small-model mode.
    #[serde(default)]
    pub enable_small_only: bool,
    /// Trigger → lookback window, in hours.
    #[serde(default = "default_window_time_reference_h")]
    pub jit_window_time_reference_h: i64,
    #[serde(default = "default_window_fact_recall_h")]
    pub jit_window_fact_recall_h: i64,
    #[serde(default = "default_window_remember_h")]
    pub jit_window_remember_h: i64,
}

impl Default for TypedStateConfig {
    fn default() -> Self {
        Self {
            csv_enable: false,
            csv_path: default_csv_path(),
            mode: default_typedstate_mode(),
            csv_jit_only: true,
            enable_small_only: false,
            jit_window_time_reference_h: default_window_time_reference_h(),
            jit_window_fact_recall_h: default_window_fact_recall_h(),
            jit_window_remember_h: default_window_remember_h(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmallModelConfig {
    #[serde(default)]
    pub mode: bool,
    /// Caps are characters; 0 disables the cap.
    #[serde(default)]
    pub char_cap: usize,
    #[serde(default)]
    pub final_cap: usize,
    #[serde(default)]
    pub tool_ctx_cap: usize,
    /// Compact-context section caps (entries per section).
    #[serde(default = "default_now_max")]
    pub now_max: usize,
    #[serde(default = "default_rules_max")]
    pub rules_max: usize,
    #[serde(default = "default_next_max")]
    pub next_max: usize,
}

impl Default for SmallModelConfig {
    fn default() -> Self {
        Self {
            mode: false,
            char_cap: 0,
            final_cap: 0,
            tool_ctx_cap: 0,
            now_max: default_now_max(),
            rules_max: default_rules_max(),
            next_max: default_next_max(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "bool_true")]
    pub enable_control_layer: bool,
    #[serde(default = "bool_true")]
    pub skip_control_on_low_risk: bool,
    /// Interactive-mode threshold above which sequential thinking is deferred.
    #[serde(default = "default_sequential_defer_threshold")]
    pub sequential_defer_threshold: u8,
    #[serde(default)]
    pub enable_chunking: bool,
    /// Token threshold for the chunked-document path.
    #[serde(default = "default_chunking_threshold")]
    pub chunking_threshold: usize,
    #[serde(default)]
    pub skill_graph_reconcile: bool,
    /// Skill identity mode: name | legacy.
    #[serde(default = "default_skill_key_mode")]
    pub skill_key_mode: String,
    /// Plan cache TTL in seconds.
    #[serde(default = "default_plan_cache_ttl_s")]
    pub plan_cache_ttl_s: u64,
    #[serde(default = "default_plan_cache_path")]
    pub plan_cache_path: String,
    #[serde(default = "default_job_queue_path")]
    pub job_queue_path: String,
    /// Directory holding daily protocol markdown files (`YYYY-MM-DD.md`).
    #[serde(default = "default_protocol_dir")]
    pub protocol_dir: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            enable_control_layer: true,
            skip_control_on_low_risk: true,
            sequential_defer_threshold: default_sequential_defer_threshold(),
            enable_chunking: false,
            chunking_threshold: default_chunking_threshold(),
            skill_graph_reconcile: false,
            skill_key_mode: default_skill_key_mode(),
            plan_cache_ttl_s: default_plan_cache_ttl_s(),
            plan_cache_path: default_plan_cache_path(),
            job_queue_path: default_job_queue_path(),
            protocol_dir: default_protocol_dir(),
        }
    }
}

fn bool_true() -> bool {
    true
}
fn default_port() -> u16 {
    8420
}
fn default_bind() -> String {
    "127.0.0.1".to_string()
}
fn default_mcp_base_url() -> String {
    "http://localhost:8081".to_string()
}
fn default_tool_timeout_s() -> u64 {
    30
}
fn default_executor_base_url() -> String {
    "http://localhost:8400".to_string()
}
fn default_endpoint_mode() -> String {
    "auto".to_string()
}
fn default_provider_base_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_thinking_model() -> String {
    "ministral-3:3b".to_string()
}
fn default_control_model() -> String {
    "qwen2.5:1.5b".to_string()
}
fn default_output_model() -> String {
    "ministral-3:8b".to_string()
}
fn default_model_deadline_s() -> u64 {
    120
}
fn default_run_mode() -> String {
    "off".to_string()
}
fn default_tz() -> String {
    "Europe/Berlin".to_string()
}
fn default_catchup_max_days() -> i64 {
    7
}
fn default_lock_path() -> String {
    "data/digest.lock".to_string()
}
fn default_lock_timeout_s() -> i64 {
    300
}
fn default_state_path() -> String {
    "data/digest_state.json".to_string()
}
fn default_store_path() -> String {
    "data/digest_store.csv".to_string()
}
fn default_key_version() -> String {
    "v1".to_string()
}
fn default_csv_path() -> String {
    "data/memory_events.csv".to_string()
}
fn default_typedstate_mode() -> String {
    "on".to_string()
}
fn default_window_time_reference_h() -> i64 {
    48
}
fn default_window_fact_recall_h() -> i64 {
    168
}
fn default_window_remember_h() -> i64 {
    336
}
fn default_now_max() -> usize {
    5
}
fn default_rules_max() -> usize {
    3
}
fn default_next_max() -> usize {
    2
}
fn default_sequential_defer_threshold() -> u8 {
    7
}
fn default_chunking_threshold() -> usize {
    3000
}
fn default_skill_key_mode() -> String {
    "name".to_string()
}
fn default_plan_cache_ttl_s() -> u64 {
    120
}
fn default_plan_cache_path() -> String {
    "data/plan_cache.sqlite".to_string()
}
fn default_job_queue_path() -> String {
    "data/posttask_jobs.sqlite".to_string()
}
fn default_protocol_dir() -> String {
    "data/protocol".to_string()
}

impl CortexConfig {
    /// Load config from a TOML file, then apply environment overrides.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path.unwrap_or("cortex.toml");
        let mut config: CortexConfig = Figment::from(Serialized::defaults(CortexConfig::default()))
            .merge(Toml::file(path))
            .extract()
            .map_err(|e| crate::error::CortexError::Config(e.to_string()))?;
        config.apply_env();
        Ok(config)
    }

    /// Apply the recognised environment variables on top of file config.
    pub fn apply_env(&mut self) {
        env_bool("DIGEST_ENABLE", &mut self.digest.enable);
        env_bool("DIGEST_DAILY_ENABLE", &mut self.digest.daily_enable);
        env_bool("DIGEST_WEEKLY_ENABLE", &mut self.digest.weekly_enable);
        env_bool("DIGEST_ARCHIVE_ENABLE", &mut self.digest.archive_enable);
        env_string("DIGEST_RUN_MODE", &mut self.digest.run_mode);
        env_string("DIGEST_TZ", &mut self.digest.tz);
        env_parse("DIGEST_CATCHUP_MAX_DAYS", &mut self.digest.catchup_max_days);
        env_parse("DIGEST_MIN_EVENTS_DAILY", &mut self.digest.min_events_daily);
        env_parse(
            "DIGEST_MIN_DAILY_PER_WEEK",
            &mut self.digest.min_daily_per_week,
        );
        env_string("DIGEST_LOCK_PATH", &mut self.digest.lock_path);
        env_parse("DIGEST_LOCK_TIMEOUT_S", &mut self.digest.lock_timeout_s);
        env_string("DIGEST_STATE_PATH", &mut self.digest.state_path);
        env_string("DIGEST_STORE_PATH", &mut self.digest.store_path);
        env_string("DIGEST_KEY_VERSION", &mut self.digest.key_version);
        env_bool("DIGEST_FILTERS_ENABLE", &mut self.digest.filters_enable);
        env_bool("DIGEST_RUNTIME_API_V2", &mut self.digest.runtime_api_v2);

        env_bool("TYPEDSTATE_CSV_ENABLE", &mut self.typedstate.csv_enable);
        env_string("TYPEDSTATE_CSV_PATH", &mut self.typedstate.csv_path);
        env_bool("TYPEDSTATE_CSV_JIT_ONLY", &mut self.typedstate.csv_jit_only);
        env_string("TYPEDSTATE_MODE", &mut self.typedstate.mode);
        env_bool(
            "TYPEDSTATE_ENABLE_SMALL_ONLY",
            &mut self.typedstate.enable_small_only,
        );
        env_parse(
            "JIT_WINDOW_TIME_REFERENCE_H",
            &mut self.typedstate.jit_window_time_reference_h,
        );
        env_parse(
            "JIT_WINDOW_FACT_RECALL_H",
            &mut self.typedstate.jit_window_fact_recall_h,
        );
        env_parse(
            "JIT_WINDOW_REMEMBER_H",
            &mut self.typedstate.jit_window_remember_h,
        );

        env_bool("SMALL_MODEL_MODE", &mut self.small_model.mode);
        env_parse("SMALL_MODEL_CHAR_CAP", &mut self.small_model.char_cap);
        env_parse("SMALL_MODEL_FINAL_CAP", &mut self.small_model.final_cap);
        env_parse(
            "SMALL_MODEL_TOOL_CTX_CAP",
            &mut self.small_model.tool_ctx_cap,
        );

        env_bool(
            "ENABLE_CONTROL_LAYER",
            &mut self.pipeline.enable_control_layer,
        );
        env_bool(
            "SKIP_CONTROL_ON_LOW_RISK",
            &mut self.pipeline.skip_control_on_low_risk,
        );
        env_bool(
            "SKILL_GRAPH_RECONCILE",
            &mut self.pipeline.skill_graph_reconcile,
        );
        env_string("SKILL_KEY_MODE", &mut self.pipeline.skill_key_mode);
        env_bool("ENABLE_CHUNKING", &mut self.pipeline.enable_chunking);
        env_parse("CHUNKING_THRESHOLD", &mut self.pipeline.chunking_threshold);
    }
}

fn env_string(name: &str, target: &mut String) {
    if let Ok(v) = std::env::var(name) {
        if !v.is_empty() {
            *target = v;
        }
    }
}

fn env_bool(name: &str, target: &mut bool) {
    if let Ok(v) = std::env::var(name) {
        match v.to_lowercase().as_str() {
            "true" | "1" | "yes" => *target = true,
            "false" | "0" | "no" => *target = false,
            _ => {}
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, target: &mut T) {
    if let Ok(v) = std::env::var(name) {
        if let Ok(parsed) = v.parse::<T>() {
            *target = parsed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let c = CortexConfig::default();
        assert_eq!(c.digest.run_mode, "off");
        assert_eq!(c.digest.tz, "Europe/Berlin");
        assert_eq!(c.digest.catchup_max_days, 7);
        assert_eq!(c.digest.lock_timeout_s, 300);
        assert_eq!(c.digest.key_version, "v1");
        assert_eq!(c.digest.min_events_daily, 0);
        assert_eq!(c.digest.min_daily_per_week, 0);
        assert_eq!(c.typedstate.jit_window_time_reference_h, 48);
        assert_eq!(c.typedstate.jit_window_fact_recall_h, 168);
        assert_eq!(c.typedstate.jit_window_remember_h, 336);
        assert_eq!(c.small_model.final_cap, 0);
        assert_eq!(c.small_model.tool_ctx_cap, 0);
        assert_eq!(c.pipeline.sequential_defer_threshold, 7);
        assert!(c.pipeline.enable_control_layer);
        assert!(c.pipeline.skip_control_on_low_risk);
    }

    #[test]
    fn env_overrides_apply() {
        let mut c = CortexConfig::default();
        std::env::set_var("DIGEST_CATCHUP_MAX_DAYS", "3");
        std::env::set_var("SMALL_MODEL_TOOL_CTX_CAP", "2000");
        std::env::set_var("DIGEST_RUN_MODE", "sidecar");
        std::env::set_var("TYPEDSTATE_CSV_JIT_ONLY", "false");
        c.apply_env();
        std::env::remove_var("DIGEST_CATCHUP_MAX_DAYS");
        std::env::remove_var("SMALL_MODEL_TOOL_CTX_CAP");
        std::env::remove_var("DIGEST_RUN_MODE");
        std::env::remove_var("TYPEDSTATE_CSV_JIT_ONLY");

        assert_eq!(c.digest.catchup_max_days, 3);
        assert_eq!(c.small_model.tool_ctx_cap, 2000);
        assert_eq!(c.digest.run_mode, "sidecar");
        assert!(!c.typedstate.csv_jit_only);
    }
}
