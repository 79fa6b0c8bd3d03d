//! Persistent run-state for the digest pipeline.
//!
//! One JSON file, schema v2. All writes are atomic (temp file in the same
//! directory, then rename). Readers return an empty v2 default on absent or
//! corrupt files. Multiple writers are tolerated (last write wins); in
//! practice pipeline runs are serialised by the lock service.
//!
//! Legacy v1 files are migrated on read: flat `jit_last_*` fields are
//! promoted into the `jit` block and missing v2 fields are defaulted. The
//! migration is idempotent.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use cortex_core::types::now_rfc3339;
use cortex_events::JitTelemetry;

pub const SCHEMA_VERSION: u32 = 2;

/// Per-cycle run record (daily / weekly / archive).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CycleState {
    pub last_run: Option<String>,
    pub status: String,
    pub duration_s: Option<f64>,
    pub input_events: Option<u64>,
    pub digest_written: Option<u64>,
    pub digest_key: Option<String>,
    pub reason: Option<String>,
    pub retry_policy: Option<String>,
}

impl Default for CycleState {
    fn default() -> Self {
        Self {
            last_run: None,
            status: "never".to_string(),
            duration_s: None,
            input_events: None,
            digest_written: None,
            digest_key: None,
            reason: None,
            retry_policy: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CatchUpState {
    pub last_run: Option<String>,
    pub days_processed: u64,
    pub written: u64,
    pub status: String,
    pub missed_runs: u64,
    pub recovered: Option<bool>,
    pub generated: u64,
    pub mode: String,
}

impl Default for CatchUpState {
    fn default() -> Self {
        Self {
            last_run: None,
            days_processed: 0,
            written: 0,
            status: "never".to_string(),
            missed_runs: 0,
            recovered: None,
            generated: 0,
            mode: "off".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct JitState {
    pub trigger: Option<String>,
    pub rows: Option<u64>,
    pub ts: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct RuntimeState {
    pub schema_version: u32,
    #[serde(default)]
    pub daily: CycleState,
    #[serde(default)]
    pub weekly: CycleState,
    #[serde(default)]
    pub archive: CycleState,
    #[serde(default)]
    pub catch_up: CatchUpState,
    #[serde(default)]
    pub jit: JitState,
}

impl RuntimeState {
    pub fn empty_v2() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            ..Self::default()
        }
    }

    pub fn cycle_mut(&mut self, cycle: &str) -> Option<&mut CycleState> {
        match cycle {
            "daily" => Some(&mut self.daily),
            "weekly" => Some(&mut self.weekly),
            "archive" => Some(&mut self.archive),
            _ => None,
        }
    }
}

/// Fields updated together on a cycle completion.
#[derive(Debug, Clone, Default)]
pub struct CycleUpdate {
    pub status: String,
    pub duration_s: Option<f64>,
    pub input_events: Option<u64>,
    pub digest_written: Option<u64>,
    pub digest_key: Option<String>,
    pub reason: Option<String>,
    pub retry_policy: Option<String>,
}

pub struct RuntimeStateFile {
    path: PathBuf,
}

impl RuntimeStateFile {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current state, migrated to v2. Absent or corrupt files read as the
    /// empty v2 default.
    pub fn get_state(&self) -> RuntimeState {
        self.read_state()
    }

    /// Update one cycle (daily / weekly / archive) with run results.
    pub fn update_cycle(&self, cycle: &str, update: CycleUpdate) -> bool {
        let mut state = self.read_state();
        let Some(slot) = state.cycle_mut(cycle) else {
            warn!(cycle, "unknown cycle name");
            return false;
        };
        slot.last_run = Some(now_rfc3339());
        slot.status = update.status.clone();
        slot.duration_s = update.duration_s;
        slot.input_events = update.input_events;
        slot.digest_written = update.digest_written;
        slot.digest_key = update.digest_key;
        slot.reason = update.reason.clone();
        slot.retry_policy = update.retry_policy;
        let ok = self.write_state(&state);
        info!(
            cycle,
            status = %update.status,
            written = update.digest_written.unwrap_or(0),
            reason = update.reason.as_deref().unwrap_or("-"),
            "cycle state updated"
        );
        ok
    }

    /// Replace the catch-up summary.
    pub fn update_catch_up(&self, mut catch_up: CatchUpState) -> bool {
        let mut state = self.read_state();
        catch_up.last_run = Some(now_rfc3339());
        state.catch_up = catch_up;
        self.write_state(&state)
    }

    /// Record JIT CSV-load telemetry.
    pub fn update_jit(&self, trigger: Option<&str>, rows: u64) -> bool {
        let mut state = self.read_state();
        state.jit = JitState {
            trigger: trigger.map(String::from),
            rows: Some(rows),
            ts: Some(now_rfc3339()),
        };
        self.write_state(&state)
    }

    // ── read / write ────────────────────────────────────────────────────────

    fn read_state(&self) -> RuntimeState {
        if !self.path.exists() {
            return RuntimeState::empty_v2();
        }
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(r) => r,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to read state");
                return RuntimeState::empty_v2();
            }
        };
        match serde_json::from_str::<serde_json::Value>(&raw) {
            Ok(value) => migrate_state(value),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "corrupt state file");
                RuntimeState::empty_v2()
            }
        }
    }

    fn write_state(&self, state: &RuntimeState) -> bool {
        let write = || -> std::io::Result<()> {
            if let Some(parent) = self.path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            let tmp = self.path.with_extension("json.tmp");
            let body = serde_json::to_string_pretty(state)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            std::fs::write(&tmp, body)?;
            std::fs::rename(&tmp, &self.path)?;
            Ok(())
        };
        match write() {
            Ok(()) => true,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to write state");
                false
            }
        }
    }
}

impl JitTelemetry for RuntimeStateFile {
    fn record_jit(&self, trigger: Option<&str>, rows: usize) {
        // Fail-open: telemetry loss never blocks a load.
        let _ = self.update_jit(trigger, rows as u64);
    }
}

/// Upgrade a raw state document to schema v2. Safe on already-v2 documents.
fn migrate_state(mut value: serde_json::Value) -> RuntimeState {
    let Some(obj) = value.as_object_mut() else {
        return RuntimeState::empty_v2();
    };

    // Promote flat jit_last_* → jit block (v1 → v2); drop the legacy fields
    // either way.
    let legacy_trigger = obj.remove("jit_last_trigger");
    let legacy_rows = obj.remove("jit_last_rows");
    let legacy_ts = obj.remove("jit_last_ts");
    if !obj.contains_key("jit") {
        obj.insert(
            "jit".to_string(),
            serde_json::json!({
                "trigger": legacy_trigger.unwrap_or(serde_json::Value::Null),
                "rows": legacy_rows.unwrap_or(serde_json::Value::Null),
                "ts": legacy_ts.unwrap_or(serde_json::Value::Null),
            }),
        );
    }

    obj.insert(
        "schema_version".to_string(),
        serde_json::json!(SCHEMA_VERSION),
    );

    // Typed deserialisation fills every remaining v2 default (cycle fields,
    // catch_up extensions). Unknown extra keys are dropped.
    match from_value_defaulted(value) {
        Some(state) => state,
        None => RuntimeState::empty_v2(),
    }
}

fn from_value_defaulted(value: serde_json::Value) -> Option<RuntimeState> {
    // Null-valued fields in hand-edited files should read as "absent".
    let cleaned = strip_nulls(value);
    serde_json::from_value(cleaned).ok()
}

fn strip_nulls(value: serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.into_iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k, strip_nulls(v)))
                .collect(),
        ),
        other => other,
    }
}
