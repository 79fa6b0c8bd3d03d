//! CSV event loader for the typed-state pipeline.
//!
//! CSV rows → workspace-event-compatible [`Event`]s. Column names in the
//! source file are an external contract and are never renamed; the
//! `timestamp → created_at` and `action → event_type` mapping happens here,
//! on load.
//!
//! Just-in-time gating: when `csv_jit_only` is set, a load without a valid
//! trigger returns empty WITHOUT opening the file. Valid triggers imply a
//! lookback window when `digest.filters_enable` is on.

use std::cmp::Ordering;
use std::path::Path;
use std::sync::Once;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use cortex_core::config::CortexConfig;
use cortex_core::types::{parse_rfc3339_utc, Event, EventType};
use cortex_core::{CortexError, Result};

use crate::rank::rank_score;

/// One row of the typed-state CSV. Field names mirror the column header
/// exactly — this struct IS the column contract.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CsvRow {
    pub event_id: String,
    pub conversation_id: String,
    pub timestamp: String,
    pub source_type: String,
    pub source_reliability: String,
    #[serde(default)]
    pub entity_ids: String,
    #[serde(default)]
    pub entity_match_type: String,
    pub action: String,
    #[serde(default)]
    pub raw_text: String,
    #[serde(default)]
    pub parameters: String,
    #[serde(default)]
    pub fact_type: String,
    #[serde(default)]
    pub fact_attributes: String,
    #[serde(default)]
    pub confidence_overall: String,
    #[serde(default)]
    pub confidence_breakdown: String,
    #[serde(default)]
    pub scenario_type: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub derived_from: String,
    #[serde(default)]
    pub stale_at: String,
    #[serde(default)]
    pub expires_at: String,
}

/// Optional row filters applied before ranking.
#[derive(Debug, Clone, Default)]
pub struct LoadFilter {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub conversation_id: Option<String>,
    pub actions: Option<Vec<String>>,
}

impl LoadFilter {
    fn is_empty(&self) -> bool {
        self.start.is_none()
            && self.end.is_none()
            && self.conversation_id.is_none()
            && self.actions.is_none()
    }

    fn matches(&self, row: &CsvRow) -> bool {
        let epoch = parse_rfc3339_utc(&row.timestamp);
        if let Some(start) = self.start {
            match epoch {
                Some(ts) if ts >= start => {}
                _ => return false,
            }
        }
        if let Some(end) = self.end {
            match epoch {
                Some(ts) if ts <= end => {}
                _ => return false,
            }
        }
        if let Some(conv) = &self.conversation_id {
            if &row.conversation_id != conv {
                return false;
            }
        }
        if let Some(actions) = &self.actions {
            if !actions.iter().any(|a| a == &row.action) {
                return false;
            }
        }
        true
    }
}

/// Trigger categories that justify a JIT CSV load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JitTrigger {
    TimeReference,
    Remember,
    FactRecall,
}

impl JitTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TimeReference => "time_reference",
            Self::Remember => "remember",
            Self::FactRecall => "fact_recall",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "time_reference" => Some(Self::TimeReference),
            "remember" => Some(Self::Remember),
            "fact_recall" => Some(Self::FactRecall),
            _ => None,
        }
    }

    /// Lookback window implied by the trigger when filters are enabled.
    fn window_hours(&self, cfg: &CortexConfig) -> i64 {
        match self {
            Self::TimeReference => cfg.typedstate.jit_window_time_reference_h,
            Self::FactRecall => cfg.typedstate.jit_window_fact_recall_h,
            Self::Remember => cfg.typedstate.jit_window_remember_h,
        }
    }
}

/// Telemetry sink for JIT loads. Implemented by the digest runtime state so
/// this crate stays independent of the state-file format.
pub trait JitTelemetry: Send + Sync {
    fn record_jit(&self, trigger: Option<&str>, rows: usize);
}

/// Load a typed-state CSV and map its rows to events.
///
/// When `sorted_by_rank` is set the result is ordered by
/// `(rank desc, timestamp desc, event_id asc)` — deterministic for equal
/// inputs. Otherwise CSV row order is preserved.
pub fn load_csv_events(
    path: impl AsRef<Path>,
    sorted_by_rank: bool,
    now: DateTime<Utc>,
    filter: &LoadFilter,
) -> Result<Vec<Event>> {
    let path = path.as_ref();
    let mut reader = csv::Reader::from_path(path)
        .map_err(|e| CortexError::Loader(format!("{}: {e}", path.display())))?;

    let mut rows: Vec<CsvRow> = Vec::new();
    for record in reader.deserialize::<CsvRow>() {
        match record {
            Ok(row) => rows.push(row),
            Err(e) => return Err(CortexError::Loader(format!("{}: {e}", path.display()))),
        }
    }
    let total = rows.len();
    info!(rows = total, path = %path.display(), "csv loaded");

    if !filter.is_empty() {
        rows.retain(|r| filter.matches(r));
        if rows.len() != total {
            info!(
                before = total,
                after = rows.len(),
                conv = filter.conversation_id.as_deref().unwrap_or("*"),
                "csv filter applied"
            );
        }
    }

    if sorted_by_rank {
        // Precompute (rank, epoch) once per row — the sort key must not
        // drift between comparisons.
        let mut keyed: Vec<(f64, i64, CsvRow)> = rows
            .into_iter()
            .map(|r| {
                let rank = rank_score(&r, now);
                let epoch = parse_rfc3339_utc(&r.timestamp)
                    .map(|t| t.timestamp())
                    .unwrap_or(0);
                (rank, epoch, r)
            })
            .collect();
        keyed.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(Ordering::Equal)
                .then_with(|| b.1.cmp(&a.1))
                .then_with(|| a.2.event_id.cmp(&b.2.event_id))
        });
        rows = keyed.into_iter().map(|(_, _, r)| r).collect();
    }

    Ok(rows.iter().map(map_row_to_event).collect())
}

/// Map one CSV row to an [`Event`]. `event_data` merges `fact_attributes`
/// (base) with `parameters` (override), then carries the useful row context
/// plus `_`-prefixed CSV provenance fields.
pub fn map_row_to_event(row: &CsvRow) -> Event {
    let parameters = parse_json_object(&row.parameters);
    let fact_attributes = parse_json_object(&row.fact_attributes);
    let confidence_breakdown = parse_json_object(&row.confidence_breakdown);
    let derived_from = parse_json_list_lenient(&row.derived_from);

    let mut event_data = serde_json::Map::new();
    event_data.extend(fact_attributes);
    event_data.extend(parameters);

    for (key, val) in [
        ("fact_type", &row.fact_type),
        ("category", &row.category),
        ("scenario_type", &row.scenario_type),
        ("entity_ids", &row.entity_ids),
        ("raw_text", &row.raw_text),
        ("stale_at", &row.stale_at),
        ("expires_at", &row.expires_at),
    ] {
        if !val.is_empty() {
            event_data.insert(key.to_string(), serde_json::Value::String(val.clone()));
        }
    }
    if !derived_from.is_empty() {
        event_data.insert(
            "derived_from".to_string(),
            serde_json::Value::Array(derived_from),
        );
    }
    if !confidence_breakdown.is_empty() {
        event_data.insert(
            "confidence_breakdown".to_string(),
            serde_json::Value::Object(confidence_breakdown),
        );
    }

    event_data.insert("_csv_source".to_string(), serde_json::Value::Bool(true));
    for (key, val) in [
        ("_source_type", &row.source_type),
        ("_source_reliability", &row.source_reliability),
        ("_confidence_overall", &row.confidence_overall),
    ] {
        if !val.is_empty() {
            event_data.insert(key.to_string(), serde_json::Value::String(val.clone()));
        }
    }

    Event {
        id: row.event_id.clone(),
        conversation_id: row.conversation_id.clone(),
        event_type: EventType::from(row.action.as_str()),
        created_at: row.timestamp.clone(),
        event_data,
    }
}

fn parse_json_object(value: &str) -> serde_json::Map<String, serde_json::Value> {
    if value.trim().is_empty() {
        return serde_json::Map::new();
    }
    match serde_json::from_str::<serde_json::Value>(value) {
        Ok(serde_json::Value::Object(map)) => map,
        _ => serde_json::Map::new(),
    }
}

/// Parse a JSON list cell. Some upstream writers emit single-quoted list
/// literals (`['uuid-1', 'uuid-2']`); retry with quotes normalised before
/// giving up.
fn parse_json_list_lenient(value: &str) -> Vec<serde_json::Value> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    if let Ok(serde_json::Value::Array(items)) = serde_json::from_str::<serde_json::Value>(trimmed)
    {
        return items;
    }
    if trimmed.starts_with('[') && trimmed.contains('\'') && !trimmed.contains('"') {
        let normalised = trimmed.replace('\'', "\"");
        if let Ok(serde_json::Value::Array(items)) =
            serde_json::from_str::<serde_json::Value>(&normalised)
        {
            return items;
        }
    }
    Vec::new()
}

/// Config gates evaluated by [`maybe_load_csv_events`].
#[derive(Debug, Clone, Copy, Default)]
pub struct LoadGates {
    pub small_model_mode: bool,
}

static JIT_DISABLED_WARNED: Once = Once::new();

/// Config-gated convenience wrapper around [`load_csv_events`].
///
/// Gate order: csv_enable → mode!=off → small-only → JIT trigger. A JIT-only
/// load without a valid trigger performs no file I/O at all. Returns an empty
/// list on any gate failure or loader error — callers treat the CSV as a
/// best-effort supplementary source.
pub fn maybe_load_csv_events(
    cfg: &CortexConfig,
    gates: LoadGates,
    trigger: Option<JitTrigger>,
    conversation_id: Option<&str>,
    actions: Option<Vec<String>>,
    telemetry: Option<&dyn JitTelemetry>,
) -> Vec<Event> {
    if !cfg.typedstate.csv_enable {
        return Vec::new();
    }
    if cfg.typedstate.mode == "off" {
        return Vec::new();
    }
    if cfg.typedstate.enable_small_only && !gates.small_model_mode {
        return Vec::new();
    }
    if cfg.typedstate.csv_jit_only && trigger.is_none() {
        info!("jit_only set and no trigger — skipping csv load");
        return Vec::new();
    }
    if !cfg.typedstate.csv_jit_only && trigger.is_none() {
        JIT_DISABLED_WARNED.call_once(|| {
            warn!(
                "csv loaded without a jit trigger; set TYPEDSTATE_CSV_JIT_ONLY=true \
                 to restrict csv reads to explicit triggers"
            );
        });
    }

    let path = Path::new(&cfg.typedstate.csv_path);
    if !path.exists() {
        warn!(path = %path.display(), "typed-state csv not found");
        return Vec::new();
    }

    let mut filter = LoadFilter {
        conversation_id: conversation_id.map(String::from),
        actions,
        ..LoadFilter::default()
    };
    if cfg.digest.filters_enable {
        if let Some(t) = trigger {
            let window_h = t.window_hours(cfg);
            filter.start = Some(Utc::now() - Duration::hours(window_h));
            info!(trigger = t.as_str(), window_h, "jit window applied");
        }
    }

    match load_csv_events(path, true, Utc::now(), &filter) {
        Ok(events) => {
            if let Some(sink) = telemetry {
                sink.record_jit(trigger.map(|t| t.as_str()), events.len());
            }
            events
        }
        Err(e) => {
            warn!(error = %e, "csv load failed");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const HEADER: &str = "event_id,conversation_id,timestamp,source_type,source_reliability,entity_ids,entity_match_type,action,raw_text,parameters,fact_type,fact_attributes,confidence_overall,confidence_breakdown,scenario_type,category,derived_from,stale_at,expires_at";

    fn write_csv(lines: &[&str]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{HEADER}").unwrap();
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
        file
    }

    #[test]
    fn maps_columns_without_renaming() {
        let file = write_csv(&[
            r#"ev-1,conv-A,2026-02-20T10:00:00Z,system,1.0,,exact,user_message,hello,"{""k"":""v""}",FACT,"{""base"":1}",high,{},chat,knowledge,[],,"#,
        ]);
        let events =
            load_csv_events(file.path(), false, Utc::now(), &LoadFilter::default()).unwrap();
        assert_eq!(events.len(), 1);
        let ev = &events[0];
        assert_eq!(ev.id, "ev-1");
        assert_eq!(ev.conversation_id, "conv-A");
        assert_eq!(ev.created_at, "2026-02-20T10:00:00Z");
        assert_eq!(ev.event_type, EventType::UserMessage);
        // parameters override fact_attributes, both merged into event_data
        assert_eq!(ev.event_data["k"], "v");
        assert_eq!(ev.event_data["base"], 1);
        assert_eq!(ev.event_data["_csv_source"], true);
    }

    #[test]
    fn parameters_override_fact_attributes() {
        let file = write_csv(&[
            r#"ev-1,c,2026-02-20T10:00:00Z,system,1.0,,,note,,"{""x"":2}",,"{""x"":1}",high,,,knowledge,,,"#,
        ]);
        let events =
            load_csv_events(file.path(), false, Utc::now(), &LoadFilter::default()).unwrap();
        assert_eq!(events[0].event_data["x"], 2);
    }

    #[test]
    fn derived_from_accepts_single_quoted_lists() {
        let file = write_csv(&[
            r#"ev-1,c,2026-02-20T10:00:00Z,system,1.0,,,note,,,,,high,,,knowledge,"['a-1', 'b-2']",,"#,
        ]);
        let events =
            load_csv_events(file.path(), false, Utc::now(), &LoadFilter::default()).unwrap();
        let derived = events[0].event_data["derived_from"].as_array().unwrap();
        assert_eq!(derived.len(), 2);
        assert_eq!(derived[0], "a-1");
    }

    #[test]
    fn sort_is_deterministic() {
        let now = Utc::now();
        let file = write_csv(&[
            r#"ev-b,c,2026-02-20T10:00:00Z,system,1.0,,,note,,,,,high,,,knowledge,,,"#,
            r#"ev-a,c,2026-02-20T10:00:00Z,system,1.0,,,note,,,,,high,,,knowledge,,,"#,
            r#"ev-c,c,2026-02-21T10:00:00Z,system,1.0,,,note,,,,,high,,,knowledge,,,"#,
        ]);
        let first = load_csv_events(file.path(), true, now, &LoadFilter::default()).unwrap();
        let second = load_csv_events(file.path(), true, now, &LoadFilter::default()).unwrap();
        let order: Vec<&str> = first.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(
            order,
            second.iter().map(|e| e.id.as_str()).collect::<Vec<_>>()
        );
        // newer timestamp wins at equal rank components except recency;
        // equal-timestamp rows tie-break by id ascending.
        assert_eq!(order[0], "ev-c");
        assert_eq!(&order[1..], ["ev-a", "ev-b"]);
    }

    #[test]
    fn filters_by_conversation_and_window() {
        let file = write_csv(&[
            r#"ev-1,conv-A,2026-02-20T10:00:00Z,system,1.0,,,note,,,,,high,,,knowledge,,,"#,
            r#"ev-2,conv-B,2026-02-20T10:00:00Z,system,1.0,,,note,,,,,high,,,knowledge,,,"#,
            r#"ev-3,conv-A,2026-02-01T10:00:00Z,system,1.0,,,note,,,,,high,,,knowledge,,,"#,
        ]);
        let filter = LoadFilter {
            conversation_id: Some("conv-A".into()),
            start: parse_rfc3339_utc("2026-02-10T00:00:00Z"),
            ..LoadFilter::default()
        };
        let events = load_csv_events(file.path(), false, Utc::now(), &filter).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, "ev-1");
    }

    #[test]
    fn jit_only_without_trigger_performs_no_io() {
        let mut cfg = CortexConfig::default();
        cfg.typedstate.csv_enable = true;
        cfg.typedstate.csv_jit_only = true;
        // Deliberately point at a path that would error if opened.
        cfg.typedstate.csv_path = "/definitely/not/here.csv".into();

        let events = maybe_load_csv_events(&cfg, LoadGates::default(), None, None, None, None);
        assert!(events.is_empty());
    }

    #[test]
    fn jit_trigger_parses_contract_values() {
        assert_eq!(
            JitTrigger::parse("time_reference"),
            Some(JitTrigger::TimeReference)
        );
        assert_eq!(JitTrigger::parse("remember"), Some(JitTrigger::Remember));
        assert_eq!(
            JitTrigger::parse("fact_recall"),
            Some(JitTrigger::FactRecall)
        );
        assert_eq!(JitTrigger::parse("smalltalk"), None);
    }

    #[test]
    fn telemetry_records_trigger_and_rows() {
        use std::sync::Mutex;

        struct Sink(Mutex<Vec<(Option<String>, usize)>>);
        impl JitTelemetry for Sink {
            fn record_jit(&self, trigger: Option<&str>, rows: usize) {
                self.0
                    .lock()
                    .unwrap()
                    .push((trigger.map(String::from), rows));
            }
        }

        let file = write_csv(&[
            r#"ev-1,c,2026-02-20T10:00:00Z,system,1.0,,,note,,,,,high,,,knowledge,,,"#,
        ]);
        let mut cfg = CortexConfig::default();
        cfg.typedstate.csv_enable = true;
        cfg.typedstate.csv_jit_only = true;
        cfg.typedstate.csv_path = file.path().to_string_lossy().into_owned();

        let sink = Sink(Mutex::new(Vec::new()));
        let events = maybe_load_csv_events(
            &cfg,
            LoadGates::default(),
            Some(JitTrigger::Remember),
            None,
            None,
            Some(&sink),
        );
        assert_eq!(events.len(), 1);
        let recorded = sink.0.lock().unwrap();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0], (Some("remember".to_string()), 1));
    }
}
