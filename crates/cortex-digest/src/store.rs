//! DigestStore: idempotent read/append for digest records.
//!
//! The store is a CSV file holding daily_digest, weekly_digest and
//! archive_digest rows in the same column schema as the typed-state event
//! CSV, so every row is loadable by the event loader unchanged.
//!
//! Re-run detection scans the file for `(action, parameters.digest_key)` —
//! O(n) over at most a few hundred rows per deployment lifetime. The store
//! performs no internal deduplication; callers MUST check `exists()` before
//! writing.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::json;
use tracing::{info, warn};

use cortex_core::types::now_rfc3339;

/// Column order of the store file. Must match the typed-state CSV exactly.
pub const CSV_COLUMNS: [&str; 19] = [
    "event_id",
    "conversation_id",
    "timestamp",
    "source_type",
    "source_reliability",
    "entity_ids",
    "entity_match_type",
    "action",
    "raw_text",
    "parameters",
    "fact_type",
    "fact_attributes",
    "confidence_overall",
    "confidence_breakdown",
    "scenario_type",
    "category",
    "derived_from",
    "stale_at",
    "expires_at",
];

/// One store row, column name → cell value.
pub type DigestRow = BTreeMap<String, String>;

pub struct DigestStore {
    path: PathBuf,
}

impl DigestStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True if a row with the given action AND digest_key already exists.
    /// The key is matched against `parameters.digest_key`.
    pub fn exists(&self, action: &str, digest_key: &str) -> bool {
        self.read_rows().iter().any(|row| {
            row.get("action").map(String::as_str) == Some(action)
                && row
                    .get("parameters")
                    .and_then(|p| serde_json::from_str::<serde_json::Value>(p).ok())
                    .and_then(|v| v.get("digest_key").and_then(|k| k.as_str().map(String::from)))
                    .as_deref()
                    == Some(digest_key)
        })
    }

    /// All rows matching the given action type, in file order.
    pub fn list_by_action(&self, action: &str) -> Vec<DigestRow> {
        self.read_rows()
            .into_iter()
            .filter(|row| row.get("action").map(String::as_str) == Some(action))
            .collect()
    }

    /// Write a daily_digest record. Returns false (and logs) on failure.
    #[allow(clippy::too_many_arguments)]
    pub fn write_daily(
        &self,
        event_id: &str,
        conversation_id: &str,
        digest_key: &str,
        digest_date: &str,
        event_count: usize,
        source_hash: &str,
        compact_text: &str,
        window: Option<(&str, &str)>,
    ) -> bool {
        let mut params = json!({
            "digest_key": digest_key,
            "digest_date": digest_date,
            "source_hash": source_hash,
        });
        let mut fa = json!({
            "digest_date": digest_date,
            "event_count": event_count,
            "digest_key": digest_key,
        });
        if let Some((start, end)) = window {
            for value in [&mut params, &mut fa] {
                value["window_start"] = json!(start);
                value["window_end"] = json!(end);
            }
        }
        let row = self.base_row(
            event_id,
            conversation_id,
            "daily_digest",
            "DAILY_DIGEST",
            &params,
            &fa,
            compact_text,
        );
        let ok = self.append_row(&row);
        if ok {
            info!(
                date = digest_date,
                conv = conversation_id,
                key = digest_key,
                "daily digest written"
            );
        }
        ok
    }

    /// Write a weekly_digest record.
    #[allow(clippy::too_many_arguments)]
    pub fn write_weekly(
        &self,
        event_id: &str,
        conversation_id: &str,
        digest_key: &str,
        iso_week: &str,
        daily_digest_keys: &[String],
        compact_text: &str,
        window: Option<(&str, &str)>,
    ) -> bool {
        let mut sorted_keys = daily_digest_keys.to_vec();
        sorted_keys.sort_unstable();
        let mut params = json!({
            "digest_key": digest_key,
            "iso_week": iso_week,
            "input_digest_keys": sorted_keys,
        });
        let mut fa = json!({
            "iso_week": iso_week,
            "daily_digest_count": daily_digest_keys.len(),
            "digest_key": digest_key,
        });
        if let Some((start, end)) = window {
            for value in [&mut params, &mut fa] {
                value["window_start"] = json!(start);
                value["window_end"] = json!(end);
            }
        }
        let row = self.base_row(
            event_id,
            conversation_id,
            "weekly_digest",
            "WEEKLY_DIGEST",
            &params,
            &fa,
            compact_text,
        );
        let ok = self.append_row(&row);
        if ok {
            info!(
                week = iso_week,
                conv = conversation_id,
                key = digest_key,
                "weekly digest written"
            );
        }
        ok
    }

    /// Write an archive_digest record.
    pub fn write_archive(
        &self,
        event_id: &str,
        conversation_id: &str,
        archive_key: &str,
        weekly_digest_key: &str,
        archive_date: &str,
        archive_graph_node_id: &str,
    ) -> bool {
        let params = json!({
            "digest_key": archive_key,
            "archive_key": archive_key,
            "weekly_digest_key": weekly_digest_key,
            "archive_date": archive_date,
        });
        let fa = json!({
            "archived_at": archive_date,
            "archive_key": archive_key,
            "archive_graph_node_id": archive_graph_node_id,
            "input_digest_keys": [weekly_digest_key],
        });
        let row = self.base_row(
            event_id,
            conversation_id,
            "archive_digest",
            "ARCHIVE_DIGEST",
            &params,
            &fa,
            "",
        );
        let ok = self.append_row(&row);
        if ok {
            info!(
                date = archive_date,
                conv = conversation_id,
                key = archive_key,
                "archive digest written"
            );
        }
        ok
    }

    // ── internals ───────────────────────────────────────────────────────────

    fn read_rows(&self) -> Vec<DigestRow> {
        if !self.path.exists() {
            return Vec::new();
        }
        let mut reader = match csv::Reader::from_path(&self.path) {
            Ok(r) => r,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to open digest store");
                return Vec::new();
            }
        };
        let headers = match reader.headers() {
            Ok(h) => h.clone(),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to read store header");
                return Vec::new();
            }
        };
        let mut rows = Vec::new();
        for record in reader.records() {
            match record {
                Ok(rec) => {
                    let row: DigestRow = headers
                        .iter()
                        .zip(rec.iter())
                        .map(|(h, v)| (h.to_string(), v.to_string()))
                        .collect();
                    rows.push(row);
                }
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "skipping malformed store row");
                }
            }
        }
        rows
    }

    #[allow(clippy::too_many_arguments)]
    fn base_row(
        &self,
        event_id: &str,
        conversation_id: &str,
        action: &str,
        fact_type: &str,
        parameters: &serde_json::Value,
        fact_attributes: &serde_json::Value,
        raw_text: &str,
    ) -> DigestRow {
        let mut row = DigestRow::new();
        row.insert("event_id".into(), event_id.to_string());
        row.insert("conversation_id".into(), conversation_id.to_string());
        row.insert("timestamp".into(), now_rfc3339());
        row.insert("source_type".into(), "system".into());
        row.insert("source_reliability".into(), "1.0".into());
        row.insert("entity_ids".into(), String::new());
        row.insert("entity_match_type".into(), "exact".into());
        row.insert("action".into(), action.to_string());
        row.insert("raw_text".into(), clamp_chars(raw_text, 500));
        row.insert("parameters".into(), parameters.to_string());
        row.insert("fact_type".into(), fact_type.to_string());
        row.insert("fact_attributes".into(), fact_attributes.to_string());
        row.insert("confidence_overall".into(), "high".into());
        row.insert("confidence_breakdown".into(), "{}".into());
        row.insert("scenario_type".into(), "digest".into());
        row.insert("category".into(), "knowledge".into());
        row.insert("derived_from".into(), "[]".into());
        row.insert("stale_at".into(), String::new());
        row.insert("expires_at".into(), String::new());
        row
    }

    /// Append one row, creating the file with header if missing.
    fn append_row(&self, row: &DigestRow) -> bool {
        let write = || -> std::io::Result<()> {
            if let Some(parent) = self.path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            let file_exists = self.path.exists();
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
            let mut writer = csv::WriterBuilder::new()
                .has_headers(false)
                .from_writer(file);
            if !file_exists {
                writer.write_record(CSV_COLUMNS)?;
            }
            let record: Vec<&str> = CSV_COLUMNS
                .iter()
                .map(|col| row.get(*col).map(String::as_str).unwrap_or(""))
                .collect();
            writer.write_record(&record)?;
            writer.flush()?;
            Ok(())
        };
        match write() {
            Ok(()) => true,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to append digest row");
                false
            }
        }
    }
}

fn clamp_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}
