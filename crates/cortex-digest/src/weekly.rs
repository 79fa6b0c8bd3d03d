//! Weekly digest + archive pipeline.
//!
//! Weekly: groups `daily_digest` store rows by (conversation, ISO week),
//! folds each group into a compact context and persists one `weekly_digest`
//! row, keyed deterministically on the sorted daily keys.
//!
//! Archive: weekly rows older than 14 days become `archive_digest` index
//! rows. The archive is optionally mirrored to the memory graph through the
//! MCP hub — fail-open, the store row is the truth. Mirror metadata MUST
//! carry the same archive key as the store row.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use chrono_tz::Tz;
use serde_json::json;
use tracing::{info, warn};

use cortex_core::config::DigestConfig;
use cortex_core::types::{parse_rfc3339_utc, Event, EventType};
use cortex_events::{build_compact_context, format_compact_context, SectionCaps};

use crate::keys::{
    iso_week_bounds, iso_week_label, make_archive_digest_key, make_archive_digest_key_v2,
    make_weekly_digest_key, make_weekly_digest_key_v2, KeyVersion,
};
use crate::store::{DigestRow, DigestStore};

/// Weekly digests older than this many days are archived.
const ARCHIVE_AFTER_DAYS: i64 = 14;

/// Structured result of a weekly or archive cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleSummary {
    pub written: u64,
    pub skipped: u64,
    pub reason: Option<String>,
}

/// Best-effort sink for archive index nodes. Implemented by the MCP hub;
/// tests substitute their own.
#[async_trait]
pub trait GraphMirror: Send + Sync {
    /// Returns the created graph node id, or `None` on any failure.
    async fn save_archive_node(
        &self,
        conversation_id: &str,
        content: &str,
        metadata: serde_json::Value,
    ) -> Option<String>;
}

#[async_trait]
impl GraphMirror for cortex_mcp::McpHub {
    async fn save_archive_node(
        &self,
        conversation_id: &str,
        content: &str,
        metadata: serde_json::Value,
    ) -> Option<String> {
        let result = self
            .call_tool(
                "memory_save",
                json!({
                    "conversation_id": conversation_id,
                    "content": content,
                    "metadata": metadata,
                }),
            )
            .await
            .ok()?;
        let node_id = result
            .get("node_id")
            .or_else(|| result.get("id"))
            .and_then(|v| v.as_str())
            .map(String::from)?;
        (!node_id.is_empty()).then_some(node_id)
    }
}

pub struct WeeklyDigestArchiver {
    config: DigestConfig,
    store: DigestStore,
}

impl WeeklyDigestArchiver {
    pub fn new(config: DigestConfig, store: DigestStore) -> Self {
        Self { config, store }
    }

    fn tz(&self) -> Tz {
        self.config.tz.parse().unwrap_or(chrono_tz::UTC)
    }

    fn key_version(&self) -> KeyVersion {
        KeyVersion::parse(&self.config.key_version)
    }

    /// Build weekly digests for every ISO week with available dailies.
    pub fn run_weekly(&self, conversation_ids: Option<&[String]>) -> CycleSummary {
        if !(self.config.enable && self.config.weekly_enable) {
            info!("weekly digest disabled — skipped");
            return CycleSummary {
                reason: Some("WEEKLY_DISABLED".to_string()),
                ..CycleSummary::default()
            };
        }

        let daily_rows = self.store.list_by_action("daily_digest");
        let grouped = self.group_by_conv_week(&daily_rows);

        let mut summary = CycleSummary::default();
        for ((conv_id, iso_week), rows) in grouped {
            if let Some(filter) = conversation_ids {
                if !filter.iter().any(|c| c == &conv_id) {
                    continue;
                }
            }
            if self.build_weekly(&conv_id, &iso_week, &rows) {
                summary.written += 1;
            } else {
                summary.skipped += 1;
            }
        }
        summary
    }

    /// Archive weekly rows older than the threshold, mirroring each to the
    /// graph through `mirror` when provided.
    pub async fn run_archive(
        &self,
        conversation_ids: Option<&[String]>,
        mirror: Option<&dyn GraphMirror>,
    ) -> CycleSummary {
        if !(self.config.enable && self.config.archive_enable) {
            info!("archive digest disabled — skipped");
            return CycleSummary {
                reason: Some("ARCHIVE_DISABLED".to_string()),
                ..CycleSummary::default()
            };
        }

        let weekly_rows = self.store.list_by_action("weekly_digest");
        let now = Utc::now();
        let threshold = now - chrono::Duration::days(ARCHIVE_AFTER_DAYS);

        let mut summary = CycleSummary::default();
        for row in weekly_rows {
            let conv_id = row.get("conversation_id").cloned().unwrap_or_default();
            if let Some(filter) = conversation_ids {
                if !filter.iter().any(|c| c == &conv_id) {
                    continue;
                }
            }
            let ts = row
                .get("timestamp")
                .and_then(|t| parse_rfc3339_utc(t));
            match ts {
                Some(ts) if ts <= threshold => {
                    if self
                        .build_archive(&conv_id, &row, now.date_naive(), mirror)
                        .await
                    {
                        summary.written += 1;
                    } else {
                        summary.skipped += 1;
                    }
                }
                _ => {
                    // Not old enough yet (or undated).
                    summary.skipped += 1;
                }
            }
        }
        summary
    }

    // ── weekly builder ──────────────────────────────────────────────────────

    fn build_weekly(&self, conversation_id: &str, iso_week: &str, rows: &[DigestRow]) -> bool {
        let daily_keys: Vec<String> = rows
            .iter()
            .filter_map(|row| {
                let params: serde_json::Value =
                    serde_json::from_str(row.get("parameters")?).ok()?;
                params
                    .get("digest_key")
                    .and_then(|k| k.as_str())
                    .filter(|k| !k.is_empty())
                    .map(String::from)
            })
            .collect();

        if daily_keys.is_empty() {
            info!(
                week = iso_week,
                conv = conversation_id,
                status = "skip",
                reason = "no_daily_keys",
                "weekly digest"
            );
            return false;
        }

        let min_daily = self.config.min_daily_per_week;
        if min_daily > 0 && daily_keys.len() < min_daily {
            info!(
                week = iso_week,
                conv = conversation_id,
                status = "skip",
                reason = "insufficient_input",
                daily_keys = daily_keys.len(),
                min = min_daily,
                "weekly digest"
            );
            return false;
        }

        let key_version = self.key_version();
        let (weekly_key, window) = match key_version {
            KeyVersion::V2 => {
                let Some(key) = make_weekly_digest_key_v2(conversation_id, iso_week, &daily_keys)
                else {
                    warn!(week = iso_week, "malformed iso week label");
                    return false;
                };
                (key, iso_week_bounds(iso_week))
            }
            KeyVersion::V1 => (
                make_weekly_digest_key(conversation_id, iso_week, &daily_keys),
                None,
            ),
        };

        if self.store.exists("weekly_digest", &weekly_key) {
            info!(
                week = iso_week,
                conv = conversation_id,
                status = "skip",
                reason = "already_exists",
                key = %weekly_key,
                "weekly digest"
            );
            return false;
        }

        // Treat the grouped daily rows as pseudo-events for the compact
        // builder — the week summarises digests, not raw events.
        let digest_events = daily_rows_to_events(rows);
        let ctx = build_compact_context(&digest_events, SectionCaps::default());
        let compact_text = format_compact_context(&ctx);

        let window_ref = window
            .as_ref()
            .map(|(start, end)| (start.as_str(), end.as_str()));
        let ok = self.store.write_weekly(
            &uuid::Uuid::new_v4().to_string(),
            conversation_id,
            &weekly_key,
            iso_week,
            &daily_keys,
            &compact_text,
            window_ref,
        );
        info!(
            week = iso_week,
            conv = conversation_id,
            status = if ok { "ok" } else { "error" },
            daily_count = daily_keys.len(),
            key = %weekly_key,
            "weekly digest"
        );
        ok
    }

    // ── archive builder ─────────────────────────────────────────────────────

    async fn build_archive(
        &self,
        conversation_id: &str,
        weekly_row: &DigestRow,
        archive_date: NaiveDate,
        mirror: Option<&dyn GraphMirror>,
    ) -> bool {
        let weekly_key = weekly_row
            .get("parameters")
            .and_then(|p| serde_json::from_str::<serde_json::Value>(p).ok())
            .and_then(|v| v.get("digest_key").and_then(|k| k.as_str().map(String::from)))
            .unwrap_or_default();
        if weekly_key.is_empty() {
            return false;
        }

        let archive_date_str = archive_date.format("%Y-%m-%d").to_string();
        let archive_key = match self.key_version() {
            KeyVersion::V2 => {
                make_archive_digest_key_v2(conversation_id, &weekly_key, &archive_date_str)
            }
            KeyVersion::V1 => {
                make_archive_digest_key(conversation_id, &weekly_key, &archive_date_str)
            }
        };

        if self.store.exists("archive_digest", &archive_key) {
            info!(
                date = %archive_date_str,
                conv = conversation_id,
                status = "skip",
                reason = "already_exists",
                key = %archive_key,
                "archive digest"
            );
            return false;
        }

        // Fail-open mirror to the graph. The metadata archive_key matches
        // the store row key so both sides stay joinable.
        let graph_node_id = match mirror {
            Some(m) => {
                let content = format!(
                    "[archive_digest] conv={conversation_id} weekly_key={weekly_key} date={archive_date_str}"
                );
                m.save_archive_node(
                    conversation_id,
                    &content,
                    json!({
                        "type": "archive_digest",
                        "weekly_digest_key": weekly_key,
                        "archived_at": archive_date_str,
                        "archive_key": archive_key,
                    }),
                )
                .await
                .unwrap_or_default()
            }
            None => String::new(),
        };

        let ok = self.store.write_archive(
            &uuid::Uuid::new_v4().to_string(),
            conversation_id,
            &archive_key,
            &weekly_key,
            &archive_date_str,
            &graph_node_id,
        );
        info!(
            date = %archive_date_str,
            conv = conversation_id,
            status = if ok { "ok" } else { "error" },
            key = %archive_key,
            graph_node = if graph_node_id.is_empty() { "none" } else { graph_node_id.as_str() },
            "archive digest"
        );
        ok
    }

    // ── grouping helpers ────────────────────────────────────────────────────

    /// Group daily rows by (conversation_id, ISO week of the row timestamp
    /// in the digest timezone). BTreeMap keeps iteration deterministic.
    fn group_by_conv_week(
        &self,
        rows: &[DigestRow],
    ) -> BTreeMap<(String, String), Vec<DigestRow>> {
        let tz = self.tz();
        let mut grouped: BTreeMap<(String, String), Vec<DigestRow>> = BTreeMap::new();
        for row in rows {
            let conv_id = row.get("conversation_id").cloned().unwrap_or_default();
            let Some(ts) = row.get("timestamp").and_then(|t| parse_rfc3339_utc(t)) else {
                continue;
            };
            let local_date = ts.with_timezone(&tz).date_naive();
            let iso_week = iso_week_label(local_date);
            grouped
                .entry((conv_id, iso_week))
                .or_default()
                .push(row.clone());
        }
        grouped
    }
}

/// Convert daily_digest store rows to workspace-event-compatible events so
/// the compact builder can process them.
fn daily_rows_to_events(rows: &[DigestRow]) -> Vec<Event> {
    rows.iter()
        .map(|row| {
            let fa: serde_json::Value = row
                .get("fact_attributes")
                .and_then(|s| serde_json::from_str(s).ok())
                .unwrap_or(serde_json::Value::Null);
            let mut event_data = serde_json::Map::new();
            event_data.insert(
                "digest_date".to_string(),
                fa.get("digest_date").cloned().unwrap_or(json!("")),
            );
            event_data.insert(
                "event_count".to_string(),
                fa.get("event_count").cloned().unwrap_or(json!(0)),
            );
            event_data.insert(
                "digest_key".to_string(),
                fa.get("digest_key").cloned().unwrap_or(json!("")),
            );
            Event {
                id: row.get("event_id").cloned().unwrap_or_default(),
                conversation_id: row.get("conversation_id").cloned().unwrap_or_default(),
                event_type: EventType::DailyDigest,
                created_at: row.get("timestamp").cloned().unwrap_or_default(),
                event_data,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enabled_config() -> DigestConfig {
        DigestConfig {
            enable: true,
            weekly_enable: true,
            archive_enable: true,
            tz: "UTC".into(),
            ..DigestConfig::default()
        }
    }

    fn archiver(config: DigestConfig) -> (tempfile::TempDir, WeeklyDigestArchiver) {
        let dir = tempfile::tempdir().unwrap();
        let store = DigestStore::new(dir.path().join("digest_store.csv"));
        (dir, WeeklyDigestArchiver::new(config, store))
    }

    fn seed_daily(store: &DigestStore, conv: &str, key: &str, date: &str) {
        assert!(store.write_daily(
            &format!("ev-{key}"),
            conv,
            key,
            date,
            3,
            "hash",
            "NOW:\n  - x\n",
            None,
        ));
    }

    #[test]
    fn weekly_groups_dailies_and_writes_once() {
        let (_dir, arch) = archiver(enabled_config());
        seed_daily(&arch.store, "conv-A", "dk-1", "2026-02-16");
        seed_daily(&arch.store, "conv-A", "dk-2", "2026-02-17");

        let first = arch.run_weekly(None);
        assert_eq!(first.written, 1);
        let rows = arch.store.list_by_action("weekly_digest");
        assert_eq!(rows.len(), 1);
        let params: serde_json::Value = serde_json::from_str(&rows[0]["parameters"]).unwrap();
        let keys = params["input_digest_keys"].as_array().unwrap();
        assert_eq!(keys.len(), 2);

        // Re-run: deterministic key → skip, nothing new.
        let second = arch.run_weekly(None);
        assert_eq!(second.written, 0);
        assert!(second.skipped >= 1);
        assert_eq!(arch.store.list_by_action("weekly_digest").len(), 1);
    }

    #[test]
    fn weekly_quality_gate_blocks_thin_weeks() {
        let mut cfg = enabled_config();
        cfg.min_daily_per_week = 3;
        let (_dir, arch) = archiver(cfg);
        seed_daily(&arch.store, "conv-A", "dk-1", "2026-02-16");

        let summary = arch.run_weekly(None);
        assert_eq!(summary.written, 0);
        assert!(arch.store.list_by_action("weekly_digest").is_empty());
    }

    #[test]
    fn weekly_disabled_reports_reason() {
        let (_dir, arch) = archiver(DigestConfig::default());
        let summary = arch.run_weekly(None);
        assert_eq!(summary.reason.as_deref(), Some("WEEKLY_DISABLED"));
    }

    struct RecordingMirror(std::sync::Mutex<Vec<serde_json::Value>>);

    #[async_trait]
    impl GraphMirror for RecordingMirror {
        async fn save_archive_node(
            &self,
            _conversation_id: &str,
            _content: &str,
            metadata: serde_json::Value,
        ) -> Option<String> {
            self.0.lock().unwrap().push(metadata);
            Some("node-1".to_string())
        }
    }

    struct FailingMirror;

    #[async_trait]
    impl GraphMirror for FailingMirror {
        async fn save_archive_node(
            &self,
            _conversation_id: &str,
            _content: &str,
            _metadata: serde_json::Value,
        ) -> Option<String> {
            None
        }
    }

    /// Seed a weekly row whose timestamp is old enough to archive. The store
    /// always stamps "now", so rewrite the timestamp cell in place.
    fn seed_old_weekly(store: &DigestStore, conv: &str, weekly_key: &str) {
        assert!(store.write_weekly(
            "ev-w",
            conv,
            weekly_key,
            "2026-W08",
            &["dk-1".to_string()],
            "",
            None,
        ));
        let written_ts = store.list_by_action("weekly_digest")[0]["timestamp"].clone();
        let old_ts = (Utc::now() - chrono::Duration::days(20))
            .to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
        let contents = std::fs::read_to_string(store.path()).unwrap();
        std::fs::write(store.path(), contents.replace(&written_ts, &old_ts)).unwrap();
    }

    #[tokio::test]
    async fn archive_mirror_metadata_carries_store_key() {
        let (_dir, arch) = archiver(enabled_config());
        seed_old_weekly(&arch.store, "conv-A", "wk-1");

        let mirror = RecordingMirror(std::sync::Mutex::new(Vec::new()));
        let summary = arch.run_archive(None, Some(&mirror)).await;
        assert_eq!(summary.written, 1);

        let rows = arch.store.list_by_action("archive_digest");
        assert_eq!(rows.len(), 1);
        let params: serde_json::Value = serde_json::from_str(&rows[0]["parameters"]).unwrap();
        let store_key = params["digest_key"].as_str().unwrap();

        let recorded = mirror.0.lock().unwrap();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0]["archive_key"].as_str().unwrap(), store_key);
        assert_eq!(recorded[0]["weekly_digest_key"], "wk-1");

        let fa: serde_json::Value = serde_json::from_str(&rows[0]["fact_attributes"]).unwrap();
        assert_eq!(fa["archive_graph_node_id"], "node-1");
    }

    #[tokio::test]
    async fn archive_survives_mirror_failure() {
        let (_dir, arch) = archiver(enabled_config());
        seed_old_weekly(&arch.store, "conv-A", "wk-1");

        let summary = arch.run_archive(None, Some(&FailingMirror)).await;
        assert_eq!(summary.written, 1, "store write is the truth — mirror failure must not block");
        let rows = arch.store.list_by_action("archive_digest");
        let fa: serde_json::Value = serde_json::from_str(&rows[0]["fact_attributes"]).unwrap();
        assert_eq!(fa["archive_graph_node_id"], "");
    }

    #[tokio::test]
    async fn fresh_weekly_rows_are_not_archived() {
        let (_dir, arch) = archiver(enabled_config());
        assert!(arch.store.write_weekly(
            "ev-w",
            "conv-A",
            "wk-fresh",
            "2026-W30",
            &["dk".to_string()],
            "",
            None,
        ));
        let summary = arch.run_archive(None, None).await;
        assert_eq!(summary.written, 0);
        assert_eq!(summary.skipped, 1);
    }
}
