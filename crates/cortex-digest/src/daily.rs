//! Daily digest scheduler.
//!
//! Reads typed-state events for a target date, folds them into a compact
//! context, and persists one `daily_digest` row per (conversation, date).
//! Catch-up fills gaps from the first event date (capped by
//! `catchup_max_days`) up to yesterday; the digest key makes every re-run a
//! no-op on unchanged inputs.

use chrono::{NaiveDate, Utc};
use chrono_tz::Tz;
use tracing::{info, warn};

use cortex_core::config::DigestConfig;
use cortex_core::types::Event;
use cortex_events::{build_compact_context, format_compact_context, LoadFilter, SectionCaps};

use crate::keys::{
    make_daily_digest_key, make_daily_digest_key_v2, make_source_hash, KeyVersion,
};
use crate::store::DigestStore;

/// Result of one catch-up pass for a single conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatchUpSummary {
    pub written: u64,
    pub days_examined: u64,
    pub missed_runs: u64,
    pub recovered: Option<bool>,
    pub generated: u64,
    /// off | full | cap — whether the first-event cap was applied.
    pub mode: String,
}

impl Default for CatchUpSummary {
    fn default() -> Self {
        Self {
            written: 0,
            days_examined: 0,
            missed_runs: 0,
            recovered: None,
            generated: 0,
            mode: "off".to_string(),
        }
    }
}

/// Aggregate result of a full daily run across conversations.
#[derive(Debug, Clone, Default)]
pub struct DailyRunSummary {
    pub written: u64,
    pub input_events: u64,
    pub skipped: u64,
    pub reason: Option<String>,
    pub conversation_ids: Vec<String>,
    pub catch_up: CatchUpSummary,
}

pub struct DailyDigestScheduler {
    config: DigestConfig,
    store: DigestStore,
    csv_path: String,
}

impl DailyDigestScheduler {
    pub fn new(config: DigestConfig, store: DigestStore, csv_path: impl Into<String>) -> Self {
        Self {
            config,
            store,
            csv_path: csv_path.into(),
        }
    }

    fn tz(&self) -> Tz {
        self.config.tz.parse().unwrap_or(chrono_tz::UTC)
    }

    fn today_local(&self) -> NaiveDate {
        Utc::now().with_timezone(&self.tz()).date_naive()
    }

    fn yesterday_local(&self) -> NaiveDate {
        self.today_local() - chrono::Duration::days(1)
    }

    fn key_version(&self) -> KeyVersion {
        KeyVersion::parse(&self.config.key_version)
    }

    fn enabled(&self) -> bool {
        self.config.enable && self.config.daily_enable
    }

    /// Main entry point (called at 04:00 local or on startup). When
    /// `conversation_ids` is `None` the set is derived from the CSV.
    pub fn run(&self, conversation_ids: Option<&[String]>) -> DailyRunSummary {
        if !self.enabled() {
            info!("daily digest disabled — skipped");
            return DailyRunSummary {
                reason: Some("DAILY_DISABLED".to_string()),
                ..DailyRunSummary::default()
            };
        }

        let convs: Vec<String> = match conversation_ids {
            Some(ids) => ids.to_vec(),
            None => {
                let derived = self.derive_conversation_ids();
                info!(count = derived.len(), "conversation ids derived from csv");
                derived
            }
        };

        let mut summary = DailyRunSummary {
            conversation_ids: convs.clone(),
            ..DailyRunSummary::default()
        };
        for conv in &convs {
            let cu = self.run_catchup(conv);
            summary.written += cu.written;
            summary.catch_up.written += cu.written;
            summary.catch_up.days_examined += cu.days_examined;
            summary.catch_up.missed_runs += cu.missed_runs;
            summary.catch_up.generated += cu.generated;
            if cu.mode != "off" {
                summary.catch_up.mode = cu.mode;
            }
        }
        summary.catch_up.recovered = if summary.catch_up.missed_runs > 0 {
            Some(summary.catch_up.generated > 0)
        } else {
            None
        };
        summary
    }

    /// Fill gaps for one conversation: process every date from the (capped)
    /// first event date up to yesterday, inclusive.
    pub fn run_catchup(&self, conversation_id: &str) -> CatchUpSummary {
        let yesterday = self.yesterday_local();

        let max_days = self.config.catchup_max_days;
        if max_days == 0 {
            info!(conv = conversation_id, "catch-up skipped: max_days=0");
            return CatchUpSummary::default();
        }

        let events = self.load_events_for_conv(conversation_id);
        if events.is_empty() {
            info!(conv = conversation_id, "no events — catch-up skipped");
            return CatchUpSummary::default();
        }

        let Some(mut first_date) = self.earliest_event_date(&events) else {
            return CatchUpSummary::default();
        };

        let mut mode = "full".to_string();
        if max_days > 0 {
            let cap_start = yesterday - chrono::Duration::days(max_days - 1);
            if first_date < cap_start {
                first_date = cap_start;
                mode = "cap".to_string();
            }
        }
        if first_date > yesterday {
            // All events are from today; nothing to catch up yet.
            return CatchUpSummary::default();
        }

        let days_in_window = (yesterday - first_date).num_days() as u64 + 1;

        let mut written = 0u64;
        let mut current = first_date;
        while current <= yesterday {
            if self.run_for_date(conversation_id, current, &events) {
                written += 1;
            }
            current += chrono::Duration::days(1);
        }

        CatchUpSummary {
            written,
            days_examined: days_in_window,
            // Every day in the window needed catch-up.
            missed_runs: days_in_window,
            recovered: Some(written > 0),
            generated: written,
            mode,
        }
    }

    /// Build and persist a daily digest for (conversation, date). Returns
    /// true if a new digest was written, false when skipped (no events,
    /// below the quality gate, or already present).
    pub fn run_for_date(
        &self,
        conversation_id: &str,
        target_date: NaiveDate,
        all_events: &[Event],
    ) -> bool {
        let date_str = target_date.format("%Y-%m-%d").to_string();
        let events = self.events_for_date(all_events, conversation_id, target_date);
        if events.is_empty() {
            info!(
                date = %date_str,
                conv = conversation_id,
                status = "skip",
                reason = "no_events",
                "daily digest"
            );
            return false;
        }

        let min_events = self.config.min_events_daily;
        if min_events > 0 && events.len() < min_events {
            info!(
                date = %date_str,
                conv = conversation_id,
                status = "skip",
                reason = "insufficient_input",
                events = events.len(),
                min = min_events,
                "daily digest"
            );
            return false;
        }

        let event_ids: Vec<String> = events.iter().map(|e| e.id.clone()).collect();
        let source_hash = make_source_hash(&event_ids);
        let key_version = self.key_version();
        let digest_key = match key_version {
            KeyVersion::V2 => make_daily_digest_key_v2(conversation_id, &date_str, &source_hash),
            KeyVersion::V1 => make_daily_digest_key(conversation_id, &date_str, &source_hash),
        };

        if self.store.exists("daily_digest", &digest_key) {
            info!(
                date = %date_str,
                conv = conversation_id,
                status = "skip",
                reason = "already_exists",
                key = %digest_key,
                "daily digest"
            );
            return false;
        }

        let owned: Vec<Event> = events.iter().map(|e| (*e).clone()).collect();
        let ctx = build_compact_context(&owned, SectionCaps::default());
        let compact_text = format_compact_context(&ctx);

        let window = match key_version {
            KeyVersion::V2 => Some((date_str.as_str(), date_str.as_str())),
            KeyVersion::V1 => None,
        };
        let ok = self.store.write_daily(
            &uuid::Uuid::new_v4().to_string(),
            conversation_id,
            &digest_key,
            &date_str,
            events.len(),
            &source_hash,
            &compact_text,
            window,
        );

        info!(
            date = %date_str,
            conv = conversation_id,
            status = if ok { "ok" } else { "error" },
            events = events.len(),
            key = %digest_key,
            "daily digest"
        );
        ok
    }

    // ── helpers ─────────────────────────────────────────────────────────────

    /// Unique conversation ids present in the CSV, sorted.
    pub fn derive_conversation_ids(&self) -> Vec<String> {
        let events = self.load_all_events();
        let mut seen: Vec<String> = events
            .into_iter()
            .map(|e| e.conversation_id)
            .filter(|c| !c.is_empty())
            .collect();
        seen.sort_unstable();
        seen.dedup();
        seen
    }

    fn load_all_events(&self) -> Vec<Event> {
        self.load_filtered(LoadFilter::default())
    }

    fn load_events_for_conv(&self, conversation_id: &str) -> Vec<Event> {
        self.load_filtered(LoadFilter {
            conversation_id: Some(conversation_id.to_string()),
            ..LoadFilter::default()
        })
    }

    fn load_filtered(&self, filter: LoadFilter) -> Vec<Event> {
        if self.csv_path.is_empty() || !std::path::Path::new(&self.csv_path).exists() {
            return Vec::new();
        }
        match cortex_events::load_csv_events(&self.csv_path, false, Utc::now(), &filter) {
            Ok(events) => events,
            Err(e) => {
                warn!(error = %e, "csv load failed");
                Vec::new()
            }
        }
    }

    fn earliest_event_date(&self, events: &[Event]) -> Option<NaiveDate> {
        let tz = self.tz();
        events
            .iter()
            .filter_map(|e| e.created_at_utc())
            .map(|ts| ts.with_timezone(&tz).date_naive())
            .min()
    }

    fn events_for_date<'a>(
        &self,
        all_events: &'a [Event],
        conversation_id: &str,
        target_date: NaiveDate,
    ) -> Vec<&'a Event> {
        let tz = self.tz();
        all_events
            .iter()
            .filter(|e| e.conversation_id == conversation_id)
            .filter(|e| {
                e.created_at_utc()
                    .map(|ts| ts.with_timezone(&tz).date_naive() == target_date)
                    .unwrap_or(false)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cortex_core::types::EventType;

    fn enabled_config() -> DigestConfig {
        DigestConfig {
            enable: true,
            daily_enable: true,
            tz: "UTC".into(),
            ..DigestConfig::default()
        }
    }

    fn event(id: &str, conv: &str, ts: &str) -> Event {
        Event {
            id: id.into(),
            conversation_id: conv.into(),
            event_type: EventType::UserMessage,
            created_at: ts.into(),
            event_data: serde_json::Map::new(),
        }
    }

    fn scheduler(config: DigestConfig) -> (tempfile::TempDir, DailyDigestScheduler) {
        let dir = tempfile::tempdir().unwrap();
        let store = DigestStore::new(dir.path().join("digest_store.csv"));
        let sched = DailyDigestScheduler::new(config, store, "");
        (dir, sched)
    }

    #[test]
    fn run_for_date_writes_once_then_skips() {
        let (_dir, sched) = scheduler(enabled_config());
        let date = NaiveDate::from_ymd_opt(2026, 2, 20).unwrap();
        let events = vec![
            event("ev-1", "conv-A", "2026-02-20T10:00:00Z"),
            event("ev-2", "conv-A", "2026-02-20T14:00:00Z"),
        ];

        assert!(sched.run_for_date("conv-A", date, &events));
        let rows = sched.store.list_by_action("daily_digest");
        assert_eq!(rows.len(), 1);
        let params: serde_json::Value = serde_json::from_str(&rows[0]["parameters"]).unwrap();
        let key = params["digest_key"].as_str().unwrap();
        assert_eq!(key.len(), 32);

        // Second run on identical inputs: skip, store unchanged.
        assert!(!sched.run_for_date("conv-A", date, &events));
        assert_eq!(sched.store.list_by_action("daily_digest").len(), 1);
    }

    #[test]
    fn quality_gate_blocks_below_minimum() {
        let mut cfg = enabled_config();
        cfg.min_events_daily = 3;
        let (_dir, sched) = scheduler(cfg);
        let date = NaiveDate::from_ymd_opt(2026, 2, 20).unwrap();
        let events = vec![event("ev-1", "conv-A", "2026-02-20T10:00:00Z")];
        assert!(!sched.run_for_date("conv-A", date, &events));
        assert!(sched.store.list_by_action("daily_digest").is_empty());
    }

    #[test]
    fn key_is_stable_across_event_order() {
        let (_dir, sched) = scheduler(enabled_config());
        let date = NaiveDate::from_ymd_opt(2026, 2, 20).unwrap();
        let forward = vec![
            event("ev-1", "conv-A", "2026-02-20T10:00:00Z"),
            event("ev-2", "conv-A", "2026-02-20T14:00:00Z"),
        ];
        let reversed: Vec<Event> = forward.iter().rev().cloned().collect();

        assert!(sched.run_for_date("conv-A", date, &forward));
        // Permuted events produce the same key → second run skips.
        assert!(!sched.run_for_date("conv-A", date, &reversed));
    }

    #[test]
    fn v2_key_writes_window_bounds() {
        let mut cfg = enabled_config();
        cfg.key_version = "v2".into();
        let (_dir, sched) = scheduler(cfg);
        let date = NaiveDate::from_ymd_opt(2026, 2, 20).unwrap();
        let events = vec![event("ev-1", "conv-A", "2026-02-20T10:00:00Z")];
        assert!(sched.run_for_date("conv-A", date, &events));
        let rows = sched.store.list_by_action("daily_digest");
        let params: serde_json::Value = serde_json::from_str(&rows[0]["parameters"]).unwrap();
        assert_eq!(params["window_start"], "2026-02-20");
        assert_eq!(params["window_end"], "2026-02-20");
    }

    #[test]
    fn disabled_run_reports_reason() {
        let (_dir, sched) = scheduler(DigestConfig::default());
        let summary = sched.run(Some(&["conv-A".to_string()]));
        assert_eq!(summary.written, 0);
        assert_eq!(summary.reason.as_deref(), Some("DAILY_DISABLED"));
    }

    #[test]
    fn catchup_zero_max_days_is_off() {
        let mut cfg = enabled_config();
        cfg.catchup_max_days = 0;
        let (_dir, sched) = scheduler(cfg);
        let summary = sched.run_catchup("conv-A");
        assert_eq!(summary, CatchUpSummary::default());
    }
}
