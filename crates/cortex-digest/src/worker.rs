//! Digest pipeline scheduling worker.
//!
//! Run modes:
//!   off      — no scheduling.
//!   sidecar  — standalone blocking loop (own process; restart policy must
//!              be on-failure so crash loops stay visible).
//!   inline   — spawned by the API host on startup; a process-wide guard
//!              prevents double starts.
//!
//! Schedule: one `run_once` at startup, then at every 04:00 in the
//! configured timezone. Pipeline order per cycle: daily → weekly → archive,
//! serialised across processes by the lock service.

use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use tokio::sync::watch;
use tracing::{info, warn};

use cortex_core::config::DigestConfig;

use crate::daily::DailyDigestScheduler;
use crate::lock::{DigestLock, LockService};
use crate::state::{CatchUpState, CycleUpdate, RuntimeStateFile};
use crate::store::DigestStore;
use crate::weekly::{GraphMirror, WeeklyDigestArchiver};

/// Guard against a second inline worker in the same process.
static INLINE_STARTED: AtomicBool = AtomicBool::new(false);

/// Summary of one full pipeline cycle.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub ok: bool,
    pub daily: u64,
    pub weekly: u64,
    pub archive: u64,
    pub skipped: bool,
    pub reason: Option<String>,
}

pub struct DigestWorker {
    config: DigestConfig,
    csv_path: String,
    owner: String,
}

impl DigestWorker {
    pub fn new(config: DigestConfig, csv_path: impl Into<String>) -> Self {
        let id = uuid::Uuid::new_v4().simple().to_string();
        Self {
            config,
            csv_path: csv_path.into(),
            owner: format!("digest-worker-{}", &id[..8]),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    fn tz(&self) -> Tz {
        self.config.tz.parse().unwrap_or(chrono_tz::UTC)
    }

    fn lock_service(&self) -> LockService {
        LockService::new(&self.config.lock_path, self.config.lock_timeout_s)
    }

    fn state_file(&self) -> RuntimeStateFile {
        RuntimeStateFile::new(&self.config.state_path)
    }

    /// Blocking scheduler loop. Runs once at startup, then at every 04:00
    /// local until `shutdown` flips to true.
    pub async fn run_loop(
        &self,
        mirror: Option<&dyn GraphMirror>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        if self.config.run_mode == "off" {
            info!("digest run_mode=off — loop not started");
            return;
        }

        info!(owner = %self.owner, "digest worker started");
        self.run_once(true, mirror).await;

        loop {
            let now = Utc::now();
            let next_run = next_run_at(now, self.tz());
            let wait = (next_run - now).to_std().unwrap_or_default();
            info!(next_run = %next_run, wait_s = wait.as_secs(), "digest worker sleeping");

            tokio::select! {
                _ = tokio::time::sleep(wait) => {
                    self.run_once(false, mirror).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("digest worker shutting down");
                        return;
                    }
                }
            }
        }
    }

    /// Single pipeline cycle: daily → weekly → archive, under the lock.
    pub async fn run_once(&self, is_startup: bool, mirror: Option<&dyn GraphMirror>) -> RunSummary {
        let mut summary = RunSummary::default();
        let lock_service = self.lock_service();
        let guard = DigestLock::acquire(&lock_service, &self.owner);
        if !guard.acquired() {
            warn!(owner = %self.owner, "run skipped: lock held");
            summary.skipped = true;
            summary.reason = Some("lock_held".to_string());
            return summary;
        }

        let started = std::time::Instant::now();
        let label = if is_startup { "startup" } else { "scheduled" };
        info!(run = label, owner = %self.owner, "digest pipeline run");

        let store = DigestStore::new(&self.config.store_path);
        let daily_sched =
            DailyDigestScheduler::new(self.config.clone(), store, self.csv_path.clone());
        let daily_result = daily_sched.run(None);

        let archiver = WeeklyDigestArchiver::new(
            self.config.clone(),
            DigestStore::new(&self.config.store_path),
        );
        let weekly_result = archiver.run_weekly(None);
        let archive_result = archiver.run_archive(None, mirror).await;

        summary.daily = daily_result.written;
        summary.weekly = weekly_result.written;
        summary.archive = archive_result.written;
        summary.ok = true;

        let duration_s = started.elapsed().as_secs_f64();
        info!(
            run = label,
            ok = summary.ok,
            daily = summary.daily,
            weekly = summary.weekly,
            archive = summary.archive,
            duration_s = format!("{duration_s:.2}"),
            "digest pipeline complete"
        );

        // Persist runtime state; state-write failures are logged inside and
        // never fail the run.
        let state = self.state_file();
        let status = if summary.ok { "ok" } else { "error" };
        state.update_cycle(
            "daily",
            CycleUpdate {
                status: status.to_string(),
                duration_s: Some((duration_s * 100.0).round() / 100.0),
                input_events: Some(daily_result.input_events),
                digest_written: Some(summary.daily),
                reason: daily_result.reason.clone(),
                retry_policy: Some("none".to_string()),
                ..CycleUpdate::default()
            },
        );
        if summary.weekly > 0 {
            state.update_cycle(
                "weekly",
                CycleUpdate {
                    status: "ok".to_string(),
                    digest_written: Some(summary.weekly),
                    reason: weekly_result.reason.clone(),
                    ..CycleUpdate::default()
                },
            );
        }
        if summary.archive > 0 {
            state.update_cycle(
                "archive",
                CycleUpdate {
                    status: "ok".to_string(),
                    digest_written: Some(summary.archive),
                    ..CycleUpdate::default()
                },
            );
        }

        let cu = &daily_result.catch_up;
        state.update_catch_up(CatchUpState {
            last_run: None, // stamped by the state file
            days_processed: cu.days_examined,
            written: summary.daily,
            status: status.to_string(),
            missed_runs: cu.missed_runs,
            recovered: cu.recovered,
            generated: cu.generated,
            mode: cu.mode.clone(),
        });

        summary
    }
}

/// Next 04:00 in `tz`, as a UTC instant strictly after `now`.
pub fn next_run_at(now: DateTime<Utc>, tz: Tz) -> DateTime<Utc> {
    let local_now = now.with_timezone(&tz);
    // 04:00:00 is always a representable time of day.
    let four = NaiveTime::from_hms_opt(4, 0, 0).unwrap();
    let mut target_date = local_now.date_naive();
    if local_now.time() >= four {
        target_date += chrono::Duration::days(1);
    }
    // DST edges: if 04:00 does not exist or is ambiguous on that date, take
    // the earliest valid instant.
    let naive = target_date.and_time(four);
    match tz.from_local_datetime(&naive) {
        chrono::LocalResult::Single(dt) => dt.with_timezone(&Utc),
        chrono::LocalResult::Ambiguous(first, _) => first.with_timezone(&Utc),
        chrono::LocalResult::None => (naive + chrono::Duration::hours(1))
            .and_local_timezone(tz)
            .earliest()
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or(now + chrono::Duration::days(1)),
    }
}

/// Spawn the inline worker once per process. Returns false if a worker is
/// already running in this process or the run mode does not ask for one.
pub fn spawn_inline_worker(
    config: DigestConfig,
    csv_path: String,
    shutdown: watch::Receiver<bool>,
) -> bool {
    if config.run_mode != "inline" {
        return false;
    }
    if INLINE_STARTED.swap(true, Ordering::SeqCst) {
        warn!("inline digest worker already running — not starting another");
        return false;
    }
    tokio::spawn(async move {
        let worker = DigestWorker::new(config, csv_path);
        worker.run_loop(None, shutdown).await;
    });
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker_config(dir: &tempfile::TempDir, run_mode: &str) -> DigestConfig {
        DigestConfig {
            enable: true,
            daily_enable: true,
            weekly_enable: true,
            archive_enable: true,
            run_mode: run_mode.to_string(),
            tz: "UTC".into(),
            lock_path: dir.path().join("digest.lock").to_string_lossy().into_owned(),
            state_path: dir
                .path()
                .join("digest_state.json")
                .to_string_lossy()
                .into_owned(),
            store_path: dir
                .path()
                .join("digest_store.csv")
                .to_string_lossy()
                .into_owned(),
            ..DigestConfig::default()
        }
    }

    #[test]
    fn owner_has_worker_prefix_and_hex_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let worker = DigestWorker::new(worker_config(&dir, "off"), "");
        let owner = worker.owner();
        assert!(owner.starts_with("digest-worker-"));
        let suffix = owner.trim_start_matches("digest-worker-");
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn next_run_is_in_future_and_at_most_a_day_away() {
        let now = Utc::now();
        let next = next_run_at(now, chrono_tz::Europe::Berlin);
        assert!(next > now);
        assert!(next - now <= chrono::Duration::days(1));
        let local = next.with_timezone(&chrono_tz::Europe::Berlin);
        assert_eq!(local.time(), NaiveTime::from_hms_opt(4, 0, 0).unwrap());
    }

    #[tokio::test]
    async fn run_once_skips_when_lock_held() {
        let dir = tempfile::tempdir().unwrap();
        let config = worker_config(&dir, "sidecar");
        let lock = LockService::new(&config.lock_path, config.lock_timeout_s);
        assert!(lock.acquire("someone-else"));

        let worker = DigestWorker::new(config, "");
        let summary = worker.run_once(true, None).await;
        assert!(summary.skipped);
        assert_eq!(summary.reason.as_deref(), Some("lock_held"));
    }

    #[tokio::test]
    async fn run_once_releases_lock_and_updates_state() {
        let dir = tempfile::tempdir().unwrap();
        let config = worker_config(&dir, "sidecar");
        let worker = DigestWorker::new(config.clone(), "");

        let summary = worker.run_once(true, None).await;
        assert!(summary.ok);
        assert!(!summary.skipped);

        // Lock must be free again.
        let lock = LockService::new(&config.lock_path, config.lock_timeout_s);
        assert_eq!(lock.get_lock_status().status, "FREE");

        // Runtime state recorded the daily cycle.
        let state = RuntimeStateFile::new(&config.state_path).get_state();
        assert_eq!(state.daily.status, "ok");
        assert_eq!(state.daily.retry_policy.as_deref(), Some("none"));
        assert!(state.daily.last_run.is_some());
        assert_eq!(state.catch_up.status, "ok");
    }

    #[tokio::test]
    async fn second_run_writes_nothing_new() {
        let dir = tempfile::tempdir().unwrap();
        let config = worker_config(&dir, "sidecar");

        // Seed a CSV with two events yesterday so daily has work to do.
        let csv_path = dir.path().join("events.csv");
        let yesterday = (Utc::now() - chrono::Duration::days(1))
            .format("%Y-%m-%dT10:00:00Z")
            .to_string();
        let yesterday_b = (Utc::now() - chrono::Duration::days(1))
            .format("%Y-%m-%dT14:00:00Z")
            .to_string();
        std::fs::write(
            &csv_path,
            format!(
                "event_id,conversation_id,timestamp,source_type,source_reliability,entity_ids,entity_match_type,action,raw_text,parameters,fact_type,fact_attributes,confidence_overall,confidence_breakdown,scenario_type,category,derived_from,stale_at,expires_at\n\
                 ev-1,conv-A,{yesterday},system,1.0,,,user_message,hello,,,,high,,,user,,,\n\
                 ev-2,conv-A,{yesterday_b},system,1.0,,,assistant_message,hi,,,,high,,,user,,,\n"
            ),
        )
        .unwrap();

        let worker = DigestWorker::new(config.clone(), csv_path.to_string_lossy().into_owned());
        let first = worker.run_once(true, None).await;
        assert_eq!(first.daily, 1);

        let second = worker.run_once(false, None).await;
        assert_eq!(second.daily, 0, "idempotent: same events, zero new rows");

        let store = DigestStore::new(&config.store_path);
        assert_eq!(store.list_by_action("daily_digest").len(), 1);
    }
}
