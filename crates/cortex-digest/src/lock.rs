//! File-based lock for the digest pipeline.
//!
//! Lock file format: JSON `{owner, acquired_at, pid}`. A lock older than the
//! configured timeout is stale and may be force-taken.
//!
//! Race-safety:
//!   Fresh lock:  exclusive create (`create_new`) — atomic at the OS level;
//!                only one process wins.
//!   Stale lock:  a second exclusive-create sentinel (`<path>.takeover`)
//!                serialises concurrent takeovers. Only the sentinel winner
//!                proceeds, and it RE-READS the lock before overwriting —
//!                a lock refreshed between the stale check and the sentinel
//!                win aborts the takeover. The sentinel is removed on every
//!                exit path; a sentinel older than 30 s is treated as left
//!                by a crashed winner and cleaned up.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use cortex_core::types::{now_rfc3339, parse_rfc3339_utc};

/// Crashed-winner guard: sentinels older than this are removed.
const TAKEOVER_SENTINEL_MAX_AGE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    pub owner: String,
    pub acquired_at: String,
    pub pid: u32,
}

/// Structured lock status for the runtime API.
#[derive(Debug, Clone, Serialize)]
pub struct LockStatus {
    pub status: &'static str,
    pub owner: Option<String>,
    pub since: Option<String>,
    pub timeout_s: i64,
    pub stale: Option<bool>,
}

pub struct LockService {
    path: PathBuf,
    timeout_s: i64,
}

impl LockService {
    pub fn new(path: impl AsRef<Path>, timeout_s: i64) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            timeout_s,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Try to acquire the lock for `owner`. Never blocks: returns false when
    /// a fresh lock is held by someone else. Stale locks are force-taken.
    pub fn acquire(&self, owner: &str) -> bool {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                if let Err(e) = std::fs::create_dir_all(parent) {
                    warn!(error = %e, "cannot create lock directory");
                    return false;
                }
            }
        }

        let payload = LockInfo {
            owner: owner.to_string(),
            acquired_at: now_rfc3339(),
            pid: std::process::id(),
        };
        let payload_json = match serde_json::to_string(&payload) {
            Ok(j) => j,
            Err(e) => {
                warn!(error = %e, "cannot serialise lock payload");
                return false;
            }
        };

        // Attempt 1: atomic exclusive create.
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(mut file) => {
                if let Err(e) = file.write_all(payload_json.as_bytes()) {
                    warn!(error = %e, "lock payload write failed");
                }
                info!(owner, "lock acquired (exclusive-create)");
                return true;
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                // Held by someone — check staleness below.
            }
            Err(e) => {
                warn!(error = %e, "exclusive create failed");
                return false;
            }
        }

        // Check the existing lock for staleness. Unreadable or malformed
        // lock files fail open into the takeover path so a corrupt file
        // never wedges the pipeline.
        let now = Utc::now();
        match self.read_lock() {
            Some(existing) => {
                let age = lock_age_seconds(&existing.acquired_at, now);
                match age {
                    Some(age_s) if age_s < self.timeout_s => {
                        warn!(
                            holder = %existing.owner,
                            age_s,
                            timeout_s = self.timeout_s,
                            "lock held — blocked"
                        );
                        return false;
                    }
                    Some(age_s) => {
                        warn!(holder = %existing.owner, age_s, "stale lock — force-taking");
                    }
                    None => {
                        warn!("lock timestamp unreadable — attempting takeover");
                    }
                }
            }
            None => {
                warn!("cannot read lock file — attempting takeover");
            }
        }

        self.takeover(owner, &payload_json, now)
    }

    /// Stale-lock takeover, serialised through the `.takeover` sentinel.
    fn takeover(&self, owner: &str, payload_json: &str, now: DateTime<Utc>) -> bool {
        let sentinel = self.sentinel_path();

        // Clean up a sentinel left by a crashed prior winner.
        if let Ok(meta) = std::fs::metadata(&sentinel) {
            let crashed = meta
                .modified()
                .ok()
                .and_then(|m| m.elapsed().ok())
                .map(|age| age > TAKEOVER_SENTINEL_MAX_AGE)
                .unwrap_or(false);
            if crashed {
                let _ = std::fs::remove_file(&sentinel);
            }
        }

        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&sentinel)
        {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                warn!(owner, "stale-takeover in progress by another worker — blocked");
                return false;
            }
            Err(e) => {
                warn!(error = %e, "takeover sentinel create failed");
                return false;
            }
        }

        let result = self.takeover_locked(payload_json, now);
        // Sentinel removal must happen on every exit path.
        let _ = std::fs::remove_file(&sentinel);
        if result {
            info!(owner, "lock acquired (stale-takeover)");
        }
        result
    }

    /// The body of a sentinel-protected takeover: re-validate freshness,
    /// then replace the lock file atomically (tmp + rename).
    fn takeover_locked(&self, payload_json: &str, _now: DateTime<Utc>) -> bool {
        // Re-read after winning the sentinel. Without this second check a
        // worker that evaluated "stale" earlier could overwrite a lock that
        // was already refreshed between stale-check and sentinel-acquire.
        if let Some(current) = self.read_lock() {
            if let Some(age_s) = lock_age_seconds(&current.acquired_at, Utc::now()) {
                if age_s < self.timeout_s {
                    warn!(
                        holder = %current.owner,
                        age_s,
                        "takeover re-check: lock was refreshed — blocked"
                    );
                    return false;
                }
            }
            // Malformed timestamp: fail open — the winner repairs the file.
        }

        let tmp = self.path.with_extension("lock.tmp");
        let replace = || -> std::io::Result<()> {
            std::fs::write(&tmp, payload_json)?;
            std::fs::rename(&tmp, &self.path)?;
            Ok(())
        };
        match replace() {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "failed to write lock during takeover");
                let _ = std::fs::remove_file(&tmp);
                false
            }
        }
    }

    /// Release the lock if owned by `owner`. Returns true if released (or
    /// the lock was already absent).
    pub fn release(&self, owner: &str) -> bool {
        if !self.path.exists() {
            return true;
        }
        match self.read_lock() {
            Some(info) if info.owner == owner => match std::fs::remove_file(&self.path) {
                Ok(()) => {
                    info!(owner, "lock released");
                    true
                }
                Err(e) => {
                    warn!(error = %e, "failed to remove lock file");
                    false
                }
            },
            Some(info) => {
                warn!(holder = %info.owner, requester = owner, "cannot release: not the holder");
                false
            }
            None => {
                warn!("cannot release: lock unreadable");
                false
            }
        }
    }

    /// Current lock info, or `None` when unlocked / unreadable.
    pub fn get_lock_info(&self) -> Option<LockInfo> {
        self.read_lock()
    }

    /// Structured status for the runtime API.
    pub fn get_lock_status(&self) -> LockStatus {
        match self.read_lock() {
            None => LockStatus {
                status: "FREE",
                owner: None,
                since: None,
                timeout_s: self.timeout_s,
                stale: None,
            },
            Some(info) => {
                let stale =
                    lock_age_seconds(&info.acquired_at, Utc::now()).map(|age| age > self.timeout_s);
                LockStatus {
                    status: "LOCKED",
                    owner: Some(info.owner),
                    since: Some(info.acquired_at),
                    timeout_s: self.timeout_s,
                    stale,
                }
            }
        }
    }

    fn read_lock(&self) -> Option<LockInfo> {
        let raw = std::fs::read_to_string(&self.path).ok()?;
        serde_json::from_str(&raw).ok()
    }

    fn sentinel_path(&self) -> PathBuf {
        let mut os = self.path.as_os_str().to_owned();
        os.push(".takeover");
        PathBuf::from(os)
    }
}

fn lock_age_seconds(acquired_at: &str, now: DateTime<Utc>) -> Option<i64> {
    parse_rfc3339_utc(acquired_at).map(|t| (now - t).num_seconds())
}

/// RAII wrapper: releases on drop when the acquire succeeded.
pub struct DigestLock<'a> {
    service: &'a LockService,
    owner: String,
    acquired: bool,
}

impl<'a> DigestLock<'a> {
    pub fn acquire(service: &'a LockService, owner: &str) -> Self {
        let acquired = service.acquire(owner);
        Self {
            service,
            owner: owner.to_string(),
            acquired,
        }
    }

    pub fn acquired(&self) -> bool {
        self.acquired
    }
}

impl Drop for DigestLock<'_> {
    fn drop(&mut self) {
        if self.acquired {
            self.service.release(&self.owner);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(dir: &tempfile::TempDir, timeout_s: i64) -> LockService {
        LockService::new(dir.path().join("digest.lock"), timeout_s)
    }

    #[test]
    fn acquire_succeeds_when_free() {
        let dir = tempfile::tempdir().unwrap();
        let lock = service(&dir, 300);
        assert!(lock.acquire("worker-a"));
        let info = lock.get_lock_info().unwrap();
        assert_eq!(info.owner, "worker-a");
        assert_eq!(info.pid, std::process::id());
    }

    #[test]
    fn fresh_lock_blocks_second_acquirer() {
        let dir = tempfile::tempdir().unwrap();
        let lock = service(&dir, 300);
        assert!(lock.acquire("worker-a"));
        assert!(!lock.acquire("worker-b"));
    }

    #[test]
    fn release_requires_matching_owner() {
        let dir = tempfile::tempdir().unwrap();
        let lock = service(&dir, 300);
        lock.acquire("worker-a");
        assert!(!lock.release("worker-b"));
        assert!(lock.path().exists());
        assert!(lock.release("worker-a"));
        assert!(!lock.path().exists());
    }

    #[test]
    fn reacquire_after_release_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let lock = service(&dir, 300);
        assert!(lock.acquire("worker-a"));
        assert!(lock.release("worker-a"));
        assert!(lock.acquire("worker-a"));
    }

    fn write_aged_lock(lock: &LockService, owner: &str, age_s: i64) {
        let acquired_at = (Utc::now() - chrono::Duration::seconds(age_s))
            .to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
        let info = LockInfo {
            owner: owner.to_string(),
            acquired_at,
            pid: 1,
        };
        std::fs::write(lock.path(), serde_json::to_string(&info).unwrap()).unwrap();
    }

    #[test]
    fn stale_lock_is_force_taken() {
        let dir = tempfile::tempdir().unwrap();
        let lock = service(&dir, 300);
        write_aged_lock(&lock, "dead-worker", 400);
        assert!(lock.acquire("worker-b"));
        assert_eq!(lock.get_lock_info().unwrap().owner, "worker-b");
        assert!(!lock.sentinel_path().exists());
    }

    #[test]
    fn refreshed_lock_aborts_takeover_recheck() {
        // A lock refreshed between stale-check and sentinel win must block
        // the takeover. We simulate by making the lock fresh again before
        // the sentinel-protected body runs.
        let dir = tempfile::tempdir().unwrap();
        let lock = service(&dir, 300);
        write_aged_lock(&lock, "holder", 10);
        let payload = serde_json::to_string(&LockInfo {
            owner: "thief".into(),
            acquired_at: now_rfc3339(),
            pid: 2,
        })
        .unwrap();
        assert!(!lock.takeover_locked(&payload, Utc::now()));
        assert_eq!(lock.get_lock_info().unwrap().owner, "holder");
    }

    #[test]
    fn concurrent_stale_takeover_has_exactly_one_winner() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("digest.lock");
        {
            let setup = LockService::new(&path, 300);
            write_aged_lock(&setup, "dead-worker", 400);
        }

        let barrier = std::sync::Arc::new(std::sync::Barrier::new(2));
        let mut handles = Vec::new();
        for name in ["racer-a", "racer-b"] {
            let path = path.clone();
            let barrier = std::sync::Arc::clone(&barrier);
            handles.push(std::thread::spawn(move || {
                let lock = LockService::new(path, 300);
                barrier.wait();
                lock.acquire(name)
            }));
        }
        let results: Vec<bool> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(
            results.iter().filter(|&&won| won).count(),
            1,
            "exactly one racer must win the stale takeover: {results:?}"
        );
        let lock = LockService::new(&path, 300);
        assert!(!lock.sentinel_path().exists());
    }

    #[test]
    fn unreadable_lock_fails_open_to_takeover() {
        let dir = tempfile::tempdir().unwrap();
        let lock = service(&dir, 300);
        std::fs::write(lock.path(), "not json at all {{{").unwrap();
        assert!(lock.acquire("repair-worker"));
        assert_eq!(lock.get_lock_info().unwrap().owner, "repair-worker");
    }

    #[test]
    fn lock_status_shape() {
        let dir = tempfile::tempdir().unwrap();
        let lock = service(&dir, 300);
        let free = lock.get_lock_status();
        assert_eq!(free.status, "FREE");
        assert!(free.owner.is_none());
        assert_eq!(free.timeout_s, 300);

        lock.acquire("worker-a");
        let held = lock.get_lock_status();
        assert_eq!(held.status, "LOCKED");
        assert_eq!(held.owner.as_deref(), Some("worker-a"));
        assert_eq!(held.stale, Some(false));
    }

    #[test]
    fn guard_releases_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let lock = service(&dir, 300);
        {
            let guard = DigestLock::acquire(&lock, "guard-owner");
            assert!(guard.acquired());
            assert!(lock.path().exists());
        }
        assert!(!lock.path().exists());
    }

    #[test]
    fn failed_guard_does_not_release_foreign_lock() {
        let dir = tempfile::tempdir().unwrap();
        let lock = service(&dir, 300);
        lock.acquire("holder");
        {
            let guard = DigestLock::acquire(&lock, "loser");
            assert!(!guard.acquired());
        }
        assert_eq!(lock.get_lock_info().unwrap().owner, "holder");
    }
}
