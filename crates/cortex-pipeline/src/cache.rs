//! Persistent plan cache.
//!
//! SQLite-backed key-value cache keyed by the normalized user text. Two
//! processes pointing at the same cache file share entries, so identical
//! inputs arriving on different workers within the TTL skip redundant
//! planning calls. Expired rows are evicted on read.

use std::path::Path;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::Connection;
use tracing::warn;

use cortex_core::{CortexError, Result};

pub struct SqlitePlanCache {
    conn: Mutex<Connection>,
    ttl_seconds: u64,
    namespace: String,
}

impl SqlitePlanCache {
    pub fn open(
        path: impl AsRef<Path>,
        ttl_seconds: u64,
        namespace: impl Into<String>,
    ) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path).map_err(|e| CortexError::Internal(e.to_string()))?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA busy_timeout=3000;
             CREATE TABLE IF NOT EXISTS plan_cache (
                 namespace  TEXT NOT NULL,
                 key        TEXT NOT NULL,
                 payload    TEXT NOT NULL,
                 created_at REAL NOT NULL,
                 PRIMARY KEY (namespace, key)
             );",
        )
        .map_err(|e| CortexError::Internal(e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
            ttl_seconds,
            namespace: namespace.into(),
        })
    }

    /// Whitespace-collapsed lowercase form — "Hallo  Welt" and "hallo welt"
    /// hit the same entry.
    fn normalize(text: &str) -> String {
        text.split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase()
    }

    fn now_epoch() -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }

    /// Fetch a cached payload. Expired entries are deleted and report a miss.
    pub fn get(&self, text: &str) -> Option<serde_json::Value> {
        let key = Self::normalize(text);
        let conn = self.conn.lock().unwrap();
        let row: Option<(String, f64)> = conn
            .query_row(
                "SELECT payload, created_at FROM plan_cache
                 WHERE namespace = ?1 AND key = ?2",
                rusqlite::params![self.namespace, key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .ok();

        let (payload, created_at) = row?;
        if Self::now_epoch() - created_at > self.ttl_seconds as f64 {
            let _ = conn.execute(
                "DELETE FROM plan_cache WHERE namespace = ?1 AND key = ?2",
                rusqlite::params![self.namespace, key],
            );
            return None;
        }
        serde_json::from_str(&payload).ok()
    }

    /// Store a payload under the normalized text, replacing any prior entry.
    pub fn set(&self, text: &str, payload: &serde_json::Value) {
        let key = Self::normalize(text);
        let conn = self.conn.lock().unwrap();
        if let Err(e) = conn.execute(
            "INSERT OR REPLACE INTO plan_cache (namespace, key, payload, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![self.namespace, key, payload.to_string(), Self::now_epoch()],
        ) {
            warn!(error = %e, "plan cache write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_between_instances_on_same_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plan_cache.sqlite");
        let c1 = SqlitePlanCache::open(&path, 120, "thinking").unwrap();
        let c2 = SqlitePlanCache::open(&path, 120, "thinking").unwrap();

        let payload = serde_json::json!({"intent": "create_skill", "score": 0.91});
        c1.set("Bitte erstelle Skill X", &payload);
        assert_eq!(c2.get("Bitte erstelle Skill X"), Some(payload));
    }

    #[test]
    fn namespaces_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plan_cache.sqlite");
        let thinking = SqlitePlanCache::open(&path, 120, "thinking").unwrap();
        let seq = SqlitePlanCache::open(&path, 120, "seq").unwrap();

        thinking.set("same text", &serde_json::json!({"from": "thinking"}));
        assert!(seq.get("same text").is_none());
    }

    #[test]
    fn normalization_collapses_case_and_whitespace() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SqlitePlanCache::open(dir.path().join("c.sqlite"), 120, "t").unwrap();
        cache.set("Hallo   Welt", &serde_json::json!(1));
        assert_eq!(cache.get("hallo welt"), Some(serde_json::json!(1)));
    }

    #[test]
    fn ttl_expires_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plan_cache_ttl.sqlite");
        let cache = SqlitePlanCache::open(&path, 60, "seq").unwrap();
        cache.set("Run sequential task", &serde_json::json!({"ok": true}));

        // Force-expire the row directly to validate TTL enforcement.
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute(
                "UPDATE plan_cache SET created_at = ?1 WHERE namespace = ?2",
                rusqlite::params![SqlitePlanCache::now_epoch() - 3600.0, "seq"],
            )
            .unwrap();
        }
        assert!(cache.get("Run sequential task").is_none());
        // The expired row was evicted, not just skipped.
        let conn = Connection::open(&path).unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM plan_cache", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}
