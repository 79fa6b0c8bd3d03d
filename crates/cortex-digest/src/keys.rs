//! Deterministic digest key computation.
//!
//! All keys are sha256-based, hex-encoded, truncated to 32 characters and
//! collision-resistant within their scope (daily / weekly / archive).
//!
//! Key schemas v1 (default):
//!     daily:   sha256("daily:v1:{conv}:{date}:{source_hash}")[..32]
//!     weekly:  sha256("weekly:v1:{conv}:{iso_week}:{sorted_daily_keys}")[..32]
//!     archive: sha256("archive:v1:{conv}:{weekly_key}:{archive_date}")[..32]
//!
//! Key schemas v2 carry explicit window bounds in the hash (daily windows
//! are [date, date]; weekly windows are Monday..Sunday of the ISO week).
//!
//! source_hash: sha256 of the sorted event ids joined by "," — first 16 hex
//! chars; covers event-set identity. Same set in any order → same hash.

use chrono::{Datelike, NaiveDate, Weekday};
use sha2::{Digest, Sha256};

/// Which key schema is in effect. Selected via `digest.key_version`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyVersion {
    #[default]
    V1,
    V2,
}

impl KeyVersion {
    pub fn parse(s: &str) -> Self {
        match s {
            "v2" => Self::V2,
            _ => Self::V1,
        }
    }
}

fn sha256_hex(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

/// 16-character hash of a sorted list of event ids.
pub fn make_source_hash(event_ids: &[String]) -> String {
    let mut sorted: Vec<&str> = event_ids.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    let canonical = sorted.join(",");
    sha256_hex(&canonical)[..16].to_string()
}

/// 32-char digest key for a daily digest. Uniquely identifies
/// (conversation, date, event-set); re-running on the same events produces
/// the same key.
pub fn make_daily_digest_key(conversation_id: &str, date: &str, source_hash: &str) -> String {
    let raw = format!("daily:v1:{conversation_id}:{date}:{source_hash}");
    sha256_hex(&raw)[..32].to_string()
}

/// 32-char digest key for a weekly digest. Same daily keys in any order →
/// same weekly key.
pub fn make_weekly_digest_key(
    conversation_id: &str,
    iso_week: &str,
    daily_digest_keys: &[String],
) -> String {
    let raw = format!(
        "weekly:v1:{conversation_id}:{iso_week}:{}",
        sorted_joined(daily_digest_keys)
    );
    sha256_hex(&raw)[..32].to_string()
}

/// 32-char digest key for an archive entry.
pub fn make_archive_digest_key(
    conversation_id: &str,
    weekly_digest_key: &str,
    archive_date: &str,
) -> String {
    let raw = format!("archive:v1:{conversation_id}:{weekly_digest_key}:{archive_date}");
    sha256_hex(&raw)[..32].to_string()
}

/// (Monday, Sunday) date strings for an ISO-week label "YYYY-Www".
///
/// Example: `"2026-W08"` → `("2026-02-16", "2026-02-22")`.
pub fn iso_week_bounds(iso_week: &str) -> Option<(String, String)> {
    let (year, week) = iso_week.split_once("-W")?;
    let year: i32 = year.parse().ok()?;
    let week: u32 = week.parse().ok()?;
    let monday = NaiveDate::from_isoywd_opt(year, week, Weekday::Mon)?;
    let sunday = monday + chrono::Duration::days(6);
    Some((
        monday.format("%Y-%m-%d").to_string(),
        sunday.format("%Y-%m-%d").to_string(),
    ))
}

/// ISO-week label "YYYY-Www" for a date.
pub fn iso_week_label(date: NaiveDate) -> String {
    let iso = date.iso_week();
    format!("{:04}-W{:02}", iso.year(), iso.week())
}

/// v2 daily key: window bounds explicit, window_start == window_end.
pub fn make_daily_digest_key_v2(conversation_id: &str, date: &str, source_hash: &str) -> String {
    let raw = format!("daily:v2:{conversation_id}:{date}:{date}:{source_hash}");
    sha256_hex(&raw)[..32].to_string()
}

/// v2 weekly key: explicitly includes the week's Monday and Sunday.
pub fn make_weekly_digest_key_v2(
    conversation_id: &str,
    iso_week: &str,
    daily_digest_keys: &[String],
) -> Option<String> {
    let (week_start, week_end) = iso_week_bounds(iso_week)?;
    let raw = format!(
        "weekly:v2:{conversation_id}:{iso_week}:{week_start}:{week_end}:{}",
        sorted_joined(daily_digest_keys)
    );
    Some(sha256_hex(&raw)[..32].to_string())
}

/// v2 archive key: structurally the same as v1 under an explicit v2 prefix.
pub fn make_archive_digest_key_v2(
    conversation_id: &str,
    weekly_digest_key: &str,
    archive_date: &str,
) -> String {
    let raw = format!("archive:v2:{conversation_id}:{weekly_digest_key}:{archive_date}");
    sha256_hex(&raw)[..32].to_string()
}

fn sorted_joined(keys: &[String]) -> String {
    let mut sorted: Vec<&str> = keys.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    sorted.join(",")
}
