//! Row ranking for fact selection.
//!
//! `rank = 0.5·confidence + 0.3·recency + 0.2·priority`, each component in
//! [0, 1]. The weights and label maps are part of the typed-state contract —
//! changing them reorders every compact context downstream.

use chrono::{DateTime, Utc};

use crate::loader::CsvRow;
use cortex_core::types::parse_rfc3339_utc;

/// Confidence label → score. Unknown labels score medium.
fn confidence_label_to_f64(label: &str) -> f64 {
    match label.trim().to_lowercase().as_str() {
        "high" => 1.0,
        "medium" => 0.65,
        "low" => 0.30,
        _ => 0.65,
    }
}

/// Source-type fallback reliability, used when the reliability cell is not a
/// parseable float.
fn source_type_reliability(source_type: &str) -> f64 {
    match source_type.trim().to_lowercase().as_str() {
        "system" => 1.0,
        "user" => 0.85,
        "memory" => 0.70,
        "inference" => 0.50,
        _ => 0.70,
    }
}

fn source_reliability(source_type: &str, raw: &str) -> f64 {
    match raw.trim().parse::<f64>() {
        Ok(v) => v.clamp(0.0, 1.0),
        Err(_) => source_type_reliability(source_type),
    }
}

fn category_priority(category: &str) -> f64 {
    match category.trim().to_lowercase().as_str() {
        "knowledge" => 1.0,
        "decision" => 0.8,
        "user" => 0.6,
        _ => 0.4,
    }
}

/// Combined confidence score: mean of reliability and the overall label.
pub fn confidence_score(row: &CsvRow) -> f64 {
    let rel = source_reliability(&row.source_type, &row.source_reliability);
    let label = confidence_label_to_f64(&row.confidence_overall);
    (rel + label) / 2.0
}

/// Time-decay recency: `1 / (1 + days_elapsed)`. Unparseable timestamps
/// score 0 so undated rows sink to the bottom.
pub fn recency_score(row: &CsvRow, now: DateTime<Utc>) -> f64 {
    match parse_rfc3339_utc(&row.timestamp) {
        Some(ts) => {
            let days = (now - ts).num_seconds() as f64 / 86_400.0;
            1.0 / (1.0 + days.max(0.0))
        }
        None => 0.0,
    }
}

pub fn fact_priority_score(row: &CsvRow) -> f64 {
    category_priority(&row.category)
}

/// Composite ranking score for fact selection.
pub fn rank_score(row: &CsvRow, now: DateTime<Utc>) -> f64 {
    0.5 * confidence_score(row) + 0.3 * recency_score(row, now) + 0.2 * fact_priority_score(row)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::CsvRow;

    fn row(reliability: &str, confidence: &str, category: &str, ts: &str) -> CsvRow {
        CsvRow {
            event_id: "e-1".into(),
            conversation_id: "c".into(),
            timestamp: ts.into(),
            source_type: "system".into(),
            source_reliability: reliability.into(),
            confidence_overall: confidence.into(),
            category: category.into(),
            ..CsvRow::default()
        }
    }

    #[test]
    fn confidence_is_mean_of_reliability_and_label() {
        let r = row("1.0", "high", "knowledge", "");
        assert!((confidence_score(&r) - 1.0).abs() < 1e-9);

        let r = row("0.5", "low", "knowledge", "");
        assert!((confidence_score(&r) - 0.40).abs() < 1e-9);
    }

    #[test]
    fn reliability_falls_back_to_source_type() {
        let mut r = row("not-a-float", "medium", "user", "");
        r.source_type = "inference".into();
        // inference fallback 0.5, medium label 0.65 → mean 0.575
        assert!((confidence_score(&r) - 0.575).abs() < 1e-9);
    }

    #[test]
    fn recency_decays_with_age() {
        let now = chrono::Utc::now();
        let fresh = row("1.0", "high", "knowledge", &now.to_rfc3339());
        let old_ts = (now - chrono::Duration::days(9)).to_rfc3339();
        let old = row("1.0", "high", "knowledge", &old_ts);

        let fresh_score = recency_score(&fresh, now);
        let old_score = recency_score(&old, now);
        assert!(fresh_score > 0.99);
        assert!((old_score - 0.1).abs() < 0.01);
    }

    #[test]
    fn unparseable_timestamp_scores_zero() {
        let r = row("1.0", "high", "knowledge", "yesterday-ish");
        assert_eq!(recency_score(&r, chrono::Utc::now()), 0.0);
    }

    #[test]
    fn rank_is_stable_for_identical_inputs() {
        let now = chrono::Utc::now();
        let r = row("0.85", "medium", "decision", &now.to_rfc3339());
        assert_eq!(rank_score(&r, now), rank_score(&r, now));
    }
}
