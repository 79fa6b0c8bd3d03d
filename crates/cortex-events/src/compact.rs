//! Compact NOW/RULES/NEXT context for small-context models.
//!
//! Events are folded into three bounded sections: NOW carries the active
//! state (running containers, latest observations, digest summaries), RULES
//! carries stable constraints, NEXT carries pending follow-ups. Section caps
//! keep the rendered block inside a small model's working budget.

use cortex_core::types::{Event, EventType};

/// Entries-per-section limits. Zero means "section stays empty".
#[derive(Debug, Clone, Copy)]
pub struct SectionCaps {
    pub now_max: usize,
    pub rules_max: usize,
    pub next_max: usize,
}

impl Default for SectionCaps {
    fn default() -> Self {
        Self {
            now_max: 5,
            rules_max: 3,
            next_max: 2,
        }
    }
}

/// Ranked selection of events, already reduced to renderable lines.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactContext {
    pub now: Vec<String>,
    pub rules: Vec<String>,
    pub next: Vec<String>,
}

impl CompactContext {
    pub fn is_empty(&self) -> bool {
        self.now.is_empty() && self.rules.is_empty() && self.next.is_empty()
    }
}

/// Fold events into a [`CompactContext`].
///
/// Events are expected in ranked order (best first); each section takes the
/// first entries that classify into it, up to its cap. Container lifecycle
/// is reconciled first so a stopped container never shows up as running.
pub fn build_compact_context(events: &[Event], caps: SectionCaps) -> CompactContext {
    let mut ctx = CompactContext::default();

    // Containers that stopped (or expired) anywhere in the batch must not
    // appear in NOW even if their start event ranks higher.
    let stopped: Vec<&str> = events
        .iter()
        .filter(|e| {
            matches!(
                e.event_type,
                EventType::ContainerStopped | EventType::ContainerTtlExpired
            )
        })
        .filter_map(|e| e.event_data.get("container_id").and_then(|v| v.as_str()))
        .collect();

    for event in events {
        match classify(event, &stopped) {
            Some(Section::Now(line)) if ctx.now.len() < caps.now_max => ctx.now.push(line),
            Some(Section::Rules(line)) if ctx.rules.len() < caps.rules_max => {
                ctx.rules.push(line)
            }
            Some(Section::Next(line)) if ctx.next.len() < caps.next_max => ctx.next.push(line),
            _ => {}
        }
        if ctx.now.len() >= caps.now_max
            && ctx.rules.len() >= caps.rules_max
            && ctx.next.len() >= caps.next_max
        {
            break;
        }
    }

    ctx
}

enum Section {
    Now(String),
    Rules(String),
    Next(String),
}

fn classify(event: &Event, stopped: &[&str]) -> Option<Section> {
    let data = &event.event_data;
    let text = data
        .get("raw_text")
        .and_then(|v| v.as_str())
        .unwrap_or_default();

    match &event.event_type {
        EventType::ContainerStarted => {
            let cid = data.get("container_id").and_then(|v| v.as_str())?;
            if stopped.contains(&cid) {
                return None;
            }
            let blueprint = data
                .get("blueprint")
                .or_else(|| data.get("blueprint_id"))
                .and_then(|v| v.as_str())
                .unwrap_or("unknown");
            Some(Section::Now(format!(
                "container {} running (blueprint {})",
                short_id(cid),
                blueprint
            )))
        }
        EventType::ContainerStopped | EventType::ContainerTtlExpired => None,
        EventType::DailyDigest => {
            let date = data
                .get("digest_date")
                .and_then(|v| v.as_str())
                .unwrap_or("?");
            let count = data.get("event_count").and_then(|v| v.as_u64()).unwrap_or(0);
            Some(Section::Now(format!("{date}: {count} events digested")))
        }
        EventType::WeeklyDigest => {
            let week = data.get("iso_week").and_then(|v| v.as_str()).unwrap_or("?");
            Some(Section::Now(format!("week {week} summarised")))
        }
        EventType::Task => {
            let line = non_empty(text).unwrap_or("open task").to_string();
            Some(Section::Next(line))
        }
        EventType::Observation | EventType::Note => {
            let line = non_empty(text)?;
            // Stable constraints are flagged by their category; everything
            // else is current state.
            let category = data
                .get("category")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            if category == "knowledge" || is_rule_fact(data) {
                Some(Section::Rules(line.to_string()))
            } else {
                Some(Section::Now(line.to_string()))
            }
        }
        EventType::UserMessage | EventType::AssistantMessage => {
            non_empty(text).map(|t| Section::Now(truncate(t, 120)))
        }
        _ => {
            // Unknown action kinds: surface text if any, as current state.
            non_empty(text).map(|t| Section::Now(truncate(t, 120)))
        }
    }
}

fn is_rule_fact(data: &serde_json::Map<String, serde_json::Value>) -> bool {
    data.get("fact_type")
        .and_then(|v| v.as_str())
        .map(|ft| ft.contains("RULE") || ft.contains("INSTRUCTION"))
        .unwrap_or(false)
}

fn non_empty(s: &str) -> Option<&str> {
    let trimmed = s.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}

fn short_id(id: &str) -> &str {
    &id[..id.len().min(12)]
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max).collect();
        format!("{cut}…")
    }
}

/// Render the compact context. Empty sections are omitted; an empty context
/// renders to the empty string (callers decide what "no context" means).
pub fn format_compact_context(ctx: &CompactContext) -> String {
    let mut out = String::new();
    for (title, lines) in [
        ("NOW", &ctx.now),
        ("RULES", &ctx.rules),
        ("NEXT", &ctx.next),
    ] {
        if lines.is_empty() {
            continue;
        }
        out.push_str(title);
        out.push_str(":\n");
        for line in lines {
            out.push_str("  - ");
            out.push_str(line);
            out.push('\n');
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(event_type: &str, data: serde_json::Value) -> Event {
        Event {
            id: "e".into(),
            conversation_id: "c".into(),
            event_type: EventType::from(event_type),
            created_at: "2026-02-20T10:00:00Z".into(),
            event_data: data.as_object().cloned().unwrap_or_default(),
        }
    }

    #[test]
    fn running_container_lands_in_now() {
        let events = vec![event(
            "container_started",
            json!({"container_id": "c-12345678901234", "blueprint": "python-sandbox"}),
        )];
        let ctx = build_compact_context(&events, SectionCaps::default());
        assert_eq!(ctx.now.len(), 1);
        assert!(ctx.now[0].contains("c-1234567890"));
        assert!(ctx.now[0].contains("python-sandbox"));
    }

    #[test]
    fn stopped_container_never_shows_as_running() {
        let events = vec![
            event(
                "container_started",
                json!({"container_id": "c-1", "blueprint": "python-sandbox"}),
            ),
            event("container_stopped", json!({"container_id": "c-1"})),
        ];
        let ctx = build_compact_context(&events, SectionCaps::default());
        assert!(ctx.now.is_empty());
    }

    #[test]
    fn section_caps_are_respected() {
        let events: Vec<Event> = (0..10)
            .map(|i| event("observation", json!({"raw_text": format!("state {i}")})))
            .collect();
        let caps = SectionCaps {
            now_max: 3,
            rules_max: 3,
            next_max: 2,
        };
        let ctx = build_compact_context(&events, caps);
        assert_eq!(ctx.now.len(), 3);
        assert_eq!(ctx.now[0], "state 0");
    }

    #[test]
    fn knowledge_category_routes_to_rules() {
        let events = vec![event(
            "note",
            json!({"raw_text": "always answer in German", "category": "knowledge"}),
        )];
        let ctx = build_compact_context(&events, SectionCaps::default());
        assert!(ctx.now.is_empty());
        assert_eq!(ctx.rules, vec!["always answer in German".to_string()]);
    }

    #[test]
    fn tasks_route_to_next() {
        let events = vec![event("task", json!({"raw_text": "follow up on deploy"}))];
        let ctx = build_compact_context(&events, SectionCaps::default());
        assert_eq!(ctx.next, vec!["follow up on deploy".to_string()]);
    }

    #[test]
    fn format_renders_sections_in_order() {
        let ctx = CompactContext {
            now: vec!["a".into()],
            rules: vec!["b".into()],
            next: vec!["c".into()],
        };
        let text = format_compact_context(&ctx);
        assert_eq!(text, "NOW:\n  - a\nRULES:\n  - b\nNEXT:\n  - c\n");
    }

    #[test]
    fn empty_context_renders_empty() {
        assert_eq!(format_compact_context(&CompactContext::default()), "");
    }
}
