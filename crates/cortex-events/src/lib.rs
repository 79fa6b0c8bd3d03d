//! Typed-state event ingestion: CSV loading with rank-based selection,
//! just-in-time gating, and the compact NOW/RULES/NEXT context builder.

pub mod compact;
pub mod loader;
pub mod rank;

pub use compact::{build_compact_context, format_compact_context, CompactContext, SectionCaps};
pub use loader::{
    load_csv_events, maybe_load_csv_events, JitTelemetry, JitTrigger, LoadFilter, LoadGates,
};
