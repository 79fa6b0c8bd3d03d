//! Durable digest pipeline: content-addressed keys, the append-only digest
//! store, cross-process locking, persistent runtime state, and the
//! daily → weekly → archive schedulers driven by the 04:00 worker.

pub mod daily;
pub mod keys;
pub mod lock;
pub mod state;
pub mod store;
pub mod weekly;
pub mod worker;

pub use daily::{CatchUpSummary, DailyDigestScheduler, DailyRunSummary};
pub use lock::{DigestLock, LockService};
pub use state::{RuntimeState, RuntimeStateFile};
pub use store::{DigestRow, DigestStore};
pub use weekly::{CycleSummary, WeeklyDigestArchiver};
pub use worker::{DigestWorker, RunSummary};
