//! Janitor sweeps (spec.md §4.8)
//!
//! Nine periodic sweeps share one contract: pick the single row with
//! the earliest `next_…_at ≤ now`, process it, reschedule it with
//! jitter. [`scheduler`] drives each sweep on its own poll loop; the
//! sweeps themselves depend only on [`crate::store::Store`] plus
//! whichever driver trait their domain needs.

pub mod account_reconcile;
pub mod blob_sweep;
pub mod federation_announce;
pub mod manifest_gc;
pub mod manifest_sync;
pub mod mount_sweep;
pub mod scheduler;
pub mod storage_sweep;
pub mod validation_sweep;
pub mod vuln_check;

use crate::error::Result;
use async_trait::async_trait;

/// What one `run_once` call did, for logging at the scheduler call site.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    pub processed: u32,
}

impl SweepOutcome {
    pub const NOTHING_DUE: Self = SweepOutcome { processed: 0 };

    pub fn one() -> Self {
        SweepOutcome { processed: 1 }
    }
}

/// One janitor sweep (spec.md §4.8). `run_once` does at most one unit
/// of work (one due account or repository) and returns promptly either
/// way; [`scheduler::run`] calls it in a loop.
#[async_trait]
pub trait Sweep: Send + Sync {
    fn name(&self) -> &'static str;
    async fn run_once(&self) -> Result<SweepOutcome>;
}
