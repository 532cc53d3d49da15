//! Sweep scheduler (spec.md §4.8)
//!
//! Runs each [`Sweep`] on its own polling loop: call `run_once`; if it
//! processed something, loop again immediately (more may be due);
//! otherwise sleep a jittered interval before trying again. The actual
//! due-row selection lives in the `Store`'s `next_…_at` columns — this
//! loop only needs to poll often enough that newly-due rows are picked
//! up promptly, and jitter its idle sleep so that multiple janitor
//! workers don't all wake up in lockstep (spec.md §4.8: "Scheduling
//! jitter is drawn uniformly from a bounded fraction of the interval").

use super::{Sweep, SweepOutcome};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Run `sweep` until `cancel` fires.
pub async fn run(sweep: Arc<dyn Sweep>, poll_interval: Duration, jitter_fraction: f64, cancel: CancellationToken) {
    loop {
        if cancel.is_cancelled() {
            return;
        }
        match sweep.run_once().await {
            Ok(SweepOutcome { processed }) if processed > 0 => {
                debug!(sweep = sweep.name(), processed, "sweep processed a row");
                continue;
            }
            Ok(_) => {}
            Err(err) => error!(sweep = sweep.name(), error = %err, "sweep failed"),
        }
        tokio::select! {
            _ = tokio::time::sleep(jittered(poll_interval, jitter_fraction)) => {}
            _ = cancel.cancelled() => return,
        }
    }
}

fn jittered(base: Duration, fraction: f64) -> Duration {
    let jitter_max = base.as_secs_f64() * fraction.clamp(0.0, 1.0);
    let jitter = if jitter_max > 0.0 { rand::thread_rng().gen_range(0.0..=jitter_max) } else { 0.0 };
    Duration::from_secs_f64(base.as_secs_f64() + jitter)
}

/// Spawn every sweep on its own task, returning join handles so the
/// caller can await a clean shutdown after cancelling.
pub fn spawn_all(
    sweeps: Vec<Arc<dyn Sweep>>,
    poll_interval: Duration,
    jitter_fraction: f64,
    cancel: &CancellationToken,
) -> Vec<tokio::task::JoinHandle<()>> {
    sweeps
        .into_iter()
        .map(|sweep| {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                info!(sweep = sweep.name(), "janitor sweep started");
                run(sweep, poll_interval, jitter_fraction, cancel).await;
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_never_shrinks_the_base_interval() {
        let base = Duration::from_secs(10);
        for _ in 0..20 {
            let d = jittered(base, 0.1);
            assert!(d >= base);
            assert!(d <= base + Duration::from_secs(1));
        }
    }

    #[test]
    fn zero_jitter_fraction_is_exact() {
        let base = Duration::from_secs(5);
        assert_eq!(jittered(base, 0.0), base);
    }
}
