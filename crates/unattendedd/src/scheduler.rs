//! Periodic trigger for update cycles.
//!
//! The task runs once immediately, then the next run is scheduled only after
//! the previous one has finished, so runs never overlap.

use crate::config::UpdateInterval;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    /// `None` runs the task exactly once
    period: Option<Duration>,
}

impl Schedule {
    pub fn once() -> Self {
        Self { period: None }
    }

    pub fn every(period: Duration) -> Self {
        Self {
            period: Some(period),
        }
    }

    pub fn period(&self) -> Option<Duration> {
        self.period
    }
}

impl From<UpdateInterval> for Schedule {
    fn from(interval: UpdateInterval) -> Self {
        Self {
            period: interval.period(),
        }
    }
}

/// Run `task` on `schedule` until cancelled. Returns how many runs completed.
///
/// Cancellation is checked between runs; a run that already started is
/// allowed to finish.
pub async fn run_periodic<F, Fut>(schedule: Schedule, cancel: CancellationToken, mut task: F) -> usize
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut runs = 0usize;
    loop {
        if cancel.is_cancelled() {
            break;
        }

        task().await;
        runs += 1;

        let Some(period) = schedule.period else {
            debug!("One-shot schedule finished");
            break;
        };

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(period) => {}
        }
    }

    info!("Periodic trigger stopped after {} run(s)", runs);
    runs
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_schedule_from_interval() {
        assert_eq!(Schedule::from(UpdateInterval::Startup), Schedule::once());
        assert_eq!(
            Schedule::from(UpdateInterval::Hourly).period(),
            Some(Duration::from_secs(3600))
        );
    }

    #[tokio::test]
    async fn test_once_runs_exactly_once() {
        let runs = run_periodic(Schedule::once(), CancellationToken::new(), || async {}).await;
        assert_eq!(runs, 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let runs = run_periodic(Schedule::every(Duration::from_millis(5)), cancel, || async {}).await;
        assert_eq!(runs, 0);
    }

    #[tokio::test]
    async fn test_first_run_is_immediate() {
        let cancel = CancellationToken::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let handle = tokio::spawn(run_periodic(
            Schedule::every(Duration::from_secs(3600)),
            cancel.clone(),
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            },
        ));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        cancel.cancel();
        assert_eq!(handle.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_runs_do_not_overlap() {
        let cancel = CancellationToken::new();
        let active = Arc::new(AtomicUsize::new(0));
        let overlap = Arc::new(AtomicUsize::new(0));

        let (a, o) = (active.clone(), overlap.clone());
        let handle = tokio::spawn(run_periodic(
            Schedule::every(Duration::from_millis(1)),
            cancel.clone(),
            move || {
                let (active, overlap) = (a.clone(), o.clone());
                async move {
                    if active.fetch_add(1, Ordering::SeqCst) > 0 {
                        overlap.fetch_add(1, Ordering::SeqCst);
                    }
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                }
            },
        ));

        tokio::time::sleep(Duration::from_millis(150)).await;
        cancel.cancel();
        let runs = handle.await.unwrap();
        assert!(runs >= 2, "expected several runs, got {}", runs);
        assert_eq!(overlap.load(Ordering::SeqCst), 0);
    }
}
