//! Execution coordinator.
//!
//! Runs work units on the worker pool. Each unit's blocking I/O runs on the
//! blocking thread pool while it holds a worker permit. Units report success
//! or a captured error (panics included); one failure never cancels its
//! siblings. Cancellation stops scheduling, and units that never started are
//! reported as cancelled.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::WorkerPool;
use crate::error::AppError;
use crate::partition::OutputTarget;

/// Blocking body of a unit. Returns the number of records it moved.
pub type UnitJob = Box<dyn FnOnce(&CancellationToken) -> Result<u64, AppError> + Send + 'static>;

/// What a unit works on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UnitKind {
    /// Ingestion of one input group into staging.
    Group { rank: usize, name: String },
    /// Emission of every segment of one output target.
    Target { target: OutputTarget },
}

/// A schedulable unit of work.
pub struct WorkUnit {
    pub label: String,
    pub kind: UnitKind,
    job: UnitJob,
}

impl WorkUnit {
    pub fn new(
        label: impl Into<String>,
        kind: UnitKind,
        job: impl FnOnce(&CancellationToken) -> Result<u64, AppError> + Send + 'static,
    ) -> Self {
        Self {
            label: label.into(),
            kind,
            job: Box::new(job),
        }
    }
}

impl std::fmt::Debug for WorkUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkUnit")
            .field("label", &self.label)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Final state of a unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UnitStatus {
    Completed { records: u64 },
    Failed { reason: String },
    Cancelled,
}

/// Result of one unit.
#[derive(Debug, Clone, Serialize)]
pub struct UnitResult {
    pub label: String,
    pub kind: UnitKind,
    pub status: UnitStatus,
}

impl UnitResult {
    pub fn is_completed(&self) -> bool {
        matches!(self.status, UnitStatus::Completed { .. })
    }
}

/// Schedules units on a bounded pool.
#[derive(Debug, Clone)]
pub struct Coordinator {
    pool: WorkerPool,
    cancel: CancellationToken,
}

impl Coordinator {
    pub fn new(pool: WorkerPool, cancel: CancellationToken) -> Self {
        Self { pool, cancel }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Runs every unit and waits for all of them. Results come back in unit order.
    pub async fn run(&self, units: Vec<WorkUnit>) -> Vec<UnitResult> {
        let total = units.len();
        let finished = Arc::new(AtomicUsize::new(0));
        let mut slots: Vec<Option<UnitResult>> = vec![None; total];
        let mut meta: Vec<(String, UnitKind)> = Vec::with_capacity(total);
        let mut join_set = JoinSet::new();

        info!(
            "[COORDINATOR] Scheduling {} unit(s) on {} worker(s)",
            total,
            self.pool.workers()
        );

        for (index, unit) in units.into_iter().enumerate() {
            meta.push((unit.label.clone(), unit.kind.clone()));

            let permit = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                permit = self.pool.acquire() => permit.ok(),
            };
            let Some(permit) = permit else {
                slots[index] = Some(UnitResult {
                    label: unit.label,
                    kind: unit.kind,
                    status: UnitStatus::Cancelled,
                });
                continue;
            };

            let cancel = self.cancel.clone();
            let finished = Arc::clone(&finished);
            let WorkUnit { label, kind, job } = unit;

            join_set.spawn(async move {
                let _permit = permit;
                debug!(unit = %label, "Unit started");

                let job_cancel = cancel.clone();
                let outcome = tokio::task::spawn_blocking(move || job(&job_cancel)).await;

                let status = match outcome {
                    Ok(Ok(records)) => UnitStatus::Completed { records },
                    Ok(Err(AppError::Cancelled)) => UnitStatus::Cancelled,
                    Ok(Err(e)) => {
                        error!("[COORDINATOR] Unit {} failed: {}", label, e);
                        UnitStatus::Failed {
                            reason: e.to_string(),
                        }
                    }
                    Err(join_error) => {
                        error!("[COORDINATOR] Unit {} panicked: {}", label, join_error);
                        UnitStatus::Failed {
                            reason: format!("unit panicked: {}", join_error),
                        }
                    }
                };

                let done = finished.fetch_add(1, Ordering::SeqCst) + 1;
                info!("[COORDINATOR] {}/{} units finished", done, total);

                (
                    index,
                    UnitResult {
                        label,
                        kind,
                        status,
                    },
                )
            });
        }

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, result)) => slots[index] = Some(result),
                Err(join_error) => warn!("[COORDINATOR] Task join error: {}", join_error),
            }
        }

        slots
            .into_iter()
            .zip(meta)
            .map(|(slot, (label, kind))| {
                slot.unwrap_or(UnitResult {
                    label,
                    kind,
                    status: UnitStatus::Failed {
                        reason: "unit did not report a result".into(),
                    },
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn target_kind(group: u64) -> UnitKind {
        UnitKind::Target {
            target: OutputTarget { artifact: 1, group },
        }
    }

    fn coordinator(workers: usize) -> Coordinator {
        Coordinator::new(
            WorkerPool::new(workers).expect("pool"),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn failures_and_panics_do_not_stop_siblings() {
        let units = vec![
            WorkUnit::new("ok", target_kind(1), |_| Ok(3)),
            WorkUnit::new("fails", target_kind(2), |_| {
                Err(AppError::Io("disk full".into()))
            }),
            WorkUnit::new("panics", target_kind(3), |_| panic!("boom")),
            WorkUnit::new("ok too", target_kind(4), |_| Ok(5)),
        ];

        let results = coordinator(2).run(units).await;

        assert_eq!(results.len(), 4);
        assert_eq!(results[0].status, UnitStatus::Completed { records: 3 });
        assert!(
            matches!(&results[1].status, UnitStatus::Failed { reason } if reason.contains("disk full"))
        );
        assert!(
            matches!(&results[2].status, UnitStatus::Failed { reason } if reason.contains("panicked"))
        );
        assert_eq!(results[3].status, UnitStatus::Completed { records: 5 });
    }

    #[tokio::test]
    async fn concurrency_is_bounded_by_the_pool() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let units = (0..8u64)
            .map(|i| {
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                WorkUnit::new(format!("unit {}", i), target_kind(i + 1), move |_| {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(10));
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(1)
                })
            })
            .collect();

        let results = coordinator(3).run(units).await;
        assert!(results.iter().all(UnitResult::is_completed));
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn cancellation_reports_unstarted_units() {
        let coordinator = coordinator(1);
        let cancel = coordinator.cancel_token().clone();

        let units = (0..4u64)
            .map(|i| {
                let cancel = cancel.clone();
                WorkUnit::new(format!("unit {}", i), target_kind(i + 1), move |_| {
                    if i == 0 {
                        cancel.cancel();
                        std::thread::sleep(Duration::from_millis(20));
                    }
                    Ok(1)
                })
            })
            .collect();

        let results = coordinator.run(units).await;
        assert!(results[0].is_completed());
        assert!(results[1..]
            .iter()
            .all(|r| r.status == UnitStatus::Cancelled));
    }

    #[tokio::test]
    async fn unit_observing_cancellation_reports_cancelled() {
        let coordinator = coordinator(1);
        coordinator.cancel_token().cancel();

        let results = coordinator
            .run(vec![WorkUnit::new("late", target_kind(1), |_| Ok(1))])
            .await;
        assert_eq!(results[0].status, UnitStatus::Cancelled);
    }
}
