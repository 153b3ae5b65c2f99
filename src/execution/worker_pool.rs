//! Worker pool for concurrency control.
//!
//! Limits the number of work units running at once. Each unit holds a permit
//! for its whole lifetime; the permit is released when dropped.
//!
//! # Usage
//!
//! ```ignore
//! let pool = WorkerPool::new(4)?;
//!
//! // Acquire a permit (waits if all workers are busy)
//! let permit = pool.acquire().await?;
//!
//! // Run the unit while holding the permit...
//!
//! drop(permit);
//! ```

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::AppError;

// ─────────────────────────────────────────────────────────────────────────────
// WorkerPool
// ─────────────────────────────────────────────────────────────────────────────

/// Semaphore-bounded pool of worker slots.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    sem: Arc<Semaphore>,
    max: usize,
}

impl WorkerPool {
    /// Creates a pool with `workers` slots.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidConfig` if `workers` is 0.
    pub fn new(workers: usize) -> Result<Self, AppError> {
        if workers == 0 {
            return Err(AppError::InvalidConfig(
                "worker count must be at least 1".into(),
            ));
        }

        Ok(Self {
            sem: Arc::new(Semaphore::new(workers)),
            max: workers,
        })
    }

    /// Acquires a permit, waiting if every worker is busy.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Cancelled` if the semaphore has been closed.
    pub async fn acquire(&self) -> Result<WorkerPermit, AppError> {
        let permit = self
            .sem
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| AppError::Cancelled)?;

        Ok(WorkerPermit { _permit: permit })
    }

    pub fn workers(&self) -> usize {
        self.max
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// WorkerPermit
// ─────────────────────────────────────────────────────────────────────────────

/// A busy worker slot, released on drop.
#[derive(Debug)]
pub struct WorkerPermit {
    _permit: OwnedSemaphorePermit,
}
