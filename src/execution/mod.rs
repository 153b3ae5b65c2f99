//! Work scheduling: worker pool, per-artifact locks, the coordinator and the
//! run summary.

mod artifact_locks;
mod coordinator;
mod summary;
mod worker_pool;

pub use artifact_locks::{ArtifactLock, ArtifactLocks};
pub use coordinator::{Coordinator, UnitJob, UnitKind, UnitResult, UnitStatus, WorkUnit};
pub use summary::{RunMode, RunSummary, UnitFailure};
pub use worker_pool::{WorkerPermit, WorkerPool};
