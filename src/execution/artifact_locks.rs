//! Per-artifact lock registry.
//!
//! Every artifact gets one mutex, created on first use. The registry map is
//! locked only while a handle is looked up or inserted, never while a write
//! runs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::workbook::ArtifactId;

/// Lock handle of one artifact.
pub type ArtifactLock = Arc<Mutex<()>>;

#[derive(Debug, Clone, Default)]
pub struct ArtifactLocks {
    locks: Arc<Mutex<HashMap<ArtifactId, ArtifactLock>>>,
}

impl ArtifactLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the lock of `artifact`, creating it if absent.
    pub fn handle(&self, artifact: ArtifactId) -> ArtifactLock {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        locks.entry(artifact).or_default().clone()
    }

    /// Number of artifacts seen so far.
    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn same_artifact_shares_one_lock() {
        let locks = ArtifactLocks::new();
        let a = locks.handle(1);
        let b = locks.handle(1);
        let c = locks.handle(2);

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(locks.len(), 2);
    }

    #[test]
    fn lock_serializes_holders() {
        let locks = ArtifactLocks::new();
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let locks = locks.clone();
                let inside = Arc::clone(&inside);
                let max_inside = Arc::clone(&max_inside);
                thread::spawn(move || {
                    let lock = locks.handle(7);
                    let _guard = lock.lock().expect("lock");
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_inside.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(2));
                    inside.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();

        for handle in handles {
            handle.join().expect("thread");
        }
        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    }
}
