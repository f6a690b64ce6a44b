//! Per-deployment exclusive leases and cooperative cancellation.
//!
//! Any transition-causing operation must hold the deployment's lease; the
//! table therefore serializes mutating operations per id. Leases live only
//! in process memory: they are re-derivable from the repository on restart,
//! never a source of truth.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// What an in-flight task should do when it notices it was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelIntent {
    /// Route into the STOPPING cleanup path and stop the workload.
    Stop,
    /// Route into the STOPPING cleanup path, tear down, remove the record.
    Delete,
}

const CANCEL_NONE: u8 = 0;
const CANCEL_STOP: u8 = 1;
const CANCEL_DELETE: u8 = 2;

/// Cooperative cancellation flag, consulted at safe checkpoints inside a
/// running task. Cancellation never force-kills partially created
/// infrastructure; the task routes into cleanup itself.
#[derive(Debug, Clone)]
pub struct CancelFlag(Arc<AtomicU8>);

impl CancelFlag {
    fn new() -> Self {
        Self(Arc::new(AtomicU8::new(CANCEL_NONE)))
    }

    /// A detached flag no lease table will ever signal. Teardown paths that
    /// must run to completion use this instead of the original flag.
    pub fn inert() -> Self {
        Self::new()
    }

    pub fn request(&self, intent: CancelIntent) {
        let value = match intent {
            CancelIntent::Stop => CANCEL_STOP,
            CancelIntent::Delete => CANCEL_DELETE,
        };
        // Delete outranks stop; never downgrade an existing delete request.
        let _ = self.0.fetch_max(value, Ordering::AcqRel);
    }

    pub fn pending(&self) -> Option<CancelIntent> {
        match self.0.load(Ordering::Acquire) {
            CANCEL_STOP => Some(CancelIntent::Stop),
            CANCEL_DELETE => Some(CancelIntent::Delete),
            _ => None,
        }
    }
}

struct LeaseEntry {
    operation: &'static str,
    cancel: CancelFlag,
    acquired_at: Instant,
}

/// Process-wide table of per-deployment leases. Clones share the same
/// underlying table.
#[derive(Default, Clone)]
pub struct LeaseTable {
    entries: Arc<DashMap<Uuid, LeaseEntry>>,
}

/// RAII lease: the deployment's lease is released when the guard drops,
/// including when an abandoned task is aborted during shutdown.
pub struct LeaseGuard {
    entries: Arc<DashMap<Uuid, LeaseEntry>>,
    id: Uuid,
    cancel: CancelFlag,
    operation: &'static str,
}

impl LeaseGuard {
    pub fn deployment_id(&self) -> Uuid {
        self.id
    }

    pub fn operation(&self) -> &'static str {
        self.operation
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        self.entries.remove(&self.id);
    }
}

impl LeaseTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the exclusive lease for a deployment id, or `None` if an
    /// operation is already in flight.
    pub fn acquire(&self, id: Uuid, operation: &'static str) -> Option<LeaseGuard> {
        match self.entries.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(_) => None,
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                let cancel = CancelFlag::new();
                vacant.insert(LeaseEntry {
                    operation,
                    cancel: cancel.clone(),
                    acquired_at: Instant::now(),
                });
                Some(LeaseGuard {
                    entries: self.entries.clone(),
                    id,
                    cancel,
                    operation,
                })
            }
        }
    }

    /// Whether a mutating operation currently holds the lease.
    pub fn is_held(&self, id: Uuid) -> bool {
        self.entries.contains_key(&id)
    }

    /// Operation label of the current holder, if any.
    pub fn holder(&self, id: Uuid) -> Option<&'static str> {
        self.entries.get(&id).map(|entry| entry.operation)
    }

    /// Signal the in-flight task for `id` to cancel at its next checkpoint.
    /// Returns false when no operation holds the lease.
    pub fn request_cancel(&self, id: Uuid, intent: CancelIntent) -> bool {
        match self.entries.get(&id) {
            Some(entry) => {
                entry.cancel.request(intent);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Age of the lease for diagnostics.
    pub fn held_for(&self, id: Uuid) -> Option<std::time::Duration> {
        self.entries.get(&id).map(|entry| entry.acquired_at.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_acquire_conflicts() {
        let table = LeaseTable::new();
        let id = Uuid::new_v4();

        let guard = table.acquire(id, "deploy").unwrap();
        assert!(table.is_held(id));
        assert_eq!(table.holder(id), Some("deploy"));
        assert!(table.acquire(id, "scale").is_none());

        drop(guard);
        assert!(!table.is_held(id));
        assert!(table.acquire(id, "scale").is_some());
    }

    #[test]
    fn test_leases_are_per_id() {
        let table = LeaseTable::new();
        let _a = table.acquire(Uuid::new_v4(), "deploy").unwrap();
        let _b = table.acquire(Uuid::new_v4(), "deploy").unwrap();
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_cancel_reaches_holder() {
        let table = LeaseTable::new();
        let id = Uuid::new_v4();
        let guard = table.acquire(id, "deploy").unwrap();
        let flag = guard.cancel_flag();

        assert_eq!(flag.pending(), None);
        assert!(table.request_cancel(id, CancelIntent::Stop));
        assert_eq!(flag.pending(), Some(CancelIntent::Stop));

        // Delete outranks a previous stop request.
        assert!(table.request_cancel(id, CancelIntent::Delete));
        assert_eq!(flag.pending(), Some(CancelIntent::Delete));
        assert!(table.request_cancel(id, CancelIntent::Stop));
        assert_eq!(flag.pending(), Some(CancelIntent::Delete));
    }

    #[test]
    fn test_cancel_without_holder_is_false() {
        let table = LeaseTable::new();
        assert!(!table.request_cancel(Uuid::new_v4(), CancelIntent::Stop));
    }
}
