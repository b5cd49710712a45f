//! The simulated critical resource.
//!
//! Nodes announce entering and leaving `UsingResource` here. Nothing in the
//! protocol depends on it; it only observes, so that overlapping use shows up
//! as a counted violation instead of going unnoticed.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{error, trace};

use crate::message::NodeId;

const FREE: u64 = 0;

#[derive(Debug, Default)]
pub struct SharedResource {
    holder: AtomicU64,
    uses: AtomicU64,
    violations: AtomicU64,
}

impl SharedResource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `id` as the user of the resource. Returns `false`, and records a
    /// violation, if another node is already using it.
    pub fn enter(&self, id: NodeId) -> bool {
        match self
            .holder
            .compare_exchange(FREE, id.as_u64(), Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                self.uses.fetch_add(1, Ordering::Relaxed);
                trace!(node = %id, "entered shared resource");
                true
            }
            Err(current) => {
                self.violations.fetch_add(1, Ordering::Relaxed);
                error!(node = %id, holder = current, "mutual exclusion violated");
                false
            }
        }
    }

    /// Frees the resource if `id` holds it.
    pub fn leave(&self, id: NodeId) {
        let _ = self
            .holder
            .compare_exchange(id.as_u64(), FREE, Ordering::AcqRel, Ordering::Acquire);
    }

    /// Node currently inside, if any.
    pub fn holder(&self) -> Option<NodeId> {
        match self.holder.load(Ordering::Acquire) {
            FREE => None,
            id => Some(NodeId::new(id)),
        }
    }

    /// Successful entries so far.
    pub fn uses(&self) -> u64 {
        self.uses.load(Ordering::Relaxed)
    }

    /// Entries refused because another node was already inside.
    pub fn violations(&self) -> u64 {
        self.violations.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_overlapping_use() {
        let resource = SharedResource::new();
        assert!(resource.enter(NodeId::new(1)));
        assert!(!resource.enter(NodeId::new(2)));
        assert_eq!(resource.violations(), 1);

        // Only the holder can free it.
        resource.leave(NodeId::new(2));
        assert_eq!(resource.holder(), Some(NodeId::new(1)));
        resource.leave(NodeId::new(1));
        assert_eq!(resource.holder(), None);

        assert!(resource.enter(NodeId::new(2)));
        assert_eq!(resource.uses(), 2);
    }
}
