//! Membership directory shared by every node and by the rotation procedure.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::message::NodeId;

/// Where datagrams for a node are delivered.
pub type Endpoint = SocketAddr;

/// The published coordinator: where requests and releases must be sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorRef {
    pub id: NodeId,
    pub endpoint: Endpoint,
}

/// Maps live node ids to their endpoints and holds the coordinator pointer.
///
/// Each operation takes the lock once, so readers on a node's request path
/// never observe a half-applied registration, removal or rotation.
#[derive(Debug, Default)]
pub struct Directory {
    inner: RwLock<Members>,
}

#[derive(Debug, Default)]
struct Members {
    nodes: BTreeMap<NodeId, Endpoint>,
    coordinator: Option<CoordinatorRef>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or overwrites the endpoint for `id`.
    pub fn register(&self, id: NodeId, endpoint: Endpoint) {
        self.write().nodes.insert(id, endpoint);
    }

    /// Removes `id`. If it was the published coordinator the pointer is
    /// cleared as well, so nobody keeps sending to a dead endpoint.
    pub fn remove(&self, id: NodeId) -> Option<Endpoint> {
        let mut members = self.write();
        if members.coordinator.map(|c| c.id) == Some(id) {
            members.coordinator = None;
        }
        members.nodes.remove(&id)
    }

    /// Endpoint of `id`, or `None` once it has been removed. Callers sending
    /// a grant treat `None` as undeliverable.
    pub fn lookup_endpoint(&self, id: NodeId) -> Option<Endpoint> {
        self.read().nodes.get(&id).copied()
    }

    /// Publishes or withdraws the coordinator. Only rotation and promotion
    /// call this.
    pub fn set_coordinator(&self, coordinator: Option<CoordinatorRef>) {
        self.write().coordinator = coordinator;
    }

    /// Currently published coordinator, if any.
    pub fn coordinator(&self) -> Option<CoordinatorRef> {
        self.read().coordinator
    }

    /// Where requests and releases go right now.
    pub fn coordinator_endpoint(&self) -> Option<Endpoint> {
        self.coordinator().map(|c| c.endpoint)
    }

    // Every write leaves `Members` consistent, so a poisoned lock is still safe to use.
    fn read(&self) -> RwLockReadGuard<'_, Members> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Members> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}
