//! Host-facing lifecycle hooks: create nodes, promote a coordinator, rotate
//! it, shut nodes down.
//!
//! # Rotation
//!
//! [`Cluster::rotate_coordinator`] models coordinator failure, not a graceful
//! handoff. The steps run strictly in this order, so at no instant are two
//! coordinator instances attached:
//!
//! 1. Withdraw the published coordinator pointer. Requests and releases sent
//!    from here on are dropped and retried by each node's cadence.
//! 2. Detach the old coordinator's role, remove it from the directory and
//!    shut it down.
//! 3. Under [`Handoff::Destructive`] discard lock and queue. Under
//!    [`Handoff::Preserve`] keep them, minus the retired node's own entries
//!    and an occupant that is no longer using the resource. Whenever the
//!    successor starts with an empty lock, every survivor abandons its
//!    request or current use.
//! 4. Attach the role to the successor.
//! 5. Publish the successor's endpoint. Under [`Handoff::Preserve`], if an
//!    occupancy was evicted in step 2 or 3, the next waiter's grant is sent
//!    only now.

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use crate::config::ProtocolConfig;
use crate::coordinator::CoordinatorState;
use crate::directory::{CoordinatorRef, Directory, Endpoint};
use crate::election::{Handoff, SuccessorStrategy};
use crate::message::NodeId;
use crate::node::{spawn_node, NodeContext, NodeHandle, NodeState, NodeStatus, NodeStopped};
use crate::resource::SharedResource;
use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("node {0} is not part of the cluster")]
    UnknownNode(NodeId),
    #[error("node {0} already exists")]
    DuplicateNode(NodeId),
    #[error("node ids must be positive")]
    InvalidId,
    #[error("no live node can take the coordinator role")]
    NoLiveNodes,
    #[error("coordinator {0} is the only live node; no successor available")]
    NoSuccessor(NodeId),
    #[error(transparent)]
    NodeStopped(#[from] NodeStopped),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// The set of live nodes plus the state they share.
pub struct Cluster {
    context: NodeContext,
    handoff: Handoff,
    strategy: Box<dyn SuccessorStrategy>,
    nodes: BTreeMap<NodeId, NodeHandle>,
    next_id: u64,
}

impl Cluster {
    /// Empty cluster. Nodes share one directory and one [`SharedResource`].
    pub fn new(
        config: ProtocolConfig,
        handoff: Handoff,
        strategy: impl SuccessorStrategy + 'static,
    ) -> Self {
        Self::with_strategy(config, handoff, Box::new(strategy))
    }

    /// Like [`Cluster::new`], for a strategy that is already boxed.
    pub fn with_strategy(
        config: ProtocolConfig,
        handoff: Handoff,
        strategy: Box<dyn SuccessorStrategy>,
    ) -> Self {
        Self {
            context: NodeContext {
                directory: Arc::new(Directory::new()),
                resource: Arc::new(SharedResource::new()),
                config,
            },
            handoff,
            strategy,
            nodes: BTreeMap::new(),
            next_id: 1,
        }
    }

    /// Membership and coordinator pointer shared by every node.
    pub fn directory(&self) -> &Arc<Directory> {
        &self.context.directory
    }

    /// The observed resource, for use and violation counts.
    pub fn resource(&self) -> &Arc<SharedResource> {
        &self.context.resource
    }

    /// Policy applied to lock and queue on every coordinator change.
    pub fn handoff(&self) -> Handoff {
        self.handoff
    }

    /// Handle of live node `id`.
    pub fn node(&self, id: NodeId) -> Option<&NodeHandle> {
        self.nodes.get(&id)
    }

    /// Live ids in ascending order.
    pub fn ids(&self) -> Vec<NodeId> {
        self.nodes.keys().copied().collect()
    }

    /// Number of live nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Id of the published coordinator.
    pub fn coordinator(&self) -> Option<NodeId> {
        self.context.directory.coordinator().map(|c| c.id)
    }

    /// Id the next [`Cluster::spawn_node`] call will use.
    pub fn next_id(&self) -> NodeId {
        NodeId::new(self.next_id)
    }

    /// Starts a node with an explicit id, binds `endpoint` and registers the
    /// bound address. The node starts `Idle` and plain, and its retry cadence
    /// begins one interval later.
    ///
    /// Fails with [`ClusterError::InvalidId`] for id 0,
    /// [`ClusterError::DuplicateNode`] for a live id, and
    /// [`ClusterError::Transport`] when the bind fails.
    pub async fn create_node(
        &mut self,
        id: NodeId,
        endpoint: Endpoint,
    ) -> Result<&NodeHandle, ClusterError> {
        if id.as_u64() == 0 {
            return Err(ClusterError::InvalidId);
        }
        if self.nodes.contains_key(&id) {
            return Err(ClusterError::DuplicateNode(id));
        }

        let handle = spawn_node(id, endpoint, self.context.clone()).await?;
        self.next_id = self.next_id.max(id.as_u64() + 1);
        Ok(self.nodes.entry(id).or_insert(handle))
    }

    /// Starts a node under the next free id.
    pub async fn spawn_node(&mut self, endpoint: Endpoint) -> Result<&NodeHandle, ClusterError> {
        let id = self.next_id();
        self.create_node(id, endpoint).await
    }

    /// Makes `id` the coordinator. A node that already coordinates is demoted
    /// first and stays alive; its lock and queue follow the handoff policy.
    pub async fn promote_to_coordinator(&mut self, id: NodeId) -> Result<(), ClusterError> {
        if !self.nodes.contains_key(&id) {
            return Err(ClusterError::UnknownNode(id));
        }
        let current = self.coordinator();
        if current == Some(id) {
            return Ok(());
        }

        self.context.directory.set_coordinator(None);
        let carried = match current.and_then(|old| self.nodes.get(&old)) {
            Some(old) => old.demote().await.unwrap_or_else(|err| {
                warn!(error = %err, "previous coordinator stopped before demotion");
                None
            }),
            None => None,
        };

        self.install(id, carried, None).await
    }

    /// Replaces the coordinator with a successor picked by the strategy and
    /// retires the old one. Returns the new coordinator's id.
    ///
    /// Fails without changing anything when there is no live node, or when
    /// the coordinator is the only one.
    pub async fn rotate_coordinator(&mut self) -> Result<NodeId, ClusterError> {
        if self.nodes.is_empty() {
            return Err(ClusterError::NoLiveNodes);
        }
        let current = self.coordinator();
        let candidates: Vec<NodeId> = self
            .nodes
            .keys()
            .copied()
            .filter(|id| Some(*id) != current)
            .collect();
        let successor = match (candidates.is_empty(), current) {
            (true, Some(only)) => return Err(ClusterError::NoSuccessor(only)),
            (true, None) => return Err(ClusterError::NoLiveNodes),
            (false, _) => self
                .strategy
                .choose(&candidates)
                .ok_or(ClusterError::NoLiveNodes)?,
        };
        if !candidates.contains(&successor) {
            return Err(ClusterError::UnknownNode(successor));
        }

        info!(old = ?current, new = %successor, handoff = ?self.handoff, "rotating coordinator");
        self.context.directory.set_coordinator(None);

        let mut carried = None;
        let mut pending_grant = None;
        if let Some(old) = current {
            if let Some(handle) = self.nodes.remove(&old) {
                let state = handle.demote().await.unwrap_or_else(|err| {
                    warn!(error = %err, "coordinator stopped before demotion");
                    None
                });
                self.context.directory.remove(old);
                handle.shutdown().await;
                info!(node = %old, "former coordinator retired");

                if let Some(mut state) = state {
                    pending_grant = state.evict(old);
                    carried = Some(state);
                }
            }
        }

        self.install(successor, carried, pending_grant).await?;
        Ok(successor)
    }

    /// Stops node `id` and removes it from the directory. If it was the
    /// coordinator the pointer is withdrawn and the cluster has none until the
    /// next promotion or rotation.
    pub async fn shutdown(&mut self, id: NodeId) -> Result<(), ClusterError> {
        let handle = self
            .nodes
            .remove(&id)
            .ok_or(ClusterError::UnknownNode(id))?;
        self.context.directory.remove(id);
        handle.shutdown().await;
        Ok(())
    }

    /// Withdraws the coordinator pointer and stops every node, in id order.
    pub async fn shutdown_all(&mut self) {
        self.context.directory.set_coordinator(None);
        for (id, handle) in std::mem::take(&mut self.nodes) {
            self.context.directory.remove(id);
            handle.shutdown().await;
        }
    }

    /// Status of every live node, in id order. Nodes that stopped on their
    /// own are skipped.
    pub async fn statuses(&self) -> Vec<NodeStatus> {
        let mut statuses = Vec::with_capacity(self.nodes.len());
        for handle in self.nodes.values() {
            if let Ok(status) = handle.status().await {
                statuses.push(status);
            }
        }
        statuses
    }

    /// Applies the handoff policy to the old coordinator's state, attaches the
    /// role to `successor` and publishes it.
    async fn install(
        &mut self,
        successor: NodeId,
        carried: Option<CoordinatorState>,
        pending_grant: Option<NodeId>,
    ) -> Result<(), ClusterError> {
        let (state, grant) = match (self.handoff, carried) {
            (Handoff::Preserve, Some(mut state)) => {
                let grant = match pending_grant {
                    Some(grantee) => Some(grantee),
                    None => self.reclaim_stale_occupancy(&mut state).await,
                };
                (state, grant)
            }
            (Handoff::Destructive, Some(state)) => {
                info!(
                    occupant = ?state.occupant(),
                    discarded = state.queue().len(),
                    "discarding lock and queue"
                );
                (CoordinatorState::new(), None)
            }
            (_, None) => (CoordinatorState::new(), None),
        };

        // An empty lock must not be published while a node still uses the
        // resource under an earlier grant.
        if state.occupant().is_none() && grant.is_none() {
            self.abandon_all_usage().await;
        }

        let handle = self
            .nodes
            .get(&successor)
            .ok_or(ClusterError::UnknownNode(successor))?;
        handle.promote(state).await?;
        self.context.directory.set_coordinator(Some(CoordinatorRef {
            id: successor,
            endpoint: handle.endpoint(),
        }));
        info!(node = %successor, endpoint = %handle.endpoint(), "coordinator published");

        // Grantees only trust grants from the published coordinator, so a
        // carried grant goes out after publication.
        if let Some(grantee) = grant {
            handle.resume_grant(grantee).await?;
        }
        Ok(())
    }

    /// A carried lock can name a node that has stopped using the resource,
    /// for instance when its release was lost in transit. That occupancy is
    /// evicted so the queue moves again. The node is reset first, so a grant
    /// still in flight from a retired coordinator cannot put it back in use.
    ///
    /// Returns the next occupant to grant, if any.
    async fn reclaim_stale_occupancy(&self, state: &mut CoordinatorState) -> Option<NodeId> {
        let occupant = state.occupant()?;
        if let Some(handle) = self.nodes.get(&occupant) {
            match handle.status().await {
                Ok(status) if status.state == NodeState::UsingResource => return None,
                Ok(_) => {
                    if let Err(err) = handle.abandon_usage().await {
                        warn!(error = %err, "could not reset stale occupant");
                    }
                }
                Err(err) => warn!(error = %err, "carried occupant has stopped"),
            }
        }
        info!(node = %occupant, "carried occupant is not using the resource; evicting");
        state.evict(occupant)
    }

    async fn abandon_all_usage(&self) {
        for handle in self.nodes.values() {
            if let Err(err) = handle.abandon_usage().await {
                warn!(error = %err, "could not reset node after rotation");
            }
        }
    }
}
