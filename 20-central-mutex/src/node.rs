//! Per-participant node actor.
//!
//! Each node runs as one tokio task that owns everything mutable about it:
//! its usage state, its [`Role`] (and with it the coordinator's lock and
//! queue), its socket and its usage timer. Four event sources feed the task:
//!
//! - **Commands** from the host through a [`NodeHandle`]
//! - **Datagrams** from other nodes
//! - **Retry cadence**: a periodic tick that (re)sends a request while the
//!   node is not using the resource
//! - **Usage timer**: fires once per grant and triggers the release
//!
//! Because a single task handles all of them, admission operations on a
//! coordinator never interleave, and a timer that belongs to a stopped node
//! is dropped with it instead of firing into a discarded role.

use std::future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::select;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior, Sleep};
use tracing::{debug, info, warn};

use crate::config::{tick_period, ProtocolConfig};
use crate::coordinator::{Admission, CoordinatorState, Role};
use crate::directory::{Directory, Endpoint};
use crate::message::{Message, NodeId};
use crate::resource::SharedResource;
use crate::transport::{MAX_DATAGRAM, Transport, TransportError};

const COMMAND_BUFFER: usize = 64;

/// Requester-side state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Idle,
    AwaitingGrant,
    UsingResource,
}

/// Snapshot of a node, as returned by [`NodeHandle::status`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    pub id: NodeId,
    pub endpoint: Endpoint,
    pub state: NodeState,
    pub is_coordinator: bool,
    /// Occupant recorded by this node's lock; always `None` for plain nodes.
    pub occupant: Option<NodeId>,
    /// Waiters in this node's queue; always empty for plain nodes.
    pub queue: Vec<NodeId>,
    pub completed_uses: u64,
}

#[derive(Debug, Error)]
#[error("node {0} has stopped")]
pub struct NodeStopped(pub NodeId);

/// Everything a node shares with the rest of the cluster.
#[derive(Debug, Clone)]
pub struct NodeContext {
    pub directory: Arc<Directory>,
    pub resource: Arc<SharedResource>,
    pub config: ProtocolConfig,
}

/// Deferred release of the resource, armed once per grant.
///
/// Dropping or cancelling the timer guarantees the release never fires.
#[derive(Debug, Default)]
pub struct UsageTimer {
    deadline: Option<Pin<Box<Sleep>>>,
}

impl UsageTimer {
    /// Starts the countdown, replacing any deadline already armed.
    pub fn arm(&mut self, duration: Duration) {
        self.deadline = Some(Box::pin(time::sleep(duration)));
    }

    /// Disarms the timer. Returns whether it was armed.
    pub fn cancel(&mut self) -> bool {
        self.deadline.take().is_some()
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Completes when the armed deadline passes, then disarms. Pending forever
    /// while disarmed. Dropping the future early keeps the deadline.
    pub async fn expired(&mut self) {
        if let Some(deadline) = self.deadline.as_mut() {
            deadline.await;
            self.deadline = None;
        } else {
            future::pending::<()>().await;
        }
    }
}

enum NodeCommand {
    Request,
    FinishUsage,
    Promote {
        state: CoordinatorState,
        respond_to: oneshot::Sender<()>,
    },
    ResumeGrant {
        grantee: NodeId,
        respond_to: oneshot::Sender<()>,
    },
    Demote {
        respond_to: oneshot::Sender<Option<CoordinatorState>>,
    },
    AbandonUsage {
        respond_to: oneshot::Sender<()>,
    },
    Status {
        respond_to: oneshot::Sender<NodeStatus>,
    },
    Shutdown,
}

/// Host-side handle to a running node.
#[derive(Debug)]
pub struct NodeHandle {
    id: NodeId,
    endpoint: Endpoint,
    commands: mpsc::Sender<NodeCommand>,
    task: JoinHandle<()>,
}

impl NodeHandle {
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// The endpoint the node's socket is actually bound to.
    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    /// Runs one retry-cadence step now instead of waiting for the next tick.
    pub async fn request(&self) -> Result<(), NodeStopped> {
        self.send(NodeCommand::Request).await
    }

    /// Ends the current usage interval early. No-op unless the node is using
    /// the resource.
    pub async fn finish_usage(&self) -> Result<(), NodeStopped> {
        self.send(NodeCommand::FinishUsage).await
    }

    /// Snapshot of the node, taken between two events so it is always
    /// consistent. Fails once the node has stopped.
    pub async fn status(&self) -> Result<NodeStatus, NodeStopped> {
        let (respond_to, response) = oneshot::channel();
        self.send(NodeCommand::Status { respond_to }).await?;
        response.await.map_err(|_| NodeStopped(self.id))
    }

    /// Attaches the coordinator role carrying `state`.
    pub async fn promote(&self, state: CoordinatorState) -> Result<(), NodeStopped> {
        let (respond_to, response) = oneshot::channel();
        self.send(NodeCommand::Promote { state, respond_to }).await?;
        response.await.map_err(|_| NodeStopped(self.id))
    }

    /// Sends the grant for `grantee` that a carried lock already records. Only
    /// acts when this node coordinates and `grantee` is its occupant.
    pub async fn resume_grant(&self, grantee: NodeId) -> Result<(), NodeStopped> {
        let (respond_to, response) = oneshot::channel();
        self.send(NodeCommand::ResumeGrant {
            grantee,
            respond_to,
        })
        .await?;
        response.await.map_err(|_| NodeStopped(self.id))
    }

    /// Detaches the coordinator role and hands back its lock and queue.
    pub async fn demote(&self) -> Result<Option<CoordinatorState>, NodeStopped> {
        let (respond_to, response) = oneshot::channel();
        self.send(NodeCommand::Demote { respond_to }).await?;
        response.await.map_err(|_| NodeStopped(self.id))
    }

    /// Drops any request in flight or usage in progress without telling the
    /// coordinator. Used when the coordinator that knew about it is gone.
    pub async fn abandon_usage(&self) -> Result<(), NodeStopped> {
        let (respond_to, response) = oneshot::channel();
        self.send(NodeCommand::AbandonUsage { respond_to }).await?;
        response.await.map_err(|_| NodeStopped(self.id))
    }

    /// Stops the node and waits for its task to exit. The socket is closed and
    /// any pending usage timer is dropped. The coordinator is not notified.
    pub async fn shutdown(self) {
        let _ = self.commands.send(NodeCommand::Shutdown).await;
        if let Err(err) = self.task.await {
            warn!(node = %self.id, error = ?err, "node task ended abnormally");
        }
    }

    async fn send(&self, command: NodeCommand) -> Result<(), NodeStopped> {
        self.commands
            .send(command)
            .await
            .map_err(|_| NodeStopped(self.id))
    }
}

/// Binds `endpoint`, registers the node in the directory under the bound
/// address and starts its task. The node starts `Idle` and plain.
pub async fn spawn_node(
    id: NodeId,
    endpoint: Endpoint,
    context: NodeContext,
) -> Result<NodeHandle, TransportError> {
    let transport = Transport::bind(endpoint).await?;
    let endpoint = transport.local_addr();
    context.directory.register(id, endpoint);

    let (commands, command_rx) = mpsc::channel(COMMAND_BUFFER);
    let worker = Worker {
        id,
        transport,
        context,
        commands: command_rx,
        state: NodeState::Idle,
        role: Role::Plain,
        usage: UsageTimer::default(),
        granter: None,
        completed_uses: 0,
    };
    let task = tokio::spawn(worker.run());
    info!(node = %id, %endpoint, "node started");

    Ok(NodeHandle {
        id,
        endpoint,
        commands,
        task,
    })
}

struct Worker {
    id: NodeId,
    transport: Transport,
    context: NodeContext,
    commands: mpsc::Receiver<NodeCommand>,
    state: NodeState,
    role: Role,
    usage: UsageTimer,
    /// Coordinator endpoint our outstanding request was sent to.
    granter: Option<Endpoint>,
    completed_uses: u64,
}

impl Worker {
    async fn run(mut self) {
        let retry = tick_period(self.context.config.retry_interval);
        let mut cadence = time::interval_at(Instant::now() + retry, retry);
        cadence.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut buf = [0u8; MAX_DATAGRAM];

        loop {
            select! {
                command = self.commands.recv() => {
                    match command {
                        Some(command) => {
                            if !self.handle_command(command).await {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                received = self.transport.recv(&mut buf) => {
                    match received {
                        Ok((len, from)) => self.handle_datagram(&buf[..len], from).await,
                        Err(err) => warn!(node = %self.id, error = %err, "receive failed"),
                    }
                }
                _ = cadence.tick() => self.request_resource().await,
                () = self.usage.expired() => self.finish_usage().await,
            }
        }

        self.stop();
    }

    /// Returns `false` when the node should stop.
    async fn handle_command(&mut self, command: NodeCommand) -> bool {
        match command {
            NodeCommand::Request => self.request_resource().await,
            NodeCommand::FinishUsage => self.finish_usage().await,
            NodeCommand::Promote { state, respond_to } => {
                if self.role.is_coordinator() {
                    warn!(node = %self.id, "promoted while already coordinating; replacing state");
                }
                info!(
                    node = %self.id,
                    occupant = ?state.occupant(),
                    waiting = state.queue().len(),
                    "coordinator role attached"
                );
                self.role = Role::Coordinator(state);
                let _ = respond_to.send(());
            }
            NodeCommand::ResumeGrant {
                grantee,
                respond_to,
            } => {
                match self.role.coordinator().map(CoordinatorState::occupant) {
                    Some(Some(occupant)) if occupant == grantee => {
                        self.deliver_grant(grantee).await;
                    }
                    _ => warn!(node = %self.id, %grantee, "no carried grant to resume"),
                }
                let _ = respond_to.send(());
            }
            NodeCommand::Demote { respond_to } => {
                let state = self.role.demote();
                if state.is_some() {
                    info!(node = %self.id, "coordinator role detached");
                }
                let _ = respond_to.send(state);
            }
            NodeCommand::AbandonUsage { respond_to } => {
                self.abandon_usage();
                let _ = respond_to.send(());
            }
            NodeCommand::Status { respond_to } => {
                let _ = respond_to.send(self.status());
            }
            NodeCommand::Shutdown => return false,
        }
        true
    }

    async fn handle_datagram(&mut self, bytes: &[u8], from: Endpoint) {
        let message = match Message::decode(bytes) {
            Ok(message) => message,
            Err(err) => {
                warn!(node = %self.id, peer = %from, error = %err, "dropping malformed datagram");
                return;
            }
        };
        debug!(node = %self.id, peer = %from, %message, "datagram received");

        match message {
            Message::Grant => self.accept_remote_grant(from),
            Message::Request(requester) => self.coordinate_request(requester).await,
            Message::Release(releaser) => self.coordinate_release(releaser).await,
        }
    }

    /// One retry-cadence step: ask for the resource unless already using it.
    async fn request_resource(&mut self) {
        if self.state == NodeState::UsingResource {
            return;
        }
        self.state = NodeState::AwaitingGrant;

        if self.role.is_coordinator() {
            // Self-coordination: no datagram round-trip.
            self.coordinate_request(self.id).await;
            return;
        }

        let Some(coordinator) = self.context.directory.coordinator_endpoint() else {
            debug!(node = %self.id, "no coordinator published; request deferred");
            return;
        };
        self.granter = Some(coordinator);
        match self
            .transport
            .send(&Message::Request(self.id), coordinator)
            .await
        {
            Ok(()) => debug!(node = %self.id, peer = %coordinator, "request sent"),
            Err(err) => warn!(node = %self.id, error = %err, "request send failed"),
        }
    }

    async fn coordinate_request(&mut self, requester: NodeId) {
        let Role::Coordinator(coordinator) = &mut self.role else {
            warn!(node = %self.id, %requester, "request reached a node that is not coordinating");
            return;
        };

        match coordinator.on_request(requester) {
            Admission::Granted(grantee) => self.deliver_grant(grantee).await,
            Admission::Queued { position } => {
                info!(node = %self.id, %requester, position, "resource busy; request queued");
            }
            Admission::AlreadyQueued => {
                debug!(node = %self.id, %requester, "duplicate request; already queued");
            }
            Admission::AlreadyOccupant => {
                debug!(node = %self.id, %requester, "duplicate request from occupant");
            }
        }
    }

    async fn coordinate_release(&mut self, releaser: NodeId) {
        let Role::Coordinator(coordinator) = &mut self.role else {
            warn!(node = %self.id, %releaser, "release reached a node that is not coordinating");
            return;
        };

        if coordinator.occupant() != Some(releaser) {
            warn!(
                node = %self.id,
                %releaser,
                occupant = ?coordinator.occupant(),
                "release from a node that is not the occupant"
            );
        }
        match coordinator.on_release(releaser) {
            Some(next) => self.deliver_grant(next).await,
            None => info!(node = %self.id, %releaser, "resource is free"),
        }
    }

    /// Sends a grant to `grantee`, or enters the resource directly when the
    /// grantee is this node. If the grant cannot be delivered the occupancy is
    /// released and the next waiter is tried, until one grant goes out or the
    /// lock is free.
    async fn deliver_grant(&mut self, mut grantee: NodeId) {
        loop {
            if grantee == self.id {
                self.enter_resource();
                return;
            }

            let delivered = match self.context.directory.lookup_endpoint(grantee) {
                Some(endpoint) => match self.transport.send(&Message::Grant, endpoint).await {
                    Ok(()) => {
                        info!(node = %self.id, %grantee, peer = %endpoint, "grant sent");
                        true
                    }
                    Err(err) => {
                        warn!(node = %self.id, %grantee, error = %err, "grant send failed");
                        false
                    }
                },
                None => {
                    warn!(node = %self.id, %grantee, "grant target is not in the directory");
                    false
                }
            };
            if delivered {
                return;
            }

            let Role::Coordinator(coordinator) = &mut self.role else {
                return;
            };
            match coordinator.abandon_grant(grantee) {
                Some(next) => grantee = next,
                None => {
                    info!(node = %self.id, "undeliverable grant released; resource is free");
                    return;
                }
            }
        }
    }

    /// Grants arriving over the wire are only honoured from the coordinator
    /// this node asked, or from the one currently published. Anything else is
    /// left over from a coordinator that no longer exists.
    fn accept_remote_grant(&mut self, from: Endpoint) {
        let current = self.context.directory.coordinator_endpoint();
        if self.granter != Some(from) && current != Some(from) {
            warn!(node = %self.id, peer = %from, "ignoring grant from a former coordinator");
            return;
        }
        self.enter_resource();
    }

    fn enter_resource(&mut self) {
        if self.state == NodeState::UsingResource {
            debug!(node = %self.id, "duplicate grant ignored");
            return;
        }
        self.state = NodeState::UsingResource;
        self.granter = None;
        self.context.resource.enter(self.id);
        self.usage.arm(self.context.config.usage);
        info!(
            node = %self.id,
            usage = ?self.context.config.usage,
            "using resource"
        );
    }

    /// Leaves the resource and releases it, exactly once per grant.
    async fn finish_usage(&mut self) {
        if self.state != NodeState::UsingResource {
            return;
        }
        self.usage.cancel();
        self.state = NodeState::Idle;
        self.completed_uses += 1;
        self.context.resource.leave(self.id);
        info!(node = %self.id, "finished using resource");

        if self.role.is_coordinator() {
            self.coordinate_release(self.id).await;
            return;
        }

        let Some(coordinator) = self.context.directory.coordinator_endpoint() else {
            warn!(node = %self.id, "no coordinator published; release dropped");
            return;
        };
        match self
            .transport
            .send(&Message::Release(self.id), coordinator)
            .await
        {
            Ok(()) => debug!(node = %self.id, peer = %coordinator, "release sent"),
            Err(err) => warn!(node = %self.id, error = %err, "release send failed"),
        }
    }

    fn abandon_usage(&mut self) {
        if self.state == NodeState::UsingResource {
            self.context.resource.leave(self.id);
            info!(node = %self.id, "usage abandoned after coordinator change");
        }
        self.usage.cancel();
        self.granter = None;
        self.state = NodeState::Idle;
    }

    fn status(&self) -> NodeStatus {
        let coordinator = self.role.coordinator();
        NodeStatus {
            id: self.id,
            endpoint: self.transport.local_addr(),
            state: self.state,
            is_coordinator: coordinator.is_some(),
            occupant: coordinator.and_then(CoordinatorState::occupant),
            queue: coordinator
                .map(|state| state.queue().to_vec())
                .unwrap_or_default(),
            completed_uses: self.completed_uses,
        }
    }

    fn stop(&mut self) {
        self.usage.cancel();
        if self.state == NodeState::UsingResource {
            self.context.resource.leave(self.id);
        }
        info!(node = %self.id, "node stopped");
    }
}
