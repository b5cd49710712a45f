//! Coordinator-side admission logic.
//!
//! The lock and the queue always change together, so they live in one
//! [`CoordinatorState`] owned by whichever node currently holds
//! [`Role::Coordinator`]. The owning node actor is the only writer, which
//! serialises every request and release for that coordinator instance.

use std::collections::VecDeque;

use crate::message::NodeId;

/// Single-slot register naming the node that currently holds the resource.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ResourceLock {
    occupant: Option<NodeId>,
}

impl ResourceLock {
    pub fn occupant(&self) -> Option<NodeId> {
        self.occupant
    }

    fn set(&mut self, occupant: Option<NodeId>) {
        self.occupant = occupant;
    }
}

/// FIFO of waiting nodes. A node appears at most once.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RequestQueue {
    waiting: VecDeque<NodeId>,
}

impl RequestQueue {
    /// Whether `id` is waiting.
    pub fn contains(&self, id: NodeId) -> bool {
        self.waiting.contains(&id)
    }

    /// Appends `id` unless it is already waiting. Returns whether it was added.
    fn push(&mut self, id: NodeId) -> bool {
        if self.contains(id) {
            return false;
        }
        self.waiting.push_back(id);
        true
    }

    fn pop(&mut self) -> Option<NodeId> {
        self.waiting.pop_front()
    }

    fn remove(&mut self, id: NodeId) -> bool {
        let before = self.waiting.len();
        self.waiting.retain(|waiting| *waiting != id);
        self.waiting.len() != before
    }

    pub fn len(&self) -> usize {
        self.waiting.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiting.is_empty()
    }

    /// Waiters from head to tail.
    pub fn to_vec(&self) -> Vec<NodeId> {
        self.waiting.iter().copied().collect()
    }
}

/// Outcome of a request reaching the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The resource was free; the requester is now the occupant and must be
    /// sent a grant.
    Granted(NodeId),
    /// The resource is busy; the requester waits at `position` (1-based).
    Queued { position: usize },
    /// The requester was already waiting.
    AlreadyQueued,
    /// The requester already holds the resource. No second grant is issued.
    AlreadyOccupant,
}

/// Lock and queue of one coordinator instance.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CoordinatorState {
    lock: ResourceLock,
    queue: RequestQueue,
}

impl CoordinatorState {
    /// Free lock, empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn occupant(&self) -> Option<NodeId> {
        self.lock.occupant()
    }

    pub fn lock(&self) -> &ResourceLock {
        &self.lock
    }

    pub fn queue(&self) -> &RequestQueue {
        &self.queue
    }

    /// Admits `id` immediately when the resource is free, otherwise queues it.
    pub fn on_request(&mut self, id: NodeId) -> Admission {
        match self.lock.occupant() {
            None => {
                self.lock.set(Some(id));
                Admission::Granted(id)
            }
            Some(occupant) if occupant == id => Admission::AlreadyOccupant,
            Some(_) => {
                if self.queue.push(id) {
                    Admission::Queued {
                        position: self.queue.len(),
                    }
                } else {
                    Admission::AlreadyQueued
                }
            }
        }
    }

    /// Advances the queue. The releasing node is not checked against the
    /// occupant: every release hands the resource to the head of the queue.
    ///
    /// Returns the new occupant, which must be sent a grant.
    pub fn on_release(&mut self, _releaser: NodeId) -> Option<NodeId> {
        let next = self.queue.pop();
        self.lock.set(next);
        next
    }

    /// Called when the grant for `id` could not be delivered. If `id` still
    /// holds the lock, the occupancy is released so the resource cannot leak.
    ///
    /// Returns the next occupant to grant, if any.
    pub fn abandon_grant(&mut self, id: NodeId) -> Option<NodeId> {
        if self.lock.occupant() == Some(id) {
            self.on_release(id)
        } else {
            None
        }
    }

    /// Drops every trace of `id`: it leaves the queue, and if it was the
    /// occupant the resource passes to the next waiter.
    ///
    /// Returns the next occupant to grant, if any.
    pub fn evict(&mut self, id: NodeId) -> Option<NodeId> {
        self.queue.remove(id);
        if self.lock.occupant() == Some(id) {
            self.on_release(id)
        } else {
            None
        }
    }
}

/// Whether a node is a plain participant or carries the coordinator state.
#[derive(Debug, Default)]
pub enum Role {
    #[default]
    Plain,
    Coordinator(CoordinatorState),
}

impl Role {
    pub fn is_coordinator(&self) -> bool {
        matches!(self, Role::Coordinator(_))
    }

    /// Lock and queue, when this role coordinates.
    pub fn coordinator(&self) -> Option<&CoordinatorState> {
        match self {
            Role::Coordinator(state) => Some(state),
            Role::Plain => None,
        }
    }

    /// Strips the coordinator role, returning its state.
    pub fn demote(&mut self) -> Option<CoordinatorState> {
        match std::mem::take(self) {
            Role::Coordinator(state) => Some(state),
            Role::Plain => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u64) -> NodeId {
        NodeId::new(n)
    }

    #[test]
    fn free_resource_is_granted_immediately() {
        let mut state = CoordinatorState::new();
        assert_eq!(state.on_request(id(2)), Admission::Granted(id(2)));
        assert_eq!(state.occupant(), Some(id(2)));
        assert!(state.queue().is_empty());
    }

    #[test]
    fn grants_follow_arrival_order() {
        let mut state = CoordinatorState::new();
        assert_eq!(state.on_request(id(1)), Admission::Granted(id(1)));
        assert_eq!(state.on_request(id(2)), Admission::Queued { position: 1 });
        assert_eq!(state.on_request(id(3)), Admission::Queued { position: 2 });

        assert_eq!(state.on_release(id(1)), Some(id(2)));
        assert_eq!(state.occupant(), Some(id(2)));
        assert_eq!(state.on_release(id(2)), Some(id(3)));
        assert_eq!(state.on_release(id(3)), None);
        assert_eq!(state.lock().occupant(), None);
    }

    #[test]
    fn repeated_requests_are_idempotent() {
        let mut state = CoordinatorState::new();
        state.on_request(id(1));
        assert_eq!(state.on_request(id(1)), Admission::AlreadyOccupant);
        assert!(state.queue().is_empty());

        state.on_request(id(2));
        assert_eq!(state.on_request(id(2)), Admission::AlreadyQueued);
        assert_eq!(state.queue().to_vec(), vec![id(2)]);
    }

    #[test]
    fn release_with_empty_queue_frees_the_lock() {
        let mut state = CoordinatorState::new();
        state.on_request(id(4));
        assert_eq!(state.on_release(id(4)), None);
        assert_eq!(state.occupant(), None);
        // A release on an idle coordinator stays a no-op.
        assert_eq!(state.on_release(id(4)), None);
    }

    #[test]
    fn release_advances_regardless_of_releaser() {
        let mut state = CoordinatorState::new();
        state.on_request(id(1));
        state.on_request(id(2));
        assert_eq!(state.on_release(id(9)), Some(id(2)));
    }

    #[test]
    fn abandoned_grant_passes_to_next_waiter() {
        let mut state = CoordinatorState::new();
        state.on_request(id(1));
        state.on_request(id(2));
        assert_eq!(state.abandon_grant(id(1)), Some(id(2)));
        assert_eq!(state.abandon_grant(id(2)), None);
        assert_eq!(state.lock().occupant(), None);
    }

    #[test]
    fn abandoning_a_stale_grant_changes_nothing() {
        let mut state = CoordinatorState::new();
        state.on_request(id(1));
        state.on_request(id(2));
        assert_eq!(state.abandon_grant(id(2)), None);
        assert_eq!(state.occupant(), Some(id(1)));
        assert_eq!(state.queue().to_vec(), vec![id(2)]);
    }

    #[test]
    fn evict_removes_waiters_and_occupants() {
        let mut state = CoordinatorState::new();
        state.on_request(id(1));
        state.on_request(id(2));
        state.on_request(id(3));

        assert_eq!(state.evict(id(2)), None);
        assert_eq!(state.queue().to_vec(), vec![id(3)]);

        assert_eq!(state.evict(id(1)), Some(id(3)));
        assert_eq!(state.occupant(), Some(id(3)));
        assert!(state.queue().is_empty());
    }

    #[test]
    fn demote_hands_back_state_once() {
        let mut state = CoordinatorState::new();
        state.on_request(id(5));
        let mut role = Role::Coordinator(state);
        assert!(role.is_coordinator());

        let taken = role.demote().map(|state| state.occupant());
        assert_eq!(taken, Some(Some(id(5))));
        assert!(!role.is_coordinator());
        assert!(role.demote().is_none());
    }
}
