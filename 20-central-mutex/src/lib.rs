//! Centralized mutual exclusion with a rotating coordinator.
//!
//! An open-ended set of nodes competes for one shared resource. A single
//! coordinator admits them one at a time: it grants the resource when it is
//! free and queues requesters (FIFO) when it is not. Every so often the
//! coordinator "fails": it is retired and a successor takes over.
//!
//! Nodes talk over UDP with a three-message text protocol:
//!
//! ```text
//! REQUISICAO | <id>    requester -> coordinator
//! LIBERACAO | <id>     requester -> coordinator
//! CONCESSAO            coordinator -> requester
//! ```
//!
//! # Modules
//!
//! - [`message`]: node ids and the wire codec
//! - [`coordinator`]: lock, queue and admission logic behind the coordinator role
//! - [`node`]: the per-node actor, its state machine and host handle
//! - [`directory`]: shared membership and coordinator pointer
//! - [`transport`]: UDP sockets
//! - [`election`]: successor strategies and the handoff policy
//! - [`cluster`]: lifecycle hooks (create, promote, rotate, shut down)
//! - [`resource`]: the simulated resource, which detects overlapping use
//! - [`simulation`]: the periodic driver used by the binary
//! - [`config`], [`cli`]: settings and their command-line surface

pub mod cli;
pub mod cluster;
pub mod config;
pub mod coordinator;
pub mod directory;
pub mod election;
pub mod message;
pub mod node;
pub mod resource;
pub mod simulation;
pub mod transport;
