//! Wire protocol between requesters and the coordinator.
//!
//! Every datagram carries one textual line. Requests and releases name the
//! sender, grants carry nothing because the destination endpoint already
//! identifies the recipient:
//!
//! ```text
//! REQUISICAO | 2
//! LIBERACAO | 2
//! CONCESSAO
//! ```
//!
//! Parsing tolerates whitespace around the whole line and around each field.
//! Anything that does not match the grammar is a [`DecodeError`]; receivers
//! log and drop it without touching protocol state.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

const REQUEST_KIND: &str = "REQUISICAO";
const RELEASE_KIND: &str = "LIBERACAO";
const GRANT_KIND: &str = "CONCESSAO";
const DELIMITER: char = '|';

/// Identity of a participant. Assigned once at creation and never reused
/// while the node is alive; valid ids are strictly positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
    /// Wraps a raw id. Ids on the wire are positive; zero is rejected by the
    /// decoder and by [`crate::cluster::Cluster::create_node`].
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<u64> for NodeId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The three message kinds exchanged by the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Message {
    /// A node asks the coordinator for the resource.
    Request(NodeId),
    /// A node hands the resource back to the coordinator.
    Release(NodeId),
    /// The coordinator authorises the recipient to use the resource.
    Grant,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("datagram is not valid UTF-8")]
    InvalidUtf8,
    #[error("empty message")]
    Empty,
    #[error("unknown message kind '{0}'")]
    UnknownKind(String),
    #[error("{0} message is missing the node id")]
    MissingId(&'static str),
    #[error("invalid node id '{0}'")]
    InvalidId(String),
    #[error("unexpected trailing fields after {0}")]
    TrailingFields(&'static str),
}

impl Message {
    /// Renders the message as its wire line.
    pub fn encode(&self) -> String {
        self.to_string()
    }

    /// Decodes a received datagram.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let text = std::str::from_utf8(bytes).map_err(|_| DecodeError::InvalidUtf8)?;
        text.parse()
    }

    /// Wire keyword of the message: `REQUISICAO`, `LIBERACAO` or `CONCESSAO`.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Request(_) => REQUEST_KIND,
            Message::Release(_) => RELEASE_KIND,
            Message::Grant => GRANT_KIND,
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Request(id) | Message::Release(id) => {
                write!(f, "{} {DELIMITER} {id}", self.kind())
            }
            Message::Grant => f.write_str(GRANT_KIND),
        }
    }
}

impl FromStr for Message {
    type Err = DecodeError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Err(DecodeError::Empty);
        }

        let (kind, payload) = match trimmed.split_once(DELIMITER) {
            Some((kind, rest)) => (kind.trim(), Some(rest)),
            None => (trimmed, None),
        };

        match kind {
            GRANT_KIND => match payload {
                None => Ok(Message::Grant),
                Some(_) => Err(DecodeError::TrailingFields(GRANT_KIND)),
            },
            REQUEST_KIND => parse_id(REQUEST_KIND, payload).map(Message::Request),
            RELEASE_KIND => parse_id(RELEASE_KIND, payload).map(Message::Release),
            other => Err(DecodeError::UnknownKind(other.to_string())),
        }
    }
}

fn parse_id(kind: &'static str, payload: Option<&str>) -> Result<NodeId, DecodeError> {
    let field = payload.map(str::trim).unwrap_or_default();
    if field.is_empty() {
        return Err(DecodeError::MissingId(kind));
    }
    if field.contains(DELIMITER) {
        return Err(DecodeError::TrailingFields(kind));
    }
    match field.parse::<u64>() {
        Ok(0) | Err(_) => Err(DecodeError::InvalidId(field.to_string())),
        Ok(id) => Ok(NodeId(id)),
    }
}
