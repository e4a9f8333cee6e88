//! Brokerless message-passing sockets: pair, pipeline, pub/sub, req/rep,
//! survey and bus patterns over TCP, unix-domain and in-process transports.
//!
//! Unlike the stream transports, these sockets carry whole messages on a
//! length-delimited wire format and enforce per-pattern capability subsets:
//! a push socket cannot receive, a subscriber cannot send, request/reply
//! alternates strictly, and a survey carries a deadline after which further
//! responses are dropped.

use std::fmt::{self, Display};
use std::ops::Deref;

use bytes::Bytes;

mod address;
mod socket;

pub use address::MeshAddress;
pub use socket::MeshSocket;

/// The socket pattern, which determines the exact semantics of the socket.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum SocketKind {
    /// One-to-one: exactly two peers, both directions.
    Pair,
    /// Pipeline upstream: load-balances messages to pull peers. Receive
    /// operations are inaccessible.
    Push,
    /// Pipeline downstream: fair-queues messages from push peers. Send
    /// operations are inaccessible.
    Pull,
    /// Broadcast to subscribers. Receive operations are inaccessible.
    Pub,
    /// Receive messages matching subscribed prefixes. Send operations are
    /// inaccessible.
    Sub,
    /// Send a request, receive the corresponding reply, strictly
    /// alternating.
    Req,
    /// Receive requests, send replies, strictly alternating per peer.
    Rep,
    /// Broadcast a survey and gather responses until the deadline.
    Surveyor,
    /// Receive surveys and send back responses.
    Respondent,
    /// Many-to-many broadcast among all connected nodes.
    Bus,
}

impl SocketKind {
    /// Stable on-wire pattern identifier, exchanged when a pipe opens.
    pub(crate) fn id(&self) -> u16 {
        match self {
            SocketKind::Pair => 16,
            SocketKind::Pub => 32,
            SocketKind::Sub => 33,
            SocketKind::Req => 48,
            SocketKind::Rep => 49,
            SocketKind::Push => 80,
            SocketKind::Pull => 81,
            SocketKind::Surveyor => 98,
            SocketKind::Respondent => 99,
            SocketKind::Bus => 112,
        }
    }

    pub(crate) fn from_id(id: u16) -> Option<SocketKind> {
        Some(match id {
            16 => SocketKind::Pair,
            32 => SocketKind::Pub,
            33 => SocketKind::Sub,
            48 => SocketKind::Req,
            49 => SocketKind::Rep,
            80 => SocketKind::Push,
            81 => SocketKind::Pull,
            98 => SocketKind::Surveyor,
            99 => SocketKind::Respondent,
            112 => SocketKind::Bus,
            _ => return None,
        })
    }

    /// The pattern this socket talks to.
    pub fn peer(&self) -> SocketKind {
        match self {
            SocketKind::Pair => SocketKind::Pair,
            SocketKind::Pub => SocketKind::Sub,
            SocketKind::Sub => SocketKind::Pub,
            SocketKind::Req => SocketKind::Rep,
            SocketKind::Rep => SocketKind::Req,
            SocketKind::Push => SocketKind::Pull,
            SocketKind::Pull => SocketKind::Push,
            SocketKind::Surveyor => SocketKind::Respondent,
            SocketKind::Respondent => SocketKind::Surveyor,
            SocketKind::Bus => SocketKind::Bus,
        }
    }

    /// Whether two patterns may share a pipe.
    pub fn matches(&self, other: SocketKind) -> bool {
        self.peer() == other && other.peer() == *self
    }

    pub fn can_send(&self) -> bool {
        !matches!(self, SocketKind::Pull | SocketKind::Sub)
    }

    pub fn can_receive(&self) -> bool {
        !matches!(self, SocketKind::Push | SocketKind::Pub)
    }
}

/// One received message: an opaque payload.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Message {
    payload: Bytes,
}

impl Message {
    pub fn new(payload: impl Into<Bytes>) -> Message {
        Message {
            payload: payload.into(),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn into_bytes(self) -> Bytes {
        self.payload
    }
}

impl Deref for Message {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.payload
    }
}

impl From<&[u8]> for Message {
    fn from(bytes: &[u8]) -> Message {
        Message::new(Bytes::copy_from_slice(bytes))
    }
}

impl From<Vec<u8>> for Message {
    fn from(bytes: Vec<u8>) -> Message {
        Message::new(bytes)
    }
}

impl From<&str> for Message {
    fn from(text: &str) -> Message {
        Message::new(Bytes::copy_from_slice(text.as_bytes()))
    }
}

impl Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        String::from_utf8_lossy(&self.payload).fmt(f)
    }
}
