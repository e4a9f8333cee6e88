//! Event capability traits.
//!
//! Each component accepts a capability object at construction: a trait
//! object with a fixed set of named hooks, every one of them defaulting to a
//! no-op. Implement only the hooks you care about. Hooks run on the
//! component's reactor worker and must not block; blocking a hook stalls
//! that reactor.

use std::sync::Arc;

use crate::endpoint::Endpoint;
use crate::error::Error;
use crate::mesh::Message;
use crate::stream::Session;

/// Hooks fired by a [`Reactor`](crate::reactor::Reactor).
pub trait ReactorHandler: Send + Sync + 'static {
    fn on_started(&self) {}
    fn on_stopped(&self) {}
    /// Fired once per polling-loop iteration when the reactor runs in
    /// polling mode.
    fn on_idle(&self) {}
    fn on_thread_initialize(&self) {}
    fn on_thread_cleanup(&self) {}
    fn on_error(&self, _error: &Error) {}
}

/// Hooks fired by a [`StreamServer`](crate::stream::StreamServer) and the
/// sessions it owns.
pub trait ServerHandler: Send + Sync + 'static {
    fn on_started(&self) {}
    fn on_stopped(&self) {}
    /// A freshly accepted session was registered. For TLS servers the
    /// handshake has not run yet.
    fn on_connected(&self, _session: &Arc<Session>) {}
    fn on_handshaked(&self, _session: &Arc<Session>) {}
    fn on_disconnected(&self, _session: &Arc<Session>) {}
    fn on_received(&self, _session: &Arc<Session>, _buffer: &[u8]) {}
    fn on_sent(&self, _session: &Arc<Session>, _sent: usize, _pending: usize) {}
    /// The session's flush buffer fully drained (and once right after a TLS
    /// handshake, to let users prime the send path).
    fn on_empty(&self, _session: &Arc<Session>) {}
    fn on_error(&self, _error: &Error) {}
}

/// Hooks fired by a [`StreamClient`](crate::stream::StreamClient).
pub trait ClientHandler: Send + Sync + 'static {
    fn on_connected(&self) {}
    fn on_handshaked(&self) {}
    /// Fired after every teardown, including failed connection attempts.
    /// Reentrant calls back into the client (e.g. `connect`) are allowed.
    fn on_disconnected(&self) {}
    fn on_received(&self, _buffer: &[u8]) {}
    fn on_sent(&self, _sent: usize, _pending: usize) {}
    fn on_empty(&self) {}
    fn on_error(&self, _error: &Error) {}
}

/// Hooks fired by a [`DatagramSocket`](crate::datagram::DatagramSocket).
pub trait DatagramHandler: Send + Sync + 'static {
    fn on_started(&self) {}
    fn on_stopped(&self) {}
    fn on_connected(&self) {}
    fn on_disconnected(&self) {}
    fn on_received(&self, _peer: &Endpoint, _buffer: &[u8]) {}
    fn on_sent(&self, _peer: &Endpoint, _sent: usize) {}
    fn on_error(&self, _error: &Error) {}
}

/// Hooks fired by a [`MeshSocket`](crate::mesh::MeshSocket) polling thread.
pub trait MeshHandler: Send + Sync + 'static {
    fn on_connected(&self) {}
    fn on_disconnected(&self) {}
    fn on_received(&self, _message: &Message) {}
    /// Fired between empty polls. The default yields the polling thread.
    fn on_idle(&self) {
        std::thread::yield_now();
    }
    fn on_thread_initialize(&self) {}
    fn on_thread_cleanup(&self) {}
    fn on_error(&self, _error: &Error) {}
}

/// The do-nothing capability object.
pub struct NullHandler;

impl ReactorHandler for NullHandler {}
impl ServerHandler for NullHandler {}
impl ClientHandler for NullHandler {}
impl DatagramHandler for NullHandler {}
impl MeshHandler for NullHandler {}
