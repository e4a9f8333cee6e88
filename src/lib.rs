//! zeehond — an asynchronous session engine.
//!
//! A uniform programming model for stateful connection servers and clients
//! across plain TCP, TLS-wrapped TCP, connectionless UDP (including
//! multicast) and brokerless message-passing sockets. Reactors drive
//! per-connection state machines; every component reports lifecycle and I/O
//! events through a capability object supplied at construction.
//!
//! The short version:
//!
//! - build a [`Reactor`] and `start` it;
//! - hang a [`StreamServer`], [`StreamClient`], [`DatagramSocket`] or
//!   [`MeshSocket`] off it with a handler implementing the matching
//!   `*Handler` trait;
//! - bytes in arrive through `on_received`, bytes out go through `send`
//!   (or `broadcast`, server-side);
//! - `stop`/`disconnect` wind everything down cooperatively.

pub mod config;
pub mod datagram;
pub mod endpoint;
pub mod error;
pub mod event;
pub mod mesh;
pub mod reactor;
pub mod stream;
pub mod tls;

mod buffer;

pub use config::EngineConfig;
pub use datagram::DatagramSocket;
pub use endpoint::{Endpoint, Family};
pub use error::Error;
pub use event::{
    ClientHandler, DatagramHandler, MeshHandler, NullHandler, ReactorHandler, ServerHandler,
};
pub use mesh::{MeshAddress, MeshSocket, Message, SocketKind};
pub use reactor::Reactor;
pub use stream::{Session, StreamClient, StreamServer};
pub use tls::{TlsContext, VerifyMode};
