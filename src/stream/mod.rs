//! Stream transports: the per-connection session pipeline and the server
//! and client built on top of it.

pub mod io_stream;

mod client;
mod server;
mod session;

pub use client::StreamClient;
pub use server::StreamServer;
pub use session::Session;
