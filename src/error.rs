//! The error type shared by every component of the engine, and the
//! classification helpers that decide which transport failures surface to
//! `on_error` and which are silently converted into a disconnect.

use std::io;

use thiserror::Error;

use crate::mesh::SocketKind;

/// Errors reported by reactors, stream/datagram transports and
/// message-passing sockets.
///
/// Configuration and address errors are raised synchronously at
/// construction; transport errors flow into the `on_error` callback of the
/// component that observed them and never unwind past a handler boundary.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("malformed address: {0}")]
    Address(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("TLS error: {0}")]
    Tls(String),
    #[error("operation not supported by {0:?} sockets")]
    NotSupported(SocketKind),
    #[error("survey deadline expired")]
    SurveyExpired,
    #[error("invalid state: {0}")]
    WrongState(&'static str),
}

impl Error {
    /// Numeric error code delivered to `on_error`. For transport errors this
    /// is the raw OS error where one exists.
    pub fn code(&self) -> i32 {
        match self {
            Error::Io(err) => err.raw_os_error().unwrap_or(-1),
            Error::Config(_) => 1,
            Error::Address(_) => 2,
            Error::Tls(_) => 3,
            Error::NotSupported(_) => 4,
            Error::SurveyExpired => 5,
            Error::WrongState(_) => 6,
        }
    }

    /// Error category delivered to `on_error`.
    pub fn category(&self) -> &'static str {
        match self {
            Error::Io(_) => "system",
            Error::Tls(_) => "tls",
            Error::Config(_) | Error::Address(_) => "config",
            Error::NotSupported(_) | Error::SurveyExpired | Error::WrongState(_) => "socket",
        }
    }

    /// Human-readable message delivered to `on_error`.
    pub fn message(&self) -> String {
        self.to_string()
    }
}

/// TLS close reasons that indicate an ordinary peer teardown rather than a
/// reportable protocol failure. Matched against the textual form of the
/// underlying rustls error.
const SILENT_TLS_REASONS: &[&str] = &[
    "stream truncated",
    "decryption failed or bad record mac",
    "protocol is shutdown",
    "wrong version number",
    "close_notify",
];

/// Whether a transport failure should be suppressed from `on_error` while
/// still triggering the disconnect path: the ordinary ways a peer goes away
/// plus the TLS teardown noise listed above.
pub(crate) fn is_silent_disconnect(err: &io::Error) -> bool {
    match err.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::UnexpectedEof
        | io::ErrorKind::Interrupted => true,
        _ => {
            let message = err.to_string().to_ascii_lowercase();
            SILENT_TLS_REASONS
                .iter()
                .any(|reason| message.contains(reason))
        }
    }
}

/// A "not connected" failure is benign inside a running loop: the peer is
/// already gone and the loop simply continues.
pub(crate) fn is_benign(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::NotConnected
}
