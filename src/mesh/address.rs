//! Message-passing endpoint addresses: URL-like strings naming a transport
//! and a location, e.g. `tcp://127.0.0.1:6670`, `ipc:///tmp/pipeline.sock`,
//! `inproc://jobs`.

use std::fmt::{self, Display};
use std::str::FromStr;

#[cfg(unix)]
use std::path::PathBuf;

use crate::endpoint::Endpoint;
use crate::error::Error;

/// A parsed mesh address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshAddress {
    /// `tcp://host:port`
    Tcp(Endpoint),
    /// `ipc://path` — a unix-domain socket path.
    #[cfg(unix)]
    Ipc(PathBuf),
    /// `inproc://name` — an in-process rendezvous by name.
    Inproc(String),
}

impl FromStr for MeshAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(rest) = s.strip_prefix("tcp://") {
            let (host, port) = rest
                .rsplit_once(':')
                .ok_or_else(|| Error::Address(format!("{}: missing port", s)))?;
            let host = host.trim_start_matches('[').trim_end_matches(']');
            let port = port
                .parse::<u16>()
                .map_err(|_| Error::Address(format!("{}: invalid port", s)))?;
            return Ok(MeshAddress::Tcp(Endpoint::resolve(host, port)?));
        }
        if let Some(rest) = s.strip_prefix("ipc://") {
            #[cfg(unix)]
            {
                if rest.is_empty() {
                    return Err(Error::Address(format!("{}: empty path", s)));
                }
                return Ok(MeshAddress::Ipc(PathBuf::from(rest)));
            }
            #[cfg(not(unix))]
            {
                let _ = rest;
                return Err(Error::Address(format!(
                    "{}: ipc transport is unix-only",
                    s
                )));
            }
        }
        if let Some(rest) = s.strip_prefix("inproc://") {
            if rest.is_empty() {
                return Err(Error::Address(format!("{}: empty name", s)));
            }
            return Ok(MeshAddress::Inproc(rest.to_owned()));
        }
        Err(Error::Address(format!(
            "{}: expected tcp://, ipc:// or inproc://",
            s
        )))
    }
}

impl Display for MeshAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MeshAddress::Tcp(endpoint) => write!(f, "tcp://{}", endpoint),
            #[cfg(unix)]
            MeshAddress::Ipc(path) => write!(f, "ipc://{}", path.display()),
            MeshAddress::Inproc(name) => write!(f, "inproc://{}", name),
        }
    }
}
