//! Transport endpoints: a protocol family, an address and a port, resolved
//! eagerly at construction and immutable afterwards.

use std::fmt::{self, Display};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::str::FromStr;

use crate::error::Error;

/// Internet protocol family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    V4,
    V6,
}

/// An immutable `{family, address, port}` tuple.
///
/// Hostnames are resolved once, at construction; an `Endpoint` never holds
/// an unresolved name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    addr: SocketAddr,
}

impl Endpoint {
    /// Wildcard endpoint for the given family, e.g. for binding a listener
    /// on all interfaces.
    pub fn any(family: Family, port: u16) -> Endpoint {
        let ip = match family {
            Family::V4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            Family::V6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        Endpoint {
            addr: SocketAddr::new(ip, port),
        }
    }

    /// Resolve a textual address (dotted-quad, IPv6 literal or hostname) and
    /// a port into an endpoint. Resolution happens here and nowhere else; a
    /// name with no addresses is a configuration error.
    pub fn resolve(address: &str, port: u16) -> Result<Endpoint, Error> {
        if let Ok(ip) = address.parse::<IpAddr>() {
            return Ok(Endpoint {
                addr: SocketAddr::new(ip, port),
            });
        }
        let mut addrs = (address, port)
            .to_socket_addrs()
            .map_err(|err| Error::Address(format!("{}: {}", address, err)))?;
        match addrs.next() {
            Some(addr) => Ok(Endpoint { addr }),
            None => Err(Error::Address(format!("{}: no addresses", address))),
        }
    }

    pub fn family(&self) -> Family {
        match self.addr {
            SocketAddr::V4(_) => Family::V4,
            SocketAddr::V6(_) => Family::V6,
        }
    }

    pub fn address(&self) -> IpAddr {
        self.addr.ip()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.addr
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Endpoint {
        Endpoint { addr }
    }
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.addr.fmt(f)
    }
}

impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let addr = s
            .parse::<SocketAddr>()
            .map_err(|err| Error::Address(format!("{}: {}", s, err)))?;
        Ok(Endpoint { addr })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_literals() {
        let endpoint = Endpoint::resolve("127.0.0.1", 2222).unwrap();
        assert_eq!(endpoint.family(), Family::V4);
        assert_eq!(endpoint.port(), 2222);
        assert_eq!(endpoint.to_string(), "127.0.0.1:2222");

        let endpoint = Endpoint::resolve("::1", 80).unwrap();
        assert_eq!(endpoint.family(), Family::V6);
    }

    #[test]
    fn wildcard_per_family() {
        assert_eq!(Endpoint::any(Family::V4, 0).to_string(), "0.0.0.0:0");
        assert_eq!(Endpoint::any(Family::V6, 0).to_string(), "[::]:0");
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            Endpoint::resolve("definitely not an address", 1),
            Err(Error::Address(_))
        ));
        assert!("not-an-endpoint".parse::<Endpoint>().is_err());
    }

    #[test]
    fn round_trips_through_strings() {
        let endpoint: Endpoint = "192.168.1.7:8080".parse().unwrap();
        assert_eq!(endpoint.address().to_string(), "192.168.1.7");
        assert_eq!(endpoint.port(), 8080);
        assert_eq!(endpoint, endpoint.to_string().parse().unwrap());
    }
}
