//! The TLS overlay: a context carrying certificate material and a role, and
//! the handshake that turns a raw TCP stream into an authenticated byte
//! stream.
//!
//! The context is built once and shared by every session of a server or
//! client; the handshake itself runs on the session's reactor, between the
//! `connected` and `handshaked` states of the session lifecycle.

use std::io;
use std::path::Path;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio_rustls::{
    rustls::{
        Certificate, ClientConfig, NoClientAuth, PrivateKey, RootCertStore, ServerCertVerified,
        ServerCertVerifier, ServerConfig, TLSError,
    },
    webpki::DNSNameRef,
    TlsAcceptor, TlsConnector,
};

use crate::error::Error;
use crate::stream::io_stream::IoStream;

/// Server certificate verification policy for client contexts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyMode {
    /// Verify the server certificate against the configured trust anchors.
    Full,
    /// Accept any server certificate. Useful against self-signed peers in
    /// closed deployments; the connection is still encrypted.
    None,
}

/// Load every `CERTIFICATE` entry from the PEM bundle at `path`. A bundle
/// without a single certificate is a configuration error, reported up front
/// rather than as a handshake failure later.
pub fn load_certificates(path: impl AsRef<Path>) -> Result<Vec<Certificate>, Error> {
    let path = path.as_ref();
    let certificates: Vec<Certificate> = read_pem(path)?
        .into_iter()
        .filter(|entry| entry.tag == "CERTIFICATE")
        .map(|entry| Certificate(entry.contents))
        .collect();
    if certificates.is_empty() {
        return Err(Error::Tls(format!(
            "{}: no CERTIFICATE entries",
            path.display()
        )));
    }
    Ok(certificates)
}

/// Load the private key from the PEM file at `path`, accepting both PKCS#8
/// (`PRIVATE KEY`) and PKCS#1 (`RSA PRIVATE KEY`) labels.
pub fn load_private_key(path: impl AsRef<Path>) -> Result<PrivateKey, Error> {
    let path = path.as_ref();
    read_pem(path)?
        .into_iter()
        .find(|entry| entry.tag == "PRIVATE KEY" || entry.tag == "RSA PRIVATE KEY")
        .map(|entry| PrivateKey(entry.contents))
        .ok_or_else(|| Error::Tls(format!("{}: no private key entry", path.display())))
}

fn read_pem(path: &Path) -> Result<Vec<pem::Pem>, Error> {
    let contents = std::fs::read(path)
        .map_err(|err| Error::Tls(format!("{}: {}", path.display(), err)))?;
    Ok(pem::parse_many(contents))
}

/// A TLS context: either the accepting side (certificate chain and private
/// key) or the connecting side (trust anchors, verification mode and the
/// server name presented for SNI and certificate matching).
#[derive(Clone)]
pub struct TlsContext {
    role: Role,
}

#[derive(Clone)]
enum Role {
    Server(TlsAcceptor),
    Client {
        connector: TlsConnector,
        server_name: String,
    },
}

impl TlsContext {
    /// Server-role context from certificate material already in memory.
    pub fn server(
        certificate_chain: Vec<Certificate>,
        private_key: PrivateKey,
    ) -> Result<TlsContext, Error> {
        let mut config = ServerConfig::new(NoClientAuth::new());
        config
            .set_single_cert(certificate_chain, private_key)
            .map_err(|err| {
                Error::Tls(format!(
                    "invalid server certificate chain or private key: {}",
                    err
                ))
            })?;
        Ok(TlsContext {
            role: Role::Server(TlsAcceptor::from(Arc::new(config))),
        })
    }

    /// Server-role context from PEM files on disk.
    pub fn server_from_pem(
        certificate_chain: impl AsRef<Path>,
        private_key: impl AsRef<Path>,
    ) -> Result<TlsContext, Error> {
        TlsContext::server(
            load_certificates(certificate_chain)?,
            load_private_key(private_key)?,
        )
    }

    /// Client-role context. With no explicit trust anchors the standard web
    /// roots are trusted.
    pub fn client(
        server_name: impl Into<String>,
        trust_anchors: Vec<Certificate>,
        verify: VerifyMode,
    ) -> Result<TlsContext, Error> {
        let mut config = ClientConfig::new();
        if trust_anchors.is_empty() {
            config
                .root_store
                .add_server_trust_anchors(&webpki_roots::TLS_SERVER_ROOTS);
        } else {
            for certificate in &trust_anchors {
                config
                    .root_store
                    .add(certificate)
                    .map_err(|err| Error::Tls(format!("invalid trust anchor: {:?}", err)))?;
            }
        }
        if let VerifyMode::None = verify {
            config
                .dangerous()
                .set_certificate_verifier(Arc::new(AcceptAnyCertificate));
        }
        Ok(TlsContext {
            role: Role::Client {
                connector: TlsConnector::from(Arc::new(config)),
                server_name: server_name.into(),
            },
        })
    }

    /// Client-role context trusting the CA bundle at `trust_anchors`.
    pub fn client_from_pem(
        server_name: impl Into<String>,
        trust_anchors: impl AsRef<Path>,
        verify: VerifyMode,
    ) -> Result<TlsContext, Error> {
        TlsContext::client(server_name, load_certificates(trust_anchors)?, verify)
    }

    pub(crate) fn is_server_role(&self) -> bool {
        matches!(self.role, Role::Server(_))
    }

    /// Run the handshake appropriate to this context's role.
    pub(crate) async fn handshake(&self, stream: TcpStream) -> io::Result<IoStream> {
        match &self.role {
            Role::Server(acceptor) => Ok(IoStream::from(acceptor.accept(stream).await?)),
            Role::Client {
                connector,
                server_name,
            } => {
                let name = DNSNameRef::try_from_ascii_str(server_name).map_err(|err| {
                    io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("invalid TLS server name '{}': {}", server_name, err),
                    )
                })?;
                Ok(IoStream::from(connector.connect(name, stream).await?))
            }
        }
    }
}

/// The `VerifyMode::None` verifier.
struct AcceptAnyCertificate;

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _roots: &RootCertStore,
        _presented_certs: &[Certificate],
        _dns_name: DNSNameRef<'_>,
        _ocsp_response: &[u8],
    ) -> Result<ServerCertVerified, TLSError> {
        Ok(ServerCertVerified::assertion())
    }
}
