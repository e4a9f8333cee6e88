use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::{client, server};

/// A session's connection stream: raw TCP or TLS-wrapped in either role.
///
/// The session pipeline is written against this one type; which transport
/// sits underneath is decided once, at connect/accept time, and never
/// changes for the life of the session.
pub enum IoStream {
    Tcp(TcpStream),
    TlsServer(Box<server::TlsStream<TcpStream>>),
    TlsClient(Box<client::TlsStream<TcpStream>>),
}

/// The object form the I/O traits dispatch through: every variant reads and
/// writes, so one projection serves all four poll methods.
trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

impl IoStream {
    fn transport(self: Pin<&mut Self>) -> Pin<&mut dyn Transport> {
        match self.get_mut() {
            IoStream::Tcp(stream) => Pin::new(stream),
            IoStream::TlsServer(stream) => Pin::new(&mut **stream),
            IoStream::TlsClient(stream) => Pin::new(&mut **stream),
        }
    }
}

impl AsyncRead for IoStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.transport().poll_read(cx, buf)
    }
}

impl AsyncWrite for IoStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.transport().poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.transport().poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.transport().poll_shutdown(cx)
    }
}

impl From<TcpStream> for IoStream {
    fn from(stream: TcpStream) -> Self {
        IoStream::Tcp(stream)
    }
}

impl From<server::TlsStream<TcpStream>> for IoStream {
    fn from(stream: server::TlsStream<TcpStream>) -> Self {
        IoStream::TlsServer(Box::new(stream))
    }
}

impl From<client::TlsStream<TcpStream>> for IoStream {
    fn from(stream: client::TlsStream<TcpStream>) -> Self {
        IoStream::TlsClient(Box::new(stream))
    }
}
