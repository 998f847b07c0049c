//! Stream wrapper that is either plain TCP or TLS.
//!
//! The control channel starts plaintext and may be upgraded in place
//! after `AUTH TLS`; data channels are wrapped before any payload byte
//! when `PROT P` is in effect. Both sides of the daemon therefore speak
//! through this enum, which delegates I/O to whichever variant is live.

use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;

use crate::policy::fxp::TlsVersion;
use crate::tls::negotiated_version;

/// A stream that may have been wrapped with server-side TLS.
pub enum MaybeTlsStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
    /// Placeholder held only while an AUTH TLS upgrade swaps the live
    /// variant out. Any I/O against it fails.
    Detached,
}

impl MaybeTlsStream {
    pub fn is_tls(&self) -> bool {
        matches!(self, MaybeTlsStream::Tls(_))
    }

    /// Negotiated TLS version, when wrapped.
    pub fn tls_version(&self) -> Option<TlsVersion> {
        match self {
            MaybeTlsStream::Tls(stream) => negotiated_version(stream.get_ref().1),
            _ => None,
        }
    }
}

fn detached_error() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::NotConnected, "stream detached during TLS upgrade")
}

impl AsyncRead for MaybeTlsStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            MaybeTlsStream::Detached => Poll::Ready(Err(detached_error())),
        }
    }
}

impl AsyncWrite for MaybeTlsStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
            MaybeTlsStream::Detached => Poll::Ready(Err(detached_error())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_flush(cx),
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
            MaybeTlsStream::Detached => Poll::Ready(Err(detached_error())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            MaybeTlsStream::Detached => Poll::Ready(Err(detached_error())),
        }
    }
}
