use std::io::Error;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// One side of a proxied session: a TCP stream, optionally wrapped by TLS.
///
/// The client side is upgraded with [`Socket::accept_tls`] when a CONNECT
/// tunnel is intercepted; the origin side with [`Socket::connect_tls`] when
/// the scheme is https. A `Socket` always owns its stream exclusively.
#[derive(Debug)]
pub struct Socket {
  inner: MaybeTlsStream,
}

#[derive(Debug)]
pub(crate) enum MaybeTlsStream {
  /// plain TCP
  Tcp(TcpStream),
  /// TLS toward the origin (proxy acts as client)
  ClientTls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
  /// TLS toward the downstream client (proxy acts as server)
  ServerTls(Box<tokio_rustls::server::TlsStream<TcpStream>>),
}

impl Socket {
  /// Wrap a freshly accepted or dialed TCP stream.
  pub fn tcp(stream: TcpStream) -> Self {
    Self {
      inner: MaybeTlsStream::Tcp(stream),
    }
  }

  /// Upgrade to a TLS client session toward the origin. A socket that is
  /// already TLS-wrapped is returned unchanged.
  pub async fn connect_tls(
    self,
    connector: &TlsConnector,
    domain: ServerName<'static>,
  ) -> Result<Self, Error> {
    match self.inner {
      MaybeTlsStream::Tcp(t) => Ok(Self {
        inner: MaybeTlsStream::ClientTls(Box::new(connector.connect(domain, t).await?)),
      }),
      other => Ok(Self { inner: other }),
    }
  }

  /// Upgrade to a TLS server session toward the client, presenting the
  /// acceptor's (static) certificate. A socket that is already TLS-wrapped is
  /// returned unchanged.
  pub async fn accept_tls(self, acceptor: &TlsAcceptor) -> Result<Self, Error> {
    match self.inner {
      MaybeTlsStream::Tcp(t) => Ok(Self {
        inner: MaybeTlsStream::ServerTls(Box::new(acceptor.accept(t).await?)),
      }),
      other => Ok(Self { inner: other }),
    }
  }
}

impl AsyncRead for Socket {
  fn poll_read(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    Pin::new(&mut self.inner).poll_read(cx, buf)
  }
}

impl AsyncWrite for Socket {
  fn poll_write(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<Result<usize, Error>> {
    Pin::new(&mut self.inner).poll_write(cx, buf)
  }

  fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    Pin::new(&mut self.inner).poll_flush(cx)
  }

  fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    Pin::new(&mut self.inner).poll_shutdown(cx)
  }
}

impl AsyncRead for MaybeTlsStream {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
      MaybeTlsStream::ClientTls(stream) => Pin::new(stream).poll_read(cx, buf),
      MaybeTlsStream::ServerTls(stream) => Pin::new(stream).poll_read(cx, buf),
    }
  }
}

impl AsyncWrite for MaybeTlsStream {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<Result<usize, Error>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
      MaybeTlsStream::ClientTls(stream) => Pin::new(stream).poll_write(cx, buf),
      MaybeTlsStream::ServerTls(stream) => Pin::new(stream).poll_write(cx, buf),
    }
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
      MaybeTlsStream::ClientTls(stream) => Pin::new(stream).poll_flush(cx),
      MaybeTlsStream::ServerTls(stream) => Pin::new(stream).poll_flush(cx),
    }
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
      MaybeTlsStream::ClientTls(stream) => Pin::new(stream).poll_shutdown(cx),
      MaybeTlsStream::ServerTls(stream) => Pin::new(stream).poll_shutdown(cx),
    }
  }
}
