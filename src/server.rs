//! Listener and per-client session driver.
//!
//! The server accepts plain TCP, intercepts CONNECT tunnels by completing
//! the TLS handshake itself with one static certificate, scrubs each request
//! of hop-by-hop and fingerprintable headers, and hands the session to a
//! [`ProxyConnection`] for forwarding.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use http::header::{HeaderName, HeaderValue, HOST};
use http::{Method, StatusCode};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{error, info};

use crate::connection::{connect_remote, write_error, Outcome, ProxyConnection, Target};
use crate::errors::{Error, Result};
use crate::request::{Request, RequestReader};
use crate::socket::Socket;
use crate::tls;

/// Hop-by-hop and fingerprintable headers stripped from every forwarded
/// request. `accept-encoding` goes too so origin bodies come back
/// uncompressed and inspectable.
const REMOVED_HEADERS: [HeaderName; 8] = [
  HeaderName::from_static("keep-alive"),
  HeaderName::from_static("proxy-authenticate"),
  HeaderName::from_static("proxy-authorization"),
  HeaderName::from_static("te"),
  HeaderName::from_static("trailers"),
  HeaderName::from_static("transfer-encoding"),
  HeaderName::from_static("proxy-connection"),
  HeaderName::from_static("accept-encoding"),
];

/// Client-address headers overwritten with a loopback address so the origin
/// never learns who is really asking.
const SPOOFED_HEADERS: [HeaderName; 4] = [
  HeaderName::from_static("x-forwarded-for"),
  HeaderName::from_static("client-ip"),
  HeaderName::from_static("real-client-ip"),
  HeaderName::from_static("x-real-ip"),
];

const LOOPBACK: HeaderValue = HeaderValue::from_static("127.0.0.1");

/// The TLS-intercepting forward proxy.
pub struct ProxyServer {
  host: String,
  port: u16,
  acceptor: TlsAcceptor,
  connector: TlsConnector,
  dump_dir: Option<PathBuf>,
}

impl ProxyServer {
  /// Build a server presenting `certs`/`key` to every intercepted tunnel.
  ///
  /// When `dump_dir` is set, the plaintext of every origin connection is
  /// captured under it.
  pub fn new(
    host: &str,
    port: u16,
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    dump_dir: Option<PathBuf>,
  ) -> Result<Self> {
    Ok(Self {
      host: host.to_string(),
      port,
      acceptor: tls::static_acceptor(certs, key)?,
      connector: tls::insecure_connector()?,
      dump_dir,
    })
  }

  /// Bind the configured address and serve clients until the listener fails.
  pub async fn run(self) -> Result<()> {
    let listener = TcpListener::bind((self.host.as_str(), self.port)).await?;
    self.serve(listener).await
  }

  /// Serve clients from an already-bound listener.
  pub async fn serve(self, listener: TcpListener) -> Result<()> {
    info!("listening on {}", listener.local_addr()?);
    let server = Arc::new(self);
    loop {
      let (stream, peer) = listener.accept().await?;
      let server = server.clone();
      tokio::spawn(async move {
        if let Err(err) = server.handle(stream, peer).await {
          error!("session with {} failed: {}", peer, err);
        }
      });
    }
  }

  async fn handle(&self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
    let mut reader = BufReader::new(Socket::tcp(stream));
    let mut request = RequestReader::new(&mut reader).read().await?;

    let mut tunnel: Option<(String, u16)> = None;
    if request.method() == Method::CONNECT {
      let host = request
        .uri()
        .host()
        .ok_or_else(|| Error::InvalidRequest("CONNECT without authority".to_string()))?
        .to_string();
      let port = request.uri().port_u16().unwrap_or(443);
      info!("intercepting CONNECT {}:{} from {}", host, port, peer);

      // The 200 goes out in plaintext, then the proxy takes the server role
      // in the TLS handshake the client believes it is doing with the origin.
      let established = format!(
        "HTTP/1.1 200 OK\r\nProxy-Agent: {}\r\n\r\n",
        crate::PROXY_NAME
      );
      reader.write_all(established.as_bytes()).await?;
      reader.flush().await?;
      let socket = reader.into_inner().accept_tls(&self.acceptor).await?;
      reader = BufReader::new(socket);

      tunnel = Some((host, port));
      request = RequestReader::new(&mut reader).read().await?;
    }

    let target = resolve_target(&request, tunnel.as_ref())?;
    info!("{} requests {} {}", peer, request.method(), target.authority());

    let remote = match connect_remote(&target, &self.connector, self.dump_dir.as_deref()).await {
      Ok(remote) => remote,
      Err(err) => {
        error!("{}", err);
        let _ = write_error(
          &mut reader,
          StatusCode::INTERNAL_SERVER_ERROR,
          &err.to_string(),
        )
        .await;
        return Ok(());
      }
    };

    let mut conn = ProxyConnection::new(reader, remote);
    sanitize_request(&mut request);
    match conn.do_req(&mut request).await {
      Ok(Outcome::Bridge) => {
        info!("bridging {} <-> {}", peer, target.authority());
        conn.bridge().await
      }
      Ok(Outcome::Close) => {
        conn.shutdown().await;
        Ok(())
      }
      Err(err) => {
        // Logged and answered here; propagating would log the same failure
        // again in the accept loop.
        error!("proxying to {} failed: {}", target.authority(), err);
        conn
          .write_error(StatusCode::SERVICE_UNAVAILABLE, &err.to_string())
          .await;
        conn.shutdown().await;
        Ok(())
      }
    }
  }
}

/// Work out where a request must be forwarded.
///
/// The `Host` header wins, then the request URI; inside a tunnel the CONNECT
/// authority is the fallback and forces TLS toward the origin.
fn resolve_target(request: &Request, tunnel: Option<&(String, u16)>) -> Result<Target> {
  let (mut host, mut port) = match request.headers().get(HOST).and_then(|v| v.to_str().ok()) {
    Some(value) => split_host_port(value),
    None => (None, None),
  };
  if host.is_none() {
    host = request.uri().host().map(str::to_string);
  }
  if port.is_none() {
    port = request.uri().port_u16();
  }

  match tunnel {
    Some((tunnel_host, tunnel_port)) => {
      let host = host.unwrap_or_else(|| tunnel_host.clone());
      Ok(Target::new(host, port.unwrap_or(*tunnel_port), true))
    }
    None => {
      let tls = request.uri().scheme() == Some(&http::uri::Scheme::HTTPS);
      let host =
        host.ok_or_else(|| Error::InvalidRequest("no destination host".to_string()))?;
      Ok(Target::new(host, port.unwrap_or(if tls { 443 } else { 80 }), tls))
    }
  }
}

fn split_host_port(value: &str) -> (Option<String>, Option<u16>) {
  match value.rsplit_once(':') {
    Some((host, port)) => match port.parse::<u16>() {
      Ok(port) => (Some(host.to_string()), Some(port)),
      Err(_) => (Some(value.to_string()), None),
    },
    None => (Some(value.to_string()), None),
  }
}

/// Strip hop-by-hop headers and overwrite every client-address header with a
/// loopback address.
fn sanitize_request(request: &mut Request) {
  for name in &REMOVED_HEADERS {
    request.headers_mut().remove(name);
  }
  for name in SPOOFED_HEADERS {
    request.headers_mut().insert(name, LOOPBACK);
  }
}
