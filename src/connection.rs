//! Per-connection proxy logic.
//!
//! A [`ProxyConnection`] owns both sides of one proxied session: the
//! downstream client stream and the origin stream. It forwards requests,
//! watches responses for an `NTLM` authentication demand and, when one
//! appears, transparently runs the anonymous handshake before relaying the
//! final response back to the client.

use std::path::Path;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use http::header::{AUTHORIZATION, CONNECTION, WWW_AUTHENTICATE};
use http::{HeaderName, HeaderValue, StatusCode};
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;
use tracing::{debug, error, info};

use crate::dump::DumpStream;
use crate::errors::{Error, Result};
use crate::ntlm::AnonClient;
use crate::request::Request;
use crate::response::{relay_body, Response, ResponseReader};
use crate::socket::Socket;

const KEEPALIVE_PERIOD: Duration = Duration::from_secs(2);
/// Marker set on every relayed response.
const PROXY_SERVER: HeaderName = HeaderName::from_static("proxy-server");

/// Where a proxied request must be forwarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
  host: String,
  port: u16,
  tls: bool,
}

impl Target {
  pub fn new<H: Into<String>>(host: H, port: u16, tls: bool) -> Self {
    Self {
      host: host.into(),
      port,
      tls,
    }
  }
  /// The origin hostname, without port.
  pub fn host(&self) -> &str {
    &self.host
  }
  /// True when the origin side must be wrapped in TLS.
  pub fn tls(&self) -> bool {
    self.tls
  }
  /// `host:port` as dialed.
  pub fn authority(&self) -> String {
    format!("{}:{}", self.host, self.port)
  }
}

/// What the caller should do with the session after a request completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
  /// Stop parsing and bridge raw bytes: a 101 upgrade, or a kept-alive
  /// origin connection whose further exchanges pass through unparsed.
  Bridge,
  /// Tear the session down.
  Close,
}

/// Dial the origin named by `target`, with a short TCP keepalive so dead
/// tunnels are reaped quickly, upgrading to TLS when the target asks for it.
pub(crate) async fn connect_remote(
  target: &Target,
  connector: &TlsConnector,
  dump_dir: Option<&Path>,
) -> Result<DumpStream<Socket>> {
  let authority = target.authority();
  let stream = TcpStream::connect(&authority)
    .await
    .map_err(|source| Error::Connect(authority.clone(), source))?;
  let keepalive = TcpKeepalive::new()
    .with_time(KEEPALIVE_PERIOD)
    .with_interval(KEEPALIVE_PERIOD);
  SockRef::from(&stream).set_tcp_keepalive(&keepalive)?;
  let mut socket = Socket::tcp(stream);
  if target.tls() {
    let domain = ServerName::try_from(target.host().to_string())
      .map_err(|_| Error::InvalidRequest(format!("invalid origin name: {}", target.host())))?;
    socket = socket.connect_tls(connector, domain).await?;
  }
  debug!("connected to {}", authority);
  DumpStream::new(socket, dump_dir, &authority)
}

/// One live proxied session between a client and an origin.
pub struct ProxyConnection {
  client: BufReader<Socket>,
  remote: BufReader<DumpStream<Socket>>,
}

impl ProxyConnection {
  pub(crate) fn new(client: BufReader<Socket>, remote: DumpStream<Socket>) -> Self {
    Self {
      client,
      remote: BufReader::new(remote),
    }
  }

  /// Forward one request to the origin and relay its response to the client,
  /// running the anonymous NTLM handshake for every `Www-Authenticate: NTLM`
  /// value the first response carries.
  ///
  /// Only response heads are parsed; the final body streams to the client in
  /// its original framing, and handshake bodies drain without buffering.
  pub async fn do_req(&mut self, request: &mut Request) -> Result<Outcome> {
    let snapshot = request.body().cloned();
    let mut response = self.send(request).await?;

    let ntlm_demands = response
      .headers()
      .get_all(WWW_AUTHENTICATE)
      .iter()
      .filter(|value| value.as_bytes() == b"NTLM")
      .count();
    for _ in 0..ntlm_demands {
      info!(
        "origin demands NTLM for {} {}, answering anonymously",
        request.method(),
        request.uri()
      );
      self.discard_body(&response).await?;
      request.set_body(snapshot.clone());
      response = self.do_anon_ntlm_req(request).await?;
    }

    response
      .headers_mut()
      .insert(PROXY_SERVER, HeaderValue::from_static(crate::PROXY_NAME));
    self.client.write_all(&response.head_to_raw()).await?;
    relay_body(&mut self.remote, &mut self.client, response.framing()).await?;
    self.client.flush().await?;

    // A 101 upgrade bridges with zero body bytes relayed; a kept-alive
    // origin connection bridges after its body so pipelined exchanges pass
    // through raw.
    let keep_alive = response
      .headers()
      .get(CONNECTION)
      .is_some_and(|value| value.as_bytes().eq_ignore_ascii_case(b"keep-alive"));
    if response.status_code() == StatusCode::SWITCHING_PROTOCOLS || keep_alive {
      Ok(Outcome::Bridge)
    } else {
      Ok(Outcome::Close)
    }
  }

  /// Run the three-message anonymous NTLM exchange on the origin connection,
  /// replaying `request` (with its original body) at each step.
  async fn do_anon_ntlm_req(&mut self, request: &mut Request) -> Result<Response> {
    let ntlm = AnonClient::new();

    let negotiate = ntlm.negotiate();
    set_ntlm_authorization(request, &negotiate)?;
    let response = self.send(request).await?;
    let challenge = extract_challenge(&response)?;
    self.discard_body(&response).await?;

    let authenticate = ntlm.authenticate(&challenge)?;
    set_ntlm_authorization(request, &authenticate)?;
    let response = self.send(request).await?;

    info!("anonymous NTLM handshake finished with {}", response.status_code());
    Ok(response)
  }

  async fn send(&mut self, request: &Request) -> Result<Response> {
    self.remote.write_all(&request.to_raw()).await?;
    self.remote.flush().await?;
    ResponseReader::new(&mut self.remote, request.method())
      .read_head()
      .await
  }

  /// Drain the body following `response` off the origin stream. Keeps the
  /// connection usable for the next exchange of the handshake.
  async fn discard_body(&mut self, response: &Response) -> Result<()> {
    relay_body(&mut self.remote, &mut tokio::io::sink(), response.framing()).await
  }

  /// Report a proxying failure to the client with Go-proxy style HTML.
  pub(crate) async fn write_error(&mut self, status: StatusCode, msg: &str) {
    if let Err(err) = write_error(&mut self.client, status, msg).await {
      debug!("unable to report error to client: {}", err);
    }
  }

  pub(crate) async fn shutdown(&mut self) {
    let _ = self.client.shutdown().await;
    let _ = self.remote.shutdown().await;
  }

  /// Splice the two streams together and copy bytes both ways until either
  /// direction finishes. Returning when the first copy resolves (instead of
  /// waiting for both) guarantees a half-dead tunnel cannot pin the other
  /// task forever.
  pub async fn bridge(self) -> Result<()> {
    let (mut client_rx, mut client_tx) = tokio::io::split(self.client);
    let (mut remote_rx, mut remote_tx) = tokio::io::split(self.remote);
    tokio::select! {
      upstream = tokio::io::copy(&mut client_rx, &mut remote_tx) => {
        if let Err(err) = upstream {
          error!("client to origin copy failed: {}", err);
        }
      },
      downstream = tokio::io::copy(&mut remote_rx, &mut client_tx) => {
        if let Err(err) = downstream {
          error!("origin to client copy failed: {}", err);
        }
      },
    }
    Ok(())
  }
}

fn set_ntlm_authorization(request: &mut Request, message: &[u8]) -> Result<()> {
  let value = HeaderValue::from_str(&format!("NTLM {}", BASE64.encode(message)))?;
  request.headers_mut().insert(AUTHORIZATION, value);
  Ok(())
}

/// Pull the base64 Type 2 message out of `Www-Authenticate: NTLM <blob>`.
fn extract_challenge(response: &Response) -> Result<Vec<u8>> {
  let header = response
    .headers()
    .get(WWW_AUTHENTICATE)
    .ok_or_else(|| Error::ntlm("origin did not return an NTLM challenge"))?;
  let value = header
    .to_str()
    .map_err(|_| Error::ntlm("NTLM challenge header is not valid text"))?;
  let blob = value
    .strip_prefix("NTLM ")
    .ok_or_else(|| Error::NtlmAuth(format!("unexpected challenge header: {}", value)))?;
  BASE64
    .decode(blob.trim())
    .map_err(|err| Error::NtlmAuth(format!("challenge is not valid base64: {}", err)))
}

/// Write an HTML error page. Usable before a [`ProxyConnection`] exists, for
/// failures that happen while dialing the origin.
pub(crate) async fn write_error<W: AsyncWrite + Unpin>(
  writer: &mut W,
  status: StatusCode,
  msg: &str,
) -> std::io::Result<()> {
  let body = format!(
    "<html><h2>{} Error</h2><pre>{}</pre></html>",
    crate::PROXY_NAME,
    msg
  );
  let raw = format!(
    "HTTP/1.1 {}\r\nserver: {}\r\ncontent-type: text/html\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
    status,
    crate::PROXY_NAME,
    body.len(),
    body
  );
  writer.write_all(raw.as_bytes()).await?;
  writer.flush().await
}
