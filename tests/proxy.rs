//! End-to-end tests driving a real listener, a scripted origin and a raw
//! TCP client through the proxy.

use std::net::SocketAddr;
use std::path::PathBuf;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ntlm_anon_proxy::{tls, ProxyServer};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

fn identity() -> (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>) {
  let key_pair = rcgen::KeyPair::generate().unwrap();
  let cert = rcgen::CertificateParams::new(vec!["localhost".to_string()])
    .unwrap()
    .self_signed(&key_pair)
    .unwrap();
  let certs = vec![cert.der().clone()];
  let key = PrivateKeyDer::Pkcs8(key_pair.serialize_der().into());
  (certs, key)
}

async fn spawn_proxy(dump_dir: Option<PathBuf>) -> SocketAddr {
  let (certs, key) = identity();
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  let server = ProxyServer::new("127.0.0.1", 0, certs, key, dump_dir).unwrap();
  tokio::spawn(async move {
    let _ = server.serve(listener).await;
  });
  addr
}

/// Read one full HTTP message (head plus `Content-Length` body) as text.
async fn read_message<R: AsyncBufRead + Unpin>(reader: &mut R) -> String {
  let mut head = String::new();
  loop {
    let mut line = String::new();
    reader.read_line(&mut line).await.unwrap();
    assert!(!line.is_empty(), "peer closed mid-message");
    let done = line == "\r\n";
    head.push_str(&line);
    if done {
      break;
    }
  }
  let length = head
    .lines()
    .find_map(|line| {
      let (name, value) = line.split_once(':')?;
      if name.eq_ignore_ascii_case("content-length") {
        value.trim().parse::<usize>().ok()
      } else {
        None
      }
    })
    .unwrap_or(0);
  let mut body = vec![0u8; length];
  reader.read_exact(&mut body).await.unwrap();
  head + &String::from_utf8(body).unwrap()
}

/// Plain-TCP origin that answers each incoming request with the next
/// scripted response, returning everything it saw.
fn spawn_origin(listener: TcpListener, responses: Vec<String>) -> JoinHandle<Vec<String>> {
  tokio::spawn(async move {
    let (stream, _) = listener.accept().await.unwrap();
    let mut reader = BufReader::new(stream);
    let mut seen = Vec::new();
    for response in responses {
      seen.push(read_message(&mut reader).await);
      reader.write_all(response.as_bytes()).await.unwrap();
      reader.flush().await.unwrap();
    }
    seen
  })
}

fn header_value<'a>(message: &'a str, name: &str) -> Option<&'a str> {
  message.lines().find_map(|line| {
    let (header, value) = line.split_once(':')?;
    header.eq_ignore_ascii_case(name).then(|| value.trim())
  })
}

fn challenge_message() -> Vec<u8> {
  let mut msg = Vec::new();
  msg.extend_from_slice(b"NTLMSSP\0");
  msg.extend_from_slice(&2u32.to_le_bytes());
  msg.extend_from_slice(&[0u8; 8]); // TargetNameFields
  msg.extend_from_slice(&1u32.to_le_bytes()); // flags
  msg.extend_from_slice(&[0x11u8; 8]); // server challenge
  msg.extend_from_slice(&[0u8; 16]); // reserved + TargetInfoFields
  msg
}

async fn proxy_request(proxy: SocketAddr, request: &str) -> String {
  let stream = TcpStream::connect(proxy).await.unwrap();
  let mut client = BufReader::new(stream);
  client.write_all(request.as_bytes()).await.unwrap();
  client.flush().await.unwrap();
  read_message(&mut client).await
}

#[tokio::test]
async fn anonymous_ntlm_downgrade_replays_the_request() {
  let origin_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let origin_addr = origin_listener.local_addr().unwrap();
  let challenge = BASE64.encode(challenge_message());
  let origin = spawn_origin(
    origin_listener,
    vec![
      "HTTP/1.1 401 Unauthorized\r\nWww-Authenticate: NTLM\r\nContent-Length: 0\r\n\r\n"
        .to_string(),
      format!(
        "HTTP/1.1 401 Unauthorized\r\nWww-Authenticate: NTLM {}\r\nContent-Length: 0\r\n\r\n",
        challenge
      ),
      "HTTP/1.1 200 OK\r\nContent-Length: 6\r\n\r\nsecret".to_string(),
    ],
  );

  let proxy = spawn_proxy(None).await;
  let response = proxy_request(
    proxy,
    &format!(
      "POST http://{origin}/login HTTP/1.1\r\nHost: {origin}\r\nContent-Length: 7\r\n\r\npayload",
      origin = origin_addr
    ),
  )
  .await;

  assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
  assert!(response.ends_with("secret"));
  assert_eq!(header_value(&response, "proxy-server"), Some("ntlm-anon-proxy"));

  let seen = origin.await.unwrap();
  assert_eq!(seen.len(), 3);
  // The original body is replayed byte for byte at every handshake step.
  for message in &seen {
    assert!(message.ends_with("payload"), "body lost in: {}", message);
  }
  assert!(header_value(&seen[0], "authorization").is_none());

  let negotiate = header_value(&seen[1], "authorization").unwrap();
  let negotiate = BASE64
    .decode(negotiate.strip_prefix("NTLM ").unwrap())
    .unwrap();
  assert_eq!(&negotiate[0..8], b"NTLMSSP\0");
  assert_eq!(&negotiate[8..12], &1u32.to_le_bytes());

  let authenticate = header_value(&seen[2], "authorization").unwrap();
  let authenticate = BASE64
    .decode(authenticate.strip_prefix("NTLM ").unwrap())
    .unwrap();
  assert_eq!(&authenticate[0..8], b"NTLMSSP\0");
  assert_eq!(&authenticate[8..12], &3u32.to_le_bytes());
}

#[tokio::test]
async fn other_auth_schemes_are_relayed_untouched() {
  let origin_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let origin_addr = origin_listener.local_addr().unwrap();
  let origin = spawn_origin(
    origin_listener,
    vec![
      "HTTP/1.1 401 Unauthorized\r\nWww-Authenticate: Negotiate\r\nContent-Length: 0\r\n\r\n"
        .to_string(),
    ],
  );

  let proxy = spawn_proxy(None).await;
  let response = proxy_request(
    proxy,
    &format!(
      "GET http://{origin}/ HTTP/1.1\r\nHost: {origin}\r\n\r\n",
      origin = origin_addr
    ),
  )
  .await;

  assert!(response.starts_with("HTTP/1.1 401 Unauthorized\r\n"));
  assert_eq!(header_value(&response, "www-authenticate"), Some("Negotiate"));
  // Exactly one request, no handshake attempt.
  assert_eq!(origin.await.unwrap().len(), 1);
}

#[tokio::test]
async fn malformed_challenge_yields_service_unavailable() {
  let origin_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let origin_addr = origin_listener.local_addr().unwrap();
  let _origin = spawn_origin(
    origin_listener,
    vec![
      "HTTP/1.1 401 Unauthorized\r\nWww-Authenticate: NTLM\r\nContent-Length: 0\r\n\r\n"
        .to_string(),
      "HTTP/1.1 401 Unauthorized\r\nWww-Authenticate: NTLM %%%\r\nContent-Length: 0\r\n\r\n"
        .to_string(),
    ],
  );

  let proxy = spawn_proxy(None).await;
  let response = proxy_request(
    proxy,
    &format!(
      "GET http://{origin}/ HTTP/1.1\r\nHost: {origin}\r\n\r\n",
      origin = origin_addr
    ),
  )
  .await;

  assert!(response.starts_with("HTTP/1.1 503 Service Unavailable\r\n"));
  assert_eq!(header_value(&response, "server"), Some("ntlm-anon-proxy"));
  assert!(response.contains("<pre>"));
}

#[tokio::test]
async fn keep_alive_responses_turn_the_session_into_a_raw_bridge() {
  let origin_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let origin_addr = origin_listener.local_addr().unwrap();
  let _origin = tokio::spawn(async move {
    let (stream, _) = origin_listener.accept().await.unwrap();
    let mut reader = BufReader::new(stream);
    read_message(&mut reader).await;
    reader
      .write_all(b"HTTP/1.1 200 OK\r\nConnection: keep-alive\r\nContent-Length: 2\r\n\r\nok")
      .await
      .unwrap();
    reader.flush().await.unwrap();
    // Whatever comes next arrives raw, without the proxy reframing it.
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"PING");
    reader.write_all(b"PONG").await.unwrap();
    reader.flush().await.unwrap();
  });

  let proxy = spawn_proxy(None).await;
  let stream = TcpStream::connect(proxy).await.unwrap();
  let mut client = BufReader::new(stream);
  client
    .write_all(
      format!(
        "GET http://{origin}/ HTTP/1.1\r\nHost: {origin}\r\n\r\n",
        origin = origin_addr
      )
      .as_bytes(),
    )
    .await
    .unwrap();
  client.flush().await.unwrap();

  // The full response arrives first, then the bridge is up.
  let response = read_message(&mut client).await;
  assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
  assert!(response.ends_with("ok"));

  client.write_all(b"PING").await.unwrap();
  client.flush().await.unwrap();
  let mut buf = [0u8; 4];
  client.read_exact(&mut buf).await.unwrap();
  assert_eq!(&buf, b"PONG");
}

#[tokio::test]
async fn hop_by_hop_and_client_address_headers_are_scrubbed() {
  let origin_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let origin_addr = origin_listener.local_addr().unwrap();
  let origin = spawn_origin(
    origin_listener,
    vec!["HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok".to_string()],
  );

  let proxy = spawn_proxy(None).await;
  let response = proxy_request(
    proxy,
    &format!(
      "GET http://{origin}/ HTTP/1.1\r\nHost: {origin}\r\nAccept-Encoding: gzip\r\nProxy-Connection: keep-alive\r\nX-Forwarded-For: 203.0.113.9\r\nUser-Agent: curl/8.0\r\n\r\n",
      origin = origin_addr
    ),
  )
  .await;
  assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));

  let seen = origin.await.unwrap();
  let forwarded = &seen[0];
  assert!(header_value(forwarded, "accept-encoding").is_none());
  assert!(header_value(forwarded, "proxy-connection").is_none());
  assert_eq!(header_value(forwarded, "x-forwarded-for"), Some("127.0.0.1"));
  assert_eq!(header_value(forwarded, "x-real-ip"), Some("127.0.0.1"));
  assert_eq!(header_value(forwarded, "user-agent"), Some("curl/8.0"));
}

#[tokio::test]
async fn switching_protocols_bridges_raw_bytes() {
  let origin_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let origin_addr = origin_listener.local_addr().unwrap();
  let _origin = tokio::spawn(async move {
    let (stream, _) = origin_listener.accept().await.unwrap();
    let mut reader = BufReader::new(stream);
    read_message(&mut reader).await;
    reader
      .write_all(b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: echo\r\nConnection: Upgrade\r\n\r\n")
      .await
      .unwrap();
    reader.flush().await.unwrap();
    // Echo whatever arrives through the tunnel.
    let mut buf = [0u8; 5];
    reader.read_exact(&mut buf).await.unwrap();
    reader.write_all(&buf).await.unwrap();
    reader.flush().await.unwrap();
  });

  let proxy = spawn_proxy(None).await;
  let stream = TcpStream::connect(proxy).await.unwrap();
  let mut client = BufReader::new(stream);
  client
    .write_all(
      format!(
        "GET http://{origin}/ws HTTP/1.1\r\nHost: {origin}\r\nUpgrade: echo\r\nConnection: Upgrade\r\n\r\n",
        origin = origin_addr
      )
      .as_bytes(),
    )
    .await
    .unwrap();
  client.flush().await.unwrap();

  let response = read_message(&mut client).await;
  assert!(response.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));

  client.write_all(b"hello").await.unwrap();
  client.flush().await.unwrap();
  let mut buf = [0u8; 5];
  client.read_exact(&mut buf).await.unwrap();
  assert_eq!(&buf, b"hello");
}

#[tokio::test]
async fn dump_files_are_named_after_the_origin_authority() {
  let dir = std::env::temp_dir().join(format!("proxy-dump-itest-{}", std::process::id()));
  std::fs::create_dir_all(&dir).unwrap();

  let origin_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let origin_addr = origin_listener.local_addr().unwrap();
  let _origin = spawn_origin(
    origin_listener,
    vec!["HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok".to_string()],
  );

  let proxy = spawn_proxy(Some(dir.clone())).await;
  let response = proxy_request(
    proxy,
    &format!(
      "GET http://{origin}/ HTTP/1.1\r\nHost: {origin}\r\n\r\n",
      origin = origin_addr
    ),
  )
  .await;
  assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));

  // One capture file per connection, prefixed with host:port as dialed.
  let prefix = format!("{}.", origin_addr);
  let entry = std::fs::read_dir(&dir)
    .unwrap()
    .filter_map(|e| e.ok())
    .find(|e| e.file_name().to_string_lossy().starts_with(&prefix))
    .unwrap();
  let captured = String::from_utf8(std::fs::read(entry.path()).unwrap()).unwrap();
  assert!(captured.starts_with("GET / HTTP/1.1\r\n"));
  assert!(captured.ends_with("ok"));
  std::fs::remove_dir_all(&dir).unwrap();
}

#[tokio::test]
async fn unusable_dump_dir_fails_the_request_with_500() {
  let dir = std::env::temp_dir().join("proxy-dump-itest-no-such-dir");
  let _ = std::fs::remove_dir_all(&dir);

  let origin_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let origin_addr = origin_listener.local_addr().unwrap();
  let _origin = tokio::spawn(async move {
    // The dial succeeds; the session dies on the proxy side before any
    // request is forwarded.
    let _ = origin_listener.accept().await;
  });

  let proxy = spawn_proxy(Some(dir)).await;
  let response = proxy_request(
    proxy,
    &format!(
      "GET http://{origin}/ HTTP/1.1\r\nHost: {origin}\r\n\r\n",
      origin = origin_addr
    ),
  )
  .await;
  assert!(response.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
  assert_eq!(header_value(&response, "server"), Some("ntlm-anon-proxy"));
}

#[tokio::test]
async fn chunked_responses_stream_through_in_original_framing() {
  let origin_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let origin_addr = origin_listener.local_addr().unwrap();
  let _origin = tokio::spawn(async move {
    let (stream, _) = origin_listener.accept().await.unwrap();
    let mut reader = BufReader::new(stream);
    read_message(&mut reader).await;
    reader
      .write_all(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n")
      .await
      .unwrap();
    reader.flush().await.unwrap();
    // Chunks land one at a time; the proxy must not wait for the body to
    // finish before relaying.
    for chunk in [&b"5\r\nfirst\r\n"[..], b"6\r\nsecond\r\n", b"0\r\n\r\n"] {
      reader.write_all(chunk).await.unwrap();
      reader.flush().await.unwrap();
    }
  });

  let proxy = spawn_proxy(None).await;
  let stream = TcpStream::connect(proxy).await.unwrap();
  let mut client = BufReader::new(stream);
  client
    .write_all(
      format!(
        "GET http://{origin}/big HTTP/1.1\r\nHost: {origin}\r\n\r\n",
        origin = origin_addr
      )
      .as_bytes(),
    )
    .await
    .unwrap();
  client.flush().await.unwrap();

  let mut head = String::new();
  loop {
    let mut line = String::new();
    client.read_line(&mut line).await.unwrap();
    let done = line == "\r\n";
    head.push_str(&line);
    if done {
      break;
    }
  }
  assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
  assert!(head.to_ascii_lowercase().contains("transfer-encoding: chunked\r\n"));

  let wire = b"5\r\nfirst\r\n6\r\nsecond\r\n0\r\n\r\n";
  let mut body = vec![0u8; wire.len()];
  client.read_exact(&mut body).await.unwrap();
  assert_eq!(body, wire);
}

#[tokio::test]
async fn connect_tunnel_is_intercepted_and_forwarded() {
  // TLS origin with its own throwaway certificate.
  let (origin_certs, origin_key) = identity();
  let origin_acceptor = tls::static_acceptor(origin_certs, origin_key).unwrap();
  let origin_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let origin_addr = origin_listener.local_addr().unwrap();
  let origin = tokio::spawn(async move {
    let (stream, _) = origin_listener.accept().await.unwrap();
    let stream = origin_acceptor.accept(stream).await.unwrap();
    let mut reader = BufReader::new(stream);
    let request = read_message(&mut reader).await;
    reader
      .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 8\r\n\r\nvia-mitm")
      .await
      .unwrap();
    reader.flush().await.unwrap();
    request
  });

  let proxy = spawn_proxy(None).await;
  let mut stream = TcpStream::connect(proxy).await.unwrap();
  stream
    .write_all(
      format!(
        "CONNECT {origin} HTTP/1.1\r\nHost: {origin}\r\n\r\n",
        origin = origin_addr
      )
      .as_bytes(),
    )
    .await
    .unwrap();

  // The tunnel-established reply arrives in plaintext, before any TLS.
  let mut established = Vec::new();
  let mut byte = [0u8; 1];
  while !established.ends_with(b"\r\n\r\n") {
    stream.read_exact(&mut byte).await.unwrap();
    established.push(byte[0]);
  }
  let established = String::from_utf8(established).unwrap();
  assert!(established.starts_with("HTTP/1.1 200 OK\r\n"));
  assert!(established.contains("Proxy-Agent: ntlm-anon-proxy\r\n"));

  // Now handshake with the proxy as if it were the origin.
  let connector = tls::insecure_connector().unwrap();
  let domain = ServerName::try_from("localhost").unwrap();
  let tls_stream = connector.connect(domain, stream).await.unwrap();
  let mut client = BufReader::new(tls_stream);
  client
    .write_all(
      format!(
        "GET /secret HTTP/1.1\r\nHost: {origin}\r\n\r\n",
        origin = origin_addr
      )
      .as_bytes(),
    )
    .await
    .unwrap();
  client.flush().await.unwrap();

  let response = read_message(&mut client).await;
  assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
  assert!(response.ends_with("via-mitm"));

  let origin_request = origin.await.unwrap();
  assert!(origin_request.starts_with("GET /secret HTTP/1.1\r\n"));
}
