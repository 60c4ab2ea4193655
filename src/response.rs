use bytes::{BufMut, Bytes, BytesMut};
use http::Method;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::errors::{new_io_error, Error, Result};
use crate::{COLON_SPACE, CR_LF, SPACE};

/// The head of an origin response as parsed off the wire.
///
/// The body is not part of this type: it is relayed (or discarded)
/// incrementally by [`relay_body`] according to [`Response::framing`], so a
/// large download never has to fit in memory.
#[derive(Debug, Default, Clone)]
pub struct Response {
  version: http::Version,
  status_code: http::StatusCode,
  reason: Option<String>,
  headers: http::HeaderMap<http::HeaderValue>,
  framing: BodyFraming,
}

impl Response {
  /// The response status code.
  #[inline]
  pub fn status_code(&self) -> http::StatusCode {
    self.status_code
  }
  /// The HTTP version from the status line.
  #[inline]
  pub fn version(&self) -> http::Version {
    self.version
  }
  /// The response headers.
  #[inline]
  pub fn headers(&self) -> &http::HeaderMap {
    &self.headers
  }
  /// Mutable access to the response headers.
  #[inline]
  pub fn headers_mut(&mut self) -> &mut http::HeaderMap {
    &mut self.headers
  }
  /// How the body following this head is delimited.
  #[inline]
  pub(crate) fn framing(&self) -> BodyFraming {
    self.framing
  }

  /// Serialize the head for relaying to the downstream client.
  ///
  /// The origin's version, reason phrase and headers pass through verbatim,
  /// framing headers included, since the body bytes that follow are relayed
  /// in their original framing too.
  pub(crate) fn head_to_raw(&self) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_slice(format!("{:?}", self.version).as_bytes());
    buf.put_slice(SPACE);
    match &self.reason {
      Some(reason) => {
        buf.put_slice(self.status_code.as_str().as_bytes());
        buf.put_slice(SPACE);
        buf.put_slice(reason.as_bytes());
      }
      None => buf.put_slice(self.status_code.to_string().as_bytes()),
    }
    buf.put_slice(CR_LF);
    for (name, value) in &self.headers {
      buf.put_slice(name.as_str().as_bytes());
      buf.put_slice(COLON_SPACE);
      buf.put_slice(value.as_bytes());
      buf.put_slice(CR_LF);
    }
    buf.put_slice(CR_LF);
    buf.freeze()
  }
}

/// How a message body is delimited on the wire.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyFraming {
  /// no body at all (HEAD answers, 1xx, 204, 304)
  #[default]
  None,
  /// exactly this many bytes
  Sized(u64),
  /// `Transfer-Encoding: chunked`
  Chunked,
  /// delimited by the peer closing the connection
  Eof,
}

/// Classify how the body after a response head is delimited.
pub(crate) fn body_framing(
  method: &Method,
  status: http::StatusCode,
  headers: &http::HeaderMap,
) -> BodyFraming {
  if *method == Method::HEAD
    || status.is_informational()
    || status == http::StatusCode::NO_CONTENT
    || status == http::StatusCode::NOT_MODIFIED
  {
    return BodyFraming::None;
  }
  let chunked = headers
    .get(http::header::TRANSFER_ENCODING)
    .is_some_and(|te| te == "chunked");
  if chunked {
    return BodyFraming::Chunked;
  }
  let content_length: Option<u64> = headers
    .get(http::header::CONTENT_LENGTH)
    .and_then(|x| x.to_str().ok()?.parse().ok());
  match content_length {
    Some(0) => BodyFraming::None,
    Some(length) => BodyFraming::Sized(length),
    None => BodyFraming::Eof,
  }
}

/// Reads one HTTP/1.1 response head from a buffered stream.
///
/// Body bytes stay in the stream; [`relay_body`] moves them onward (or into
/// a sink) without ever buffering the whole body.
pub(crate) struct ResponseReader<'a, T: AsyncRead + Unpin> {
  reader: &'a mut BufReader<T>,
  method: Method,
}

impl<'a, T: AsyncRead + Unpin> ResponseReader<'a, T> {
  pub(crate) fn new(reader: &'a mut BufReader<T>, method: &Method) -> Self {
    Self {
      reader,
      method: method.clone(),
    }
  }

  async fn parse_status_line(
    &mut self,
  ) -> Result<(http::Version, http::StatusCode, Option<String>)> {
    let mut line = Vec::new();
    let length = self.reader.read_until(b'\n', &mut line).await?;
    if length == 0 {
      return Err(new_io_error(
        std::io::ErrorKind::UnexpectedEof,
        "origin closed before a status line",
      ));
    }
    let line = line.strip_suffix(CR_LF).unwrap_or(&line);
    let mut parts = line.splitn(3, |b| b == &b' ');
    let version = match parts.next() {
      Some(b"HTTP/0.9") => http::Version::HTTP_09,
      Some(b"HTTP/1.0") => http::Version::HTTP_10,
      Some(b"HTTP/1.1") => http::Version::HTTP_11,
      Some(b"HTTP/2.0") => http::Version::HTTP_2,
      Some(b"HTTP/3.0") => http::Version::HTTP_3,
      _ => {
        return Err(Error::InvalidResponse("bad http version".to_string()));
      }
    };
    let status_code = parts
      .next()
      .map(http::StatusCode::try_from)
      .ok_or_else(|| Error::InvalidResponse("missing status code".to_string()))??;
    let reason = parts
      .next()
      .and_then(|r| std::str::from_utf8(r).ok())
      .filter(|r| !r.is_empty())
      .map(str::to_string);
    Ok((version, status_code, reason))
  }

  async fn read_headers(&mut self) -> http::HeaderMap {
    let mut headers = http::HeaderMap::new();
    let mut header_line = Vec::new();
    while let Ok(length) = self.reader.read_until(b'\n', &mut header_line).await {
      if length == 0 || header_line == b"\r\n" {
        break;
      }
      if let Ok((Some(k), Some(v))) = parser_headers(&header_line) {
        headers.append(k, v);
      }
      header_line.clear();
    }
    headers
  }

  pub(crate) async fn read_head(mut self) -> Result<Response> {
    let (version, status_code, reason) = self.parse_status_line().await?;
    let headers = self.read_headers().await;
    let framing = body_framing(&self.method, status_code, &headers);
    Ok(Response {
      version,
      status_code,
      reason,
      headers,
      framing,
    })
  }
}

/// Split one `Name: value` header line into typed key/value.
pub(crate) fn parser_headers(
  buffer: &[u8],
) -> Result<(Option<http::HeaderName>, Option<http::HeaderValue>)> {
  let mut k = None;
  let mut v = None;
  let buffer = buffer.strip_suffix(CR_LF).unwrap_or(buffer);
  for (index, h) in buffer.splitn(2, |s| s == &58).enumerate() {
    let h = h.strip_prefix(b" ".as_ref()).unwrap_or(h);
    match index {
      0 => match http::HeaderName::from_bytes(h) {
        Ok(hk) => k = Some(hk),
        Err(err) => {
          return Err(Error::Http(http::Error::from(err)));
        }
      },
      1 => match http::HeaderValue::from_bytes(h) {
        Ok(hv) => v = Some(hv),
        Err(err) => {
          return Err(Error::Http(http::Error::from(err)));
        }
      },
      _ => {}
    }
  }
  Ok((k, v))
}

/// Move one body from `reader` to `writer` in its original wire framing,
/// copying incrementally. The declared length is never trusted for an
/// allocation; only bytes actually received occupy memory.
pub(crate) async fn relay_body<R: AsyncRead + Unpin, W: AsyncWrite + Unpin>(
  reader: &mut BufReader<R>,
  writer: &mut W,
  framing: BodyFraming,
) -> Result<()> {
  match framing {
    BodyFraming::None => Ok(()),
    BodyFraming::Sized(length) => copy_sized(reader, writer, length).await,
    BodyFraming::Chunked => relay_chunked(reader, writer).await,
    BodyFraming::Eof => {
      tokio::io::copy(reader, writer).await?;
      Ok(())
    }
  }
}

async fn copy_sized<R: AsyncRead + Unpin, W: AsyncWrite + Unpin>(
  reader: &mut BufReader<R>,
  writer: &mut W,
  length: u64,
) -> Result<()> {
  let mut buf = [0u8; 8192];
  let mut remaining = length;
  while remaining > 0 {
    let want = remaining.min(buf.len() as u64) as usize;
    let read = reader.read(&mut buf[..want]).await?;
    if read == 0 {
      return Err(new_io_error(
        std::io::ErrorKind::UnexpectedEof,
        "connection closed inside a sized body",
      ));
    }
    writer.write_all(&buf[..read]).await?;
    remaining -= read as u64;
  }
  Ok(())
}

/// Relay a `Transfer-Encoding: chunked` body verbatim, including chunk size
/// lines, extensions, the terminal chunk and any trailers.
async fn relay_chunked<R: AsyncRead + Unpin, W: AsyncWrite + Unpin>(
  reader: &mut BufReader<R>,
  writer: &mut W,
) -> Result<()> {
  loop {
    let mut size_line = Vec::new();
    let length = reader.read_until(b'\n', &mut size_line).await?;
    if length == 0 {
      return Err(new_io_error(
        std::io::ErrorKind::UnexpectedEof,
        "connection closed inside a chunked body",
      ));
    }
    let stripped = size_line
      .strip_suffix(CR_LF)
      .unwrap_or(&size_line)
      .to_vec();
    // Chunk extensions after ';' are ignored for sizing.
    let size_str = stripped
      .split(|b| b == &b';')
      .next()
      .and_then(|s| std::str::from_utf8(s).ok())
      .unwrap_or_default()
      .trim()
      .to_string();
    let size = u64::from_str_radix(&size_str, 16)
      .map_err(|_| Error::InvalidResponse("bad chunk size".to_string()))?;
    writer.write_all(&size_line).await?;
    if size == 0 {
      // Trailer lines pass through up to (and including) the empty line.
      let mut trailer = Vec::new();
      loop {
        trailer.clear();
        let length = reader.read_until(b'\n', &mut trailer).await?;
        if length == 0 {
          break;
        }
        writer.write_all(&trailer).await?;
        if trailer == b"\r\n" || trailer == b"\n" {
          break;
        }
      }
      return Ok(());
    }
    copy_sized(reader, writer, size).await?;
    let mut crlf = [0; 2];
    reader.read_exact(&mut crlf).await?;
    writer.write_all(&crlf).await?;
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  async fn read_relayed(raw: &[u8], method: Method) -> (Response, Vec<u8>) {
    let mut reader = BufReader::new(raw);
    let resp = ResponseReader::new(&mut reader, &method)
      .read_head()
      .await
      .unwrap();
    let mut body = Vec::new();
    relay_body(&mut reader, &mut body, resp.framing()).await.unwrap();
    (resp, body)
  }

  #[tokio::test]
  async fn parses_content_length_body() {
    let (resp, body) = read_relayed(
      b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nX-A: 1\r\n\r\nok",
      Method::GET,
    )
    .await;
    assert_eq!(resp.status_code(), http::StatusCode::OK);
    assert_eq!(resp.framing(), BodyFraming::Sized(2));
    assert_eq!(body, b"ok");
  }

  #[tokio::test]
  async fn chunked_body_is_relayed_verbatim() {
    let wire = b"4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n";
    let raw = [
      b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n".as_ref(),
      wire.as_ref(),
    ]
    .concat();
    let (resp, body) = read_relayed(&raw, Method::GET).await;
    assert_eq!(resp.framing(), BodyFraming::Chunked);
    assert_eq!(body, wire);
  }

  #[tokio::test]
  async fn switching_protocols_has_no_body() {
    let raw = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\nRAW";
    let mut reader = BufReader::new(raw.as_ref());
    let resp = ResponseReader::new(&mut reader, &Method::GET)
      .read_head()
      .await
      .unwrap();
    assert_eq!(resp.status_code(), http::StatusCode::SWITCHING_PROTOCOLS);
    assert_eq!(resp.framing(), BodyFraming::None);
    // The tunneled bytes after the head stay in the reader untouched.
    let mut rest = Vec::new();
    reader.read_to_end(&mut rest).await.unwrap();
    assert_eq!(rest, b"RAW");
  }

  #[tokio::test]
  async fn repeated_headers_keep_all_values() {
    let (resp, _) = read_relayed(
      b"HTTP/1.1 401 Unauthorized\r\nWww-Authenticate: Negotiate\r\nWww-Authenticate: NTLM\r\nContent-Length: 0\r\n\r\n",
      Method::GET,
    )
    .await;
    let values: Vec<_> = resp
      .headers()
      .get_all(http::header::WWW_AUTHENTICATE)
      .iter()
      .collect();
    assert_eq!(values, vec!["Negotiate", "NTLM"]);
  }

  #[tokio::test]
  async fn head_response_body_is_skipped() {
    let (resp, body) = read_relayed(
      b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\n",
      Method::HEAD,
    )
    .await;
    assert_eq!(resp.framing(), BodyFraming::None);
    assert!(body.is_empty());
  }

  #[tokio::test]
  async fn absurd_content_length_fails_without_allocating() {
    let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 18446744073709551615\r\n\r\nstub";
    let mut reader = BufReader::new(raw.as_ref());
    let resp = ResponseReader::new(&mut reader, &Method::GET)
      .read_head()
      .await
      .unwrap();
    assert_eq!(resp.framing(), BodyFraming::Sized(u64::MAX));
    // The declared size never becomes an allocation; the copy just runs out
    // of input and errors.
    let mut out = Vec::new();
    let err = relay_body(&mut reader, &mut out, resp.framing())
      .await
      .unwrap_err();
    assert!(matches!(err, Error::IO(ref e) if e.kind() == std::io::ErrorKind::UnexpectedEof));
    assert_eq!(out, b"stub");
  }

  #[tokio::test]
  async fn origin_status_line_passes_through_verbatim() {
    let mut reader =
      BufReader::new(b"HTTP/1.0 404 Not Here\r\nX-A: 1\r\nContent-Length: 0\r\n\r\n".as_ref());
    let resp = ResponseReader::new(&mut reader, &Method::GET)
      .read_head()
      .await
      .unwrap();
    let head = resp.head_to_raw();
    assert!(head.starts_with(b"HTTP/1.0 404 Not Here\r\n"));
  }

  #[tokio::test]
  async fn head_serialization_keeps_framing_headers() {
    let (resp, _) = read_relayed(
      b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n0\r\n\r\n",
      Method::GET,
    )
    .await;
    let head = String::from_utf8(resp.head_to_raw().to_vec()).unwrap();
    assert!(head.contains("transfer-encoding: chunked\r\n"));
  }
}
