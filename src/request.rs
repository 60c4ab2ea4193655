use std::fmt::{Debug, Formatter};

use bytes::Bytes;
use http::{HeaderMap, HeaderValue, Method, Version};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};

use crate::body::Body;
use crate::errors::{new_io_error, Error, Result};
use crate::response::parser_headers;
use crate::{COLON_SPACE, CR_LF, SPACE};

/// A client request intercepted by the proxy.
///
/// The target URI starts out as whatever was on the request line (origin form
/// for tunneled requests, absolute or authority form for direct proxy
/// requests) and is rebuilt by the server layer into an effective
/// scheme://host:port/path target before forwarding.
#[derive(Default, Clone)]
pub struct Request {
  uri: http::Uri,
  version: Version,
  method: Method,
  headers: HeaderMap<HeaderValue>,
  body: Option<Body>,
}

impl Debug for Request {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Request")
      .field("uri", &self.uri)
      .field("version", &self.version)
      .field("method", &self.method)
      .field("headers", &self.headers)
      .field("body", &self.body)
      .finish()
  }
}

impl Request {
  /// The HTTP method.
  #[inline]
  pub fn method(&self) -> &Method {
    &self.method
  }
  /// The target URI.
  #[inline]
  pub fn uri(&self) -> &http::Uri {
    &self.uri
  }
  /// The HTTP version from the request line.
  #[inline]
  pub fn version(&self) -> Version {
    self.version
  }
  /// The request headers.
  #[inline]
  pub fn headers(&self) -> &HeaderMap {
    &self.headers
  }
  /// Mutable access to the request headers.
  #[inline]
  pub fn headers_mut(&mut self) -> &mut HeaderMap {
    &mut self.headers
  }
  /// The request body, if one was read.
  #[inline]
  pub fn body(&self) -> Option<&Body> {
    self.body.as_ref()
  }
  /// Replace the body, restoring a snapshot taken before a send.
  #[inline]
  pub fn set_body<B: Into<Body>>(&mut self, body: Option<B>) {
    self.body = body.map(Into::into);
  }

  /// Serialize the request for the wire.
  ///
  /// A `Host` header is added from the URI authority when the client did not
  /// send one, and `Content-Length` is added when a body is present. The body
  /// bytes are appended verbatim, so serializing twice after a body restore
  /// produces byte-identical output.
  pub(crate) fn to_raw(&self) -> Bytes {
    let mut raw = Vec::new();
    raw.extend(self.method.as_str().as_bytes());
    raw.extend(SPACE);
    raw.extend(self.uri.path().as_bytes());
    if let Some(q) = self.uri.query() {
      raw.extend([63]);
      raw.extend(q.as_bytes());
    }
    raw.extend(SPACE);
    raw.extend(format!("{:?}", self.version).as_bytes());
    raw.extend(CR_LF);
    if self.headers.get(http::header::HOST).is_none() {
      raw.extend(http::header::HOST.as_str().as_bytes());
      raw.extend(COLON_SPACE);
      raw.extend(if let Some(a) = self.uri.authority() {
        a.as_str().as_bytes()
      } else {
        &[]
      });
      raw.extend(CR_LF);
    }
    let mut headers = self.headers.clone();
    if let Some(b) = self.body() {
      if !b.is_empty() {
        headers
          .entry(http::header::CONTENT_LENGTH)
          .or_insert(HeaderValue::from(b.len()));
      }
    }
    for (k, v) in headers.iter() {
      raw.extend(k.as_str().as_bytes());
      raw.extend(COLON_SPACE);
      raw.extend(v.as_bytes());
      raw.extend(CR_LF);
    }
    raw.extend(CR_LF);
    if let Some(b) = self.body() {
      if !b.is_empty() {
        raw.extend(b.as_ref());
      }
    }
    Bytes::from(raw)
  }
}

/// Reads one HTTP/1.1 request from a buffered stream.
pub(crate) struct RequestReader<'a, T: AsyncRead + Unpin> {
  reader: &'a mut BufReader<T>,
}

impl<'a, T: AsyncRead + Unpin> RequestReader<'a, T> {
  pub(crate) fn new(reader: &'a mut BufReader<T>) -> Self {
    Self { reader }
  }

  async fn parse_request_line(&mut self) -> Result<(Method, http::Uri, Version)> {
    let mut line = Vec::new();
    let length = self.reader.read_until(b'\n', &mut line).await?;
    if length == 0 {
      return Err(new_io_error(
        std::io::ErrorKind::UnexpectedEof,
        "connection closed before a request line",
      ));
    }
    let line = line.strip_suffix(CR_LF).unwrap_or(&line);
    let mut parts = line.splitn(3, |b| b == &b' ');
    let method = parts
      .next()
      .filter(|p| !p.is_empty())
      .and_then(|p| Method::from_bytes(p).ok())
      .ok_or_else(|| Error::InvalidRequest("bad method".to_string()))?;
    let uri = parts
      .next()
      .filter(|p| !p.is_empty())
      .and_then(|p| std::str::from_utf8(p).ok())
      .and_then(|p| p.parse::<http::Uri>().ok())
      .ok_or_else(|| Error::InvalidRequest("bad request target".to_string()))?;
    let version = match parts.next() {
      Some(b"HTTP/0.9") => Version::HTTP_09,
      Some(b"HTTP/1.0") => Version::HTTP_10,
      Some(b"HTTP/1.1") => Version::HTTP_11,
      _ => return Err(Error::InvalidRequest("bad http version".to_string())),
    };
    Ok((method, uri, version))
  }

  async fn read_headers(&mut self) -> HeaderMap {
    let mut headers = HeaderMap::new();
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

  /// Parse the request line, headers and (framed) body.
  ///
  /// Requests carrying neither `Content-Length` nor a chunked
  /// `Transfer-Encoding` have no body; the stream is never read to EOF here
  /// since the client connection stays open for the response.
  pub(crate) async fn read(mut self) -> Result<Request> {
    let (method, uri, version) = self.parse_request_line().await?;
    let headers = self.read_headers().await;
    let content_length: Option<u64> = headers
      .get(http::header::CONTENT_LENGTH)
      .and_then(|x| x.to_str().ok()?.parse().ok());
    let chunked = headers
      .get(http::header::TRANSFER_ENCODING)
      .is_some_and(|te| te == "chunked");
    let body = if chunked {
      Some(read_chunked_body(self.reader).await?)
    } else if let Some(length) = content_length.filter(|l| *l > 0) {
      Some(read_sized_body(self.reader, length).await?)
    } else {
      None
    };
    Ok(Request {
      uri,
      version,
      method,
      headers,
      body: body.map(Body::from),
    })
  }
}

/// Buffer a `Content-Length` request body.
///
/// Request bodies are held whole so they can be replayed during an auth
/// exchange. The declared length only bounds the read; the buffer grows with
/// the bytes actually received, so a hostile length cannot force an
/// allocation.
async fn read_sized_body<T: AsyncRead + Unpin>(
  reader: &mut BufReader<T>,
  length: u64,
) -> Result<Vec<u8>> {
  let mut body = Vec::new();
  let read = (&mut *reader).take(length).read_to_end(&mut body).await?;
  if (read as u64) != length {
    return Err(new_io_error(
      std::io::ErrorKind::UnexpectedEof,
      "connection closed inside a sized body",
    ));
  }
  Ok(body)
}

/// Buffer a `Transfer-Encoding: chunked` request body, decoded.
async fn read_chunked_body<T: AsyncRead + Unpin>(
  reader: &mut BufReader<T>,
) -> Result<Vec<u8>> {
  let mut body = Vec::new();
  loop {
    let mut size_line = Vec::new();
    let length = reader.read_until(b'\n', &mut size_line).await?;
    if length == 0 {
      return Err(new_io_error(
        std::io::ErrorKind::UnexpectedEof,
        "connection closed inside a chunked body",
      ));
    }
    let stripped = size_line.strip_suffix(CR_LF).unwrap_or(&size_line);
    // Chunk extensions after ';' are ignored for sizing.
    let size_str = stripped
      .split(|b| b == &b';')
      .next()
      .and_then(|s| std::str::from_utf8(s).ok())
      .unwrap_or_default()
      .trim();
    let size = u64::from_str_radix(size_str, 16)
      .map_err(|_| Error::InvalidRequest("bad chunk size".to_string()))?;
    if size == 0 {
      let mut trailer = Vec::new();
      loop {
        trailer.clear();
        let length = reader.read_until(b'\n', &mut trailer).await?;
        if length == 0 || trailer == b"\r\n" || trailer == b"\n" {
          break;
        }
      }
      return Ok(body);
    }
    let read = (&mut *reader).take(size).read_to_end(&mut body).await?;
    if (read as u64) != size {
      return Err(new_io_error(
        std::io::ErrorKind::UnexpectedEof,
        "connection closed inside a chunked body",
      ));
    }
    let mut crlf = [0; 2];
    reader.read_exact(&mut crlf).await?;
  }
}
