//! Debug traffic capture.
//!
//! [`DumpStream`] wraps the remote-side stream and appends every byte read
//! from or written to it into a per-connection log file, after TLS removal.
//! With no capture directory configured it is a zero-cost passthrough.

use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::warn;

use crate::errors::Result;

/// Stream decorator that tees plaintext traffic into a capture file.
#[derive(Debug)]
pub(crate) struct DumpStream<S> {
  inner: S,
  sink: Option<File>,
}

impl<S> DumpStream<S> {
  /// Wrap `inner`, capturing into `<dump_dir>/<authority>.<nanos>.log` when
  /// a dump directory is configured. The authority is the `host:port` the
  /// connection was made to.
  ///
  /// A capture file that cannot be created fails the connection setup; the
  /// caller turns that into an error response.
  pub(crate) fn new(inner: S, dump_dir: Option<&Path>, authority: &str) -> Result<Self> {
    let sink = match dump_dir {
      Some(dir) => {
        let nanos = SystemTime::now()
          .duration_since(UNIX_EPOCH)
          .map(|d| d.as_nanos())
          .unwrap_or_default();
        Some(File::create(dir.join(format!("{}.{}.log", authority, nanos)))?)
      }
      None => None,
    };
    Ok(Self { inner, sink })
  }

  fn dump(&mut self, data: &[u8]) {
    if let Some(sink) = self.sink.as_mut() {
      if let Err(err) = sink.write_all(data) {
        warn!("dump write failed, disabling capture: {}", err);
        self.sink = None;
      }
    }
  }
}

impl<S: AsyncRead + Unpin> AsyncRead for DumpStream<S> {
  fn poll_read(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    let before = buf.filled().len();
    match Pin::new(&mut self.inner).poll_read(cx, buf) {
      Poll::Ready(Ok(())) => {
        let filled = buf.filled()[before..].to_vec();
        self.dump(&filled);
        Poll::Ready(Ok(()))
      }
      other => other,
    }
  }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for DumpStream<S> {
  fn poll_write(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<std::io::Result<usize>> {
    match Pin::new(&mut self.inner).poll_write(cx, buf) {
      Poll::Ready(Ok(n)) => {
        let written = buf[..n].to_vec();
        self.dump(&written);
        Poll::Ready(Ok(n))
      }
      other => other,
    }
  }

  fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
    Pin::new(&mut self.inner).poll_flush(cx)
  }

  fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
    Pin::new(&mut self.inner).poll_shutdown(cx)
  }
}
