//! proxy errors
use thiserror::Error as ThisError;

/// A `Result` alias where the `Err` case is `ntlm_anon_proxy::Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// The errors that may occur while proxying a connection.
#[derive(ThisError, Debug)]
pub enum Error {
  /// TLS error
  #[error(transparent)]
  Tls(#[from] tokio_rustls::rustls::Error),
  /// IO error
  #[error(transparent)]
  IO(#[from] std::io::Error),
  /// http::Error
  #[error(transparent)]
  Http(http::Error),
  /// failed to reach the origin
  #[error("connect to {0} failed: {1}")]
  Connect(String, std::io::Error),
  /// malformed inbound request
  #[error("invalid request: {0}")]
  InvalidRequest(String),
  /// malformed origin response
  #[error("invalid response: {0}")]
  InvalidResponse(String),
  /// the origin did not complete the anonymous NTLM exchange
  #[error("NTLM authentication failed: {0}")]
  NtlmAuth(String),
}

impl From<http::Error> for Error {
  fn from(value: http::Error) -> Self {
    Error::Http(value)
  }
}

impl From<http::header::InvalidHeaderValue> for Error {
  fn from(value: http::header::InvalidHeaderValue) -> Self {
    Error::Http(http::Error::from(value))
  }
}

impl From<http::header::InvalidHeaderName> for Error {
  fn from(value: http::header::InvalidHeaderName) -> Self {
    Error::Http(http::Error::from(value))
  }
}

impl From<http::status::InvalidStatusCode> for Error {
  fn from(value: http::status::InvalidStatusCode) -> Self {
    Error::Http(http::Error::from(value))
  }
}

impl Error {
  pub(crate) fn ntlm(msg: &str) -> Error {
    Error::NtlmAuth(msg.to_string())
  }
}

pub(crate) fn new_io_error(error_kind: std::io::ErrorKind, msg: &str) -> Error {
  Error::IO(std::io::Error::new(error_kind, msg))
}
