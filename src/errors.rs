//! proxy error
use std::io::ErrorKind;
use thiserror::Error as ThisError;
/// A `Result` alias where the `Err` case is `tunnelmark::Error`.
pub type Result<T> = std::result::Result<T, Error>;
/// The Errors that may occur while intercepting a tunnel.
#[derive(ThisError, Debug)]
pub enum Error {
  /// Error
  #[error(transparent)]
  IO(#[from] std::io::Error),
  /// http::Error
  #[error(transparent)]
  Http(http::Error),
  /// TLS configuration or handshake failure
  #[error("tls error: {0}")]
  TlsSetup(String),
  /// Certificate generation or encoding failed
  #[error("certificate error: {0}")]
  Certificate(String),
  /// Malformed request read from the client
  #[error("invalid request: {0}")]
  InvalidRequest(String),
  /// Malformed response read from the origin
  #[error("invalid response: {0}")]
  InvalidResponse(String),
  /// Origin connection failure
  #[error("connection error: {0}")]
  Connection(String),
  /// Body could not be parsed or rewritten as HTML
  #[error("html error: {0}")]
  Html(String),
  /// An I/O stage did not finish in time
  #[error("timed out during {0}")]
  Timeout(&'static str),
  /// Unknown Error
  #[error("{0}")]
  Other(String),
}

impl Error {
  /// Create a certificate error and log it
  pub fn certificate_error(msg: impl Into<String>) -> Self {
    let error = Error::Certificate(msg.into());
    tracing::debug!("{}", error);
    error
  }

  /// Create a TLS error and log it
  pub fn tls_error(msg: impl Into<String>) -> Self {
    let error = Error::TlsSetup(msg.into());
    tracing::debug!("{}", error);
    error
  }

  /// Create an invalid request error and log it
  pub fn invalid_request(msg: impl Into<String>) -> Self {
    let error = Error::InvalidRequest(msg.into());
    tracing::debug!("{}", error);
    error
  }

  /// Create an invalid response error and log it
  pub fn invalid_response(msg: impl Into<String>) -> Self {
    let error = Error::InvalidResponse(msg.into());
    tracing::debug!("{}", error);
    error
  }

  /// Create a connection error and log it
  pub fn connection_error(msg: impl Into<String>) -> Self {
    let error = Error::Connection(msg.into());
    tracing::debug!("{}", error);
    error
  }

  /// Create an html error
  pub fn html_error(msg: impl Into<String>) -> Self {
    Error::Html(msg.into())
  }

  /// `true` when the error is an end-of-stream from the peer.
  pub fn is_eof(&self) -> bool {
    matches!(self, Error::IO(e) if e.kind() == ErrorKind::UnexpectedEof)
  }
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

impl From<rcgen::Error> for Error {
  fn from(value: rcgen::Error) -> Self {
    Error::certificate_error(value.to_string())
  }
}

/// Which side of the tunnel a message was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Peer {
  Client,
  Origin,
}

impl Peer {
  /// Malformed-message error for this side.
  pub(crate) fn invalid(self, msg: impl Into<String>) -> Error {
    match self {
      Peer::Client => Error::invalid_request(msg),
      Peer::Origin => Error::invalid_response(msg),
    }
  }
}

pub(crate) fn new_io_error(error_kind: ErrorKind, msg: &str) -> Error {
  Error::IO(std::io::Error::new(error_kind, msg))
}
