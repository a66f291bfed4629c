use std::fmt;
use std::ops::Deref;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::errors::{new_io_error, Peer, Result};

/// Default bound on a request or response body, decoded or not.
pub const DEFAULT_MAX_BODY_SIZE: usize = 32 * 1024 * 1024;

/// Message payload of a proxied request or response.
#[derive(Clone, PartialEq, Default)]
pub struct Body {
  inner: Bytes,
}

impl Body {
  /// Cheap handle to the underlying bytes.
  pub fn bytes(&self) -> Bytes {
    self.inner.clone()
  }
}

impl Deref for Body {
  type Target = Bytes;

  fn deref(&self) -> &Self::Target {
    &self.inner
  }
}

impl From<Bytes> for Body {
  #[inline]
  fn from(b: Bytes) -> Body {
    Body { inner: b }
  }
}

impl From<Vec<u8>> for Body {
  #[inline]
  fn from(v: Vec<u8>) -> Body {
    Body { inner: v.into() }
  }
}

impl From<String> for Body {
  #[inline]
  fn from(s: String) -> Body {
    s.into_bytes().into()
  }
}

impl From<&'static str> for Body {
  #[inline]
  fn from(s: &'static str) -> Body {
    Body {
      inner: Bytes::from_static(s.as_bytes()),
    }
  }
}

impl fmt::Debug for Body {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    match std::str::from_utf8(&self.inner) {
      Ok(s) => fmt::Debug::fmt(s, f),
      Err(_err) => fmt::Debug::fmt(&self.inner, f),
    }
  }
}

/// Read a `Content-Length` delimited body.
///
/// Lengths above `max_body_size` are rejected before anything is read, and the
/// buffer only grows as bytes arrive.
pub(crate) async fn read_sized<R: AsyncRead + Unpin>(
  reader: &mut R,
  length: u64,
  max_body_size: usize,
  peer: Peer,
) -> Result<Vec<u8>> {
  if length > max_body_size as u64 {
    return Err(peer.invalid(format!(
      "content-length {} exceeds the {} byte body limit",
      length, max_body_size
    )));
  }
  let mut body = Vec::new();
  let read = (&mut *reader).take(length).read_to_end(&mut body).await?;
  if (read as u64) < length {
    return Err(new_io_error(
      std::io::ErrorKind::UnexpectedEof,
      "connection closed inside message body",
    ));
  }
  Ok(body)
}

/// Read a body delimited by the peer closing the connection.
pub(crate) async fn read_to_close<R: AsyncRead + Unpin>(
  reader: &mut R,
  max_body_size: usize,
  peer: Peer,
) -> Result<Vec<u8>> {
  let mut body = Vec::new();
  (&mut *reader)
    .take(max_body_size as u64 + 1)
    .read_to_end(&mut body)
    .await?;
  if body.len() > max_body_size {
    return Err(peer.invalid(format!("body exceeds the {} byte limit", max_body_size)));
  }
  Ok(body)
}
