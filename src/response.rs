use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::body::{read_sized, read_to_close, Body, DEFAULT_MAX_BODY_SIZE};
use crate::chunked::{read_chunked, ChunkedWriter};
use crate::errors::{new_io_error, Error, Peer, Result};
use crate::{COLON_SPACE, CR_LF, SPACE};
#[cfg(feature = "gzip")]
use flate2::read::MultiGzDecoder;
use http::{HeaderMap, HeaderValue, Method, Response as HttpResponse, StatusCode, Version};
#[cfg(feature = "gzip")]
use std::io::Read;

/// Bodies are handed to the chunked writer in pieces of at most this size.
const WRITE_SEGMENT: usize = 32 * 1024;

/// A response read from an origin server.
#[derive(Debug, Default, Clone)]
pub struct Response {
  version: Version,
  status_code: StatusCode,
  reason: String,
  headers: HeaderMap<HeaderValue>,
  body: Option<Body>,
  keep_alive: bool,
}

impl PartialEq for Response {
  fn eq(&self, other: &Self) -> bool {
    self.version == other.version
      && self.status_code == other.status_code
      && self.headers == other.headers
      && self.body == other.body
  }
}

impl<T> From<HttpResponse<T>> for Response
where
  T: Into<Body>,
{
  fn from(value: HttpResponse<T>) -> Self {
    let (parts, body) = value.into_parts();
    let body = body.into();
    Self {
      version: parts.version,
      status_code: parts.status,
      reason: String::new(),
      headers: parts.headers,
      body: if body.is_empty() { None } else { Some(body) },
      keep_alive: false,
    }
  }
}

impl Response {
  /// Creates a new builder-style object to manufacture a `Response`
  pub fn builder() -> http::response::Builder {
    http::response::Builder::new()
  }
  /// Get the `StatusCode` of this `Response`.
  pub fn status_code(&self) -> StatusCode {
    self.status_code
  }
  /// Get the HTTP `Version` the origin answered with.
  pub fn version(&self) -> Version {
    self.version
  }
  /// Reason phrase sent by the origin, or the canonical one for the status.
  pub fn reason(&self) -> &str {
    if self.reason.is_empty() {
      self.status_code.canonical_reason().unwrap_or_default()
    } else {
      &self.reason
    }
  }
  /// Get the `Headers` of this `Response`.
  pub fn headers(&self) -> &HeaderMap {
    &self.headers
  }
  /// Get a mutable reference to the `Headers` of this `Response`.
  pub fn headers_mut(&mut self) -> &mut HeaderMap {
    &mut self.headers
  }
  /// Decoded response body, if any.
  pub fn body(&self) -> &Option<Body> {
    &self.body
  }
  /// Replace the response body.
  pub fn set_body(&mut self, body: impl Into<Body>) {
    let body = body.into();
    self.body = if body.is_empty() { None } else { Some(body) };
  }
  /// `true` when the `Content-Type` is missing or is `text/html`.
  pub fn is_html(&self) -> bool {
    match self.headers.get(http::header::CONTENT_TYPE) {
      None => true,
      Some(value) => value
        .to_str()
        .ok()
        .and_then(|v| v.parse::<mime::Mime>().ok())
        .map(|m| m.type_() == mime::TEXT && m.subtype() == mime::HTML)
        .unwrap_or(false),
    }
  }
  /// Whether the origin connection may carry another request.
  pub(crate) fn keep_alive(&self) -> bool {
    self.keep_alive
  }

  /// Serialize for the intercepted client.
  ///
  /// The status line is always `HTTP/1.1`. `Content-Length` is dropped,
  /// `Transfer-Encoding: chunked` and `Connection: close` are forced, and the body
  /// is sent as chunks followed by the terminator and one more CRLF.
  pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
    let mut head = Vec::new();
    head.extend(b"HTTP/1.1");
    head.extend(SPACE);
    head.extend(self.status_code.as_str().as_bytes());
    head.extend(SPACE);
    head.extend(self.reason().as_bytes());
    head.extend(CR_LF);
    let mut headers = self.headers.clone();
    headers.remove(http::header::CONTENT_LENGTH);
    headers.insert(
      http::header::TRANSFER_ENCODING,
      HeaderValue::from_static("chunked"),
    );
    headers.insert(http::header::CONNECTION, HeaderValue::from_static("close"));
    for (k, v) in headers.iter() {
      head.extend(k.as_str().as_bytes());
      head.extend(COLON_SPACE);
      head.extend(v.as_bytes());
      head.extend(CR_LF);
    }
    head.extend(CR_LF);
    writer.write_all(&head).await?;

    let mut chunked = ChunkedWriter::new(&mut *writer);
    if let Some(body) = &self.body {
      for segment in body.chunks(WRITE_SEGMENT) {
        chunked.write(segment).await?;
      }
    }
    chunked.close().await?;
    writer.write_all(CR_LF).await?;
    writer.flush().await?;
    Ok(())
  }
}

/// response config
#[derive(Debug, Clone)]
pub struct ResponseConfig {
  method: Method,
  max_header_size: usize,
  max_body_size: usize,
}

impl ResponseConfig {
  /// Settings for reading the answer to a `method` request.
  pub fn new(method: Method, max_header_size: usize) -> Self {
    ResponseConfig {
      method,
      max_header_size,
      max_body_size: DEFAULT_MAX_BODY_SIZE,
    }
  }

  /// Bound on the body, before and after gzip decoding.
  pub fn max_body_size(mut self, limit: usize) -> Self {
    self.max_body_size = limit;
    self
  }
}

/// Reads one [`Response`] from an origin connection.
#[derive(Debug)]
pub struct ResponseBuilder<'a, T> {
  reader: &'a mut T,
  config: ResponseConfig,
}

impl<'a, T: AsyncBufRead + Unpin> ResponseBuilder<'a, T> {
  /// Constructs a new response reader.
  pub fn new(reader: &'a mut T, config: ResponseConfig) -> ResponseBuilder<'a, T> {
    ResponseBuilder { reader, config }
  }

  fn parser_version(line: &[u8]) -> Result<(Version, StatusCode, String)> {
    let mut parts = line.splitn(3, |b| b == &b' ');
    let version = match parts.next() {
      Some(b"HTTP/1.0") => Version::HTTP_10,
      Some(b"HTTP/1.1") => Version::HTTP_11,
      _ => {
        return Err(Error::invalid_response(format!(
          "invalid status line: {}",
          line.escape_ascii()
        )))
      }
    };
    let status = parts
      .next()
      .ok_or_else(|| Error::invalid_response("missing status code"))
      .and_then(|sc| StatusCode::from_bytes(sc).map_err(|x| Error::Http(http::Error::from(x))))?;
    let reason = parts
      .next()
      .map(|r| String::from_utf8_lossy(r).trim().to_string())
      .unwrap_or_default();
    Ok((version, status, reason))
  }

  async fn read_body(&mut self, status: StatusCode, headers: &mut HeaderMap) -> Result<(Vec<u8>, bool)> {
    if matches!(self.config.method, Method::HEAD)
      || status.is_informational()
      || status == StatusCode::NO_CONTENT
      || status == StatusCode::NOT_MODIFIED
    {
      return Ok((Vec::new(), true));
    }
    let limit = self.config.max_body_size;
    if is_chunked(headers) {
      let body = read_chunked(&mut *self.reader, limit, Peer::Origin).await?;
      headers.remove(http::header::TRANSFER_ENCODING);
      return Ok((body, true));
    }
    if let Some(length) = content_length(headers, Peer::Origin)? {
      let body = read_sized(&mut *self.reader, length, limit, Peer::Origin).await?;
      return Ok((body, true));
    }
    // delimited by connection close
    let body = read_to_close(&mut *self.reader, limit, Peer::Origin).await?;
    Ok((body, false))
  }

  /// Read status line, headers and body.
  ///
  /// Interim `1xx` answers other than `101` are skipped.
  pub async fn build(mut self) -> Result<Response> {
    loop {
      let lines = read_head(&mut *self.reader, self.config.max_header_size).await?;
      let (version, status_code, reason) = Self::parser_version(&lines[0])?;
      let mut headers = parse_header_lines(&lines[1..], Peer::Origin)?;
      if status_code.is_informational() && status_code != StatusCode::SWITCHING_PROTOCOLS {
        tracing::debug!(status = %status_code, "skipping interim response");
        continue;
      }
      let (body, delimited) = self.read_body(status_code, &mut headers).await?;
      let body = decode_body(&mut headers, body, self.config.max_body_size);
      let keep_alive = delimited && connection_persists(version, &headers);
      return Ok(Response {
        version,
        status_code,
        reason,
        headers,
        body: if body.is_empty() {
          None
        } else {
          Some(body.into())
        },
        keep_alive,
      });
    }
  }
}

#[cfg(feature = "gzip")]
fn decode_body(headers: &mut HeaderMap, body: Vec<u8>, max_body_size: usize) -> Vec<u8> {
  let gzip = headers
    .get(http::header::CONTENT_ENCODING)
    .map(|ce| ce.as_bytes().eq_ignore_ascii_case(b"gzip"))
    .unwrap_or(false);
  if !gzip || body.is_empty() {
    return body;
  }
  let inflated = {
    let mut decoded = Vec::new();
    let mut decoder = MultiGzDecoder::new(&body[..]).take(max_body_size as u64 + 1);
    decoder.read_to_end(&mut decoded).map(|_| decoded)
  };
  match inflated {
    Ok(decoded) if decoded.len() > max_body_size => {
      tracing::warn!(
        "gzip body inflates past the {} byte limit, passing it through",
        max_body_size
      );
      body
    }
    Ok(decoded) => {
      headers.remove(http::header::CONTENT_ENCODING);
      decoded
    }
    Err(err) => {
      tracing::warn!("cannot decode gzip body, passing it through: {}", err);
      body
    }
  }
}

#[cfg(not(feature = "gzip"))]
fn decode_body(_headers: &mut HeaderMap, body: Vec<u8>, _max_body_size: usize) -> Vec<u8> {
  body
}

pub(crate) fn is_chunked(headers: &HeaderMap) -> bool {
  headers
    .get_all(http::header::TRANSFER_ENCODING)
    .iter()
    .filter_map(|v| v.to_str().ok())
    .flat_map(|v| v.split(','))
    .any(|v| v.trim().eq_ignore_ascii_case("chunked"))
}

pub(crate) fn content_length(headers: &HeaderMap, peer: Peer) -> Result<Option<u64>> {
  match headers.get(http::header::CONTENT_LENGTH) {
    None => Ok(None),
    Some(v) => v
      .to_str()
      .ok()
      .and_then(|s| s.trim().parse::<u64>().ok())
      .map(Some)
      .ok_or_else(|| peer.invalid("invalid content-length")),
  }
}

fn connection_persists(version: Version, headers: &HeaderMap) -> bool {
  let has = |token: &str| {
    headers
      .get_all(http::header::CONNECTION)
      .iter()
      .filter_map(|v| v.to_str().ok())
      .flat_map(|v| v.split(','))
      .any(|v| v.trim().eq_ignore_ascii_case(token))
  };
  match version {
    Version::HTTP_11 => !has("close"),
    _ => has("keep-alive"),
  }
}

/// Read the start line and header lines of a message, without line endings.
///
/// Blank lines before the start line are skipped. At most `max_size` bytes are
/// consumed; a longer head is an error.
pub(crate) async fn read_head<R: AsyncBufRead + Unpin>(
  reader: &mut R,
  max_size: usize,
) -> Result<Vec<Vec<u8>>> {
  let mut lines: Vec<Vec<u8>> = Vec::new();
  let mut budget = max_size as u64;
  loop {
    let mut line = Vec::new();
    let n = (&mut *reader).take(budget).read_until(b'\n', &mut line).await?;
    if n == 0 {
      if budget == 0 {
        return Err(new_io_error(
          std::io::ErrorKind::InvalidData,
          "message head too large",
        ));
      }
      return Err(new_io_error(
        std::io::ErrorKind::UnexpectedEof,
        "connection closed before message head",
      ));
    }
    budget -= n as u64;
    if !line.ends_with(b"\n") {
      return Err(new_io_error(
        std::io::ErrorKind::InvalidData,
        if budget == 0 {
          "message head too large"
        } else {
          "connection closed inside message head"
        },
      ));
    }
    let line = line
      .strip_suffix(b"\n")
      .map(|l| l.strip_suffix(b"\r").unwrap_or(l))
      .unwrap_or_default()
      .to_vec();
    if line.is_empty() {
      if lines.is_empty() {
        continue;
      }
      return Ok(lines);
    }
    lines.push(line);
  }
}

pub(crate) fn parse_header_lines(lines: &[Vec<u8>], peer: Peer) -> Result<HeaderMap> {
  let mut headers = HeaderMap::new();
  for line in lines {
    match parser_headers(line)? {
      (Some(k), Some(v)) => {
        headers.append(k, v);
      }
      _ => return Err(peer.invalid(format!("malformed header line: {}", line.escape_ascii()))),
    }
  }
  Ok(headers)
}

pub(crate) fn parser_headers(buffer: &[u8]) -> Result<(Option<http::HeaderName>, Option<http::HeaderValue>)> {
  let mut k = None;
  let mut v = None;
  let buffer = buffer.strip_suffix(CR_LF).unwrap_or(buffer);
  for (index, h) in buffer.splitn(2, |s| s == &b':').enumerate() {
    let h = h.trim_ascii();
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

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::BufReader;

  async fn read(raw: &[u8], method: Method) -> Result<Response> {
    read_limited(raw, method, 1024).await
  }

  async fn read_limited(raw: &[u8], method: Method, max_body_size: usize) -> Result<Response> {
    let mut reader = BufReader::new(raw);
    let config = ResponseConfig::new(method, 64 * 1024).max_body_size(max_body_size);
    ResponseBuilder::new(&mut reader, config).build().await
  }

  #[tokio::test]
  async fn test_content_length_body() {
    let resp = read(
      b"HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: 5\r\n\r\nhello",
      Method::GET,
    )
    .await
    .unwrap();
    assert_eq!(resp.status_code(), StatusCode::OK);
    assert_eq!(resp.reason(), "OK");
    assert_eq!(resp.body().as_ref().map(|b| &b[..]), Some(&b"hello"[..]));
    assert!(resp.is_html());
    assert!(resp.keep_alive());
  }

  #[tokio::test]
  async fn test_chunked_body_drops_transfer_encoding() {
    let resp = read(
      b"HTTP/1.1 404 Not Here\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n0\r\n\r\n",
      Method::GET,
    )
    .await
    .unwrap();
    assert_eq!(resp.reason(), "Not Here");
    assert!(resp.headers().get(http::header::TRANSFER_ENCODING).is_none());
    assert_eq!(resp.body().as_ref().map(|b| &b[..]), Some(&b"abc"[..]));
  }

  #[tokio::test]
  async fn test_close_delimited_and_bodyless() {
    let resp = read(b"HTTP/1.0 200 OK\r\n\r\nuntil close", Method::GET)
      .await
      .unwrap();
    assert_eq!(resp.body().as_ref().map(|b| &b[..]), Some(&b"until close"[..]));
    assert!(!resp.keep_alive());

    let resp = read(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n", Method::HEAD)
      .await
      .unwrap();
    assert!(resp.body().is_none());

    let resp = read(
      b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 204 No Content\r\nConnection: close\r\n\r\n",
      Method::POST,
    )
    .await
    .unwrap();
    assert_eq!(resp.status_code(), StatusCode::NO_CONTENT);
    assert!(!resp.keep_alive());
  }

  #[tokio::test]
  async fn test_malformed_responses() {
    assert!(read(b"SIP/2.0 200 OK\r\n\r\n", Method::GET).await.is_err());
    assert!(read(b"HTTP/1.1 abc OK\r\n\r\n", Method::GET).await.is_err());
    assert!(read(b"HTTP/1.1 200 OK\r\nContent-Length: x\r\n\r\n", Method::GET)
      .await
      .is_err());
    assert!(read(b"", Method::GET).await.unwrap_err().is_eof());
  }

  #[tokio::test]
  async fn test_body_size_limits() {
    let err = read(
      b"HTTP/1.1 200 OK\r\nContent-Length: 18446744073709551615\r\n\r\nabc",
      Method::GET,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, Error::InvalidResponse(_)));

    let err = read(
      b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nffffffffffffffff\r\nabc\r\n0\r\n\r\n",
      Method::GET,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, Error::InvalidResponse(_)));

    let err = read_limited(b"HTTP/1.0 200 OK\r\n\r\nuntil close", Method::GET, 5)
      .await
      .unwrap_err();
    assert!(matches!(err, Error::InvalidResponse(_)));
  }

  #[tokio::test]
  async fn test_malformed_header_is_a_response_error() {
    let err = read(b"HTTP/1.1 200 OK\r\nX-Missing-Colon\r\n\r\n", Method::GET)
      .await
      .unwrap_err();
    assert!(matches!(err, Error::InvalidResponse(_)));
  }

  #[tokio::test]
  async fn test_head_size_limit() {
    let mut raw = b"HTTP/1.1 200 OK\r\nX-Big: ".to_vec();
    raw.extend(vec![b'a'; 100]);
    raw.extend(b"\r\n\r\n");
    let mut reader = BufReader::new(&raw[..]);
    let result = read_head(&mut reader, 64).await;
    assert!(result.is_err());
    let mut reader = BufReader::new(&raw[..]);
    assert_eq!(read_head(&mut reader, 1024).await.unwrap().len(), 2);
  }

  #[cfg(feature = "gzip")]
  #[tokio::test]
  async fn test_gzip_body_is_decoded() {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(b"<p>packed</p>").unwrap();
    let packed = encoder.finish().unwrap();
    let mut raw = format!(
      "HTTP/1.1 200 OK\r\nContent-Encoding: gzip\r\nContent-Length: {}\r\n\r\n",
      packed.len()
    )
    .into_bytes();
    raw.extend(&packed);
    let resp = read(&raw, Method::GET).await.unwrap();
    assert_eq!(resp.body().as_ref().map(|b| &b[..]), Some(&b"<p>packed</p>"[..]));
    assert!(resp.headers().get(http::header::CONTENT_ENCODING).is_none());

    let raw = b"HTTP/1.1 200 OK\r\nContent-Encoding: gzip\r\nContent-Length: 4\r\n\r\nnope";
    let resp = read(raw, Method::GET).await.unwrap();
    assert_eq!(resp.body().as_ref().map(|b| &b[..]), Some(&b"nope"[..]));
    assert!(resp.headers().get(http::header::CONTENT_ENCODING).is_some());
  }

  #[cfg(feature = "gzip")]
  #[tokio::test]
  async fn test_gzip_past_limit_passes_through() {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::best());
    encoder.write_all(&vec![b'a'; 64 * 1024]).unwrap();
    let packed = encoder.finish().unwrap();
    assert!(packed.len() < 1024);
    let mut raw = format!(
      "HTTP/1.1 200 OK\r\nContent-Encoding: gzip\r\nContent-Length: {}\r\n\r\n",
      packed.len()
    )
    .into_bytes();
    raw.extend(&packed);
    let resp = read_limited(&raw, Method::GET, 1024).await.unwrap();
    assert_eq!(resp.body().as_ref().map(|b| b.to_vec()), Some(packed));
    assert!(resp.headers().get(http::header::CONTENT_ENCODING).is_some());
  }

  #[tokio::test]
  async fn test_write_to_forces_chunked_close() {
    let resp: Response = Response::builder()
      .status(201)
      .header("Content-Length", "3")
      .header("Content-Type", "text/html")
      .header("Connection", "keep-alive")
      .body("abc")
      .unwrap()
      .into();
    let mut out = Vec::new();
    resp.write_to(&mut out).await.unwrap();
    let text = String::from_utf8(out).unwrap();
    assert!(text.starts_with("HTTP/1.1 201 Created\r\n"));
    assert!(!text.to_ascii_lowercase().contains("content-length"));
    assert!(text.contains("transfer-encoding: chunked\r\n"));
    assert!(text.contains("connection: close\r\n"));
    assert!(text.contains("content-type: text/html\r\n"));
    assert!(text.ends_with("\r\n\r\n3\r\nabc\r\n0\r\n\r\n"));
  }

  #[tokio::test]
  async fn test_write_to_empty_body() {
    let resp: Response = Response::builder().status(304).body("").unwrap().into();
    let mut out = Vec::new();
    resp.write_to(&mut out).await.unwrap();
    assert!(out.ends_with(b"\r\n\r\n0\r\n\r\n"));
  }

  #[test]
  fn test_is_html() {
    let mut resp = Response::default();
    assert!(resp.is_html());
    resp
      .headers_mut()
      .insert(http::header::CONTENT_TYPE, HeaderValue::from_static("text/html; charset=utf-8"));
    assert!(resp.is_html());
    resp
      .headers_mut()
      .insert(http::header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    assert!(!resp.is_html());
  }
}
