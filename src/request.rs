use std::fmt::{Debug, Formatter};

use bytes::Bytes;
use http::Request as HttpRequest;
use http::{HeaderMap, HeaderValue, Method, Version};
use tokio::io::AsyncBufRead;

use crate::body::{read_sized, Body};
use crate::chunked::read_chunked;
use crate::errors::{Error, Peer, Result};
use crate::response::{content_length, is_chunked, parse_header_lines, read_head};
use crate::{COLON_SPACE, CR_LF, SPACE};

/// Headers that only make sense between a client and its proxy.
const PROXY_HEADERS: [http::HeaderName; 5] = [
  http::header::ACCEPT_ENCODING,
  http::header::PROXY_AUTHENTICATE,
  http::header::PROXY_AUTHORIZATION,
  http::header::CONNECTION,
  http::header::HeaderName::from_static("proxy-connection"),
];

/// A request read from an intercepted client, forwarded to the origin.
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

impl<T> From<HttpRequest<T>> for Request
where
  T: Into<Body>,
{
  fn from(value: HttpRequest<T>) -> Self {
    let (parts, body) = value.into_parts();
    let body = body.into();
    Self {
      uri: parts.uri,
      version: parts.version,
      method: parts.method,
      headers: parts.headers,
      body: if body.is_empty() { None } else { Some(body) },
    }
  }
}

impl Request {
  /// Serialize in origin-form for the upstream connection.
  ///
  /// A `Host` header is added from the URI when the client sent none, and a
  /// non-empty body is framed with `Content-Length`.
  pub(crate) fn to_raw(&self) -> Bytes {
    let mut http_requests = Vec::new();
    http_requests.extend(self.method.as_str().as_bytes());
    http_requests.extend(SPACE);
    http_requests.extend(
      self
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .filter(|pq| !pq.is_empty())
        .unwrap_or("/")
        .as_bytes(),
    );
    http_requests.extend(SPACE);
    // upstream always speaks HTTP/1.1
    http_requests.extend(b"HTTP/1.1");
    http_requests.extend(CR_LF);
    if self.headers.get(http::header::HOST).is_none() {
      http_requests.extend(http::header::HOST.as_str().as_bytes());
      http_requests.extend(COLON_SPACE);
      http_requests.extend(if let Some(s) = self.uri.authority() {
        s.as_str().as_bytes()
      } else {
        &[]
      });
      http_requests.extend(CR_LF);
    }
    let mut headers = self.headers.clone();
    headers.remove(http::header::TRANSFER_ENCODING);
    match &self.body {
      Some(b) if !b.is_empty() => {
        headers.insert(http::header::CONTENT_LENGTH, HeaderValue::from(b.len()));
      }
      _ => {
        headers.remove(http::header::CONTENT_LENGTH);
      }
    }
    for (k, v) in headers.iter() {
      http_requests.extend(k.as_str().as_bytes());
      http_requests.extend(COLON_SPACE);
      http_requests.extend(v.as_bytes());
      http_requests.extend(CR_LF);
    }
    http_requests.extend(CR_LF);
    if let Some(b) = &self.body {
      http_requests.extend(&b[..]);
    }
    Bytes::from(http_requests)
  }

  /// Creates a new builder-style object to manufacture a `Request`
  pub fn builder() -> http::request::Builder {
    http::request::Builder::new()
  }

  /// Read the request line and headers, leaving any body unread.
  pub async fn read_head<R: AsyncBufRead + Unpin>(reader: &mut R, max_header_size: usize) -> Result<Request> {
    let lines = read_head(reader, max_header_size).await?;
    let (method, uri, version) = parse_request_line(&lines[0])?;
    let headers = parse_header_lines(&lines[1..], Peer::Client)?;
    Ok(Request {
      uri,
      version,
      method,
      headers,
      body: None,
    })
  }

  /// Read a complete request, including a `Content-Length` or chunked body.
  ///
  /// Bodies larger than `max_body_size` are rejected.
  pub async fn read_from<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    max_header_size: usize,
    max_body_size: usize,
  ) -> Result<Request> {
    let mut request = Request::read_head(&mut *reader, max_header_size).await?;
    let body = if is_chunked(&request.headers) {
      read_chunked(&mut *reader, max_body_size, Peer::Client).await?
    } else if let Some(length) = content_length(&request.headers, Peer::Client)? {
      read_sized(&mut *reader, length, max_body_size, Peer::Client).await?
    } else {
      Vec::new()
    };
    request.headers.remove(http::header::TRANSFER_ENCODING);
    if !body.is_empty() {
      request.body = Some(body.into());
    }
    Ok(request)
  }

  /// Point a relative request target at the tunnel's origin.
  ///
  /// Requests inside a tunnel usually carry only a path; they become
  /// `https://<tunnel_host><path>`. Absolute URIs are left untouched.
  pub fn normalize_uri(&mut self, tunnel_host: &str) -> Result<()> {
    if self.uri.scheme().is_some() {
      return Ok(());
    }
    let path = self
      .uri
      .path_and_query()
      .map(|pq| pq.as_str())
      .unwrap_or("/");
    let absolute = format!("https://{}{}", tunnel_host, path);
    self.uri = http::Uri::try_from(absolute.as_str())
      .map_err(|e| Error::invalid_request(format!("cannot build origin uri {}: {}", absolute, e)))?;
    Ok(())
  }

  /// Remove hop-by-hop proxy headers and `Accept-Encoding`.
  pub fn strip_proxy_headers(&mut self) {
    for name in PROXY_HEADERS.iter() {
      self.headers.remove(name);
    }
  }

  /// Get the http method
  pub fn method(&self) -> &Method {
    &self.method
  }
  /// Get the uri
  pub fn uri(&self) -> &http::Uri {
    &self.uri
  }
  /// Get the headers
  pub fn headers(&self) -> &HeaderMap {
    &self.headers
  }
  /// Get a mutable reference to the headers
  pub fn headers_mut(&mut self) -> &mut HeaderMap {
    &mut self.headers
  }
  /// Get the body
  pub fn body(&self) -> Option<&Body> {
    self.body.as_ref()
  }
  /// Get the http version the client used
  pub fn version(&self) -> Version {
    self.version
  }
}

fn parse_request_line(line: &[u8]) -> Result<(Method, http::Uri, Version)> {
  let malformed = || Error::invalid_request(format!("malformed request line: {}", line.escape_ascii()));
  let mut parts = line.split(|b| b == &b' ').filter(|p| !p.is_empty());
  let (Some(method), Some(target), Some(version), None) = (parts.next(), parts.next(), parts.next(), parts.next()) else {
    return Err(malformed());
  };
  let method = Method::from_bytes(method).map_err(|_| malformed())?;
  let uri = http::Uri::try_from(target).map_err(|e| Error::invalid_request(format!("invalid request target: {}", e)))?;
  let version = match version {
    b"HTTP/1.0" => Version::HTTP_10,
    b"HTTP/1.1" => Version::HTTP_11,
    _ => return Err(malformed()),
  };
  Ok((method, uri, version))
}
