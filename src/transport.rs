//! Pooled HTTP/1.1 client used to forward decrypted requests to origins
//!
use crate::body::DEFAULT_MAX_BODY_SIZE;
use crate::connector::{Connector, ConnectorBuilder};
use crate::errors::{new_io_error, Error, Result};
use crate::request::Request;
use crate::response::{Response, ResponseBuilder, ResponseConfig};
use crate::socket::Socket;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Mutex;

/// Sends one request to its origin and returns the origin's response.
#[async_trait]
pub trait Upstream: Send + Sync {
  /// Forward `request`, whose URI must be absolute.
  async fn forward(&self, request: Request) -> Result<Response>;
}

/// TransportBuilder
#[derive(Clone)]
pub struct TransportBuilder {
  connector: ConnectorBuilder,
  pool_idle_timeout: Duration,
  pool_max_idle_per_host: usize,
  max_header_size: usize,
  max_body_size: usize,
}

impl Default for TransportBuilder {
  fn default() -> Self {
    Self {
      connector: ConnectorBuilder::default(),
      pool_idle_timeout: Duration::from_secs(90),
      pool_max_idle_per_host: 8,
      max_header_size: 64 * 1024,
      max_body_size: DEFAULT_MAX_BODY_SIZE,
    }
  }
}

impl TransportBuilder {
  /// Set a timeout for connecting to the origin, TLS included.
  pub fn connect_timeout(mut self, timeout: Option<Duration>) -> TransportBuilder {
    self.connector = self.connector.connect_timeout(timeout);
    self
  }
  /// Bound the time spent reading one origin response.
  pub fn read_timeout(mut self, timeout: Option<Duration>) -> TransportBuilder {
    self.connector = self.connector.read_timeout(timeout);
    self
  }
  /// Bound every write to the origin.
  pub fn write_timeout(mut self, timeout: Option<Duration>) -> TransportBuilder {
    self.connector = self.connector.write_timeout(timeout);
    self
  }
  /// Idle connections older than this are closed instead of reused.
  pub fn pool_idle_timeout(mut self, timeout: Duration) -> TransportBuilder {
    self.pool_idle_timeout = timeout;
    self
  }
  /// Maximum idle connections kept per origin. Zero disables pooling.
  pub fn pool_max_idle_per_host(mut self, max: usize) -> TransportBuilder {
    self.pool_max_idle_per_host = max;
    self
  }
  /// Bound on the size of an origin response head.
  pub fn max_header_size(mut self, size: usize) -> TransportBuilder {
    self.max_header_size = size;
    self
  }
  /// Bound on an origin response body, after gzip decoding.
  pub fn max_body_size(mut self, size: usize) -> TransportBuilder {
    self.max_body_size = size;
    self
  }
  /// Verify origin certificates against `roots`. By default origins are not verified.
  pub fn roots(mut self, roots: tokio_rustls::rustls::RootCertStore) -> TransportBuilder {
    self.connector = self.connector.roots(Some(roots));
    self
  }
  /// Combine the configuration of this builder with a connector to create a `Transport`.
  pub fn build(&self) -> Result<Transport> {
    Ok(Transport {
      inner: Arc::new(TransportRef {
        connector: self.connector.build()?,
        pool_idle_timeout: self.pool_idle_timeout,
        pool_max_idle_per_host: self.pool_max_idle_per_host,
        max_header_size: self.max_header_size,
        max_body_size: self.max_body_size,
        idle: Mutex::new(HashMap::new()),
      }),
    })
  }
}

/// Connection-pooling origin client.
///
/// Clones share one pool; the pool is the only state mutated across tunnels.
/// A pooled connection that fails before any byte of the answer arrives was
/// closed by the origin while idle; it is dropped and the request is sent once
/// more on a new connection. Nothing else is retried.
#[derive(Clone)]
pub struct Transport {
  inner: Arc<TransportRef>,
}

struct TransportRef {
  connector: Connector,
  pool_idle_timeout: Duration,
  pool_max_idle_per_host: usize,
  max_header_size: usize,
  max_body_size: usize,
  idle: Mutex<HashMap<String, Vec<Socket>>>,
}

impl Transport {
  /// Constructs a new `TransportBuilder`.
  pub fn builder() -> TransportBuilder {
    TransportBuilder::default()
  }

  /// Number of idle connections currently pooled for `key`.
  #[cfg(test)]
  pub(crate) async fn idle_count(&self, key: &str) -> usize {
    self.inner.idle.lock().await.get(key).map(Vec::len).unwrap_or(0)
  }

  async fn checkout(&self, key: &str) -> Option<Socket> {
    let mut idle = self.inner.idle.lock().await;
    let sockets = idle.get_mut(key)?;
    let mut found = None;
    while let Some(socket) = sockets.pop() {
      if socket.idle_for() < self.inner.pool_idle_timeout {
        found = Some(socket);
        break;
      }
      tracing::trace!(origin = key, "dropping expired idle connection");
    }
    if sockets.is_empty() {
      idle.remove(key);
    }
    found
  }

  async fn checkin(&self, key: String, mut socket: Socket) {
    if self.inner.pool_max_idle_per_host == 0 {
      return;
    }
    socket.touch();
    let mut idle = self.inner.idle.lock().await;
    let sockets = idle.entry(key).or_default();
    sockets.retain(|s| s.idle_for() < self.inner.pool_idle_timeout);
    if sockets.len() < self.inner.pool_max_idle_per_host {
      sockets.push(socket);
    }
  }

  async fn round_trip(&self, socket: Socket, request: &Request) -> Result<Exchange> {
    let mut socket = socket;
    let read_timeout = socket.read_timeout();
    if let Err(err) = send(&mut socket, request).await {
      return Ok(Exchange::Unanswered(err.into()));
    }
    let deadline = read_timeout.map(|timeout| tokio::time::Instant::now() + timeout);
    let mut reader = BufReader::new(socket);
    let first = match deadline {
      Some(deadline) => tokio::time::timeout_at(deadline, reader.fill_buf())
        .await
        .map_err(|_| Error::Timeout("read response"))?,
      None => reader.fill_buf().await,
    };
    match first {
      Ok([]) => {
        return Ok(Exchange::Unanswered(new_io_error(
          std::io::ErrorKind::UnexpectedEof,
          "origin closed the connection before answering",
        )))
      }
      Ok(_) => {}
      Err(err) => return Ok(Exchange::Unanswered(err.into())),
    }

    let config = ResponseConfig::new(request.method().clone(), self.inner.max_header_size)
      .max_body_size(self.inner.max_body_size);
    let read = ResponseBuilder::new(&mut reader, config).build();
    let response = match deadline {
      Some(deadline) => tokio::time::timeout_at(deadline, read)
        .await
        .map_err(|_| Error::Timeout("read response"))??,
      None => read.await?,
    };
    let reusable = response.keep_alive() && reader.buffer().is_empty();
    Ok(Exchange::Answered(response, reusable.then(|| reader.into_inner())))
  }

  async fn finish(&self, key: String, response: Response, socket: Option<Socket>) -> Response {
    if let Some(socket) = socket {
      self.checkin(key, socket).await;
    }
    response
  }
}

/// Outcome of one request on one connection.
enum Exchange {
  /// The origin answered; the socket comes back when it may be pooled.
  Answered(Response, Option<Socket>),
  /// The connection failed before any byte of the answer arrived.
  Unanswered(Error),
}

async fn send(socket: &mut Socket, request: &Request) -> std::io::Result<()> {
  socket.write_all(&request.to_raw()).await?;
  socket.flush().await
}

#[async_trait]
impl Upstream for Transport {
  async fn forward(&self, request: Request) -> Result<Response> {
    let uri = request.uri();
    let key = pool_key(uri)?;
    if let Some(socket) = self.checkout(&key).await {
      tracing::trace!(origin = %key, "reusing pooled connection");
      match self.round_trip(socket, &request).await? {
        Exchange::Answered(response, socket) => return Ok(self.finish(key, response, socket).await),
        Exchange::Unanswered(err) => {
          tracing::debug!(origin = %key, "pooled connection is gone, dialing again: {}", err);
        }
      }
    }
    let socket = self.inner.connector.connect_with_uri(uri).await?;
    match self.round_trip(socket, &request).await? {
      Exchange::Answered(response, socket) => Ok(self.finish(key, response, socket).await),
      Exchange::Unanswered(err) => Err(err),
    }
  }
}

/// `scheme://host:port`, with the scheme's default port filled in.
pub(crate) fn pool_key(uri: &http::Uri) -> Result<String> {
  let scheme = uri
    .scheme_str()
    .ok_or_else(|| Error::invalid_request(format!("request uri {} is not absolute", uri)))?;
  let host = uri
    .host()
    .ok_or_else(|| Error::invalid_request(format!("request uri {} has no host", uri)))?;
  let port = match (uri.port_u16(), scheme) {
    (Some(port), _) => port,
    (None, "https") => 443,
    (None, "http") => 80,
    (None, other) => {
      return Err(Error::invalid_request(format!(
        "unsupported scheme {}",
        other
      )))
    }
  };
  Ok(format!("{}://{}:{}", scheme, host.to_ascii_lowercase(), port))
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::{AsyncReadExt, AsyncWriteExt};
  use tokio::net::TcpListener;

  #[test]
  fn test_pool_key() {
    let key = |s: &str| pool_key(&s.parse().unwrap());
    assert_eq!(key("https://Example.com/a").unwrap(), "https://example.com:443");
    assert_eq!(key("http://example.com/").unwrap(), "http://example.com:80");
    assert_eq!(key("https://example.com:8443/").unwrap(), "https://example.com:8443");
    assert!(key("/relative").is_err());
    assert!(key("ftp://example.com/").is_err());
  }

  async fn serve_plain(listener: TcpListener, responses: usize) -> usize {
    let (mut stream, _) = listener.accept().await.unwrap();
    let mut served = 0;
    let mut buf = vec![0u8; 4096];
    while served < responses {
      let n = stream.read(&mut buf).await.unwrap();
      if n == 0 {
        break;
      }
      stream
        .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
        .await
        .unwrap();
      served += 1;
    }
    served
  }

  #[tokio::test]
  async fn test_connection_reused_for_same_origin() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let origin = tokio::spawn(serve_plain(listener, 2));

    let transport = Transport::builder().build().unwrap();
    let uri = format!("http://{}/first", addr);
    for path in ["/first", "/second"] {
      let request: Request = Request::builder()
        .uri(format!("http://{}{}", addr, path))
        .body("")
        .unwrap()
        .into();
      let response = transport.forward(request).await.unwrap();
      assert_eq!(response.status_code(), http::StatusCode::OK);
      assert_eq!(response.body().as_ref().map(|b| &b[..]), Some(&b"ok"[..]));
    }
    let key = pool_key(&uri.parse().unwrap()).unwrap();
    assert_eq!(transport.idle_count(&key).await, 1);
    // one accepted connection served both requests
    assert_eq!(origin.await.unwrap(), 2);
  }

  #[tokio::test]
  async fn test_pooled_connection_closed_by_origin_is_replaced() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    // every connection answers once, then the origin hangs up
    let origin = tokio::spawn(async move {
      let mut accepted = 0;
      while accepted < 2 {
        let (mut stream, _) = listener.accept().await.unwrap();
        accepted += 1;
        let mut buf = vec![0u8; 4096];
        if stream.read(&mut buf).await.unwrap() == 0 {
          continue;
        }
        stream
          .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
          .await
          .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
      }
      accepted
    });

    let transport = Transport::builder().build().unwrap();
    for path in ["/first", "/second"] {
      let request: Request = Request::builder()
        .uri(format!("http://{}{}", addr, path))
        .body("")
        .unwrap()
        .into();
      let response = transport.forward(request).await.unwrap();
      assert_eq!(response.status_code(), http::StatusCode::OK);
      tokio::time::sleep(Duration::from_millis(200)).await;
    }
    assert_eq!(origin.await.unwrap(), 2);
  }

  #[tokio::test]
  async fn test_oversized_origin_body_is_rejected() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
      let (mut stream, _) = listener.accept().await.unwrap();
      let mut buf = vec![0u8; 4096];
      let _ = stream.read(&mut buf).await;
      let _ = stream
        .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 18446744073709551615\r\n\r\nabc")
        .await;
    });
    let transport = Transport::builder().max_body_size(1024).build().unwrap();
    let request: Request = Request::builder()
      .uri(format!("http://{}/", addr))
      .body("")
      .unwrap()
      .into();
    let err = transport.forward(request).await.unwrap_err();
    assert!(matches!(err, Error::InvalidResponse(_)));
  }

  #[tokio::test]
  async fn test_connect_failure_is_reported() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    let transport = Transport::builder().build().unwrap();
    let request: Request = Request::builder()
      .uri(format!("http://{}/", addr))
      .body("")
      .unwrap()
      .into();
    assert!(transport.forward(request).await.is_err());
  }

  #[tokio::test]
  async fn test_read_timeout() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let origin = tokio::spawn(async move {
      let (stream, _) = listener.accept().await.unwrap();
      tokio::time::sleep(Duration::from_millis(500)).await;
      drop(stream);
    });
    let transport = Transport::builder()
      .read_timeout(Some(Duration::from_millis(50)))
      .build()
      .unwrap();
    let request: Request = Request::builder()
      .uri(format!("http://{}/", addr))
      .body("")
      .unwrap()
      .into();
    let err = transport.forward(request).await.unwrap_err();
    assert!(matches!(err, Error::Timeout(_)));
    origin.await.unwrap();
  }
}
