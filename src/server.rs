//! Inbound proxy listener
//!
//! Only `CONNECT` is served. The client is answered with a bare
//! `HTTP/1.0 200 OK`, after which the raw socket belongs to a [`Tunnel`] running
//! on its own task. Any other method gets `501 Not Implemented`.

use crate::errors::{Error, Result};
use crate::request::Request;
use crate::tls::ServerIdentity;
use crate::transport::Upstream;
use crate::tunnel::{Tunnel, TunnelConfig};
use http::Method;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::Instrument;

/// Written to the client once a `CONNECT` is accepted.
pub const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.0 200 OK\r\n\r\n";
const NOT_IMPLEMENTED: &[u8] =
  b"HTTP/1.1 501 Not Implemented\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: 16\r\nConnection: close\r\n\r\nnot implemented\n";

/// Builder for `ProxyServer`.
pub struct ProxyServerBuilder {
  identity: ServerIdentity,
  upstream: Arc<dyn Upstream>,
  tunnel: TunnelConfig,
  max_connections: usize,
  handshake_timeout: Option<Duration>,
}

impl ProxyServerBuilder {
  /// Settings applied to every tunnel.
  pub fn tunnel_config(mut self, config: TunnelConfig) -> Self {
    self.tunnel = config;
    self
  }
  /// Maximum number of tunnels served at once.
  pub fn max_connections(mut self, max: usize) -> Self {
    self.max_connections = max;
    self
  }
  /// Bound on reading the `CONNECT` head and on the TLS handshake.
  pub fn handshake_timeout(mut self, timeout: Option<Duration>) -> Self {
    self.handshake_timeout = timeout;
    self
  }
  /// Build the `ProxyServer`.
  pub fn build(self) -> ProxyServer {
    ProxyServer {
      inner: Arc::new(ServerRef {
        identity: self.identity,
        upstream: self.upstream,
        tunnel: self.tunnel,
        handshake_timeout: self.handshake_timeout,
        permits: Arc::new(Semaphore::new(self.max_connections.max(1))),
      }),
    }
  }
}

struct ServerRef {
  identity: ServerIdentity,
  upstream: Arc<dyn Upstream>,
  tunnel: TunnelConfig,
  handshake_timeout: Option<Duration>,
  permits: Arc<Semaphore>,
}

/// Proxy server implementation
#[derive(Clone)]
pub struct ProxyServer {
  inner: Arc<ServerRef>,
}

impl ProxyServer {
  /// Start building a server presenting `identity` and forwarding through `upstream`.
  pub fn builder(identity: ServerIdentity, upstream: Arc<dyn Upstream>) -> ProxyServerBuilder {
    ProxyServerBuilder {
      identity,
      upstream,
      tunnel: TunnelConfig::default(),
      max_connections: 1000,
      handshake_timeout: Some(Duration::from_secs(30)),
    }
  }

  /// Bind `addr` and serve forever.
  pub async fn run(&self, addr: &str) -> Result<()> {
    let listener = TcpListener::bind(addr)
      .await
      .map_err(|e| Error::Other(format!("Failed to bind to {}: {}", addr, e)))?;
    self.run_on(listener).await
  }

  /// Serve connections from an already bound listener.
  pub async fn run_on(&self, listener: TcpListener) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
      tracing::info!("proxy listening on {}", addr);
    }
    loop {
      let permit = match self.inner.permits.clone().acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => return Err(Error::Other("connection limiter closed".to_string())),
      };
      match listener.accept().await {
        Ok((stream, peer_addr)) => {
          let inner = self.inner.clone();
          tokio::spawn(async move {
            let _permit = permit;
            if let Err(e) = Self::handle_connection(stream, peer_addr, inner).await {
              tracing::debug!(peer = %peer_addr, "connection ended: {}", e);
            }
          });
        }
        Err(e) => {
          tracing::error!("Failed to accept connection: {}", e);
        }
      }
    }
  }

  async fn handle_connection(stream: TcpStream, peer_addr: SocketAddr, inner: Arc<ServerRef>) -> Result<()> {
    let mut reader = BufReader::new(stream);
    let head = Request::read_head(&mut reader, inner.tunnel.max_header_size);
    let request = match inner.handshake_timeout {
      Some(timeout) => tokio::time::timeout(timeout, head)
        .await
        .unwrap_or_else(|_| Err(Error::Timeout("connect"))),
      None => head.await,
    };
    let request = match request {
      Ok(request) => request,
      Err(err) => {
        tracing::warn!(peer = %peer_addr, "cannot read proxy request: {}", err);
        return Err(err);
      }
    };
    if !reader.buffer().is_empty() {
      // TLS bytes sent before our answer would be lost with the buffer
      tracing::warn!(peer = %peer_addr, "client sent data before CONNECT was answered");
      return Err(Error::invalid_request("early data after CONNECT"));
    }
    let mut stream = reader.into_inner();
    if request.method() != Method::CONNECT {
      tracing::info!(peer = %peer_addr, method = %request.method(), "rejecting non-CONNECT request");
      stream.write_all(NOT_IMPLEMENTED).await?;
      stream.shutdown().await?;
      return Ok(());
    }
    let host = connect_target(&request)?;
    stream.write_all(CONNECT_ESTABLISHED).await?;
    stream.flush().await?;

    let span = tracing::info_span!("tunnel", host = %host, peer = %peer_addr);
    async move {
      let acceptor = inner.identity.acceptor_for(host_name(&host)).await?;
      let tunnel = Tunnel::new(host, inner.upstream.clone(), inner.tunnel.clone());
      tunnel.run(stream, acceptor, inner.handshake_timeout).await
    }
    .instrument(span)
    .await
  }
}

/// The `host:port` a `CONNECT` asks for.
fn connect_target(request: &Request) -> Result<String> {
  request
    .uri()
    .authority()
    .map(|authority| authority.to_string())
    .or_else(|| {
      request
        .headers()
        .get(http::header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
    })
    .ok_or_else(|| Error::invalid_request("CONNECT without a target authority"))
}

/// `host` from `host:port`, without IPv6 brackets.
pub(crate) fn host_name(target: &str) -> &str {
  let host = match target.rsplit_once(':') {
    Some((host, port)) if port.parse::<u16>().is_ok() && (!host.contains(':') || host.ends_with(']')) => host,
    _ => target,
  };
  host.trim_start_matches('[').trim_end_matches(']')
}
