use crate::errors::{new_io_error, Error, Result};
use crate::socket::{MaybeTlsStream, Socket};
use socket2::Socket as RawSocket;
use socket2::{Domain, Protocol, Type};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpSocket;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;

/// ConnectorBuilder
#[derive(Clone)]
pub struct ConnectorBuilder {
  read_timeout: Option<Duration>,
  write_timeout: Option<Duration>,
  connect_timeout: Option<Duration>,
  nodelay: bool,
  keepalive: bool,
  roots: Option<tokio_rustls::rustls::RootCertStore>,
}

impl Default for ConnectorBuilder {
  fn default() -> Self {
    Self {
      read_timeout: Some(Duration::from_secs(30)),
      write_timeout: Some(Duration::from_secs(30)),
      connect_timeout: Some(Duration::from_secs(10)),
      nodelay: true,
      keepalive: true,
      roots: None,
    }
  }
}

impl ConnectorBuilder {
  /// Set that all sockets have `SO_NODELAY` set to the supplied value `nodelay`.
  ///
  /// Default is `true`.
  pub fn nodelay(mut self, value: bool) -> ConnectorBuilder {
    self.nodelay = value;
    self
  }
  /// Sets value for the `SO_KEEPALIVE` option on this socket.
  ///
  /// Default is `true`.
  pub fn keepalive(mut self, value: bool) -> ConnectorBuilder {
    self.keepalive = value;
    self
  }
  /// Verify origin certificates against `roots` instead of accepting any certificate.
  pub fn roots(mut self, roots: Option<tokio_rustls::rustls::RootCertStore>) -> ConnectorBuilder {
    self.roots = roots;
    self
  }
  /// Bound on reading one whole response from a connection, measured from
  /// the moment the request has been written.
  ///
  /// Default is 30 seconds.
  pub fn read_timeout(mut self, timeout: Option<Duration>) -> ConnectorBuilder {
    self.read_timeout = timeout;
    self
  }
  /// Enables a write timeout.
  ///
  /// Default is 30 seconds.
  pub fn write_timeout(mut self, timeout: Option<Duration>) -> ConnectorBuilder {
    self.write_timeout = timeout;
    self
  }
  /// Set a timeout for the TCP connect and TLS handshake phases.
  ///
  /// Default is 10 seconds.
  pub fn connect_timeout(mut self, timeout: Option<Duration>) -> ConnectorBuilder {
    self.connect_timeout = timeout;
    self
  }
  /// Combine the configuration of this builder to create a `Connector`.
  pub fn build(&self) -> Result<Connector> {
    let tls = crate::tls::client_config(self.roots.clone())?;
    Ok(Connector {
      connect_timeout: self.connect_timeout,
      nodelay: self.nodelay,
      keepalive: self.keepalive,
      read_timeout: self.read_timeout,
      write_timeout: self.write_timeout,
      tls: TlsConnector::from(Arc::new(tls)),
    })
  }
}

/// Opens origin connections.
pub struct Connector {
  connect_timeout: Option<Duration>,
  nodelay: bool,
  keepalive: bool,
  read_timeout: Option<Duration>,
  write_timeout: Option<Duration>,
  tls: TlsConnector,
}

impl Connector {
  /// Connect to a remote endpoint with addr
  pub async fn connect_with_addr<S: Into<SocketAddr>>(&self, addr: S) -> Result<Socket> {
    let addr = addr.into();
    let raw_socket = RawSocket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    raw_socket.set_nonblocking(true)?;
    let socket = TcpSocket::from_std_stream(raw_socket.into());
    if self.nodelay {
      socket.set_nodelay(self.nodelay)?;
    }
    if self.keepalive {
      socket.set_keepalive(self.keepalive)?;
    }
    let s = match self.connect_timeout {
      None => socket.connect(addr).await?,
      Some(timeout) => tokio::time::timeout(timeout, socket.connect(addr))
        .await
        .map_err(|x| new_io_error(std::io::ErrorKind::TimedOut, &x.to_string()))??,
    };
    Ok(Socket::new(
      MaybeTlsStream::Tcp(s),
      self.read_timeout,
      self.write_timeout,
    ))
  }
  /// Connect to the origin named by `uri`, upgrading to TLS for `https`.
  pub async fn connect_with_uri(&self, uri: &http::Uri) -> Result<Socket> {
    let host = uri
      .host()
      .ok_or_else(|| Error::connection_error(format!("no host in {}", uri)))?;
    let https = uri.scheme() == Some(&http::uri::Scheme::HTTPS);
    let port = uri.port_u16().unwrap_or(if https { 443 } else { 80 });
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let addr = tokio::net::lookup_host((host, port))
      .await
      .map_err(|e| Error::connection_error(format!("Failed to resolve {}: {}", host, e)))?
      .next()
      .ok_or_else(|| Error::connection_error(format!("No address for {}", host)))?;
    let socket = self
      .connect_with_addr(addr)
      .await
      .map_err(|e| Error::connection_error(format!("Failed to connect to {}: {}", addr, e)))?;
    if https {
      self.upgrade_to_tls(socket, host).await
    } else {
      Ok(socket)
    }
  }
  /// Run the client TLS handshake over an established socket.
  pub async fn upgrade_to_tls(&self, stream: Socket, domain: &str) -> Result<Socket> {
    let server_name = ServerName::try_from(domain.to_owned())
      .map_err(|e| Error::tls_error(format!("invalid server name {}: {}", domain, e)))?;
    let connect_timeout = self.connect_timeout.unwrap_or(Duration::from_secs(30));
    let connector = self.tls.clone();
    stream
      .tls(|tcp| async move {
        match tokio::time::timeout(connect_timeout, connector.connect(server_name, tcp)).await {
          Ok(stream) => stream,
          Err(e) => Err(std::io::Error::new(std::io::ErrorKind::TimedOut, e.to_string())),
        }
      })
      .await
      .map_err(|e| Error::connection_error(format!("tls handshake with {} failed: {}", domain, e)))
  }
}
