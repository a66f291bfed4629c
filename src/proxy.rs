//! MITM proxy configuration and start-up

use crate::body::DEFAULT_MAX_BODY_SIZE;
use crate::ca::{CertificateIssuer, CertificateManager, DEFAULT_VALIDITY};
use crate::errors::Result;
use crate::rewrite::{ContentTransformer, RenderScope, DEFAULT_WORD_LEN};
use crate::server::ProxyServer;
use crate::tls::ServerIdentity;
use crate::transport::{Transport, Upstream};
use crate::tunnel::TunnelConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

/// Which certificate a tunnel presents to the client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IdentityMode {
  /// One self-signed certificate for `cert_hosts`, shared by every tunnel
  #[default]
  Fixed,
  /// A leaf per tunnel host, signed by an in-memory CA
  PerHost,
}

/// Configuration for MITM proxy
#[derive(Debug, Clone)]
pub struct ProxyConfig {
  /// Comma-separated names and addresses the fixed certificate is valid for
  pub cert_hosts: String,
  /// Lifetime of issued certificates
  pub cert_validity: Duration,
  /// Certificate strategy
  pub identity_mode: IdentityMode,
  /// Words of exactly this many letters get a trademark sign
  pub word_len: usize,
  /// Serialize the whole document or only the body
  pub render_scope: RenderScope,
  /// Maximum concurrent connections
  pub max_connections: usize,
  /// Bound on the `CONNECT` exchange and the TLS handshake
  pub handshake_timeout: Option<Duration>,
  /// Longest wait for the next request inside a tunnel
  pub idle_timeout: Option<Duration>,
  /// Bound on request and response heads
  pub max_header_size: usize,
  /// Bound on request and response bodies; larger messages end the tunnel
  pub max_body_size: usize,
  /// Origin connect timeout, TLS included
  pub connect_timeout: Option<Duration>,
  /// Origin response read timeout
  pub read_timeout: Option<Duration>,
  /// Origin write timeout
  pub write_timeout: Option<Duration>,
  /// Idle origin connections are closed after this long
  pub pool_idle_timeout: Duration,
  /// Idle origin connections kept per origin
  pub pool_max_idle_per_host: usize,
}

impl Default for ProxyConfig {
  fn default() -> Self {
    Self {
      cert_hosts: "localhost,127.0.0.1".to_string(),
      cert_validity: DEFAULT_VALIDITY,
      identity_mode: IdentityMode::Fixed,
      word_len: DEFAULT_WORD_LEN,
      render_scope: RenderScope::Document,
      max_connections: 1000,
      handshake_timeout: Some(Duration::from_secs(30)),
      idle_timeout: Some(Duration::from_secs(120)),
      max_header_size: 64 * 1024,
      max_body_size: DEFAULT_MAX_BODY_SIZE,
      connect_timeout: Some(Duration::from_secs(10)),
      read_timeout: Some(Duration::from_secs(60)),
      write_timeout: Some(Duration::from_secs(30)),
      pool_idle_timeout: Duration::from_secs(90),
      pool_max_idle_per_host: 8,
    }
  }
}

/// MITM Proxy main struct
pub struct MitmProxy {
  identity_pem: String,
  server: ProxyServer,
}

impl MitmProxy {
  /// Issue the proxy identity and build the origin transport.
  ///
  /// Certificate generation failures are returned here, before anything listens.
  pub fn new(config: ProxyConfig) -> Result<Self> {
    let transport = Transport::builder()
      .connect_timeout(config.connect_timeout)
      .read_timeout(config.read_timeout)
      .write_timeout(config.write_timeout)
      .pool_idle_timeout(config.pool_idle_timeout)
      .pool_max_idle_per_host(config.pool_max_idle_per_host)
      .max_header_size(config.max_header_size)
      .max_body_size(config.max_body_size)
      .build()?;
    Self::with_upstream(config, Arc::new(transport))
  }

  /// Like [`MitmProxy::new`] with a caller supplied origin client.
  pub fn with_upstream(config: ProxyConfig, upstream: Arc<dyn Upstream>) -> Result<Self> {
    let (identity, identity_pem) = match config.identity_mode {
      IdentityMode::Fixed => {
        let identity = CertificateIssuer::new(config.cert_hosts.clone(), config.cert_validity).issue()?;
        (ServerIdentity::fixed(&identity)?, identity.cert_pem().to_string())
      }
      IdentityMode::PerHost => {
        let manager = CertificateManager::new(config.cert_validity)?;
        let pem = manager.ca().ca_cert_pem().to_string();
        (ServerIdentity::PerHost(Arc::new(manager)), pem)
      }
    };
    let tunnel = TunnelConfig {
      transformer: ContentTransformer::new(config.word_len).scope(config.render_scope),
      idle_timeout: config.idle_timeout,
      max_header_size: config.max_header_size,
      max_body_size: config.max_body_size,
    };
    let server = ProxyServer::builder(identity, upstream)
      .tunnel_config(tunnel)
      .max_connections(config.max_connections)
      .handshake_timeout(config.handshake_timeout)
      .build();
    Ok(Self {
      identity_pem,
      server,
    })
  }

  /// The certificate clients must trust, in PEM format.
  ///
  /// In fixed mode this is the shared self-signed certificate; in per-host mode
  /// it is the signing CA.
  pub fn identity_pem(&self) -> &str {
    &self.identity_pem
  }

  /// Start the MITM proxy server on the given address
  pub async fn start(&self, addr: &str) -> Result<()> {
    self.server.run(addr).await
  }

  /// Serve on an already bound listener.
  pub async fn serve(&self, listener: TcpListener) -> Result<()> {
    self.server.run_on(listener).await
  }
}
