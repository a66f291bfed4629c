//! One intercepted `CONNECT` tunnel
//!
//! After the client has been told `200 OK` the tunnel runs the TLS server
//! handshake, then loops: read a request, aim it at the tunnel host, forward it,
//! rewrite the HTML answer and send it back chunked. The loop ends when the
//! client closes its side or any stage fails.

use crate::body::DEFAULT_MAX_BODY_SIZE;
use crate::errors::{Error, Result};
use crate::request::Request;
use crate::response::Response;
use crate::rewrite::ContentTransformer;
use crate::transport::Upstream;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;

/// Settings shared by every tunnel.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
  /// Rewriter applied to HTML responses
  pub transformer: ContentTransformer,
  /// Longest wait for the next request or for a request to finish arriving
  pub idle_timeout: Option<Duration>,
  /// Bound on a request head
  pub max_header_size: usize,
  /// Bound on a request body
  pub max_body_size: usize,
}

impl Default for TunnelConfig {
  fn default() -> Self {
    Self {
      transformer: ContentTransformer::default(),
      idle_timeout: Some(Duration::from_secs(120)),
      max_header_size: 64 * 1024,
      max_body_size: DEFAULT_MAX_BODY_SIZE,
    }
  }
}

/// Drives a single intercepted connection.
pub struct Tunnel {
  host: String,
  upstream: Arc<dyn Upstream>,
  config: TunnelConfig,
}

impl Tunnel {
  /// `host` is the `CONNECT` target, `host:port` as the client sent it.
  pub fn new(host: impl Into<String>, upstream: Arc<dyn Upstream>, config: TunnelConfig) -> Self {
    Tunnel {
      host: host.into(),
      upstream,
      config,
    }
  }

  /// The `CONNECT` target.
  pub fn host(&self) -> &str {
    &self.host
  }

  /// Complete the TLS handshake on `stream` and serve requests until the client leaves.
  pub async fn run(
    &self,
    stream: TcpStream,
    acceptor: TlsAcceptor,
    handshake_timeout: Option<Duration>,
  ) -> Result<()> {
    let tls_stream = self
      .stage("handshake", handshake_timeout, async {
        acceptor
          .accept(stream)
          .await
          .map_err(|e| Error::tls_error(format!("TLS handshake failed: {}", e)))
      })
      .await?;
    self.serve_stream(tls_stream).await
  }

  /// Serve requests arriving on an already decrypted stream.
  pub async fn serve_stream<S>(&self, stream: S) -> Result<()>
  where
    S: AsyncRead + AsyncWrite + Unpin,
  {
    let mut stream = BufReader::new(stream);
    let idle_timeout = self.config.idle_timeout;
    loop {
      let closed = self
        .stage("read_request", idle_timeout, async {
          Ok::<_, Error>(stream.fill_buf().await?.is_empty())
        })
        .await?;
      if closed {
        tracing::debug!("client closed the tunnel");
        break;
      }
      let mut request = self
        .stage(
          "read_request",
          idle_timeout,
          Request::read_from(
            &mut stream,
            self.config.max_header_size,
            self.config.max_body_size,
          ),
        )
        .await?;
      request.normalize_uri(&self.host)?;
      request.strip_proxy_headers();
      tracing::info!(method = %request.method(), uri = %request.uri(), "forwarding request");

      let mut response = self
        .stage("forward", None, self.upstream.forward(request))
        .await?;
      self.transform(&mut response);
      self
        .stage("write_response", None, response.write_to(&mut stream))
        .await?;
    }
    if let Err(err) = stream.shutdown().await {
      tracing::debug!("tunnel shutdown: {}", err);
    }
    Ok(())
  }

  /// Rewrite an HTML body in place, leaving the original on failure.
  fn transform(&self, response: &mut Response) {
    if !response.is_html() {
      return;
    }
    let Some(body) = response.body().clone() else {
      return;
    };
    match self.config.transformer.rewrite(&body) {
      Ok(rewritten) => response.set_body(rewritten),
      Err(err) => {
        tracing::warn!(error = %err, "cannot transform response body, passing it through")
      }
    }
  }

  async fn stage<T, F>(&self, stage: &'static str, timeout: Option<Duration>, fut: F) -> Result<T>
  where
    F: Future<Output = Result<T>>,
  {
    let result = match timeout {
      Some(timeout) => tokio::time::timeout(timeout, fut)
        .await
        .unwrap_or_else(|_| Err(Error::Timeout(stage))),
      None => fut.await,
    };
    if let Err(err) = &result {
      if stage == "read_request" && err.is_eof() {
        tracing::debug!(stage, "client went away mid-request");
      } else {
        tracing::warn!(host = %self.host, stage, error = %err, "tunnel stage failed");
      }
    }
    result
  }
}
