//! TLS configuration for both sides of an intercepted tunnel
//!
use crate::ca::{CertificateManager, Identity};
use crate::errors::{Error, Result};
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use tokio_rustls::rustls::{
  self,
  client::danger::HandshakeSignatureValid,
  client::danger::ServerCertVerified,
  client::danger::ServerCertVerifier,
  crypto::CryptoProvider,
  pki_types::{ServerName, UnixTime},
  ClientConfig, DigitallySignedStruct, ServerConfig, SignatureScheme,
};
use tokio_rustls::TlsAcceptor;

/// Only HTTP/1.1 is offered to intercepted clients; h2 is never negotiated.
const HTTP11_ALPN: &[u8] = b"http/1.1";

fn provider() -> Arc<CryptoProvider> {
  CryptoProvider::get_default()
    .cloned()
    .unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider()))
}

/// Build the inbound TLS server configuration presenting `identity`.
pub fn server_config(identity: &Identity) -> Result<ServerConfig> {
  let mut config = ServerConfig::builder_with_provider(provider())
    .with_safe_default_protocol_versions()
    .map_err(|e| Error::tls_error(format!("Invalid TLS versions: {}", e)))?
    .with_no_client_auth()
    .with_single_cert(identity.cert_chain().to_vec(), identity.private_key())
    .map_err(|e| Error::tls_error(format!("Failed to create TLS config: {}", e)))?;
  config.alpn_protocols = vec![HTTP11_ALPN.to_vec()];
  Ok(config)
}

/// Build the outbound TLS client configuration.
///
/// Without `roots`, origin certificates are accepted unchecked.
pub fn client_config(roots: Option<rustls::RootCertStore>) -> Result<ClientConfig> {
  let builder = ClientConfig::builder_with_provider(provider())
    .with_safe_default_protocol_versions()
    .map_err(|e| Error::tls_error(format!("Invalid TLS versions: {}", e)))?;
  let mut config = match roots {
    Some(roots) => builder.with_root_certificates(roots).with_no_client_auth(),
    None => builder
      .dangerous()
      .with_custom_certificate_verifier(Arc::new(NoVerifier))
      .with_no_client_auth(),
  };
  config.alpn_protocols = vec![HTTP11_ALPN.to_vec()];
  Ok(config)
}

/// Where the inbound TLS identity for a tunnel comes from.
#[derive(Clone)]
pub enum ServerIdentity {
  /// One configuration shared by every tunnel.
  Fixed(Arc<ServerConfig>),
  /// A leaf certificate per tunnel host.
  PerHost(Arc<CertificateManager>),
}

impl Debug for ServerIdentity {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    match self {
      ServerIdentity::Fixed(_) => f.write_str("ServerIdentity::Fixed"),
      ServerIdentity::PerHost(_) => f.write_str("ServerIdentity::PerHost"),
    }
  }
}

impl ServerIdentity {
  /// A shared configuration presenting `identity`.
  pub fn fixed(identity: &Identity) -> Result<Self> {
    Ok(ServerIdentity::Fixed(Arc::new(server_config(identity)?)))
  }

  /// Acceptor for a tunnel whose CONNECT target is `host`.
  pub async fn acceptor_for(&self, host: &str) -> Result<TlsAcceptor> {
    match self {
      ServerIdentity::Fixed(config) => Ok(TlsAcceptor::from(config.clone())),
      ServerIdentity::PerHost(manager) => {
        let identity = manager.identity_for(host).await?;
        Ok(TlsAcceptor::from(Arc::new(server_config(&identity)?)))
      }
    }
  }
}

/// Accepts every origin certificate.
#[derive(Debug)]
pub(crate) struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
  fn verify_server_cert(
    &self,
    _end_entity: &rustls_pki_types::CertificateDer,
    _intermediates: &[rustls_pki_types::CertificateDer],
    _server_name: &ServerName,
    _ocsp_response: &[u8],
    _now: UnixTime,
  ) -> std::result::Result<ServerCertVerified, rustls::Error> {
    Ok(ServerCertVerified::assertion())
  }

  fn verify_tls12_signature(
    &self,
    _message: &[u8],
    _cert: &rustls_pki_types::CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn verify_tls13_signature(
    &self,
    _message: &[u8],
    _cert: &rustls_pki_types::CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
    vec![
      SignatureScheme::RSA_PKCS1_SHA1,
      SignatureScheme::ECDSA_SHA1_Legacy,
      SignatureScheme::RSA_PKCS1_SHA256,
      SignatureScheme::ECDSA_NISTP256_SHA256,
      SignatureScheme::RSA_PKCS1_SHA384,
      SignatureScheme::ECDSA_NISTP384_SHA384,
      SignatureScheme::RSA_PKCS1_SHA512,
      SignatureScheme::ECDSA_NISTP521_SHA512,
      SignatureScheme::RSA_PSS_SHA256,
      SignatureScheme::RSA_PSS_SHA384,
      SignatureScheme::RSA_PSS_SHA512,
      SignatureScheme::ED25519,
      SignatureScheme::ED448,
    ]
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::ca::{CertificateIssuer, DEFAULT_VALIDITY};

  #[test]
  fn test_server_config_offers_http11_only() {
    let identity = CertificateIssuer::new("localhost", DEFAULT_VALIDITY)
      .issue()
      .unwrap();
    let config = server_config(&identity).unwrap();
    assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
  }

  #[test]
  fn test_client_config_skips_verification() {
    let config = client_config(None).unwrap();
    assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
  }

  #[tokio::test]
  async fn test_per_host_acceptor() {
    let manager = CertificateManager::new(DEFAULT_VALIDITY).unwrap();
    let identity = ServerIdentity::PerHost(Arc::new(manager));
    assert!(identity.acceptor_for("example.com").await.is_ok());
  }
}
