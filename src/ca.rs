//! Certificate issuance for the proxy's TLS server identity
//!
//! Two strategies are offered. [`CertificateIssuer`] creates one self-signed
//! certificate for a fixed host list at start-up and that identity is presented
//! for every tunnel. [`CertificateManager`] keeps an in-memory CA and signs a
//! leaf per tunnel host, caching leaves by host name.
//!
//! Nothing here touches the filesystem; key material lives for the process lifetime.

use crate::errors::{Error, Result};
use moka::future::Cache;
use rand::Rng;
use rcgen::{
  BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
  Issuer, KeyPair, KeyUsagePurpose, SanType, SerialNumber, SignatureAlgorithm,
};
use std::fmt::{Debug, Formatter};
use std::net::IpAddr;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

/// Organization placed in every issued subject
pub const ORGANIZATION: &str = "Acme Co";
/// Default validity window (365 days)
pub const DEFAULT_VALIDITY: std::time::Duration = std::time::Duration::from_secs(365 * 24 * 60 * 60);
/// Offset for the leaf not_before timestamp to handle clock skew (60 seconds)
const NOT_BEFORE_OFFSET: time::Duration = time::Duration::seconds(60);
/// Serial numbers are 128 random bits
const SERIAL_BYTES: usize = 16;
/// Upper bound of cached leaf certificates
const LEAF_CACHE_CAPACITY: u64 = 1000;

/// An in-memory certificate chain and private key usable as a TLS server identity.
pub struct Identity {
  cert_chain: Vec<CertificateDer<'static>>,
  key: PrivateKeyDer<'static>,
  cert_pem: String,
}

impl Clone for Identity {
  fn clone(&self) -> Self {
    Self {
      cert_chain: self.cert_chain.clone(),
      key: self.key.clone_key(),
      cert_pem: self.cert_pem.clone(),
    }
  }
}

impl Debug for Identity {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Identity")
      .field("chain_len", &self.cert_chain.len())
      .finish_non_exhaustive()
  }
}

impl Identity {
  /// Certificate chain, leaf first.
  pub fn cert_chain(&self) -> &[CertificateDer<'static>] {
    &self.cert_chain
  }
  /// The end-entity certificate.
  pub fn leaf(&self) -> &CertificateDer<'static> {
    &self.cert_chain[0]
  }
  /// A copy of the private key matching [`Identity::leaf`].
  pub fn private_key(&self) -> PrivateKeyDer<'static> {
    self.key.clone_key()
  }
  /// Leaf certificate in PEM, for installing into a client trust store.
  pub fn cert_pem(&self) -> &str {
    &self.cert_pem
  }
}

/// Issues the single self-signed identity used for every intercepted tunnel.
#[derive(Debug, Clone)]
pub struct CertificateIssuer {
  hosts: String,
  validity: std::time::Duration,
  algorithm: &'static SignatureAlgorithm,
}

impl CertificateIssuer {
  /// `hosts` is a comma-separated list; IP literals become IP SANs, the rest DNS SANs.
  pub fn new(hosts: impl Into<String>, validity: std::time::Duration) -> Self {
    Self {
      hosts: hosts.into(),
      validity,
      algorithm: &rcgen::PKCS_ECDSA_P256_SHA256,
    }
  }

  /// Use a different key algorithm.
  ///
  /// Keys are generated with `ring`, which supports the ECDSA and Ed25519
  /// algorithms only; RSA algorithms make [`CertificateIssuer::issue`] fail.
  pub fn algorithm(mut self, algorithm: &'static SignatureAlgorithm) -> Self {
    self.algorithm = algorithm;
    self
  }

  /// Generate a key pair and a self-signed certificate valid for `[now, now + validity)`.
  ///
  /// The certificate is its own CA (`IsCA`), carries `ServerAuth` and a random
  /// 128-bit serial number.
  pub fn issue(&self) -> Result<Identity> {
    let subject_alt_names = san_entries(&self.hosts)?;
    if subject_alt_names.is_empty() {
      return Err(Error::certificate_error("certificate host list is empty"));
    }
    let key_pair = KeyPair::generate_for(self.algorithm)
      .map_err(|e| Error::certificate_error(format!("Failed to generate private key: {}", e)))?;

    let mut params = CertificateParams::default();
    params.serial_number = Some(random_serial());
    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, ORGANIZATION);
    params.distinguished_name = dn;
    params.subject_alt_names = subject_alt_names;

    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + validity_window(self.validity)?;

    params.key_usages = key_usages(key_pair.algorithm());
    params.key_usages.push(KeyUsagePurpose::KeyCertSign);
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);

    let cert = params
      .self_signed(&key_pair)
      .map_err(|e| Error::certificate_error(format!("Failed to create certificate: {}", e)))?;
    tracing::info!(hosts = %self.hosts, "issued self-signed proxy certificate");
    Ok(Identity {
      cert_chain: vec![cert.der().clone()],
      key: PrivatePkcs8KeyDer::from(key_pair.serialize_der()).into(),
      cert_pem: cert.pem(),
    })
  }
}

/// Split a comma-separated host list into subject alternative names.
///
/// Entries are trimmed and empty ones skipped. A `:port` suffix on a host name
/// is dropped since SANs never carry ports.
pub(crate) fn san_entries(hosts: &str) -> Result<Vec<SanType>> {
  let mut sans = Vec::new();
  for host in hosts.split(',').map(str::trim).filter(|h| !h.is_empty()) {
    if let Some(ip) = parse_ip(host) {
      sans.push(SanType::IpAddress(ip));
      continue;
    }
    let name = match host.rsplit_once(':') {
      Some((name, port)) if port.parse::<u16>().is_ok() => name,
      _ => host,
    };
    if let Some(ip) = parse_ip(name) {
      sans.push(SanType::IpAddress(ip));
      continue;
    }
    let dns = name
      .try_into()
      .map_err(|_| Error::certificate_error(format!("Invalid domain name: {}", name)))?;
    sans.push(SanType::DnsName(dns));
  }
  Ok(sans)
}

fn parse_ip(host: &str) -> Option<IpAddr> {
  host
    .trim_start_matches('[')
    .trim_end_matches(']')
    .parse::<IpAddr>()
    .ok()
}

/// Digital signature always, key encipherment only for RSA keys.
pub(crate) fn key_usages(algorithm: &SignatureAlgorithm) -> Vec<KeyUsagePurpose> {
  let mut usages = vec![KeyUsagePurpose::DigitalSignature];
  let rsa = [
    &rcgen::PKCS_RSA_SHA256,
    &rcgen::PKCS_RSA_SHA384,
    &rcgen::PKCS_RSA_SHA512,
  ];
  if rsa.iter().any(|alg| *alg == algorithm) {
    usages.push(KeyUsagePurpose::KeyEncipherment);
  }
  usages
}

fn random_serial() -> SerialNumber {
  let mut bytes = [0u8; SERIAL_BYTES];
  rand::thread_rng().fill(&mut bytes);
  SerialNumber::from_slice(&bytes)
}

fn validity_window(validity: std::time::Duration) -> Result<time::Duration> {
  if validity.is_zero() {
    return Err(Error::certificate_error("validity window must be positive"));
  }
  time::Duration::try_from(validity)
    .map_err(|e| Error::certificate_error(format!("Invalid validity window: {}", e)))
}

/// In-memory root used to sign one leaf certificate per intercepted host.
pub struct CertificateAuthority {
  issuer: Issuer<'static, KeyPair>,
  ca_cert_der: CertificateDer<'static>,
  ca_cert_pem: String,
  validity: std::time::Duration,
}

impl CertificateAuthority {
  /// Generate a fresh CA key pair and self-signed root.
  pub fn generate(validity: std::time::Duration) -> Result<Self> {
    let mut params = CertificateParams::default();
    params.serial_number = Some(random_serial());
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "tunnelmark interception CA");
    dn.push(DnType::OrganizationName, ORGANIZATION);
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
      KeyUsagePurpose::DigitalSignature,
      KeyUsagePurpose::KeyCertSign,
      KeyUsagePurpose::CrlSign,
    ];
    let now = OffsetDateTime::now_utc();
    params.not_before = now - NOT_BEFORE_OFFSET;
    params.not_after = now + validity_window(validity)?;

    let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
      .map_err(|e| Error::certificate_error(format!("Failed to generate CA key pair: {}", e)))?;
    let cert = params
      .self_signed(&key_pair)
      .map_err(|e| Error::certificate_error(format!("Failed to generate CA: {}", e)))?;
    let ca_cert_der = cert.der().clone();
    let ca_cert_pem = cert.pem();
    let issuer = Issuer::new(params, key_pair);
    Ok(Self {
      issuer,
      ca_cert_der,
      ca_cert_pem,
      validity,
    })
  }

  /// Sign a server certificate for `host`. The returned chain is `[leaf, ca]`.
  pub fn issue_leaf(&self, host: &str) -> Result<Identity> {
    let mut params = CertificateParams::default();
    params.serial_number = Some(random_serial());
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, host);
    dn.push(DnType::OrganizationName, ORGANIZATION);
    params.distinguished_name = dn;
    params.subject_alt_names = san_entries(host)?;
    params.is_ca = IsCa::NoCa;
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let now = OffsetDateTime::now_utc();
    params.not_before = now - NOT_BEFORE_OFFSET;
    params.not_after = now + validity_window(self.validity)?;

    let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
      .map_err(|e| Error::certificate_error(format!("Failed to generate key pair: {}", e)))?;
    params.key_usages = key_usages(key_pair.algorithm());
    let cert = params
      .signed_by(&key_pair, &self.issuer)
      .map_err(|e| Error::certificate_error(format!("Failed to sign server cert: {}", e)))?;
    Ok(Identity {
      cert_chain: vec![cert.der().clone(), self.ca_cert_der.clone()],
      key: PrivatePkcs8KeyDer::from(key_pair.serialize_der()).into(),
      cert_pem: cert.pem(),
    })
  }

  /// Root certificate in PEM format for client installation
  pub fn ca_cert_pem(&self) -> &str {
    &self.ca_cert_pem
  }

  /// Root certificate in DER format
  pub fn ca_cert_der(&self) -> &CertificateDer<'static> {
    &self.ca_cert_der
  }
}

/// Caches leaf identities issued by a [`CertificateAuthority`], keyed by host name.
pub struct CertificateManager {
  ca: CertificateAuthority,
  cert_cache: Cache<String, Arc<Identity>>,
}

impl CertificateManager {
  /// Create a manager around a freshly generated CA.
  pub fn new(validity: std::time::Duration) -> Result<Self> {
    let ca = CertificateAuthority::generate(validity)?;
    // Leaves expire from the cache well before their notAfter
    let cert_cache = Cache::builder()
      .max_capacity(LEAF_CACHE_CAPACITY)
      .time_to_live(validity / 2)
      .build();
    Ok(Self { ca, cert_cache })
  }

  /// Get or generate the leaf identity for `host`.
  ///
  /// Concurrent lookups of a host missing from the cache share one issuance.
  pub async fn identity_for(&self, host: &str) -> Result<Arc<Identity>> {
    let key = normalize_host(host);
    self
      .cert_cache
      .try_get_with(key.clone(), async { self.ca.issue_leaf(&key).map(Arc::new) })
      .await
      .map_err(|e| Error::certificate_error(format!("cannot issue certificate for {}: {}", key, e)))
  }

  /// The root every leaf chains to.
  pub fn ca(&self) -> &CertificateAuthority {
    &self.ca
  }
}

fn normalize_host(host: &str) -> String {
  match parse_ip(host) {
    Some(ip) => ip.to_string(),
    None => host.to_ascii_lowercase(),
  }
}
