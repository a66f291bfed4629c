#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! # tunnelmark
//!
//! An intercepting HTTPS proxy that rewrites the pages passing through it.
//!
//! A client sends `CONNECT host:port`; the proxy answers `200 OK`, terminates
//! TLS itself with a certificate it issued at start-up, and forwards every
//! decrypted request to the real origin over a pooled HTTPS client. HTML
//! answers come back with a trademark sign (™) after every word of exactly
//! [`ProxyConfig::word_len`] letters, framed as a chunked `HTTP/1.1` response.
//!
//! - Self-signed identity for a fixed host list, or one leaf per host from an in-memory CA
//! - Origin connection pool with idle eviction
//! - Text-node-only rewriting; tags, attributes and comments are left alone
//!
//! ## Running the proxy
//!
//! ```rust,no_run
//! use tunnelmark::{MitmProxy, ProxyConfig};
//!
//! #[tokio::main]
//! async fn main() -> tunnelmark::Result<()> {
//!   let proxy = MitmProxy::new(ProxyConfig::default())?;
//!   println!("{}", proxy.identity_pem());
//!   proxy.start("127.0.0.1:8080").await
//! }
//! ```
//!
//! ## Rewriting without the proxy
//!
//! ```rust
//! use tunnelmark::{ContentTransformer, RenderScope};
//!
//! let html = ContentTransformer::new(3)
//!   .scope(RenderScope::Body)
//!   .rewrite(b"<p>one three</p>")
//!   .unwrap();
//! assert_eq!(html, "<p>one™ three</p>".as_bytes());
//! ```

mod body;
mod ca;
mod chunked;
mod connector;
mod errors;
mod proxy;
mod request;
mod response;
mod rewrite;
mod server;
mod socket;
mod tls;
mod transport;
mod tunnel;

pub use body::{Body, DEFAULT_MAX_BODY_SIZE};
pub use ca::{CertificateAuthority, CertificateIssuer, CertificateManager, Identity, DEFAULT_VALIDITY, ORGANIZATION};
pub use chunked::ChunkedWriter;
pub use connector::{Connector, ConnectorBuilder};
pub use errors::{Error, Result};
pub use http::header;
pub use http::Method;
pub use http::{StatusCode, Version};
pub use proxy::{IdentityMode, MitmProxy, ProxyConfig};
pub use request::Request;
pub use response::{Response, ResponseBuilder, ResponseConfig};
pub use rewrite::{rewrite_text, ContentTransformer, RenderScope, DEFAULT_WORD_LEN, TRADEMARK};
pub use server::{ProxyServer, ProxyServerBuilder, CONNECT_ESTABLISHED};
pub use socket::{MaybeTlsStream, Socket};
pub use tls::{client_config, server_config, ServerIdentity};
pub use tokio_rustls::rustls;
pub use transport::{Transport, TransportBuilder, Upstream};
pub use tunnel::{Tunnel, TunnelConfig};

pub(crate) const CR_LF: &[u8] = &[13, 10];
pub(crate) const SPACE: &[u8] = &[32];
pub(crate) const COLON_SPACE: &[u8] = &[58, 32];
