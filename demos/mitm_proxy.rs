//! Trademark-rewriting MITM proxy
//!
//! To run:
//! ```bash
//! RUST_LOG=tunnelmark=debug cargo run --example mitm_proxy
//! ```
//!
//! Point a client at 127.0.0.1:8080 as its HTTPS proxy and trust the
//! certificate printed on start-up, or skip verification:
//! ```bash
//! curl -k --proxy http://127.0.0.1:8080 https://localhost:8443/
//! ```

use tracing_subscriber::EnvFilter;
use tunnelmark::{IdentityMode, MitmProxy, ProxyConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tunnelmark=info")))
    .init();

  let mut config = ProxyConfig::default();
  if std::env::args().any(|arg| arg == "--per-host") {
    config.identity_mode = IdentityMode::PerHost;
  }
  let proxy = MitmProxy::new(config)?;

  println!("=== tunnelmark ===\n");
  println!("Trust this certificate in your client:\n{}", proxy.identity_pem());
  println!("Starting MITM proxy on 127.0.0.1:8080");

  proxy.start("127.0.0.1:8080").await?;

  Ok(())
}
