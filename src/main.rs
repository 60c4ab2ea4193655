use std::path::PathBuf;

use clap::Parser;
use ntlm_anon_proxy::{tls, ProxyServer, Result};

/// Transparent TLS-intercepting proxy that answers origin NTLM demands with
/// an anonymous handshake.
#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Cli {
  /// Address to listen on
  #[arg(long, default_value = "127.0.0.1")]
  host: String,
  /// Port to listen on
  #[arg(long, default_value_t = 8080)]
  port: u16,
  /// PEM certificate presented to intercepted tunnels
  #[arg(long, default_value = "server.pem")]
  cert: PathBuf,
  /// PEM private key for the certificate
  #[arg(long, default_value = "server.key")]
  key: PathBuf,
  /// Capture decrypted origin traffic into this directory
  #[arg(long, env = "DEBUG_DIR")]
  debug_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(
      tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
    )
    .init();

  let cli = Cli::parse();
  let (certs, key) = tls::load_identity(&cli.cert, &cli.key)?;
  let server = ProxyServer::new(&cli.host, cli.port, certs, key, cli.debug_dir)?;
  server.run().await
}
