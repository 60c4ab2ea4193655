//! # ntlm-anon-proxy
//!
//! A TLS-intercepting HTTP forward proxy for security testing of NTLM-gated
//! services. It terminates CONNECT tunnels itself (man-in-the-middle, one
//! static certificate for every host), forwards the inner request to the real
//! origin, and silently downgrades any `Www-Authenticate: NTLM` response into
//! an anonymous three-message NTLM exchange so the client receives a response
//! without any real credentials ever being supplied.
//!
//! Not for production traffic: there is no connection limit, no timeout on
//! proxied traffic, and origin certificates are never verified.
//!
//! # Example
//!
//! ```no_run
//! use ntlm_anon_proxy::{tls, ProxyServer};
//!
//! #[tokio::main]
//! async fn main() -> ntlm_anon_proxy::Result<()> {
//!   let (certs, key) = tls::load_identity("./cert.pem", "./key.pem")?;
//!   let server = ProxyServer::new("127.0.0.1", 8080, certs, key, None)?;
//!   server.run().await
//! }
//! ```

mod body;
mod connection;
mod dump;
mod errors;
mod ntlm;
mod request;
mod response;
mod server;
mod socket;
/// TLS configuration and certificate loading
pub mod tls;

pub use body::Body;
pub use connection::{Outcome, ProxyConnection, Target};
pub use errors::{Error, Result};
pub use ntlm::AnonClient;
pub use request::Request;
pub use response::Response;
pub use server::ProxyServer;
pub use socket::Socket;

/// Marker carried in the `Proxy-Agent` header and on error pages.
pub const PROXY_NAME: &str = "ntlm-anon-proxy";

pub(crate) const CR_LF: &[u8] = &[13, 10];
pub(crate) const SPACE: &[u8] = &[32];
pub(crate) const COLON_SPACE: &[u8] = &[58, 32];
