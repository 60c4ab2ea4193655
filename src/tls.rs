//! TLS configuration for both directions of the intercept.
//!
//! The client-facing side presents one statically loaded certificate for
//! every intercepted host; the origin-facing side disables certificate
//! verification entirely. Both are deliberate: this proxy exists to inspect
//! traffic, not to protect it.
use crate::errors::Result;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::rustls;
use tokio_rustls::rustls::{
  client::danger::HandshakeSignatureValid, client::danger::ServerCertVerified,
  client::danger::ServerCertVerifier, ClientConfig, DigitallySignedStruct, Error as TLSError,
  ServerConfig, SignatureScheme,
};
use tokio_rustls::{TlsAcceptor, TlsConnector};

fn provider() -> Arc<rustls::crypto::CryptoProvider> {
  rustls::crypto::CryptoProvider::get_default()
    .cloned()
    .unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider()))
}

/// Build the connector used toward origins: any certificate is accepted.
pub fn insecure_connector() -> Result<TlsConnector> {
  let config = ClientConfig::builder_with_provider(provider())
    .with_protocol_versions(rustls::ALL_VERSIONS)?
    .dangerous()
    .with_custom_certificate_verifier(Arc::new(NoVerifier))
    .with_no_client_auth();
  Ok(TlsConnector::from(Arc::new(config)))
}

/// Build the acceptor used toward clients from the static MITM identity.
pub fn static_acceptor(
  certs: Vec<CertificateDer<'static>>,
  key: PrivateKeyDer<'static>,
) -> Result<TlsAcceptor> {
  let config = ServerConfig::builder_with_provider(provider())
    .with_protocol_versions(rustls::ALL_VERSIONS)?
    .with_no_client_auth()
    .with_single_cert(certs, key)?;
  Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Load the PEM encoded certificate chain and private key used for the
/// client-facing TLS handshake.
///
/// The key must be in RSA, SEC1 elliptic curve or PKCS#8 format.
pub fn load_identity<P: AsRef<Path>>(
  cert_path: P,
  key_path: P,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
  let cert_pem = std::fs::read(cert_path)?;
  let certs = rustls_pemfile::certs(&mut cert_pem.as_slice()).collect::<std::io::Result<Vec<_>>>()?;
  if certs.is_empty() {
    return Err(crate::errors::new_io_error(
      std::io::ErrorKind::InvalidData,
      "no certificate found in PEM file",
    ));
  }
  let key_pem = std::fs::read(key_path)?;
  let key = rustls_pemfile::private_key(&mut key_pem.as_slice())?.ok_or_else(|| {
    crate::errors::new_io_error(
      std::io::ErrorKind::InvalidData,
      "no private key found in PEM file",
    )
  })?;
  Ok((certs, key))
}

#[derive(Debug)]
pub(crate) struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
  fn verify_server_cert(
    &self,
    _end_entity: &CertificateDer,
    _intermediates: &[CertificateDer],
    _server_name: &ServerName,
    _ocsp_response: &[u8],
    _now: UnixTime,
  ) -> std::result::Result<ServerCertVerified, TLSError> {
    Ok(ServerCertVerified::assertion())
  }

  fn verify_tls12_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, TLSError> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn verify_tls13_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, TLSError> {
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
