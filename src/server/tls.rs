//! Self-signed TLS for the reference listener.

use std::sync::Arc;

use rcgen::CertifiedKey;
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio_rustls::TlsAcceptor;

use crate::error::{Error, Result};

/// Acceptor with a fresh self-signed certificate for `names`.
///
/// ALPN offers `h2` then `http/1.1`; TLS 1.2 and 1.3 are both enabled so
/// fingerprints restricted to either version can connect.
pub(crate) fn self_signed_acceptor(names: &[String]) -> Result<TlsAcceptor> {
    let CertifiedKey { cert, key_pair } = rcgen::generate_simple_self_signed(names.to_vec())
        .map_err(|e| Error::config(format!("certificate generation failed: {e}")))?;
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = rustls::ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(rustls::ALL_VERSIONS)
        .map_err(|e| Error::config(format!("TLS versions: {e}")))?
        .with_no_client_auth()
        .with_single_cert(vec![cert.der().clone()], key)
        .map_err(|e| Error::config(format!("TLS certificate: {e}")))?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok(TlsAcceptor::from(Arc::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acceptor_builds() {
        let names = vec!["localhost".to_string(), "127.0.0.1".to_string()];
        assert!(self_signed_acceptor(&names).is_ok());
    }
}
