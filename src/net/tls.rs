use std::path::Path;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use ring::digest::{digest, SHA256};
use tracing::info;
use wtransport::tls::Sha256Digest;

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("Invalid certificate hash: {0}")]
    InvalidHash(String),
    #[error("Failed to read certificate {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
}

/// Server certificate verification for the WebTransport client.
///
/// Development servers run with self-signed certificates and print the
/// base64-encoded SHA-256 hash of their DER certificate; pinning that hash is
/// how the client trusts them. Without a pin the platform's root store is used.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsConfig {
    pin: Option<[u8; 32]>,
}

impl TlsConfig {
    /// Verify against the native root certificates
    pub fn native() -> Self {
        Self { pin: None }
    }

    /// Pin a base64-encoded SHA-256 certificate hash
    pub fn from_cert_hash(cert_hash: &str) -> Result<Self, TlsError> {
        let bytes = STANDARD
            .decode(cert_hash.trim())
            .map_err(|e| TlsError::InvalidHash(e.to_string()))?;

        let pin: [u8; 32] = bytes
            .try_into()
            .map_err(|b: Vec<u8>| TlsError::InvalidHash(format!("expected 32 bytes, got {}", b.len())))?;

        Ok(Self { pin: Some(pin) })
    }

    /// Pin the certificate stored (DER-encoded) at `path`
    pub fn from_der_file(path: impl AsRef<Path>) -> Result<Self, TlsError> {
        let path = path.as_ref();
        let der = std::fs::read(path).map_err(|source| TlsError::Read {
            path: path.display().to_string(),
            source,
        })?;

        Ok(Self::from_der(&der))
    }

    pub fn from_der(der: &[u8]) -> Self {
        let hash = digest(&SHA256, der);
        let mut pin = [0u8; 32];
        pin.copy_from_slice(hash.as_ref());

        Self { pin: Some(pin) }
    }

    /// Base64 hash of the pinned certificate, if any
    pub fn cert_hash(&self) -> Option<String> {
        self.pin.map(|pin| STANDARD.encode(pin))
    }

    /// Build the wtransport client configuration
    pub fn client_config(&self) -> wtransport::ClientConfig {
        let builder = wtransport::ClientConfig::builder().with_bind_default();

        match self.pin {
            Some(pin) => {
                info!("Pinning server certificate: {}", STANDARD.encode(pin));
                builder
                    .with_server_certificate_hashes([Sha256Digest::new(pin)])
                    .build()
            }
            None => builder.with_native_certs().build(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cert_hash_roundtrip() {
        let encoded = STANDARD.encode([7u8; 32]);
        let tls = TlsConfig::from_cert_hash(&encoded).unwrap();
        assert_eq!(tls.cert_hash(), Some(encoded));
    }

    #[test]
    fn test_cert_hash_wrong_length() {
        let encoded = STANDARD.encode([1u8; 16]);
        assert!(matches!(
            TlsConfig::from_cert_hash(&encoded),
            Err(TlsError::InvalidHash(_))
        ));
    }

    #[test]
    fn test_cert_hash_not_base64() {
        assert!(TlsConfig::from_cert_hash("not base64!").is_err());
    }

    #[test]
    fn test_from_der_matches_server_hash_format() {
        let der = b"fake certificate bytes";
        let tls = TlsConfig::from_der(der);

        let expected = STANDARD.encode(digest(&SHA256, der).as_ref());
        assert_eq!(tls.cert_hash(), Some(expected));
    }

    #[test]
    fn test_native_has_no_pin() {
        assert_eq!(TlsConfig::native().cert_hash(), None);
    }

    #[test]
    fn test_missing_der_file() {
        let result = TlsConfig::from_der_file("/definitely/not/here.der");
        assert!(matches!(result, Err(TlsError::Read { .. })));
    }
}
