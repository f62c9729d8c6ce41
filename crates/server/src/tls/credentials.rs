//! [`CredentialBundle`]: validated certificate, private key, and optional CA chain.

use std::io::BufReader;
use std::path::Path;

use common::CredentialError;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{RootCertStore, ServerConfig};

use super::crypto_provider;

/// TLS key material the server authenticates itself with.
///
/// Built once at server construction and shared read-only (behind an `Arc`)
/// by every connection for the lifetime of the server.
pub struct CredentialBundle {
    cert_chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    ca_chain: Option<Vec<CertificateDer<'static>>>,
}

impl CredentialBundle {
    /// Parse and validate PEM-encoded credentials.
    ///
    /// # Errors
    ///
    /// - [`CredentialError::InvalidKeyPair`] if the certificate or key is empty,
    ///   unparsable, or the key does not belong to the end-entity certificate.
    /// - [`CredentialError::MalformedCa`] if `ca_pem` is present but does not
    ///   contain at least one parsable certificate.
    pub fn load(
        cert_pem: &[u8],
        key_pem: &[u8],
        ca_pem: Option<&[u8]>,
    ) -> Result<Self, CredentialError> {
        if cert_pem.is_empty() || key_pem.is_empty() {
            return Err(CredentialError::InvalidKeyPair(
                "certificate and private key must not be empty".into(),
            ));
        }

        let cert_chain = rustls_pemfile::certs(&mut BufReader::new(cert_pem))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| {
                CredentialError::InvalidKeyPair(format!("failed to parse certificate chain: {e}"))
            })?;
        if cert_chain.is_empty() {
            return Err(CredentialError::InvalidKeyPair(
                "no certificate found in PEM data".into(),
            ));
        }

        let key = rustls_pemfile::private_key(&mut BufReader::new(key_pem))
            .map_err(|e| {
                CredentialError::InvalidKeyPair(format!("failed to read private key: {e}"))
            })?
            .ok_or_else(|| {
                CredentialError::InvalidKeyPair("no private key found in PEM data".into())
            })?;

        let ca_chain = ca_pem.map(parse_ca_chain).transpose()?;

        let bundle = Self {
            cert_chain,
            key,
            ca_chain,
        };
        // rustls checks that the key's public half matches the leaf certificate.
        bundle.server_config(Vec::new())?;
        Ok(bundle)
    }

    /// Read PEM files from disk and delegate to [`CredentialBundle::load`].
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::Io`] if any file cannot be read, otherwise
    /// the errors of [`CredentialBundle::load`].
    pub fn from_files(
        cert_path: &Path,
        key_path: &Path,
        ca_path: Option<&Path>,
    ) -> Result<Self, CredentialError> {
        let cert = read_pem(cert_path)?;
        let key = read_pem(key_path)?;
        let ca = ca_path.map(read_pem).transpose()?;
        Self::load(&cert, &key, ca.as_deref())
    }

    /// The server certificate chain, leaf first.
    pub fn cert_chain(&self) -> &[CertificateDer<'static>] {
        &self.cert_chain
    }

    /// The optional CA chain supplied alongside the key pair.
    pub fn ca_chain(&self) -> Option<&[CertificateDer<'static>]> {
        self.ca_chain.as_deref()
    }

    /// Build a rustls [`ServerConfig`] advertising the given ALPN protocols.
    ///
    /// CA certificates not already part of the leaf chain are appended to the
    /// chain presented to clients.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::InvalidKeyPair`] if rustls rejects the key
    /// material.
    pub fn server_config(
        &self,
        alpn_protocols: Vec<Vec<u8>>,
    ) -> Result<ServerConfig, CredentialError> {
        let mut chain = self.cert_chain.clone();
        if let Some(ca) = &self.ca_chain {
            for cert in ca {
                if !chain.contains(cert) {
                    chain.push(cert.clone());
                }
            }
        }

        let mut config = ServerConfig::builder_with_provider(crypto_provider())
            .with_safe_default_protocol_versions()
            .map_err(|e| CredentialError::InvalidKeyPair(e.to_string()))?
            .with_no_client_auth()
            .with_single_cert(chain, self.key.clone_key())
            .map_err(|e| CredentialError::InvalidKeyPair(e.to_string()))?;
        config.alpn_protocols = alpn_protocols;
        Ok(config)
    }
}

impl std::fmt::Debug for CredentialBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        f.debug_struct("CredentialBundle")
            .field("cert_chain_len", &self.cert_chain.len())
            .field("key", &"[REDACTED]")
            .field("ca_chain_len", &self.ca_chain.as_ref().map(Vec::len))
            .finish()
    }
}

fn parse_ca_chain(ca_pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, CredentialError> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(ca_pem))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| CredentialError::MalformedCa(e.to_string()))?;
    if certs.is_empty() {
        return Err(CredentialError::MalformedCa(
            "no certificate found in CA PEM data".into(),
        ));
    }

    // Adding to a root store forces a full X.509 parse of each entry.
    let mut store = RootCertStore::empty();
    for cert in &certs {
        store
            .add(cert.clone())
            .map_err(|e| CredentialError::MalformedCa(e.to_string()))?;
    }
    Ok(certs)
}

pub(crate) fn read_pem(path: &Path) -> Result<Vec<u8>, CredentialError> {
    std::fs::read(path).map_err(|source| CredentialError::Io {
        path: path.display().to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn self_signed() -> (String, String) {
        let rcgen::CertifiedKey { cert, signing_key } =
            rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
        (cert.pem(), signing_key.serialize_pem())
    }

    #[test]
    fn loads_matching_pair() {
        let (cert, key) = self_signed();
        let bundle = CredentialBundle::load(cert.as_bytes(), key.as_bytes(), None).unwrap();
        assert_eq!(bundle.cert_chain().len(), 1);
        assert!(bundle.ca_chain().is_none());
    }

    #[test]
    fn load_is_repeatable() {
        let (cert, key) = self_signed();
        for _ in 0..3 {
            assert!(CredentialBundle::load(cert.as_bytes(), key.as_bytes(), None).is_ok());
        }
    }

    #[test]
    fn rejects_mismatched_pair() {
        let (cert, _) = self_signed();
        let (_, other_key) = self_signed();
        let err = CredentialBundle::load(cert.as_bytes(), other_key.as_bytes(), None).unwrap_err();
        assert!(matches!(err, CredentialError::InvalidKeyPair(_)), "got {err:?}");
    }

    #[test]
    fn rejects_empty_cert_pem() {
        let err = CredentialBundle::load(b"", b"", None).unwrap_err();
        assert!(matches!(err, CredentialError::InvalidKeyPair(_)));
    }

    #[test]
    fn rejects_garbage_pem() {
        let err = CredentialBundle::load(b"not a pem", b"also not a pem", None).unwrap_err();
        assert!(matches!(err, CredentialError::InvalidKeyPair(_)));
    }

    #[test]
    fn accepts_ca_chain() {
        let (cert, key) = self_signed();
        let (ca, _) = self_signed();
        let bundle =
            CredentialBundle::load(cert.as_bytes(), key.as_bytes(), Some(ca.as_bytes())).unwrap();
        assert_eq!(bundle.ca_chain().map(<[_]>::len), Some(1));
    }

    #[test]
    fn rejects_unparsable_ca() {
        let (cert, key) = self_signed();
        let err = CredentialBundle::load(cert.as_bytes(), key.as_bytes(), Some(b"garbage"))
            .unwrap_err();
        assert!(matches!(err, CredentialError::MalformedCa(_)));
    }

    #[test]
    fn rejects_ca_with_corrupt_der() {
        let (cert, key) = self_signed();
        let bogus = "-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----\n";
        let err = CredentialBundle::load(cert.as_bytes(), key.as_bytes(), Some(bogus.as_bytes()))
            .unwrap_err();
        assert!(matches!(err, CredentialError::MalformedCa(_)));
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = CredentialBundle::from_files(
            Path::new("/nonexistent/cert.pem"),
            Path::new("/nonexistent/key.pem"),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, CredentialError::Io { .. }));
    }

    #[test]
    fn debug_redacts_key() {
        let (cert, key) = self_signed();
        let bundle = CredentialBundle::load(cert.as_bytes(), key.as_bytes(), None).unwrap();
        assert!(format!("{bundle:?}").contains("REDACTED"));
    }
}
