//! Trust anchor certificate values.

use std::fmt;
use std::fs;
use std::path::Path;

use rustls::RootCertStore;
use rustls::pki_types::CertificateDer;
use rustls::pki_types::pem::PemObject;
use sha2::{Digest, Sha256};

/// The result type for anchor parsing.
pub type AnchorResult<T> = Result<T, AnchorError>;

#[derive(Debug, thiserror::Error)]
pub enum AnchorError {
    #[error("certificate is empty")]
    Empty,
    #[error("certificate is not a usable trust anchor: {0}")]
    Malformed(#[source] rustls::Error),
    #[error("failed to decode PEM certificate: {0}")]
    Pem(#[source] rustls::pki_types::pem::Error),
    #[error("failed to read certificate file: {0}")]
    Io(#[from] std::io::Error),
}

/// A DER-encoded certificate designated as a root of trust.
///
/// Values are immutable and always well formed: every constructor checks that
/// the bytes parse as a trust anchor. Equality is byte-exact on the DER.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct TrustAnchor {
    der: CertificateDer<'static>,
    fingerprint: String,
}

impl TrustAnchor {
    /// Builds an anchor from raw DER bytes.
    pub fn from_der(der: impl Into<Vec<u8>>) -> AnchorResult<Self> {
        let der = CertificateDer::from(der.into());
        if der.is_empty() {
            return Err(AnchorError::Empty);
        }

        // Same parse rustls performs when the anchor is later used for
        // verification, so anything accepted here is usable there.
        let mut roots = RootCertStore::empty();
        roots.add(der.clone()).map_err(AnchorError::Malformed)?;

        let fingerprint = hex::encode(Sha256::digest(der.as_ref()));
        Ok(Self { der, fingerprint })
    }

    /// Builds an anchor from the first certificate in a PEM document.
    pub fn from_pem(pem: &[u8]) -> AnchorResult<Self> {
        let der = CertificateDer::from_pem_slice(pem).map_err(AnchorError::Pem)?;
        Self::from_der(der.as_ref().to_vec())
    }

    /// Loads an anchor from a file, accepting either PEM or DER encoding.
    ///
    /// Text around the PEM block (such as `Bag Attributes` headers or
    /// `openssl x509 -text` output) is ignored.
    pub fn load(path: impl AsRef<Path>) -> AnchorResult<Self> {
        let bytes = fs::read(path)?;
        match CertificateDer::from_pem_slice(&bytes) {
            Ok(der) => Self::from_der(der.as_ref().to_vec()),
            Err(_) if !contains_pem_marker(&bytes) => Self::from_der(bytes),
            Err(e) => Err(AnchorError::Pem(e)),
        }
    }

    /// Returns the certificate in DER format.
    pub fn der(&self) -> &CertificateDer<'static> {
        &self.der
    }

    /// Returns the lowercase hex SHA-256 fingerprint of the DER bytes.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

fn contains_pem_marker(bytes: &[u8]) -> bool {
    const MARKER: &[u8] = b"-----BEGIN";
    bytes.windows(MARKER.len()).any(|w| w == MARKER)
}

impl fmt::Debug for TrustAnchor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrustAnchor")
            .field("fingerprint", &self.fingerprint)
            .field("len", &self.der.len())
            .finish()
    }
}

impl fmt::Display for TrustAnchor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sha256:{}", &self.fingerprint[..16])
    }
}
