//! CA and host certificate generation using rcgen.

use std::sync::Arc;

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use rustls::ServerConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use time::{Duration, OffsetDateTime};
use tracing::debug;

use crate::anchors::{AnchorError, TrustAnchor};

/// The result type for CA operations.
pub type CaResult<T> = Result<T, CaError>;

#[derive(Debug, thiserror::Error)]
pub enum CaError {
    #[error("failed to generate certificate: {0}")]
    Generation(#[from] rcgen::Error),
    #[error("invalid DNS name: {0}")]
    InvalidDnsName(String),
    #[error("failed to build server config: {0}")]
    ServerConfig(#[source] rustls::Error),
    #[error("CA certificate is not a usable anchor: {0}")]
    Anchor(#[from] AnchorError),
}

const CA_LIFETIME: Duration = Duration::hours(24);
const HOST_LIFETIME: Duration = Duration::hours(1);

/// Ephemeral CA, valid for 24 hours from creation.
pub struct DemoCa {
    ca_cert_der: CertificateDer<'static>,
    ca_cert_pem: String,
    ca_key_pair: KeyPair,
    ca_params: CertificateParams,
}

impl DemoCa {
    /// Generates a new self-signed CA with the given common name.
    pub fn generate(common_name: &str) -> CaResult<Self> {
        let mut params = CertificateParams::default();
        params.distinguished_name = name(&[
            (DnType::CommonName, common_name),
            (DnType::OrganizationName, "anchor-intercept"),
        ]);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        set_validity(&mut params, CA_LIFETIME);

        let key_pair = KeyPair::generate()?;
        let cert = params.self_signed(&key_pair)?;
        debug!("generated demo CA \"{}\"", common_name);

        Ok(Self {
            ca_cert_der: cert.der().clone(),
            ca_cert_pem: cert.pem(),
            ca_key_pair: key_pair,
            ca_params: params,
        })
    }

    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    pub fn ca_cert_der(&self) -> &CertificateDer<'static> {
        &self.ca_cert_der
    }

    /// The CA certificate as a candidate trust anchor.
    pub fn anchor(&self) -> CaResult<TrustAnchor> {
        Ok(TrustAnchor::from_der(self.ca_cert_der.as_ref().to_vec())?)
    }

    /// Issues a short-lived server certificate for `host`.
    pub fn issue_host_cert(
        &self,
        host: &str,
    ) -> CaResult<(CertificateDer<'static>, PrivateKeyDer<'static>)> {
        let mut params = CertificateParams::default();
        params.distinguished_name = name(&[(DnType::CommonName, host)]);
        params.subject_alt_names = vec![SanType::DnsName(
            host.try_into()
                .map_err(|_| CaError::InvalidDnsName(host.to_string()))?,
        )];
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        set_validity(&mut params, HOST_LIFETIME);

        let key_pair = KeyPair::generate()?;
        let issuer = Issuer::from_params(&self.ca_params, &self.ca_key_pair);
        let cert = params.signed_by(&key_pair, &issuer)?;
        debug!("issued demo host certificate for {}", host);

        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
        Ok((cert.der().clone(), key))
    }

    /// Wraps a freshly issued certificate for `host` in a rustls server
    /// configuration.
    pub fn server_config(&self, host: &str) -> CaResult<Arc<ServerConfig>> {
        let (cert_der, key_der) = self.issue_host_cert(host)?;
        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert_der], key_der)
            .map_err(CaError::ServerConfig)?;
        Ok(Arc::new(config))
    }
}

fn name(parts: &[(DnType, &str)]) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    for (ty, value) in parts {
        dn.push(ty.clone(), *value);
    }
    dn
}

/// Backdates the start a little to tolerate clock skew between peers.
fn set_validity(params: &mut CertificateParams, lifetime: Duration) {
    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::minutes(5);
    params.not_after = now + lifetime;
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Tests that the generated CA is exported in PEM and accepted as an
    /// anchor.
    #[test]
    fn generate_ca() {
        let ca = DemoCa::generate("demo").unwrap();
        assert!(ca.ca_cert_pem().contains("BEGIN CERTIFICATE"));
        let anchor = ca.anchor().unwrap();
        assert_eq!(anchor.der(), ca.ca_cert_der());
    }

    /// Tests issuing a server configuration for a host name.
    #[test]
    fn issue_server_config() {
        let ca = DemoCa::generate("demo").unwrap();
        assert!(ca.server_config("localhost").is_ok());
    }

    /// Tests that non-ASCII host names are refused.
    #[test]
    fn invalid_host_rejected() {
        let ca = DemoCa::generate("demo").unwrap();
        assert!(matches!(
            ca.server_config("bücher.example"),
            Err(CaError::InvalidDnsName(_))
        ));
    }
}
