//! Server certificate verification against the live anchor store.

use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use rustls::client::WebPkiServerVerifier;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{
    CertificateError, ClientConfig, DigitallySignedStruct, Error, RootCertStore, SignatureScheme,
};
use tracing::{debug, warn};

use crate::anchors::TrustAnchorStore;
use crate::contract::ContractClient;

struct CachedVerifier {
    version: u64,
    inner: Arc<WebPkiServerVerifier>,
}

/// Verifies server chains against a base root set plus every anchor
/// currently in the [`TrustAnchorStore`].
///
/// The WebPKI verifier is rebuilt only when the store version moves.
pub struct AnchorVerifier {
    store: Arc<TrustAnchorStore>,
    base_roots: RootCertStore,
    provider: Arc<CryptoProvider>,
    cached: ArcSwapOption<CachedVerifier>,
    contract: ContractClient,
}

impl AnchorVerifier {
    /// Creates a verifier. With `webpki_roots` the bundled Mozilla roots are
    /// trusted in addition to the store.
    pub fn new(store: Arc<TrustAnchorStore>, webpki_roots: bool, contract: ContractClient) -> Self {
        let base_roots = if webpki_roots {
            RootCertStore {
                roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
            }
        } else {
            RootCertStore::empty()
        };

        Self {
            store,
            base_roots,
            provider: Arc::new(rustls::crypto::ring::default_provider()),
            cached: ArcSwapOption::empty(),
            contract,
        }
    }

    /// Builds a client configuration that verifies with this verifier.
    pub fn client_config(self: Arc<Self>) -> Arc<ClientConfig> {
        let config = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(self)
            .with_no_client_auth();
        Arc::new(config)
    }

    /// Returns the WebPKI verifier for the current store contents.
    fn current(&self) -> Result<Arc<WebPkiServerVerifier>, Error> {
        let snapshot = self.store.snapshot();

        if let Some(cached) = self.cached.load().as_ref()
            && cached.version == snapshot.version()
        {
            return Ok(Arc::clone(&cached.inner));
        }

        let mut roots = self.base_roots.clone();
        for anchor in snapshot.iter() {
            roots.add(anchor.der().clone())?;
        }
        if roots.is_empty() {
            return Err(Error::InvalidCertificate(CertificateError::UnknownIssuer));
        }

        let inner = WebPkiServerVerifier::builder_with_provider(
            Arc::new(roots),
            Arc::clone(&self.provider),
        )
        .build()
        .map_err(|e| Error::General(e.to_string()))?;

        debug!(
            "rebuilt server verifier for anchor store version {}",
            snapshot.version()
        );

        self.cached.store(Some(Arc::new(CachedVerifier {
            version: snapshot.version(),
            inner: Arc::clone(&inner),
        })));

        Ok(inner)
    }
}

impl fmt::Debug for AnchorVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnchorVerifier")
            .field("base_roots", &self.base_roots.len())
            .field("anchors", &self.store.len())
            .finish_non_exhaustive()
    }
}

impl ServerCertVerifier for AnchorVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, Error> {
        let result = self.current().and_then(|inner| {
            inner.verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
        });

        if let Err(ref e) = result {
            warn!("rejected certificate for {}: {}", server_name.to_str(), e);
            if matches!(e, Error::InvalidCertificate(CertificateError::UnknownIssuer)) {
                self.contract.log(format_args!(
                    "untrusted issuer for {}; install its root to continue",
                    server_name.to_str()
                ));
            }
        }

        result
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca::DemoCa;
    use crate::contract::{ContextOptions, InteractionContext, LogRecord};
    use crate::worker::WorkerRegistry;
    use std::io;
    use std::sync::Mutex;
    use std::thread;
    use std::time::{Duration, Instant};

    fn verify(verifier: &AnchorVerifier, ca: &DemoCa) -> Result<ServerCertVerified, Error> {
        let (cert, _) = ca.issue_host_cert("localhost").unwrap();
        let name = ServerName::try_from("localhost").unwrap();
        verifier.verify_server_cert(&cert, &[], &name, &[], UnixTime::now())
    }

    /// Tests that a chain from an uninstalled CA is rejected and accepted
    /// once its root is in the store.
    #[test]
    fn installed_anchor_is_trusted() {
        let store = Arc::new(TrustAnchorStore::new());
        let verifier = AnchorVerifier::new(Arc::clone(&store), true, ContractClient::detached());
        let ca = DemoCa::generate("verifier CA").unwrap();

        assert!(matches!(
            verify(&verifier, &ca),
            Err(Error::InvalidCertificate(CertificateError::UnknownIssuer))
        ));

        store.add(ca.anchor().unwrap());
        assert!(verify(&verifier, &ca).is_ok());

        // Other CAs stay untrusted.
        let other = DemoCa::generate("other CA").unwrap();
        assert!(verify(&verifier, &other).is_err());
    }

    /// Tests that the cached verifier is reused until the store changes.
    #[test]
    fn rebuild_only_on_change() {
        let store = Arc::new(TrustAnchorStore::new());
        let verifier = AnchorVerifier::new(Arc::clone(&store), true, ContractClient::detached());

        let first = verifier.current().unwrap();
        let second = verifier.current().unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        store.add(DemoCa::generate("cache CA").unwrap().anchor().unwrap());
        let third = verifier.current().unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
    }

    /// Tests that an unknown-issuer rejection is reported to the attached log
    /// sink, and that an accepted chain is not.
    #[test]
    fn unknown_issuer_logged() {
        let store = Arc::new(TrustAnchorStore::new());
        let ctx = InteractionContext::spawn(
            Arc::clone(&store),
            Arc::new(WorkerRegistry::new()),
            ContextOptions::default(),
        )
        .unwrap();
        let messages = Arc::new(Mutex::new(Vec::<String>::new()));
        let captured = Arc::clone(&messages);
        let sink = Arc::new(move |record: &LogRecord| -> io::Result<()> {
            captured.lock().unwrap().push(record.message.clone());
            Ok(())
        });
        ctx.attach_log_sink(&sink);

        let verifier = AnchorVerifier::new(Arc::clone(&store), false, ctx.client());
        let ca = DemoCa::generate("unlisted CA").unwrap();
        assert!(verify(&verifier, &ca).is_err());

        let deadline = Instant::now() + Duration::from_secs(5);
        while messages.lock().unwrap().is_empty() {
            assert!(Instant::now() < deadline, "rejection was not logged");
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(
            messages.lock().unwrap().as_slice(),
            ["untrusted issuer for localhost; install its root to continue"]
        );

        store.add(ca.anchor().unwrap());
        assert!(verify(&verifier, &ca).is_ok());
        // Give a stray record time to arrive before checking nothing came.
        thread::sleep(Duration::from_millis(50));
        assert_eq!(messages.lock().unwrap().len(), 1);
    }

    /// Tests that with no base roots and an empty store every chain is
    /// rejected as coming from an unknown issuer.
    #[test]
    fn empty_roots_reject() {
        let store = Arc::new(TrustAnchorStore::new());
        let verifier = AnchorVerifier::new(store, false, ContractClient::detached());
        assert!(matches!(
            verifier.current(),
            Err(Error::InvalidCertificate(CertificateError::UnknownIssuer))
        ));
    }
}
