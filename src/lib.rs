//! Runtime-installable TLS trust anchors for an intercepting protocol layer.
//!
//! Worker threads handle connections and evaluate server certificates. When a
//! worker comes across a root certificate it wants trusted, it proposes it to
//! a single interaction context, which decides and, on acceptance, adds it to
//! a shared [`TrustAnchorStore`]. Every later handshake sees it.
//!
//! # Architecture
//!
//! - [`TrustAnchorStore`]: copy-on-write, observable set of anchors. Readers
//!   take a snapshot without locking; writers publish a new set atomically.
//! - [`WorkerRegistry`]: identity (OS thread id, sequence number, name) for
//!   each worker, used to correlate log output.
//! - [`InteractionContext`] / [`ContractClient`]: install requests and log
//!   records sent over channels to one thread that owns the decision.
//! - [`AnchorVerifier`]: rustls verifier that trusts the base roots plus the
//!   current store snapshot.
//!
//! # Example
//!
//! ```no_run
//! use anchor_intercept::{Config, Session, TrustAnchor};
//!
//! let session = Session::start(Config::default()).unwrap();
//! let anchor = TrustAnchor::load("corp-root.pem").unwrap();
//! let worker = session
//!     .spawn_worker("loader", move |client| client.request_install_trusted_anchor(anchor))
//!     .unwrap();
//! worker.join().unwrap().unwrap();
//! ```

pub mod anchors;
pub mod ca;
mod config;
pub mod contract;
pub mod discovery;
pub mod proxy;
mod worker;

pub use anchors::{AnchorError, AnchorSet, StoreChange, TrustAnchor, TrustAnchorStore};
pub use config::{Config, ConfigError, InstallConfig, InstallPolicy, LoggingConfig, TrustConfig};
pub use contract::{
    ContextOptions, ContractClient, InstallDecision, InstallError, InstallHandler, InstallRequest,
    InteractionContext, LogRecord, LogSink, PolicyInstaller, TracingLogSink,
};
pub use proxy::{AnchorVerifier, UpstreamConnector};
pub use worker::{WorkerError, WorkerRecord, WorkerRegistry};

use anyhow::{Context, Result};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{info, warn};

/// A running instance: store, registry and interaction context, configured
/// from a [`Config`].
pub struct Session {
    config: Config,
    registry: Arc<WorkerRegistry>,
    context: InteractionContext,
    /// Strong owners of the attached handlers; the context holds them weakly.
    _installer: Arc<PolicyInstaller>,
    _log_sink: Arc<TracingLogSink>,
}

impl Session {
    /// Starts the interaction context and installs the configured anchors.
    pub fn start(config: Config) -> Result<Self> {
        let store = Arc::new(TrustAnchorStore::new());
        let registry = Arc::new(WorkerRegistry::new());

        for path in &config.trust.anchors {
            let anchor = TrustAnchor::load(path)
                .with_context(|| format!("failed to load trust anchor {:?}", path))?;
            store.add(anchor);
        }
        if !store.is_empty() {
            info!("loaded {} configured trust anchors", store.len());
        }

        let context = InteractionContext::spawn(
            store,
            Arc::clone(&registry),
            config.context_options(),
        )
        .context("failed to start interaction context")?;

        let installer = Arc::new(PolicyInstaller::new(&config.install));
        let log_sink = Arc::new(TracingLogSink);
        context.attach_install_handler(&installer);
        context.attach_log_sink(&log_sink);

        Ok(Self {
            config,
            registry,
            context,
            _installer: installer,
            _log_sink: log_sink,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<TrustAnchorStore> {
        self.context.store()
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    pub fn context(&self) -> &InteractionContext {
        &self.context
    }

    pub fn client(&self) -> ContractClient {
        self.context.client()
    }

    /// Builds a verifier over this session's store.
    pub fn verifier(&self) -> Arc<AnchorVerifier> {
        Arc::new(AnchorVerifier::new(
            Arc::clone(self.store()),
            self.config.trust.webpki_roots,
            self.client(),
        ))
    }

    pub fn connector(&self) -> UpstreamConnector {
        UpstreamConnector::new(self.verifier())
    }

    /// Builds the interception runtime with the configured worker count.
    pub fn runtime(&self) -> Result<tokio::runtime::Runtime> {
        proxy::intercept_runtime(Arc::clone(&self.registry), self.config.workers)
            .context("failed to create interception runtime")
    }

    /// Runs `f` on a new, registered worker thread.
    pub fn spawn_worker<F, T>(&self, name: &str, f: F) -> Result<JoinHandle<T>>
    where
        F: FnOnce(ContractClient) -> T + Send + 'static,
        T: Send + 'static,
    {
        let registry = Arc::clone(&self.registry);
        let client = self.client();
        let worker_name = name.to_string();

        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                if let Err(e) = registry.register_current(&worker_name) {
                    warn!("failed to register worker: {}", e);
                }
                let result = f(client);
                registry.unregister_current();
                result
            })
            .context("failed to spawn worker thread")?;

        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca::DemoCa;

    fn config_for(anchor: &TrustAnchor) -> Config {
        let mut config = Config::default();
        config.install.allowed_fingerprints = vec![anchor.fingerprint().to_string()];
        config.trust.webpki_roots = false;
        config
    }

    /// Tests that the default fingerprint policy installs listed anchors and
    /// rejects everything else.
    #[test]
    fn session_policy() {
        let listed = DemoCa::generate("listed").unwrap().anchor().unwrap();
        let unlisted = DemoCa::generate("unlisted").unwrap().anchor().unwrap();
        let session = Session::start(config_for(&listed)).unwrap();

        let (a, b) = (listed.clone(), unlisted.clone());
        let outcome = session
            .spawn_worker("loader", move |client| {
                (
                    client.request_install_trusted_anchor(a),
                    client.request_install_trusted_anchor(b),
                )
            })
            .unwrap()
            .join()
            .unwrap();

        assert!(outcome.0.is_ok());
        assert!(matches!(outcome.1, Err(InstallError::Rejected(_))));
        assert_eq!(&session.store().snapshot()[..], &[listed][..]);
        // The worker unregistered on exit; only the context thread remains.
        assert_eq!(session.registry().len(), 1);
    }

    /// Tests that anchors listed in the configuration are present at start.
    #[test]
    fn configured_anchors_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let ca = DemoCa::generate("configured").unwrap();
        let path = dir.path().join("root.pem");
        std::fs::write(&path, ca.ca_cert_pem()).unwrap();

        let mut config = Config::default();
        config.trust.anchors = vec![path];
        let session = Session::start(config).unwrap();

        assert!(session.store().contains(&ca.anchor().unwrap()));
    }

    /// Tests that a missing configured anchor fails startup.
    #[test]
    fn missing_configured_anchor() {
        let mut config = Config::default();
        config.trust.anchors = vec!["/nonexistent/root.pem".into()];
        assert!(Session::start(config).is_err());
    }
}
