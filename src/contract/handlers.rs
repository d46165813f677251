//! Capabilities the owning context can attach: install review and log sink.

use std::collections::HashSet;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use time::OffsetDateTime;
use tracing::info;

use crate::anchors::{AnchorError, TrustAnchor};
use crate::config::{InstallConfig, InstallPolicy};
use crate::worker::WorkerRecord;

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("malformed certificate: {0}")]
    Malformed(#[from] AnchorError),
    #[error("install of trust anchor {0} was rejected")]
    Rejected(String),
    #[error("failed to store trust anchor: {0}")]
    Storage(String),
    #[error("no handler")]
    NoHandler,
    #[error("no install decision within {0:?}")]
    TimedOut(Duration),
    #[error("install requested from the interaction context itself")]
    Reentrant,
}

/// A candidate anchor on its way to the owning context.
#[derive(Debug, Clone)]
pub struct InstallRequest {
    pub anchor: TrustAnchor,
    /// The worker that proposed it, if that thread registered.
    pub origin: Option<Arc<WorkerRecord>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallDecision {
    Accept,
    Reject,
}

/// Reviews install requests on the interaction context.
///
/// Returning [`InstallDecision::Accept`] makes the context add the anchor to
/// the store before the requester is answered.
pub trait InstallHandler: Send + Sync {
    fn review(&self, request: &InstallRequest) -> Result<InstallDecision, InstallError>;
}

impl<F> InstallHandler for F
where
    F: Fn(&InstallRequest) -> Result<InstallDecision, InstallError> + Send + Sync,
{
    fn review(&self, request: &InstallRequest) -> Result<InstallDecision, InstallError> {
        self(request)
    }
}

/// One diagnostic line emitted through the contract.
#[derive(Debug, Clone)]
pub struct LogRecord {
    /// Process-wide emission order.
    pub seq: u64,
    pub timestamp: OffsetDateTime,
    pub worker: Option<Arc<WorkerRecord>>,
    pub message: String,
}

/// Receives log records on the interaction context.
///
/// Errors are swallowed by the context.
pub trait LogSink: Send + Sync {
    fn write(&self, record: &LogRecord) -> io::Result<()>;
}

impl<F> LogSink for F
where
    F: Fn(&LogRecord) -> io::Result<()> + Send + Sync,
{
    fn write(&self, record: &LogRecord) -> io::Result<()> {
        self(record)
    }
}

/// Forwards contract log records into `tracing`.
#[derive(Debug, Default)]
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn write(&self, record: &LogRecord) -> io::Result<()> {
        match record.worker {
            Some(ref worker) => info!(
                target: "surface",
                seq = record.seq,
                worker = worker.name(),
                number = worker.number(),
                tid = worker.tid(),
                "{}",
                record.message
            ),
            None => info!(target: "surface", seq = record.seq, "{}", record.message),
        }
        Ok(())
    }
}

/// Install handler driven by the `install` configuration section.
#[derive(Debug)]
pub struct PolicyInstaller {
    policy: InstallPolicy,
    allowed: HashSet<String>,
}

impl PolicyInstaller {
    pub fn new(config: &InstallConfig) -> Self {
        Self {
            policy: config.policy,
            allowed: config
                .allowed_fingerprints
                .iter()
                .map(|f| f.to_ascii_lowercase())
                .collect(),
        }
    }
}

impl InstallHandler for PolicyInstaller {
    fn review(&self, request: &InstallRequest) -> Result<InstallDecision, InstallError> {
        let accept = match self.policy {
            InstallPolicy::AcceptAll => true,
            InstallPolicy::DenyAll => false,
            InstallPolicy::Fingerprints => self.allowed.contains(request.anchor.fingerprint()),
        };
        Ok(if accept {
            InstallDecision::Accept
        } else {
            InstallDecision::Reject
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca::DemoCa;

    fn request() -> InstallRequest {
        InstallRequest {
            anchor: DemoCa::generate("policy CA").unwrap().anchor().unwrap(),
            origin: None,
        }
    }

    /// Tests the fingerprint policy: only listed fingerprints are accepted,
    /// compared case-insensitively.
    #[test]
    fn fingerprint_policy() {
        let req = request();
        let listed = InstallConfig {
            policy: InstallPolicy::Fingerprints,
            allowed_fingerprints: vec![req.anchor.fingerprint().to_ascii_uppercase()],
            ..InstallConfig::default()
        };
        let unlisted = InstallConfig {
            policy: InstallPolicy::Fingerprints,
            ..InstallConfig::default()
        };

        assert_eq!(
            PolicyInstaller::new(&listed).review(&req).unwrap(),
            InstallDecision::Accept
        );
        assert_eq!(
            PolicyInstaller::new(&unlisted).review(&req).unwrap(),
            InstallDecision::Reject
        );
    }

    /// Tests the blanket policies.
    #[test]
    fn blanket_policies() {
        let req = request();
        let accept = InstallConfig {
            policy: InstallPolicy::AcceptAll,
            ..InstallConfig::default()
        };
        let deny = InstallConfig {
            policy: InstallPolicy::DenyAll,
            ..InstallConfig::default()
        };
        assert_eq!(
            PolicyInstaller::new(&accept).review(&req).unwrap(),
            InstallDecision::Accept
        );
        assert_eq!(
            PolicyInstaller::new(&deny).review(&req).unwrap(),
            InstallDecision::Reject
        );
    }
}
