//! Directory watcher that proposes newly dropped certificate files.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher, event::ModifyKind};
use tracing::{debug, error, info, warn};

use crate::anchors::TrustAnchor;
use crate::contract::ContractClient;
use crate::worker::WorkerRegistry;

const CERT_EXTENSIONS: &[&str] = &["pem", "crt", "cer", "der"];

/// Message sent when a candidate file appears or changes.
#[derive(Debug)]
pub enum DiscoveryEvent {
    Candidate(PathBuf),
    /// Watcher encountered an error.
    Error(String),
}

/// Returns whether the path has a certificate file extension.
pub fn is_certificate_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            CERT_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
}

/// Watches a directory for certificate files.
pub struct AnchorWatcher {
    _watcher: RecommendedWatcher,
    receiver: Receiver<DiscoveryEvent>,
}

impl AnchorWatcher {
    pub fn new(dir: &Path) -> Result<Self, notify::Error> {
        let (tx, rx) = mpsc::channel();

        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            match res {
                Ok(event) => {
                    // Covers direct writes and editors that save by
                    // creating a new file.
                    let relevant = matches!(
                        event.kind,
                        notify::EventKind::Modify(ModifyKind::Data(_))
                            | notify::EventKind::Modify(ModifyKind::Any)
                            | notify::EventKind::Modify(ModifyKind::Name(_))
                            | notify::EventKind::Create(_)
                    );
                    if !relevant {
                        return;
                    }

                    for path in event.paths {
                        if is_certificate_file(&path) {
                            debug!("candidate certificate changed: {:?} ({:?})", path, event.kind);
                            let _ = tx.send(DiscoveryEvent::Candidate(path));
                        }
                    }
                }
                Err(e) => {
                    error!("anchor watcher error: {}", e);
                    let _ = tx.send(DiscoveryEvent::Error(e.to_string()));
                }
            }
        })?;

        watcher.watch(dir, RecursiveMode::NonRecursive)?;
        info!("watching {} for trust anchors", dir.display());

        Ok(Self {
            _watcher: watcher,
            receiver: rx,
        })
    }

    /// Receives an event, blocking until one is available or the timeout
    /// expires.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<DiscoveryEvent> {
        self.receiver.recv_timeout(timeout).ok()
    }
}

/// Lists certificate files already present in `dir`, sorted by name.
pub fn scan_dir(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut found: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file() && is_certificate_file(path))
        .collect();
    found.sort();
    Ok(found)
}

/// Loads `path` and proposes it through the contract, logging the outcome.
///
/// Returns whether the anchor is now installed.
pub fn propose_file(client: &ContractClient, path: &Path) -> bool {
    let anchor = match TrustAnchor::load(path) {
        Ok(anchor) => anchor,
        Err(e) => {
            warn!("skipping {}: {}", path.display(), e);
            client.log(format_args!("skipped {}: {}", path.display(), e));
            return false;
        }
    };

    client.log(format_args!(
        "proposing {} from {}",
        anchor,
        path.display()
    ));
    match client.request_install_trusted_anchor(anchor) {
        Ok(()) => {
            client.log(format_args!("installed anchor from {}", path.display()));
            true
        }
        Err(e) => {
            client.log(format_args!(
                "install from {} failed: {}",
                path.display(),
                e
            ));
            false
        }
    }
}

/// Paths are proposed once the directory has been quiet this long.
const QUIET_PERIOD: Duration = Duration::from_millis(300);
/// Upper bound on how long a path waits while events keep arriving.
const MAX_DELAY: Duration = Duration::from_secs(2);

/// Handle to a running anchor watcher thread.
pub struct WatcherHandle {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

impl WatcherHandle {
    /// Signals the watcher to exit and waits for it. Paths still waiting for
    /// the quiet period are not proposed.
    pub fn stop(self) -> thread::Result<()> {
        self.stop.store(true, Ordering::Relaxed);
        self.thread.join()
    }

    /// Waits for the watcher thread without stopping it.
    pub fn join(self) -> thread::Result<()> {
        self.thread.join()
    }
}

/// Starts a worker thread that proposes every certificate already in `dir`,
/// then every one that is added or modified later.
pub fn spawn_anchor_watcher(
    dir: &Path,
    client: ContractClient,
    registry: Arc<WorkerRegistry>,
) -> Result<WatcherHandle, notify::Error> {
    let watcher = AnchorWatcher::new(dir)?;
    let existing = scan_dir(dir)?;
    let stop = Arc::new(AtomicBool::new(false));
    let thread_stop = Arc::clone(&stop);

    let thread = thread::Builder::new()
        .name("anchor-watcher".to_string())
        .spawn(move || {
            if let Err(e) = registry.register_current("anchor-watcher") {
                warn!("failed to register anchor watcher: {}", e);
            }

            for path in existing {
                propose_file(&client, &path);
            }

            // Files are often written in several steps; collect paths until
            // the directory has been quiet for a moment.
            let mut pending: Vec<PathBuf> = Vec::new();
            let mut oldest: Option<Instant> = None;

            while !thread_stop.load(Ordering::Relaxed) {
                match watcher.recv_timeout(QUIET_PERIOD) {
                    Some(DiscoveryEvent::Candidate(path)) => {
                        if !pending.contains(&path) {
                            pending.push(path);
                        }
                        oldest.get_or_insert_with(Instant::now);
                        if oldest.is_some_and(|t| t.elapsed() < MAX_DELAY) {
                            continue;
                        }
                    }
                    Some(DiscoveryEvent::Error(e)) => {
                        warn!("anchor watcher error: {}", e);
                        continue;
                    }
                    None => {}
                }

                oldest = None;
                for path in pending.drain(..) {
                    if path.is_file() {
                        propose_file(&client, &path);
                    }
                }
            }

            debug!("anchor watcher stopping");
            registry.unregister_current();
        })?;

    Ok(WatcherHandle { stop, thread })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anchors::TrustAnchorStore;
    use crate::ca::DemoCa;
    use crate::contract::{
        ContextOptions, InstallDecision, InstallError, InstallRequest, InteractionContext,
    };

    /// Tests recognition of certificate file extensions.
    #[test]
    fn certificate_extensions() {
        assert!(is_certificate_file(Path::new("root.pem")));
        assert!(is_certificate_file(Path::new("ROOT.CER")));
        assert!(is_certificate_file(Path::new("/tmp/a.der")));
        assert!(!is_certificate_file(Path::new("notes.txt")));
        assert!(!is_certificate_file(Path::new("pem")));
    }

    /// Tests that the directory scan only returns certificate files.
    #[test]
    fn scan_filters_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("b.pem"), "x").unwrap();
        fs::write(dir.path().join("a.der"), "x").unwrap();
        fs::write(dir.path().join("readme.md"), "x").unwrap();
        fs::create_dir(dir.path().join("sub.pem")).unwrap();

        let found = scan_dir(dir.path()).unwrap();
        let names: Vec<_> = found
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap())
            .collect();
        assert_eq!(names, ["a.der", "b.pem"]);
    }

    /// Tests that proposing files installs valid anchors and skips garbage.
    #[test]
    fn propose_installs_valid_files() {
        let dir = tempfile::tempdir().unwrap();
        let ca = DemoCa::generate("dropped CA").unwrap();
        let good = dir.path().join("root.pem");
        fs::write(&good, ca.ca_cert_pem()).unwrap();
        let bad = dir.path().join("broken.pem");
        fs::write(&bad, "-----BEGIN CERTIFICATE-----\nnope\n").unwrap();

        let ctx = InteractionContext::spawn(
            Arc::new(TrustAnchorStore::new()),
            Arc::new(WorkerRegistry::new()),
            ContextOptions::default(),
        )
        .unwrap();
        let handler = Arc::new(|_: &InstallRequest| -> Result<InstallDecision, InstallError> {
            Ok(InstallDecision::Accept)
        });
        ctx.attach_install_handler(&handler);

        let client = ctx.client();
        assert!(propose_file(&client, &good));
        assert!(!propose_file(&client, &bad));
        assert_eq!(ctx.store().len(), 1);
        assert!(ctx.store().contains(&ca.anchor().unwrap()));
    }

    /// Tests that the watcher thread installs files present at startup.
    #[test]
    fn watcher_installs_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        let ca = DemoCa::generate("existing CA").unwrap();
        fs::write(dir.path().join("existing.der"), ca.ca_cert_der().as_ref()).unwrap();

        let registry = Arc::new(WorkerRegistry::new());
        let ctx = InteractionContext::spawn(
            Arc::new(TrustAnchorStore::new()),
            Arc::clone(&registry),
            ContextOptions::default(),
        )
        .unwrap();
        let handler = Arc::new(|_: &InstallRequest| -> Result<InstallDecision, InstallError> {
            Ok(InstallDecision::Accept)
        });
        ctx.attach_install_handler(&handler);

        let watcher = spawn_anchor_watcher(dir.path(), ctx.client(), registry).unwrap();

        wait_until(|| !ctx.store().is_empty());
        assert!(ctx.store().contains(&ca.anchor().unwrap()));
        watcher.stop().unwrap();
    }

    /// Tests that a certificate written after the watcher started is picked
    /// up from change events and proposed once the directory is quiet.
    #[test]
    fn watcher_installs_new_files() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(WorkerRegistry::new());
        let ctx = context_for(&registry);
        let handler = Arc::new(|_: &InstallRequest| -> Result<InstallDecision, InstallError> {
            Ok(InstallDecision::Accept)
        });
        ctx.attach_install_handler(&handler);

        let watcher = spawn_anchor_watcher(dir.path(), ctx.client(), Arc::clone(&registry)).unwrap();
        assert!(ctx.store().is_empty());

        let ca = DemoCa::generate("late CA").unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        fs::write(dir.path().join("late.pem"), ca.ca_cert_pem()).unwrap();

        wait_until(|| !ctx.store().is_empty());
        assert_eq!(ctx.store().len(), 1);
        assert!(ctx.store().contains(&ca.anchor().unwrap()));
        watcher.stop().unwrap();
    }

    /// Tests that stopping the watcher ends its thread and removes its
    /// worker registration.
    #[test]
    fn stop_unregisters_watcher() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(WorkerRegistry::new());
        let ctx = context_for(&registry);

        let watcher = spawn_anchor_watcher(dir.path(), ctx.client(), Arc::clone(&registry)).unwrap();
        // The context thread plus the watcher.
        wait_until(|| registry.len() == 2);

        watcher.stop().unwrap();
        assert_eq!(registry.len(), 1);
    }

    fn context_for(registry: &Arc<WorkerRegistry>) -> InteractionContext {
        InteractionContext::spawn(
            Arc::new(TrustAnchorStore::new()),
            Arc::clone(registry),
            ContextOptions::default(),
        )
        .unwrap()
    }

    fn wait_until(mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !done() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(10));
        }
    }
}
