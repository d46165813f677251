//! The interaction context and the worker-side client that talks to it.
//!
//! Install requests and log records travel over channels to one dedicated
//! thread. Workers block on an install reply (bounded by a timeout) but never
//! block on logging.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self as std_mpsc, RecvTimeoutError};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::handlers::{
    InstallDecision, InstallError, InstallHandler, InstallRequest, LogRecord, LogSink,
};
use crate::anchors::{TrustAnchor, TrustAnchorStore};
use crate::worker::WorkerRegistry;

/// Tuning for an [`InteractionContext`].
#[derive(Debug, Clone, Copy)]
pub struct ContextOptions {
    /// How long a worker waits for an install decision.
    pub install_timeout: Duration,
    /// Log records queued beyond this are dropped.
    pub log_queue_capacity: usize,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            install_timeout: Duration::from_secs(30),
            log_queue_capacity: 1024,
        }
    }
}

/// Attached capabilities. Held weakly so the context never keeps its owner
/// alive; a handler that has been dropped behaves as unattached.
#[derive(Default)]
struct Handlers {
    install: RwLock<Option<Weak<dyn InstallHandler>>>,
    log: RwLock<Option<Weak<dyn LogSink>>>,
}

impl Handlers {
    fn install(&self) -> Option<Arc<dyn InstallHandler>> {
        self.install
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(Weak::upgrade)
    }

    fn log(&self) -> Option<Arc<dyn LogSink>> {
        self.log
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(Weak::upgrade)
    }
}

struct InstallEnvelope {
    request: InstallRequest,
    reply: std_mpsc::SyncSender<Result<(), InstallError>>,
}

struct ContextLink {
    install_tx: mpsc::UnboundedSender<InstallEnvelope>,
    log_tx: mpsc::Sender<LogRecord>,
    context_thread: ThreadId,
    install_timeout: Duration,
    registry: Arc<WorkerRegistry>,
    log_seq: AtomicU64,
    dropped_logs: AtomicU64,
}

/// The single context allowed to make trust decisions and receive
/// diagnostics.
///
/// Runs on its own thread. Dropping it (or calling
/// [`shutdown`](Self::shutdown)) stops the thread; outstanding clients then
/// get [`InstallError::NoHandler`] and their logs are discarded.
pub struct InteractionContext {
    store: Arc<TrustAnchorStore>,
    handlers: Arc<Handlers>,
    link: Arc<ContextLink>,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl InteractionContext {
    /// Starts the context thread.
    pub fn spawn(
        store: Arc<TrustAnchorStore>,
        registry: Arc<WorkerRegistry>,
        options: ContextOptions,
    ) -> io::Result<Self> {
        let (install_tx, install_rx) = mpsc::unbounded_channel();
        let (log_tx, log_rx) = mpsc::channel(options.log_queue_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handlers = Arc::new(Handlers::default());

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let loop_store = Arc::clone(&store);
        let loop_handlers = Arc::clone(&handlers);
        let loop_registry = Arc::clone(&registry);
        let thread = thread::Builder::new()
            .name("interaction".to_string())
            .spawn(move || {
                if let Err(e) = loop_registry.register_current("interaction") {
                    warn!("failed to register interaction context: {}", e);
                }
                rt.block_on(run_context(
                    install_rx,
                    log_rx,
                    shutdown_rx,
                    loop_handlers,
                    loop_store,
                ));
                loop_registry.unregister_current();
            })?;

        let link = Arc::new(ContextLink {
            install_tx,
            log_tx,
            context_thread: thread.thread().id(),
            install_timeout: options.install_timeout,
            registry,
            log_seq: AtomicU64::new(0),
            dropped_logs: AtomicU64::new(0),
        });

        Ok(Self {
            store,
            handlers,
            link,
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        })
    }

    /// Returns a client for worker contexts.
    pub fn client(&self) -> ContractClient {
        ContractClient {
            link: Some(Arc::clone(&self.link)),
        }
    }

    pub fn store(&self) -> &Arc<TrustAnchorStore> {
        &self.store
    }

    /// Attaches the install reviewer. Only a weak reference is kept.
    pub fn attach_install_handler<H: InstallHandler + 'static>(&self, handler: &Arc<H>) {
        let weak = Arc::downgrade(handler);
        let weak: Weak<dyn InstallHandler> = weak;
        *self
            .handlers
            .install
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(weak);
    }

    pub fn detach_install_handler(&self) {
        *self
            .handlers
            .install
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Attaches the log sink. Only a weak reference is kept.
    pub fn attach_log_sink<S: LogSink + 'static>(&self, sink: &Arc<S>) {
        let weak = Arc::downgrade(sink);
        let weak: Weak<dyn LogSink> = weak;
        *self
            .handlers
            .log
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(weak);
    }

    pub fn detach_log_sink(&self) {
        *self
            .handlers
            .log
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Stops the context thread and waits for it to exit.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            warn!("interaction context thread panicked");
        }
    }
}

impl Drop for InteractionContext {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_context(
    mut install_rx: mpsc::UnboundedReceiver<InstallEnvelope>,
    mut log_rx: mpsc::Receiver<LogRecord>,
    mut shutdown_rx: oneshot::Receiver<()>,
    handlers: Arc<Handlers>,
    store: Arc<TrustAnchorStore>,
) {
    info!("interaction context started");

    // Installs are served ahead of logs so a blocked worker waits for at
    // most one sink write, however long the log backlog is.
    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown_rx => break,
            Some(envelope) = install_rx.recv() => {
                let outcome = review_install(&handlers, &store, &envelope.request);
                // The requester may have timed out and gone; the decision
                // still stands.
                let _ = envelope.reply.send(outcome);
            }
            Some(record) = log_rx.recv() => deliver_log(&handlers, &record),
            else => break,
        }
    }

    info!("interaction context stopped");
}

fn review_install(
    handlers: &Handlers,
    store: &TrustAnchorStore,
    request: &InstallRequest,
) -> Result<(), InstallError> {
    let Some(handler) = handlers.install() else {
        debug!("no install handler attached, refusing {}", request.anchor);
        return Err(InstallError::NoHandler);
    };

    match handler.review(request)? {
        InstallDecision::Accept => {
            store.add(request.anchor.clone());
            Ok(())
        }
        InstallDecision::Reject => {
            info!("install of trust anchor {} rejected", request.anchor);
            Err(InstallError::Rejected(request.anchor.fingerprint().to_string()))
        }
    }
}

fn deliver_log(handlers: &Handlers, record: &LogRecord) {
    if let Some(sink) = handlers.log()
        && let Err(e) = sink.write(record)
    {
        debug!("log sink failed for record {}: {}", record.seq, e);
    }
}

/// Worker-side handle to the interaction context.
///
/// Cheap to clone. A detached client behaves exactly like one whose context
/// has no handlers: installs fail with [`InstallError::NoHandler`] and logging
/// does nothing.
#[derive(Clone)]
pub struct ContractClient {
    link: Option<Arc<ContextLink>>,
}

impl ContractClient {
    /// A client with no context behind it.
    pub fn detached() -> Self {
        Self { link: None }
    }

    pub fn is_attached(&self) -> bool {
        self.link.is_some()
    }

    /// Asks the interaction context to trust `anchor`, blocking until it
    /// decides or the install timeout passes.
    ///
    /// On success the anchor is already in the store. Must not be called while
    /// holding anything the interaction context might wait on; calling it from
    /// the context thread itself returns [`InstallError::Reentrant`]. A timed
    /// out request is not cancelled and may still be applied.
    pub fn request_install_trusted_anchor(&self, anchor: TrustAnchor) -> Result<(), InstallError> {
        let Some(link) = self.link.as_deref() else {
            return Err(InstallError::NoHandler);
        };
        if thread::current().id() == link.context_thread {
            return Err(InstallError::Reentrant);
        }

        let request = InstallRequest {
            anchor,
            origin: link.registry.current(),
        };
        debug!("proposing trust anchor {}", request.anchor);

        let (reply_tx, reply_rx) = std_mpsc::sync_channel(1);
        link.install_tx
            .send(InstallEnvelope {
                request,
                reply: reply_tx,
            })
            .map_err(|_| InstallError::NoHandler)?;

        match reply_rx.recv_timeout(link.install_timeout) {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    "no install decision within {:?}, giving up",
                    link.install_timeout
                );
                Err(InstallError::TimedOut(link.install_timeout))
            }
            Err(RecvTimeoutError::Disconnected) => Err(InstallError::NoHandler),
        }
    }

    /// Parses `der` and requests its installation.
    pub fn request_install_der(&self, der: impl Into<Vec<u8>>) -> Result<(), InstallError> {
        let anchor = TrustAnchor::from_der(der)?;
        self.request_install_trusted_anchor(anchor)
    }

    /// Queues a diagnostic line for the context's log sink.
    ///
    /// Never blocks and never fails. Lines from one worker arrive in the order
    /// they were logged.
    pub fn log(&self, args: fmt::Arguments<'_>) {
        let Some(link) = self.link.as_deref() else {
            return;
        };

        let record = LogRecord {
            seq: link.log_seq.fetch_add(1, Ordering::Relaxed),
            timestamp: OffsetDateTime::now_utc(),
            worker: link.registry.current(),
            message: args.to_string(),
        };

        match link.log_tx.try_send(record) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                link.dropped_logs.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    /// Number of log records discarded because the queue was full.
    pub fn dropped_logs(&self) -> u64 {
        self.link
            .as_deref()
            .map_or(0, |link| link.dropped_logs.load(Ordering::Relaxed))
    }
}

impl fmt::Debug for ContractClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContractClient")
            .field("attached", &self.is_attached())
            .finish_non_exhaustive()
    }
}
