//! Multi-threaded runtime for connection handling.

use std::io;
use std::sync::Arc;

use tokio::runtime::{Builder, Runtime};
use tracing::warn;

use crate::worker::WorkerRegistry;

const WORKER_NAME: &str = "intercept-worker";

/// Builds the runtime that runs interception work.
///
/// Every runtime thread registers itself with `registry` when it starts and
/// unregisters when it stops, so contract log lines carry its identity.
pub fn intercept_runtime(registry: Arc<WorkerRegistry>, workers: usize) -> io::Result<Runtime> {
    let start_registry = Arc::clone(&registry);
    let stop_registry = registry;

    Builder::new_multi_thread()
        .worker_threads(workers.max(1))
        .thread_name(WORKER_NAME)
        .enable_all()
        .on_thread_start(move || {
            if let Err(e) = start_registry.register_current(WORKER_NAME) {
                warn!("failed to register runtime thread: {}", e);
            }
        })
        .on_thread_stop(move || {
            stop_registry.unregister_current();
        })
        .build()
}
